use std::sync::Arc;
use thiserror::Error;

use crate::sync::BackoffState;

/// Opaque associated data carried by feeds and articles (tags, flags, ...).
///
/// Stored as a JSON object; the storage layer never interprets its keys.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the model store.
///
/// Any of these met while a sync session is running aborts the session.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process holds the database lock
    #[error("Another instance of tidings appears to be running. Please close it and try again.")]
    InstanceLocked,

    #[error("Database migration failed: {0}")]
    Migration(String),

    #[error("Feed {0} does not exist")]
    FeedNotFound(i64),

    /// Rejected input (blank names, empty queries, ...)
    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Attribute data is not valid JSON: {0}")]
    Attributes(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StoreError {
    /// Maps lock-related sqlx errors to [`StoreError::InstanceLocked`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return StoreError::InstanceLocked;
        }
        StoreError::Other(err)
    }
}

/// SQLITE_BUSY, SQLITE_LOCKED and SQLITE_CANTOPEN all surface as these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Decoded document (input to the merge)
// ============================================================================

/// A feed document as returned by a [`FeedSource`](crate::feed::FeedSource).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub image_url: Option<String>,
    /// Entries in document order
    pub entries: Vec<ParsedEntry>,
}

/// One decoded entry, not yet persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEntry {
    /// Upstream id (RSS guid / Atom id), if the document had one
    pub identifier: Option<String>,
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub published: Option<i64>,
    pub content: Option<String>,
    pub enclosures: Vec<ParsedEnclosure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEnclosure {
    pub url: String,
    /// MIME type, e.g. `audio/mpeg`
    pub kind: Option<String>,
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub title: String,
    pub url: Option<String>,
    pub summary: String,
    pub image_url: Option<String>,
    pub query: Option<String>,
    pub attributes: String,
    pub wait_period: i64,
    pub remaining_wait: i64,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
    pub last_fetched: Option<i64>,
    pub created_at: i64,
    pub unread_count: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Result<Feed, StoreError> {
        Ok(Feed {
            id: self.id,
            title: Arc::from(self.title),
            url: self.url,
            summary: self.summary,
            image_url: self.image_url,
            query: self.query,
            attributes: parse_attributes(&self.attributes)?,
            wait_period: to_u32(self.wait_period),
            remaining_wait: to_u32(self.remaining_wait),
            consecutive_failures: to_u32(self.consecutive_failures),
            last_error: self.last_error,
            last_fetched: self.last_fetched,
            created_at: self.created_at,
            unread_count: self.unread_count,
        })
    }
}

/// Column list matching [`FeedDbRow`]; expects `feeds` aliased as `f`.
pub(crate) const FEED_COLUMNS: &str = r#"
    f.id, f.title, f.url, f.summary, f.image_url, f.query, f.attributes,
    f.wait_period, f.remaining_wait, f.consecutive_failures, f.last_error,
    f.last_fetched, f.created_at,
    (SELECT COUNT(*) FROM articles a WHERE a.feed_id = f.id AND a.read = 0) AS unread_count
"#;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub identifier: String,
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub published: Option<i64>,
    pub updated_at: i64,
    pub read: bool,
    pub attributes: String,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Result<Article, StoreError> {
        Ok(Article {
            id: self.id,
            feed_id: self.feed_id,
            identifier: self.identifier,
            title: Arc::from(self.title),
            link: self.link.map(Arc::from),
            summary: self.summary.map(Arc::from),
            author: self.author,
            content: self.content.map(Arc::from),
            published: self.published,
            updated_at: self.updated_at,
            read: self.read,
            attributes: parse_attributes(&self.attributes)?,
        })
    }
}

pub(crate) const ARTICLE_COLUMNS: &str = r#"
    id, feed_id, identifier, title, link, summary, author, content,
    published, updated_at, read, attributes
"#;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EnclosureDbRow {
    pub id: i64,
    pub article_id: i64,
    pub url: String,
    pub kind: Option<String>,
    pub data: Option<Vec<u8>>,
    pub downloaded: bool,
}

impl From<EnclosureDbRow> for Enclosure {
    fn from(row: EnclosureDbRow) -> Self {
        Enclosure {
            id: row.id,
            article_id: row.article_id,
            url: row.url,
            kind: row.kind,
            data: row.data,
            downloaded: row.downloaded,
        }
    }
}

pub(crate) fn parse_attributes(raw: &str) -> Result<Attributes, StoreError> {
    if raw.trim().is_empty() {
        return Ok(Attributes::new());
    }
    Ok(serde_json::from_str(raw)?)
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscription: either fetched from `url` or computed from `query`.
///
/// `title` is `Arc<str>` so report and log paths can clone it cheaply.
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub title: Arc<str>,
    /// `None` for query feeds
    pub url: Option<String>,
    pub summary: String,
    pub image_url: Option<String>,
    /// Saved-search predicate; query feeds are never fetched
    pub query: Option<String>,
    pub attributes: Attributes,
    pub wait_period: u32,
    pub remaining_wait: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_fetched: Option<i64>,
    pub created_at: i64,
    pub unread_count: i64,
}

impl Feed {
    pub fn is_query_feed(&self) -> bool {
        self.query.as_deref().is_some_and(|q| !q.trim().is_empty())
    }

    /// The URL to fetch, or `None` when the feed is not network-backed.
    pub fn fetch_url(&self) -> Option<&str> {
        if self.is_query_feed() {
            return None;
        }
        self.url.as_deref().filter(|u| !u.is_empty())
    }

    pub fn backoff(&self) -> BackoffState {
        BackoffState {
            wait_period: self.wait_period,
            remaining_wait: self.remaining_wait,
        }
    }

    /// Eligible for a scheduled fetch right now.
    pub fn is_due(&self) -> bool {
        self.fetch_url().is_some() && self.backoff().is_due()
    }
}

/// A stored article. `identifier` is unique within its feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub identifier: String,
    pub title: Arc<str>,
    pub link: Option<Arc<str>>,
    pub summary: Option<Arc<str>>,
    pub author: Option<String>,
    pub content: Option<Arc<str>>,
    /// Original publish time; never overwritten once set
    pub published: Option<i64>,
    pub updated_at: i64,
    /// User controlled; sync never touches it
    pub read: bool,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclosure {
    pub id: i64,
    pub article_id: i64,
    pub url: String,
    pub kind: Option<String>,
    pub data: Option<Vec<u8>>,
    pub downloaded: bool,
}

/// A user-defined folder of feeds. Has no bearing on sync.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub feed_count: i64,
}
