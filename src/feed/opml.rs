use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

use crate::storage::Database;
use crate::util::validate_feed_url;

/// Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an outline's articles come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpmlSource {
    /// `xmlUrl`, already validated
    Url(String),
    /// Saved-search predicate from the `query` attribute
    Query(String),
}

/// A subscription extracted from (or written to) an OPML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// From `title`, falling back to `text`, then to the URL
    pub title: String,
    pub source: OpmlSource,
    /// Names of the folder outlines enclosing this outline, outermost first
    pub groups: Vec<String>,
}

/// Outcome of [`import`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub existing: usize,
    pub memberships: usize,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse OPML text into subscriptions.
///
/// Outlines with `xmlUrl` become URL subscriptions, outlines with a `query`
/// attribute become query subscriptions, and any other outline with
/// children is a folder whose name is attached to everything inside it.
/// Invalid URLs (non-HTTP schemes, localhost, private ranges) are skipped
/// with a warning.
///
/// `quick-xml` does not expand `<!ENTITY>` declarations, and attribute
/// values go through `decode_and_unescape_value`, which only knows the five
/// XML builtins. Custom entity references therefore fail instead of
/// expanding.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlFeed>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    let mut buf = Vec::new();
    // One slot per open <outline>; `Some` for folders
    let mut open: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if open.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }
                let outline = read_outline(&e, &reader)?;
                let folder = match outline {
                    Outline::Feed(title, source) => {
                        feeds.push(OpmlFeed {
                            title,
                            source,
                            groups: folder_path(&open),
                        });
                        None
                    }
                    Outline::Folder(name) => name,
                    Outline::Skipped => None,
                };
                open.push(folder);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Outline::Feed(title, source) = read_outline(&e, &reader)? {
                    feeds.push(OpmlFeed {
                        title,
                        source,
                        groups: folder_path(&open),
                    });
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                open.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(feeds)
}

pub async fn parse_file(path: &Path) -> Result<Vec<OpmlFeed>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(OpmlError::Io)
        .with_context(|| format!("Failed to read OPML file: {}", path.display()))?;
    parse_opml(&content)
}

enum Outline {
    Feed(String, OpmlSource),
    Folder(Option<String>),
    Skipped,
}

fn folder_path(open: &[Option<String>]) -> Vec<String> {
    open.iter().flatten().cloned().collect()
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline> {
    let mut xml_url = None;
    let mut query = None;
    let mut title = None;
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let decoder = reader.decoder();
        let value = || attr.decode_and_unescape_value(decoder).map(|v| v.trim().to_string());
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value()?),
            b"query" => query = Some(value()?),
            b"title" => title = Some(value()?),
            b"text" => text = Some(value()?),
            _ => {}
        }
    }

    let name = title.or(text).filter(|t| !t.is_empty());

    if let Some(url) = xml_url.filter(|u| !u.is_empty()) {
        return match validate_feed_url(&url) {
            Ok(_) => Ok(Outline::Feed(name.unwrap_or_else(|| url.clone()), OpmlSource::Url(url))),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
                Ok(Outline::Skipped)
            }
        };
    }

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        return Ok(Outline::Feed(
            name.unwrap_or_else(|| query.clone()),
            OpmlSource::Query(query),
        ));
    }

    Ok(Outline::Folder(name))
}

// ============================================================================
// Import
// ============================================================================

/// Subscribe to everything in an OPML file.
///
/// Known URLs are not duplicated, nor are query feeds with the same title
/// and predicate; both still gain the memberships listed in the file. New
/// URL feeds start at `wait_period` and are due immediately.
pub async fn import(db: &Database, path: &Path, wait_period: u32) -> Result<ImportSummary> {
    let entries = parse_file(path).await?;
    import_feeds(db, &entries, wait_period).await
}

pub async fn import_feeds(
    db: &Database,
    entries: &[OpmlFeed],
    wait_period: u32,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    let mut known_queries: Vec<(String, String, i64)> = db
        .list_feeds()
        .await?
        .into_iter()
        .filter_map(|f| {
            let query = f.query.clone()?;
            Some((f.title.to_string(), query, f.id))
        })
        .collect();

    for entry in entries {
        let feed_id = match &entry.source {
            OpmlSource::Url(url) => {
                if let Some(feed) = db.find_feed_by_url(url).await? {
                    summary.existing += 1;
                    feed.id
                } else {
                    let feed = db
                        .create_feed(url, &entry.title, wait_period)
                        .await
                        .with_context(|| format!("Failed to add feed {url}"))?;
                    summary.added += 1;
                    feed.id
                }
            }
            OpmlSource::Query(query) => {
                let existing = known_queries
                    .iter()
                    .find(|(title, q, _)| title == &entry.title && q == query)
                    .map(|(_, _, id)| *id);
                match existing {
                    Some(id) => {
                        summary.existing += 1;
                        id
                    }
                    None => {
                        let feed = db.create_query_feed(&entry.title, query, "").await?;
                        known_queries.push((feed.title.to_string(), query.clone(), feed.id));
                        summary.added += 1;
                        feed.id
                    }
                }
            }
        };

        for group in &entry.groups {
            let group_id = match db.create_group(group).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(group = %group, error = %e, "Skipping OPML folder");
                    continue;
                }
            };
            if db.add_feed_to_group(group_id, feed_id).await? {
                summary.memberships += 1;
            }
        }
    }

    tracing::info!(
        added = summary.added,
        existing = summary.existing,
        memberships = summary.memberships,
        "OPML import finished"
    );
    Ok(summary)
}

// ============================================================================
// Export
// ============================================================================

/// Render subscriptions as an OPML 2.0 document.
///
/// Ungrouped feeds sit directly under `<body>`. Each group becomes a folder
/// outline; a feed in several groups is listed once per group.
pub fn render_opml(feeds: &[OpmlFeed]) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .context("Failed to write title element")?;
    writer
        .write_event(Event::Text(BytesText::new("tidings subscriptions")))
        .context("Failed to write title text")?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .context("Failed to write title end")?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    let mut folders: BTreeMap<&str, Vec<&OpmlFeed>> = BTreeMap::new();
    for feed in feeds {
        if feed.groups.is_empty() {
            write_feed_outline(&mut writer, feed)?;
        }
        for group in &feed.groups {
            folders.entry(group.as_str()).or_default().push(feed);
        }
    }

    for (name, members) in folders {
        let mut folder = BytesStart::new("outline");
        folder.push_attribute(("text", name));
        folder.push_attribute(("title", name));
        writer
            .write_event(Event::Start(folder))
            .context("Failed to write folder outline")?;
        for feed in members {
            write_feed_outline(&mut writer, feed)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("outline")))
            .context("Failed to write folder end")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

fn write_feed_outline(writer: &mut Writer<Cursor<Vec<u8>>>, feed: &OpmlFeed) -> Result<()> {
    let mut outline = BytesStart::new("outline");
    match &feed.source {
        OpmlSource::Url(url) => {
            outline.push_attribute(("type", "rss"));
            outline.push_attribute(("text", feed.title.as_str()));
            outline.push_attribute(("title", feed.title.as_str()));
            outline.push_attribute(("xmlUrl", url.as_str()));
        }
        OpmlSource::Query(query) => {
            outline.push_attribute(("type", "query"));
            outline.push_attribute(("text", feed.title.as_str()));
            outline.push_attribute(("title", feed.title.as_str()));
            outline.push_attribute(("query", query.as_str()));
        }
    }
    writer
        .write_event(Event::Empty(outline))
        .context("Failed to write outline element")?;
    Ok(())
}

/// Collect every subscription with its group names, ready for [`render_opml`].
pub async fn collect_subscriptions(db: &Database) -> Result<Vec<OpmlFeed>> {
    let mut subscriptions = Vec::new();
    for feed in db.list_feeds().await? {
        let source = match (&feed.query, &feed.url) {
            (Some(query), _) if feed.is_query_feed() => OpmlSource::Query(query.clone()),
            (_, Some(url)) if !url.is_empty() => OpmlSource::Url(url.clone()),
            _ => continue,
        };
        let groups = db
            .groups_for_feed(feed.id)
            .await?
            .into_iter()
            .map(|g| g.name)
            .collect();
        subscriptions.push(OpmlFeed {
            title: feed.title.to_string(),
            source,
            groups,
        });
    }
    Ok(subscriptions)
}

/// Export all subscriptions to `path`, replacing it atomically.
pub async fn export(db: &Database, path: &Path) -> Result<usize> {
    let subscriptions = collect_subscriptions(db).await?;
    let content = render_opml(&subscriptions)?;
    write_atomically(path, content.as_bytes())?;
    let unique: HashSet<&OpmlSource> = subscriptions.iter().map(|s| &s.source).collect();
    Ok(unique.len())
}

/// Writes to a uniquely named temporary file in the same directory, syncs
/// it, then renames over `path`, so the destination is never partial.
fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| {
            format!(
                "Failed to create temporary file '{}': check directory permissions",
                temp_path.display()
            )
        })?;

    std::io::Write::write_all(&mut file, content).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!("Failed to write OPML to '{}'", temp_path.display())
    })?;

    file.sync_all().with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!("Failed to sync '{}' to disk", temp_path.display())
    })?;
    drop(file);

    std::fs::rename(&temp_path, path).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}'",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
