//! Reconciles freshly fetched entries with the articles already stored for a
//! feed.
//!
//! Planning is pure: [`plan_merge`] takes a snapshot of the feed's articles
//! and returns the creates and updates needed to absorb the document. The
//! store applies the plan inside the same transaction it took the snapshot
//! in (see `Database::merge_feed`).
//!
//! Rules:
//! - an entry is matched to a stored article by identifier, never by position
//! - unseen identifiers become new unread articles
//! - known identifiers update title/link/summary/author/content when they differ;
//!   `published` is only filled in when missing and `read` is never touched
//! - enclosures are deduplicated by URL and only ever added
//! - nothing is deleted
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::storage::{ParsedEnclosure, ParsedEntry};

/// Non-fatal problem with a single entry. The rest of the document still merges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeWarning {
    #[error("entry {index} has no identifier and no link, title or content to derive one")]
    Unidentifiable { index: usize },
}

/// Stored state of one article, as seen by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleSnapshot {
    pub id: i64,
    pub identifier: String,
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub published: Option<i64>,
    pub updated_at: i64,
    pub enclosure_urls: Vec<String>,
}

/// An article to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArticle {
    pub identifier: String,
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub published: Option<i64>,
    pub updated_at: i64,
    pub enclosures: Vec<ParsedEnclosure>,
}

/// Full new field values for an existing article plus enclosures to add.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleUpdate {
    pub id: i64,
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub published: Option<i64>,
    pub updated_at: i64,
    pub new_enclosures: Vec<ParsedEnclosure>,
}

/// The minimal set of writes that absorbs a document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub creates: Vec<NewArticle>,
    pub updates: Vec<ArticleUpdate>,
    pub warnings: Vec<DecodeWarning>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty()
    }
}

/// An enclosure created by a merge, not yet downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDownload {
    pub enclosure_id: i64,
    pub url: String,
}

/// Outcome of applying a document to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub created: usize,
    pub updated: usize,
    pub enclosures_added: usize,
    pub warnings: Vec<DecodeWarning>,
    pub new_enclosures: Vec<PendingDownload>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.created + self.updated > 0
    }
}

/// Stable identifier for an entry.
///
/// The upstream id wins when present. Otherwise a SHA-256 over
/// `link|title|published` is used (content is folded in only when there is
/// neither link nor title). Returns `None` when there is nothing to hash.
pub fn entry_identifier(entry: &ParsedEntry) -> Option<String> {
    if let Some(id) = entry.identifier.as_deref().map(str::trim) {
        if !id.is_empty() {
            return Some(id.to_owned());
        }
    }

    let link = entry.link.as_deref().map(str::trim).unwrap_or("");
    let title = entry.title.trim();
    let content = entry.content.as_deref().map(str::trim).unwrap_or("");
    if link.is_empty() && title.is_empty() && content.is_empty() {
        return None;
    }

    let published = entry.published.map(|p| p.to_string()).unwrap_or_default();
    let mut input = format!("{link}|{title}|{published}");
    if link.is_empty() && title.is_empty() {
        input.push('|');
        input.push_str(content);
    }
    Some(format!("{:x}", Sha256::digest(input.as_bytes())))
}

#[derive(Debug, Clone, PartialEq)]
struct Fields {
    title: String,
    link: Option<String>,
    summary: Option<String>,
    author: Option<String>,
    content: Option<String>,
    published: Option<i64>,
}

impl Fields {
    fn from_snapshot(s: &ArticleSnapshot) -> Self {
        Self {
            title: s.title.clone(),
            link: s.link.clone(),
            summary: s.summary.clone(),
            author: s.author.clone(),
            content: s.content.clone(),
            published: s.published,
        }
    }

    /// Last write wins per field. Fields the entry leaves out keep their
    /// value; `published` is only ever filled in.
    fn absorb(&mut self, entry: &ParsedEntry) {
        if !entry.title.trim().is_empty() {
            self.title = entry.title.clone();
        }
        overwrite(&mut self.link, &entry.link);
        overwrite(&mut self.summary, &entry.summary);
        overwrite(&mut self.author, &entry.author);
        overwrite(&mut self.content, &entry.content);
        if self.published.is_none() {
            self.published = entry.published;
        }
    }
}

fn overwrite(slot: &mut Option<String>, incoming: &Option<String>) {
    if let Some(value) = incoming {
        if !value.trim().is_empty() {
            *slot = Some(value.clone());
        }
    }
}

struct Working {
    /// Index into the snapshot, `None` for articles created by this plan
    origin: Option<usize>,
    fields: Fields,
    known_urls: HashSet<String>,
    added: Vec<ParsedEnclosure>,
}

impl Working {
    fn absorb(&mut self, entry: &ParsedEntry) {
        self.fields.absorb(entry);
        for enclosure in &entry.enclosures {
            let url = enclosure.url.trim();
            if url.is_empty() {
                continue;
            }
            if self.known_urls.insert(url.to_owned()) {
                self.added.push(ParsedEnclosure {
                    url: url.to_owned(),
                    kind: enclosure.kind.clone(),
                });
            }
        }
    }
}

/// Plan the writes needed to absorb `entries` into a feed whose stored
/// articles are `existing`.
///
/// Entries repeating an identifier are folded in document order before the
/// result is compared with the snapshot, so applying the plan and planning
/// the same entries again yields an empty plan.
pub fn plan_merge(existing: &[ArticleSnapshot], entries: &[ParsedEntry], now: i64) -> MergePlan {
    let by_identifier: HashMap<&str, usize> = existing
        .iter()
        .enumerate()
        .map(|(i, a)| (a.identifier.as_str(), i))
        .collect();

    let mut order: Vec<String> = Vec::new();
    let mut working: HashMap<String, Working> = HashMap::new();
    let mut warnings = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        let Some(identifier) = entry_identifier(entry) else {
            warnings.push(DecodeWarning::Unidentifiable { index });
            continue;
        };

        let slot = working.entry(identifier.clone()).or_insert_with(|| {
            order.push(identifier.clone());
            match by_identifier.get(identifier.as_str()) {
                Some(&pos) => Working {
                    origin: Some(pos),
                    fields: Fields::from_snapshot(&existing[pos]),
                    known_urls: existing[pos].enclosure_urls.iter().cloned().collect(),
                    added: Vec::new(),
                },
                None => Working {
                    origin: None,
                    fields: Fields {
                        title: String::new(),
                        link: None,
                        summary: None,
                        author: None,
                        content: None,
                        published: None,
                    },
                    known_urls: HashSet::new(),
                    added: Vec::new(),
                },
            }
        });
        slot.absorb(entry);
    }

    let mut plan = MergePlan {
        warnings,
        ..MergePlan::default()
    };

    for identifier in order {
        let Some(w) = working.remove(&identifier) else {
            continue;
        };
        match w.origin {
            None => plan.creates.push(NewArticle {
                identifier,
                title: w.fields.title,
                link: w.fields.link,
                summary: w.fields.summary,
                author: w.fields.author,
                content: w.fields.content,
                published: w.fields.published,
                updated_at: now,
                enclosures: w.added,
            }),
            Some(pos) => {
                let stored = &existing[pos];
                if w.fields == Fields::from_snapshot(stored) && w.added.is_empty() {
                    continue;
                }
                plan.updates.push(ArticleUpdate {
                    id: stored.id,
                    title: w.fields.title,
                    link: w.fields.link,
                    summary: w.fields.summary,
                    author: w.fields.author,
                    content: w.fields.content,
                    published: w.fields.published,
                    // Strictly advances even when the clock has not
                    updated_at: now.max(stored.updated_at.saturating_add(1)),
                    new_enclosures: w.added,
                });
            }
        }
    }

    plan
}
