//! tidings: an RSS/Atom aggregator core.
//!
//! Feeds and articles live in SQLite ([`storage`]). The [`sync`] engine
//! fetches URL feeds on an adaptive per-feed schedule, merges what it
//! finds without ever deleting, and reports each session. [`feed`] holds
//! the HTTP source, the document parser and OPML import/export.

pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
