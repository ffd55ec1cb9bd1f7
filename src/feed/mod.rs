//! Everything that talks to the outside world about feeds.
//!
//! - [`FeedSource`] / [`EnclosureSource`]: the fetch collaborators the sync
//!   coordinator depends on, with [`HttpFeedSource`] as the `reqwest`
//!   implementation (bounded retries, size caps)
//! - [`parse_document`]: RSS/Atom/JSON Feed decoding via `feed-rs`
//! - [`opml`]: subscription import/export, including groups and query feeds

mod fetcher;
pub mod opml;
mod parser;

pub use fetcher::{EnclosureSource, FeedSource, FetchError, HttpFeedSource};
pub use opml::{OpmlFeed, OpmlSource};
pub use parser::parse_document;
