mod articles;
mod batch;
mod enclosures;
mod feeds;
mod groups;
mod query;
mod schema;
mod types;

pub use query::{KeywordEvaluator, QueryEvaluator};
pub use schema::Database;
pub use types::{
    Article, Attributes, Enclosure, Feed, Group, ParsedEnclosure, ParsedEntry, ParsedFeed,
    StoreError,
};
