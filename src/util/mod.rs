//! Small helpers shared by the storage, feed and CLI layers.
//!
//! - **URL validation**: feed URLs must be public HTTP(S) endpoints
//! - **Text processing**: control-character stripping for user-supplied names
//!   and HTML flattening for feed summaries

mod text;
mod url_validator;

pub use text::{html_to_text, sanitize_name, strip_control_chars};
pub use url_validator::{validate_feed_url, FeedUrlError};
