//! Feed polling: fetch the JSON Feed document and parse it into a strict
//! snapshot.
//!
//! - [`parser`] - serde schema for the feed snapshot and item helpers
//! - [`fetcher`] - single-shot HTTP fetch with status, size and time limits

mod fetcher;
mod parser;

pub use fetcher::{FeedClient, FetchError};
pub use parser::{parse_snapshot, FeedItem, FeedSnapshot};
