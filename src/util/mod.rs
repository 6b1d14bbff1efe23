//! Utility functions for common operations.
//!
//! - **URL validation**: scheme checks for the feed location and for links
//!   opened in the system browser

mod url_validator;

pub use url_validator::{validate_feed_url, validate_url_for_open, UrlValidationError};
