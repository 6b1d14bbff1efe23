use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates the configured feed location.
///
/// Only the scheme is restricted: the feed is chosen by whoever runs the
/// notifier, and serving it from a local or LAN host is legitimate.
///
/// # Examples
///
/// ```
/// use digest_notify::util::validate_feed_url;
///
/// let url = validate_feed_url("https://adobedigest.com/feed.json").unwrap();
/// assert_eq!(url.path(), "/feed.json");
///
/// assert!(validate_feed_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_feed_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;
    check_web_url(&url)?;
    Ok(url)
}

/// Validates a URL taken from feed content before it is handed to the system
/// browser.
///
/// Feed items are remote input; anything but an http(s) URL with a host could
/// make `open` launch a local handler instead of a browser.
pub fn validate_url_for_open(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;
    check_web_url(&url)?;
    Ok(url)
}

fn check_web_url(url: &Url) -> Result<(), UrlValidationError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(UrlValidationError::MissingHost),
    }
}
