use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

/// A fetched JSON Feed document, reduced to the fields the notifier reads.
///
/// Items are expected newest-first and only the first one is read, so only
/// that one has to match [`FeedItem`]. Older entries may be any JSON value.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub title: Option<String>,
    pub newest: Option<FeedItem>,
    pub item_count: usize,
}

/// Wire shape: `items` is required, a document without it is not a feed.
#[derive(Deserialize)]
struct RawFeed {
    #[serde(default)]
    title: Option<String>,
    items: Vec<serde_json::Value>,
}

/// One published entry.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedItem {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub url: String,
    /// RFC 3339 timestamp.
    pub date_published: DateTime<FixedOffset>,
    #[serde(default)]
    pub content_text: Option<String>,
}

impl FeedSnapshot {
    /// The most recent entry, if any.
    pub fn newest(&self) -> Option<&FeedItem> {
        self.newest.as_ref()
    }
}

impl FeedItem {
    /// Publication time as epoch milliseconds, the unit of the checkpoint.
    pub fn published_millis(&self) -> i64 {
        self.date_published.timestamp_millis()
    }

    /// Adobe security bulletin identifier (`APSB24-01`), looked up in the
    /// url first and then the title.
    pub fn bulletin_id(&self) -> Option<String> {
        find_bulletin_id(&self.url).or_else(|| find_bulletin_id(&self.title))
    }

    /// Notification body: the title, prefixed with the bulletin id when the
    /// title does not already carry it.
    pub fn notification_body(&self) -> String {
        let title = self.title.trim();
        match self.bulletin_id() {
            Some(id) if !title.to_ascii_uppercase().contains(&id) => format!("{}: {}", id, title),
            _ => title.to_string(),
        }
    }
}

pub fn parse_snapshot(bytes: &[u8]) -> Result<FeedSnapshot, serde_json::Error> {
    let raw: RawFeed = serde_json::from_slice(bytes)?;
    let item_count = raw.items.len();
    let newest = raw
        .items
        .into_iter()
        .next()
        .map(serde_json::from_value::<FeedItem>)
        .transpose()?;

    Ok(FeedSnapshot {
        title: raw.title,
        newest,
        item_count,
    })
}

/// Finds `APSB<2 digits>-<2 digits>`, case-insensitive, returned upper-cased.
fn find_bulletin_id(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    const PREFIX: &[u8] = b"APSB";
    // PREFIX + "NN-NN"
    const LEN: usize = 9;

    if bytes.len() < LEN {
        return None;
    }

    (0..=bytes.len() - LEN).find_map(|start| {
        let candidate = &bytes[start..start + LEN];
        let shaped = candidate[..4].eq_ignore_ascii_case(PREFIX)
            && candidate[4].is_ascii_digit()
            && candidate[5].is_ascii_digit()
            && candidate[6] == b'-'
            && candidate[7].is_ascii_digit()
            && candidate[8].is_ascii_digit();
        shaped.then(|| String::from_utf8_lossy(candidate).to_ascii_uppercase())
    })
}
