use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};

/// Maximum length (in bytes) of the dedup key derived from a URL
pub const MAX_KEY_LENGTH: usize = 512;

/// A URL accepted into the frontier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identifier assigned by the record store (None until persisted)
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Dedup key, the URL cut down to `MAX_KEY_LENGTH` bytes
    pub key: String,

    /// URL to crawl
    pub url: String,

    /// When the URL entered the frontier
    pub added_time: DateTime<Utc>,

    /// When the URL was last crawled successfully
    #[serde(default)]
    pub last_crawled: Option<DateTime<Utc>>,

    /// Whether the page content was downloaded
    #[serde(default)]
    pub is_downloaded: bool,
}

impl WorkItem {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: None,
            key: Self::key_for(&url),
            url,
            added_time: Utc::now(),
            last_crawled: None,
            is_downloaded: false,
        }
    }

    /// Record describing a successful crawl of `url`
    pub fn crawled(url: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut item = Self::new(url);
        item.last_crawled = Some(now);
        item.is_downloaded = true;
        item
    }

    /// Derive the dedup key for a URL
    pub fn key_for(url: &str) -> String {
        if url.len() <= MAX_KEY_LENGTH {
            return url.to_string();
        }

        let mut end = MAX_KEY_LENGTH;
        while !url.is_char_boundary(end) {
            end -= 1;
        }
        url[..end].to_string()
    }

    /// Whether keys derived from this URL may collide with other URLs
    pub fn is_key_truncated(url: &str) -> bool {
        url.len() > MAX_KEY_LENGTH
    }
}

/// Result of crawling a single URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlOutcome {
    /// URL that was crawled
    pub url: String,

    /// Whether the page was fetched successfully
    pub success: bool,

    /// Links discovered on the page
    #[serde(default)]
    pub found_urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_urls_are_their_own_key() {
        let item = WorkItem::new("https://example.com/a");
        assert_eq!(item.key, "https://example.com/a");
        assert!(!WorkItem::is_key_truncated(&item.url));
        assert!(item.id.is_none());
        assert!(!item.is_downloaded);
    }

    #[test]
    fn long_urls_are_truncated_on_char_boundary() {
        let mut url = String::from("https://example.com/");
        while url.len() < MAX_KEY_LENGTH - 1 {
            url.push('a');
        }
        url.push_str("é/rest");

        let key = WorkItem::key_for(&url);
        assert!(key.len() <= MAX_KEY_LENGTH);
        assert!(url.starts_with(&key));
        assert!(WorkItem::is_key_truncated(&url));
    }

    #[test]
    fn crawled_record_is_marked_downloaded() {
        let item = WorkItem::crawled("https://example.com/");
        assert!(item.is_downloaded);
        assert!(item.last_crawled.is_some());
    }
}
