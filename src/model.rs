use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Upper bound on tags kept per record; extras past this are dropped.
pub const MAX_TAGS: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Authenticated,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "authenticated" => Some(SessionStatus::Authenticated),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }
}

/// Identity bound to a session once the ring handshake completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub public_key: String,
    pub display_name: Option<String>,
    pub homeserver: Option<String>,
}

/// The single authoritative session. `token` is present iff
/// `status == Authenticated`; `qr_payload` is meaningful only while pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub qr_payload: Option<String>,
    pub token: Option<String>,
    pub identity: Option<Identity>,
}

/// A tag/bookmark/post record authored by the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishPayload {
    pub url: String,
    pub tags: Vec<String>,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PublishPayload {
    /// Normalize in place: stable URL key, lowercase sorted bounded tags.
    pub fn normalized(mut self) -> Self {
        self.url = normalize_url(&self.url);
        self.tags = normalize_tags(&self.tags);
        self
    }
}

/// A durably queued record awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPublication {
    pub id: String,
    pub payload: PublishPayload,
    pub metadata: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    pub public_key: String,
    pub display_name: Option<String>,
    pub homeserver: Option<String>,
}

/// Normalized remote post about a URL. `id` is stable for logically
/// identical content, which is what makes deduplication well-defined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub id: String,
    pub url: String,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub author: Author,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub note: Option<String>,
    pub tags: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

/// Observability state surfaced to UI surfaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub last_homeserver_error: Option<String>,
    pub last_successful_publish_at: Option<DateTime<Utc>>,
    pub last_feed_refresh_at: Option<DateTime<Utc>>,
    pub online: bool,
}

/// Strip the fragment and collapse an empty path to `/`. The result is the
/// stable key for caching, bookmarking, and deduplication. Unparseable
/// input falls back to trimming a trailing `#fragment` by hand.
pub fn normalize_url(raw: &str) -> String {
    match url::Url::parse(raw.trim()) {
        Ok(mut u) => {
            u.set_fragment(None);
            u.to_string()
        }
        Err(_) => {
            let trimmed = raw.trim();
            match trimmed.split_once('#') {
                Some((before, _)) => before.to_string(),
                None => trimmed.to_string(),
            }
        }
    }
}

/// Lowercase, trim, drop empties, dedup, sort, and bound the tag set.
/// Sorting makes the set order-insensitive for id derivation.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out.truncate(MAX_TAGS);
    out
}

/// Deterministic feed-item id: sha256 over the normalized URL and the
/// sorted normalized tag set. Two remote records describing the same
/// content hash to the same id regardless of field casing or tag order.
pub fn feed_item_id(normalized_url: &str, normalized_tags: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());
    for tag in normalized_tags {
        hasher.update(b"\n");
        hasher.update(tag.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_url_strips_fragment() {
        assert_eq!(
            normalize_url("https://example.com/page#section"),
            "https://example.com/page"
        );
    }

    #[test]
    fn normalize_url_collapses_root() {
        assert_eq!(normalize_url("https://example.com"), "https://example.com/");
        assert_eq!(
            normalize_url("https://example.com/#frag"),
            "https://example.com/"
        );
    }

    #[test]
    fn normalize_url_keeps_query() {
        assert_eq!(
            normalize_url("https://example.com/a?b=1#c"),
            "https://example.com/a?b=1"
        );
    }

    #[test]
    fn normalize_url_tolerates_garbage() {
        assert_eq!(normalize_url("not a url#frag"), "not a url");
    }

    #[test]
    fn normalize_tags_lowercases_and_dedups() {
        let tags = vec!["Rust".into(), "  rust ".into(), "Web".into(), "".into()];
        assert_eq!(
            normalize_tags(&tags),
            vec!["rust".to_string(), "web".to_string()]
        );
    }

    #[test]
    fn normalize_tags_bounds_count() {
        let tags: Vec<String> = (0..50).map(|i| format!("tag{i:02}")).collect();
        assert_eq!(normalize_tags(&tags).len(), MAX_TAGS);
    }

    #[test]
    fn feed_item_id_is_order_insensitive() {
        let a = feed_item_id(
            "https://example.com/",
            &normalize_tags(&["b".into(), "A".into()]),
        );
        let b = feed_item_id(
            "https://example.com/",
            &normalize_tags(&["a".into(), "B".into()]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn feed_item_id_differs_by_url() {
        let tags = normalize_tags(&["a".into()]);
        assert_ne!(
            feed_item_id("https://example.com/x", &tags),
            feed_item_id("https://example.com/y", &tags)
        );
    }

    #[test]
    fn session_status_round_trips() {
        for s in [
            SessionStatus::Pending,
            SessionStatus::Authenticated,
            SessionStatus::Expired,
        ] {
            assert_eq!(SessionStatus::parse_status(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::parse_status("bogus"), None);
    }
}
