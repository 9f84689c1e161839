//! Feed Synchronizer: the up-to-date, deduplicated, socially-filtered list
//! of remote posts about a URL. Remote records arrive in heterogeneous
//! shapes; all "guess the field name" logic lives in [`coerce_record`].

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::db;
use crate::engine::{Engine, Event};
use crate::model::{feed_item_id, normalize_tags, normalize_url, Author, FeedItem, SessionStatus};

impl Engine {
    /// Return the feed for `url`. A cache hit short-circuits unless
    /// `force_refresh` is set; otherwise the homeserver is queried, the
    /// results normalized, and the cache replaced. A fetch failure leaves
    /// any stale cache untouched: stale-but-present beats empty.
    #[instrument(skip_all)]
    pub async fn get_feed(&self, url: &str, force_refresh: bool) -> Result<Vec<FeedItem>> {
        let normalized = normalize_url(url);

        if !force_refresh {
            match db::get_feed_cache(&self.pool, &normalized).await {
                Ok(Some(items)) => return Ok(items),
                Ok(None) => {}
                Err(err) => warn!(?err, "feed cache read failed; fetching fresh"),
            }
        }

        let follows = self.resolve_follows_or_empty().await;
        let author_filter = if follows.is_empty() {
            None
        } else {
            Some(follows.as_slice())
        };

        let raw = match self.gateway.query_content(&normalized, author_filter).await {
            Ok(raw) => raw,
            Err(err) => {
                self.note_gateway_error(&err).await;
                return Err(err.into());
            }
        };

        // Last-write-wins by deterministic id: logically identical records
        // from different sources collapse to one entry.
        let mut by_id: HashMap<String, FeedItem> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for record in &raw {
            let Some(item) = coerce_record(record) else {
                warn!("skipping remote record with no usable URL");
                continue;
            };
            if !by_id.contains_key(&item.id) {
                order.push(item.id.clone());
            }
            by_id.insert(item.id.clone(), item);
        }

        let mut items: Vec<FeedItem> = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        if !follows.is_empty() {
            items.retain(|item| follows.contains(&item.author.public_key));
        }
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if let Err(err) = db::put_feed_cache(&self.pool, &normalized, &items).await {
            warn!(?err, "failed to persist feed cache");
        }
        if let Err(err) = db::mark_feed_refresh(&self.pool, Utc::now()).await {
            warn!(?err, "failed to stamp feed refresh");
        }
        // Broadcast before returning so a background-triggered refresh
        // updates any open surface even if no surface asked for it.
        self.notify(Event::FeedUpdated {
            url: normalized,
            items: items.clone(),
        });

        Ok(items)
    }

    /// The follow list, or empty when unauthenticated or when resolution
    /// fails. An empty list means the feed is unfiltered, never empty.
    async fn resolve_follows_or_empty(&self) -> Vec<String> {
        let identity_key = self
            .session_or_none()
            .await
            .filter(|s| s.status == SessionStatus::Authenticated)
            .and_then(|s| s.identity.map(|i| i.public_key));
        let Some(key) = identity_key else {
            return Vec::new();
        };
        match self.gateway.resolve_follows(&key).await {
            Ok(follows) => follows,
            Err(err) => {
                warn!(?err, "follow resolution failed; feed will be unfiltered");
                Vec::new()
            }
        }
    }

    /// Background refresh pass: re-fetch every URL currently cached so
    /// open surfaces stay current without issuing commands.
    #[instrument(skip_all)]
    pub async fn refresh_cached_feeds(&self) {
        let urls = match db::list_cached_urls(&self.pool).await {
            Ok(urls) => urls,
            Err(err) => {
                warn!(?err, "failed to list cached feed URLs");
                return;
            }
        };
        for url in urls {
            if let Err(err) = self.get_feed(&url, true).await {
                warn!(?err, url, "background feed refresh failed");
            }
        }
    }
}

fn str_field<'a>(record: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|n| record.get(*n).and_then(Value::as_str))
}

fn parse_created_at(record: &Value) -> DateTime<Utc> {
    for name in ["created_at", "createdAt", "timestamp", "indexed_at"] {
        let Some(v) = record.get(name) else { continue };
        if let Some(s) = v.as_str() {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return dt.with_timezone(&Utc);
            }
        }
        if let Some(n) = v.as_i64() {
            // Heuristic: values past ~2001 in milliseconds.
            let (secs, millis) = if n > 1_000_000_000_000 {
                (n / 1000, (n % 1000) as u32)
            } else {
                (n, 0)
            };
            if let Some(dt) = Utc.timestamp_opt(secs, millis * 1_000_000).single() {
                return dt;
            }
        }
    }
    Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now)
}

fn parse_author(record: &Value) -> Author {
    if let Some(obj) = record.get("author") {
        if let Some(key) = str_field(obj, &["public_key", "pubkey", "key", "id"]) {
            return Author {
                public_key: key.to_string(),
                display_name: str_field(obj, &["display_name", "name"]).map(str::to_string),
                homeserver: str_field(obj, &["homeserver", "origin"]).map(str::to_string),
            };
        }
        if let Some(key) = obj.as_str() {
            return Author {
                public_key: key.to_string(),
                display_name: None,
                homeserver: None,
            };
        }
    }
    Author {
        public_key: String::new(),
        display_name: None,
        homeserver: None,
    }
}

fn parse_tags(record: &Value) -> Vec<String> {
    let raw = record
        .get("tags")
        .or_else(|| record.get("labels"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    normalize_tags(&raw)
}

/// Best-effort coercion of one raw remote record into a strict `FeedItem`.
/// Tolerates missing author info and alternate field names; returns `None`
/// only when no URL can be found. The id is the remote record's own
/// identifier when present, else derived from the normalized URL and tag
/// set so equivalent records collapse under deduplication.
pub fn coerce_record(record: &Value) -> Option<FeedItem> {
    let url = normalize_url(str_field(record, &["url", "uri", "link"])?);
    let tags = parse_tags(record);
    let id = str_field(record, &["id"])
        .map(str::to_string)
        .unwrap_or_else(|| feed_item_id(&url, &tags));

    Some(FeedItem {
        id,
        url,
        tags,
        comment: str_field(record, &["comment", "text", "body"]).map(str::to_string),
        title: str_field(record, &["title", "name"]).map(str::to_string),
        created_at: parse_created_at(record),
        author: parse_author(record),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_record_requires_url() {
        assert!(coerce_record(&json!({ "tags": ["a"] })).is_none());
    }

    #[test]
    fn coerce_record_reads_alternate_fields() {
        let item = coerce_record(&json!({
            "uri": "https://example.com/page#frag",
            "labels": ["Rust", "WEB"],
            "body": "great read",
            "name": "A Page",
            "createdAt": "2024-05-01T12:00:00Z",
            "author": { "pubkey": "key-1", "name": "Alice" }
        }))
        .unwrap();
        assert_eq!(item.url, "https://example.com/page");
        assert_eq!(item.tags, vec!["rust", "web"]);
        assert_eq!(item.comment.as_deref(), Some("great read"));
        assert_eq!(item.title.as_deref(), Some("A Page"));
        assert_eq!(item.author.public_key, "key-1");
        assert_eq!(item.author.display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn coerce_record_derives_stable_id() {
        let a = coerce_record(&json!({
            "url": "https://example.com/#frag",
            "tags": ["B", "a"]
        }))
        .unwrap();
        let b = coerce_record(&json!({
            "uri": "https://example.com/",
            "tags": ["A", "b"]
        }))
        .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn coerce_record_prefers_remote_id() {
        let item = coerce_record(&json!({
            "id": "remote-1",
            "url": "https://example.com/"
        }))
        .unwrap();
        assert_eq!(item.id, "remote-1");
    }

    #[test]
    fn coerce_record_parses_epoch_timestamps() {
        let secs = coerce_record(&json!({
            "url": "https://example.com/",
            "timestamp": 1714564800
        }))
        .unwrap();
        let millis = coerce_record(&json!({
            "url": "https://example.com/",
            "timestamp": 1714564800000i64
        }))
        .unwrap();
        assert_eq!(secs.created_at, millis.created_at);
    }

    #[test]
    fn coerce_record_missing_author_is_anonymous() {
        let item = coerce_record(&json!({ "url": "https://example.com/" })).unwrap();
        assert!(item.author.public_key.is_empty());
    }

    #[test]
    fn coerce_record_author_as_bare_key() {
        let item = coerce_record(&json!({
            "url": "https://example.com/",
            "author": "key-9"
        }))
        .unwrap();
        assert_eq!(item.author.public_key, "key-9");
    }
}
