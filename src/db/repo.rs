use super::model::{
    decode_items, decode_payload, decode_tags, encode_items, encode_payload, encode_tags,
    SessionRecord,
};
use crate::model::{Bookmark, FeedItem, PendingPublication, Session, StatusSnapshot};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---- session ----

#[instrument(skip_all)]
pub async fn save_session(pool: &Pool, session: &Session) -> Result<()> {
    let rec = SessionRecord::from_session(session);
    sqlx::query(
        "INSERT INTO session (id, session_id, status, qr_payload, token, identity_key, identity_name, identity_homeserver, updated_at) \
         VALUES (1, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(id) DO UPDATE SET session_id = excluded.session_id, status = excluded.status, \
             qr_payload = excluded.qr_payload, token = excluded.token, identity_key = excluded.identity_key, \
             identity_name = excluded.identity_name, identity_homeserver = excluded.identity_homeserver, \
             updated_at = CURRENT_TIMESTAMP",
    )
    .bind(&rec.session_id)
    .bind(&rec.status)
    .bind(&rec.qr_payload)
    .bind(&rec.token)
    .bind(&rec.identity_key)
    .bind(&rec.identity_name)
    .bind(&rec.identity_homeserver)
    .execute(pool)
    .await
    .context("failed to persist session")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_session(pool: &Pool) -> Result<Option<Session>> {
    let row = sqlx::query(
        "SELECT session_id, status, qr_payload, token, identity_key, identity_name, identity_homeserver \
         FROM session WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let rec = SessionRecord {
        session_id: row.get("session_id"),
        status: row.get("status"),
        qr_payload: row.try_get::<Option<String>, _>("qr_payload").ok().flatten(),
        token: row.try_get::<Option<String>, _>("token").ok().flatten(),
        identity_key: row.try_get::<Option<String>, _>("identity_key").ok().flatten(),
        identity_name: row.try_get::<Option<String>, _>("identity_name").ok().flatten(),
        identity_homeserver: row
            .try_get::<Option<String>, _>("identity_homeserver")
            .ok()
            .flatten(),
    };
    rec.into_session().map(Some)
}

#[instrument(skip_all)]
pub async fn clear_session(pool: &Pool) -> Result<()> {
    sqlx::query("DELETE FROM session WHERE id = 1")
        .execute(pool)
        .await?;
    Ok(())
}

// ---- pending queue ----

#[instrument(skip_all)]
pub async fn insert_pending(pool: &Pool, entry: &PendingPublication) -> Result<()> {
    sqlx::query(
        "INSERT INTO pending (id, payload, metadata, attempts, last_error, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(encode_payload(&entry.payload)?)
    .bind(&entry.metadata)
    .bind(entry.attempts)
    .bind(&entry.last_error)
    .bind(entry.created_at)
    .execute(pool)
    .await
    .context("failed to enqueue pending publication")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_pending(pool: &Pool) -> Result<Vec<PendingPublication>> {
    let rows = sqlx::query(
        "SELECT id, payload, metadata, attempts, last_error, created_at FROM pending ORDER BY datetime(created_at) ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let payload_raw: String = row.get("payload");
        out.push(PendingPublication {
            id: row.get("id"),
            payload: decode_payload(&payload_raw)?,
            metadata: row.try_get::<Option<String>, _>("metadata").ok().flatten(),
            attempts: row.get("attempts"),
            last_error: row.try_get::<Option<String>, _>("last_error").ok().flatten(),
            created_at: row.get("created_at"),
        });
    }
    Ok(out)
}

#[instrument(skip_all)]
pub async fn mark_pending_failed(pool: &Pool, id: &str, error: &str) -> Result<()> {
    sqlx::query("UPDATE pending SET attempts = attempts + 1, last_error = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Returns true when a row was actually removed.
#[instrument(skip_all)]
pub async fn delete_pending(pool: &Pool, id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM pending WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn count_pending(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---- bookmarks ----

/// Upsert keyed by id or normalized URL: a save matching either updates in
/// place, which is what keeps at most one live bookmark per URL.
#[instrument(skip_all)]
pub async fn upsert_bookmark(pool: &Pool, bookmark: &Bookmark) -> Result<Bookmark> {
    let mut tx = pool.begin().await?;
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM bookmarks WHERE id = ? OR url = ?")
            .bind(&bookmark.id)
            .bind(&bookmark.url)
            .fetch_optional(&mut *tx)
            .await?;

    let id = match existing {
        Some(id) => {
            sqlx::query(
                "UPDATE bookmarks SET url = ?, title = ?, note = ?, tags = ?, saved_at = ? WHERE id = ?",
            )
            .bind(&bookmark.url)
            .bind(&bookmark.title)
            .bind(&bookmark.note)
            .bind(encode_tags(&bookmark.tags))
            .bind(bookmark.saved_at)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            id
        }
        None => {
            sqlx::query(
                "INSERT INTO bookmarks (id, url, title, note, tags, saved_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&bookmark.id)
            .bind(&bookmark.url)
            .bind(&bookmark.title)
            .bind(&bookmark.note)
            .bind(encode_tags(&bookmark.tags))
            .bind(bookmark.saved_at)
            .execute(&mut *tx)
            .await?;
            bookmark.id.clone()
        }
    };
    tx.commit().await?;

    Ok(Bookmark {
        id,
        ..bookmark.clone()
    })
}

#[instrument(skip_all)]
pub async fn list_bookmarks(pool: &Pool) -> Result<Vec<Bookmark>> {
    let rows = sqlx::query(
        "SELECT id, url, title, note, tags, saved_at FROM bookmarks ORDER BY datetime(saved_at) DESC",
    )
    .fetch_all(pool)
    .await?;

    let out = rows
        .into_iter()
        .map(|row| {
            let tags_raw: String = row.get("tags");
            Bookmark {
                id: row.get("id"),
                url: row.get("url"),
                title: row.try_get::<Option<String>, _>("title").ok().flatten(),
                note: row.try_get::<Option<String>, _>("note").ok().flatten(),
                tags: decode_tags(&tags_raw),
                saved_at: row.get("saved_at"),
            }
        })
        .collect();
    Ok(out)
}

#[instrument(skip_all)]
pub async fn delete_bookmark(pool: &Pool, id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM bookmarks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

// ---- tag history ----

/// Merge-only: history never shrinks and never replaces existing tags.
#[instrument(skip_all)]
pub async fn merge_tag_history(pool: &Pool, tags: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for tag in tags {
        sqlx::query("INSERT OR IGNORE INTO tag_history (tag) VALUES (?)")
            .bind(tag)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_tag_history(pool: &Pool) -> Result<Vec<String>> {
    let tags: Vec<String> = sqlx::query_scalar("SELECT tag FROM tag_history ORDER BY tag ASC")
        .fetch_all(pool)
        .await?;
    Ok(tags)
}

// ---- feed cache ----

#[instrument(skip_all)]
pub async fn put_feed_cache(pool: &Pool, url: &str, items: &[FeedItem]) -> Result<()> {
    sqlx::query(
        "INSERT INTO feed_cache (url, items, fetched_at) VALUES (?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(url) DO UPDATE SET items = excluded.items, fetched_at = CURRENT_TIMESTAMP",
    )
    .bind(url)
    .bind(encode_items(items)?)
    .execute(pool)
    .await
    .context("failed to persist feed cache")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_feed_cache(pool: &Pool, url: &str) -> Result<Option<Vec<FeedItem>>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT items FROM feed_cache WHERE url = ?")
        .bind(url)
        .fetch_optional(pool)
        .await?;
    match raw {
        Some(raw) => Ok(Some(decode_items(&raw)?)),
        None => Ok(None),
    }
}

#[instrument(skip_all)]
pub async fn list_cached_urls(pool: &Pool) -> Result<Vec<String>> {
    let urls: Vec<String> =
        sqlx::query_scalar("SELECT url FROM feed_cache ORDER BY datetime(fetched_at) DESC")
            .fetch_all(pool)
            .await?;
    Ok(urls)
}

// ---- status ----

#[instrument(skip_all)]
pub async fn load_status(pool: &Pool) -> Result<StatusSnapshot> {
    let row = sqlx::query(
        "SELECT last_homeserver_error, last_successful_publish_at, last_feed_refresh_at, online FROM status WHERE id = 1",
    )
    .fetch_one(pool)
    .await?;

    Ok(StatusSnapshot {
        last_homeserver_error: row
            .try_get::<Option<String>, _>("last_homeserver_error")
            .ok()
            .flatten(),
        last_successful_publish_at: row
            .try_get::<Option<DateTime<Utc>>, _>("last_successful_publish_at")
            .ok()
            .flatten(),
        last_feed_refresh_at: row
            .try_get::<Option<DateTime<Utc>>, _>("last_feed_refresh_at")
            .ok()
            .flatten(),
        online: row.get::<i64, _>("online") != 0,
    })
}

#[instrument(skip_all)]
pub async fn set_status_error(pool: &Pool, error: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE status SET last_homeserver_error = ? WHERE id = 1")
        .bind(error)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_online(pool: &Pool, online: bool) -> Result<()> {
    sqlx::query("UPDATE status SET online = ? WHERE id = 1")
        .bind(online as i64)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_publish_success(pool: &Pool, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE status SET last_successful_publish_at = ?, last_homeserver_error = NULL, online = 1 WHERE id = 1",
    )
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_feed_refresh(pool: &Pool, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE status SET last_feed_refresh_at = ?, online = 1 WHERE id = 1")
        .bind(at)
        .execute(pool)
        .await?;
    Ok(())
}

// ---- settings ----

#[instrument(skip_all)]
pub async fn get_setting(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

#[instrument(skip_all)]
pub async fn set_setting(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}
