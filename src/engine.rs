use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, Pool};
use crate::gateway::{GatewayError, RemoteGateway};
use crate::model::{
    normalize_tags, normalize_url, Bookmark, FeedItem, Identity, PendingPublication,
    PublishPayload, SessionStatus, StatusSnapshot,
};

pub const SETTING_HOMESERVER: &str = "homeserver_origin";

/// Runtime knobs, lifted out of `Config` so tests can shrink every timer.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub immediate_attempts: u32,
    pub backoff_base: Duration,
    pub login_poll_interval: Duration,
    pub login_deadline: Duration,
}

impl EngineConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            immediate_attempts: cfg.publish.immediate_attempts,
            backoff_base: Duration::from_millis(cfg.publish.backoff_base_ms),
            login_poll_interval: Duration::from_millis(cfg.login.poll_interval_ms),
            login_deadline: Duration::from_secs(cfg.login.deadline_secs),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            immediate_attempts: 3,
            backoff_base: Duration::from_millis(500),
            login_poll_interval: Duration::from_millis(2000),
            login_deadline: Duration::from_secs(120),
        }
    }
}

/// Session state as exposed to UI surfaces. The token never leaves the
/// engine.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub status: SessionStatus,
    pub qr_payload: Option<String>,
    pub identity: Option<Identity>,
}

/// One consistent snapshot assembled on every mutation.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub session: Option<SessionView>,
    pub tag_history: Vec<String>,
    pub bookmarks: Vec<Bookmark>,
    pub pending: Vec<PendingPublication>,
    pub status: StatusSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    AuthStateChanged { state: StateSnapshot },
    FeedUpdated { url: String, items: Vec<FeedItem> },
    BookmarksUpdated { state: StateSnapshot },
    PendingUpdated { state: StateSnapshot },
    StatusUpdated { state: StateSnapshot },
}

/// A record as authored by a UI surface; the engine stamps the timestamp
/// and normalizes URL and tags.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub title: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookmarkRequest {
    pub id: Option<String>,
    pub url: String,
    pub title: Option<String>,
    pub note: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    StartLogin,
    Logout,
    GetSession,
    SetHomeserver { origin: String },
    GetFeed {
        url: String,
        #[serde(default)]
        refresh: bool,
    },
    Publish {
        payload: PublishRequest,
        metadata: Option<String>,
    },
    GetBookmarks,
    SaveBookmark { bookmark: BookmarkRequest },
    DeleteBookmark { id: String },
    GetTagHistory,
    GetStatus,
    RetryPending,
    CancelPending { id: String },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PublishOutcome {
    Delivered,
    Queued,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum Response {
    Ack,
    Session { session: Option<SessionView> },
    LoginStarted { session_id: String, qr_payload: String },
    Feed { url: String, items: Vec<FeedItem> },
    Published { outcome: PublishOutcome },
    Bookmarks { bookmarks: Vec<Bookmark> },
    Bookmark { bookmark: Bookmark },
    TagHistory { tags: Vec<String> },
    Status { status: StatusSnapshot },
    Error { message: String },
}

/// The background synchronization engine. Owns all mutable state;
/// constructed once per process, no ambient globals. The durable store is
/// the single source of truth and every mutation is a full
/// read-modify-persist-broadcast cycle.
pub struct Engine {
    pub(crate) pool: Pool,
    pub(crate) gateway: Arc<dyn RemoteGateway>,
    pub(crate) cfg: EngineConfig,
    events: broadcast::Sender<Event>,
    pub(crate) poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(pool: Pool, gateway: Arc<dyn RemoteGateway>, cfg: EngineConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            pool,
            gateway,
            cfg,
            events,
            poll_task: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Best-effort fan-out. A surface that is not listening is not an
    /// error, so send failures are logged and swallowed.
    pub(crate) fn notify(&self, event: Event) {
        if let Err(err) = self.events.send(event) {
            debug!(?err, "no listeners for event");
        }
    }

    // ---- snapshot assembly (State Broadcaster) ----

    pub async fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            session: self.session_view().await,
            tag_history: self.tag_history_or_default().await,
            bookmarks: self.bookmarks_or_default().await,
            pending: self.pending_or_default().await,
            status: self.status_or_default().await,
        }
    }

    pub(crate) async fn broadcast_auth(&self) {
        let state = self.snapshot().await;
        self.notify(Event::AuthStateChanged { state });
    }

    pub(crate) async fn broadcast_bookmarks(&self) {
        let state = self.snapshot().await;
        self.notify(Event::BookmarksUpdated { state });
    }

    pub(crate) async fn broadcast_pending(&self) {
        let state = self.snapshot().await;
        self.notify(Event::PendingUpdated { state });
    }

    pub(crate) async fn broadcast_status(&self) {
        let state = self.snapshot().await;
        self.notify(Event::StatusUpdated { state });
    }

    // ---- degrade-to-default reads ----
    // Losing a storage read must never crash a UI command.

    pub(crate) async fn session_or_none(&self) -> Option<crate::model::Session> {
        match db::load_session(&self.pool).await {
            Ok(s) => s,
            Err(err) => {
                warn!(?err, "failed to load session; treating as signed out");
                None
            }
        }
    }

    async fn session_view(&self) -> Option<SessionView> {
        self.session_or_none().await.map(|s| SessionView {
            status: s.status,
            qr_payload: s.qr_payload,
            identity: s.identity,
        })
    }

    async fn tag_history_or_default(&self) -> Vec<String> {
        match db::list_tag_history(&self.pool).await {
            Ok(tags) => tags,
            Err(err) => {
                warn!(?err, "failed to load tag history");
                Vec::new()
            }
        }
    }

    pub(crate) async fn bookmarks_or_default(&self) -> Vec<Bookmark> {
        match db::list_bookmarks(&self.pool).await {
            Ok(b) => b,
            Err(err) => {
                warn!(?err, "failed to load bookmarks");
                Vec::new()
            }
        }
    }

    pub(crate) async fn pending_or_default(&self) -> Vec<PendingPublication> {
        match db::list_pending(&self.pool).await {
            Ok(p) => p,
            Err(err) => {
                warn!(?err, "failed to load pending queue");
                Vec::new()
            }
        }
    }

    pub(crate) async fn status_or_default(&self) -> StatusSnapshot {
        match db::load_status(&self.pool).await {
            Ok(s) => s,
            Err(err) => {
                warn!(?err, "failed to load status");
                StatusSnapshot::default()
            }
        }
    }

    /// Record a gateway failure in status. Network errors also flip the
    /// online indicator; any gateway success flips it back.
    pub(crate) async fn note_gateway_error(&self, err: &GatewayError) {
        if let Err(db_err) = db::set_status_error(&self.pool, Some(&err.to_string())).await {
            warn!(?db_err, "failed to persist homeserver error");
        }
        if matches!(err, GatewayError::Network(_)) {
            if let Err(db_err) = db::set_online(&self.pool, false).await {
                warn!(?db_err, "failed to persist offline state");
            }
        }
        self.broadcast_status().await;
    }

    // ---- command dispatch ----

    /// Single entry point for UI surfaces. Never panics and never lets a
    /// background failure escape: errors come back as `Response::Error`.
    #[instrument(skip_all)]
    pub async fn dispatch(self: &Arc<Self>, cmd: Command) -> Response {
        match cmd {
            Command::StartLogin => match self.start_login().await {
                Ok(handle) => Response::LoginStarted {
                    session_id: handle.id,
                    qr_payload: handle.qr_payload,
                },
                Err(err) => Response::Error {
                    message: err.to_string(),
                },
            },
            Command::Logout => {
                self.logout().await;
                Response::Ack
            }
            Command::GetSession => Response::Session {
                session: self.session_view().await,
            },
            Command::SetHomeserver { origin } => match self.set_homeserver(&origin).await {
                Ok(()) => Response::Ack,
                Err(err) => Response::Error {
                    message: err.to_string(),
                },
            },
            Command::GetFeed { url, refresh } => match self.get_feed(&url, refresh).await {
                Ok(items) => Response::Feed {
                    url: normalize_url(&url),
                    items,
                },
                Err(err) => Response::Error {
                    message: err.to_string(),
                },
            },
            Command::Publish { payload, metadata } => {
                match self.publish(payload, metadata).await {
                    Ok(outcome) => Response::Published { outcome },
                    Err(err) => Response::Error {
                        message: err.to_string(),
                    },
                }
            }
            Command::GetBookmarks => Response::Bookmarks {
                bookmarks: self.bookmarks_or_default().await,
            },
            Command::SaveBookmark { bookmark } => match self.save_bookmark(bookmark).await {
                Ok(saved) => Response::Bookmark { bookmark: saved },
                Err(err) => Response::Error {
                    message: err.to_string(),
                },
            },
            Command::DeleteBookmark { id } => match self.delete_bookmark(&id).await {
                Ok(()) => Response::Ack,
                Err(err) => Response::Error {
                    message: err.to_string(),
                },
            },
            Command::GetTagHistory => Response::TagHistory {
                tags: self.tag_history_or_default().await,
            },
            Command::GetStatus => Response::Status {
                status: self.status_or_default().await,
            },
            Command::RetryPending => match self.drain_queue().await {
                Ok(()) => Response::Ack,
                Err(err) => Response::Error {
                    message: err.to_string(),
                },
            },
            Command::CancelPending { id } => match self.cancel_pending(&id).await {
                Ok(()) => Response::Ack,
                Err(err) => Response::Error {
                    message: err.to_string(),
                },
            },
        }
    }

    // ---- homeserver setting ----

    pub async fn set_homeserver(&self, origin: &str) -> anyhow::Result<()> {
        self.gateway.set_homeserver(origin)?;
        db::set_setting(&self.pool, SETTING_HOMESERVER, origin).await?;
        self.broadcast_status().await;
        Ok(())
    }

    // ---- bookmarks ----

    pub async fn save_bookmark(&self, req: BookmarkRequest) -> anyhow::Result<Bookmark> {
        let tags = normalize_tags(&req.tags);
        let bookmark = Bookmark {
            id: req.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            url: normalize_url(&req.url),
            title: req.title,
            note: req.note,
            tags: tags.clone(),
            saved_at: Utc::now(),
        };
        let saved = db::upsert_bookmark(&self.pool, &bookmark).await?;
        db::merge_tag_history(&self.pool, &tags).await?;
        self.broadcast_bookmarks().await;
        Ok(saved)
    }

    pub async fn delete_bookmark(&self, id: &str) -> anyhow::Result<()> {
        db::delete_bookmark(&self.pool, id).await?;
        self.broadcast_bookmarks().await;
        Ok(())
    }

    // ---- pending queue surface ----

    pub async fn cancel_pending(&self, id: &str) -> anyhow::Result<()> {
        db::delete_pending(&self.pool, id).await?;
        self.broadcast_pending().await;
        Ok(())
    }
}

/// Turn a publish request into a normalized payload.
pub(crate) fn payload_from_request(req: PublishRequest) -> PublishPayload {
    PublishPayload {
        url: req.url,
        tags: req.tags,
        title: req.title,
        comment: req.comment,
        created_at: Utc::now(),
    }
    .normalized()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parses_kebab_case() {
        let cmd: Command =
            serde_json::from_str(r#"{"cmd":"get-feed","url":"https://example.com","refresh":true}"#)
                .unwrap();
        match cmd {
            Command::GetFeed { url, refresh } => {
                assert_eq!(url, "https://example.com");
                assert!(refresh);
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn get_feed_refresh_defaults_false() {
        let cmd: Command =
            serde_json::from_str(r#"{"cmd":"get-feed","url":"https://example.com"}"#).unwrap();
        assert!(matches!(cmd, Command::GetFeed { refresh: false, .. }));
    }

    #[test]
    fn payload_from_request_normalizes() {
        let payload = payload_from_request(PublishRequest {
            url: "https://example.com/page#frag".into(),
            tags: vec!["Rust".into(), "rust".into()],
            title: None,
            comment: None,
        });
        assert_eq!(payload.url, "https://example.com/page");
        assert_eq!(payload.tags, vec!["rust".to_string()]);
    }

    #[test]
    fn response_serializes_outcome() {
        let json = serde_json::to_value(Response::Published {
            outcome: PublishOutcome::Queued,
        })
        .unwrap();
        assert_eq!(json["result"], "published");
        assert_eq!(json["outcome"], "queued");
    }
}
