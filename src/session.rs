//! Session Manager: drives the QR ring-login handshake and keeps exactly
//! one authoritative session. State machine:
//! `none → pending → {authenticated | expired}`; `authenticated → none`
//! (logout); `expired → none` (clear) or `expired → pending` (restart).

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::db;
use crate::engine::Engine;
use crate::gateway::model::SessionHandle;
use crate::model::{Session, SessionStatus};

impl Engine {
    /// Open a new ring session and begin the bounded polling loop. Any
    /// in-flight poll loop is cancelled first, so at most one is active.
    #[instrument(skip_all)]
    pub async fn start_login(self: &Arc<Self>) -> anyhow::Result<SessionHandle> {
        self.stop_poll_loop().await;

        let handle = match self.gateway.create_session().await {
            Ok(h) => h,
            Err(err) => {
                self.note_gateway_error(&err).await;
                return Err(err.into());
            }
        };

        let session = Session {
            id: handle.id.clone(),
            status: SessionStatus::Pending,
            qr_payload: Some(handle.qr_payload.clone()),
            token: None,
            identity: None,
        };
        db::save_session(&self.pool, &session).await?;
        self.broadcast_auth().await;

        let engine = Arc::clone(self);
        let session_id = handle.id.clone();
        let task = tokio::spawn(async move {
            engine.run_poll_loop(session_id).await;
        });
        *self.poll_task.lock().await = Some(task);

        Ok(handle)
    }

    /// Poll until the session leaves `pending` or the wall-clock deadline
    /// elapses, whichever comes first. Poll errors are logged and retried
    /// on the next tick; only the deadline or a terminal status stops the
    /// loop.
    async fn run_poll_loop(self: Arc<Self>, session_id: String) {
        let deadline = Instant::now() + self.cfg.login_deadline;
        loop {
            tokio::time::sleep(self.cfg.login_poll_interval).await;

            if Instant::now() >= deadline {
                info!(session_id, "login deadline elapsed; expiring session");
                self.expire_session(&session_id).await;
                return;
            }

            match self.gateway.poll_session(&session_id).await {
                Ok(poll) => match poll.status {
                    SessionStatus::Pending => continue,
                    SessionStatus::Authenticated => {
                        let session = Session {
                            id: session_id.clone(),
                            status: SessionStatus::Authenticated,
                            qr_payload: None,
                            token: poll.token,
                            identity: poll.identity,
                        };
                        if let Err(err) = db::save_session(&self.pool, &session).await {
                            warn!(?err, "failed to persist authenticated session");
                        }
                        info!(session_id, "login authenticated");
                        self.broadcast_auth().await;
                        // Auth just became available: try to deliver
                        // anything that queued up while signed out.
                        let engine = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = engine.drain_queue().await {
                                warn!(?err, "post-login drain failed");
                            }
                        });
                        return;
                    }
                    SessionStatus::Expired => {
                        info!(session_id, "homeserver reported session expired");
                        self.expire_session(&session_id).await;
                        return;
                    }
                },
                Err(err) => {
                    warn!(?err, session_id, "session poll failed; will retry");
                }
            }
        }
    }

    /// Transition to `expired`, cancel remotely best-effort, broadcast.
    async fn expire_session(&self, session_id: &str) {
        let session = Session {
            id: session_id.to_string(),
            status: SessionStatus::Expired,
            qr_payload: None,
            token: None,
            identity: None,
        };
        if let Err(err) = db::save_session(&self.pool, &session).await {
            warn!(?err, "failed to persist expired session");
        }
        if let Err(err) = self.gateway.cancel_session(session_id).await {
            warn!(?err, session_id, "best-effort session cancel failed");
        }
        self.broadcast_auth().await;
    }

    /// Logout always succeeds locally, even if the remote sign-out fails.
    #[instrument(skip_all)]
    pub async fn logout(self: &Arc<Self>) {
        self.stop_poll_loop().await;

        if let Some(session) = self.session_or_none().await {
            if let Err(err) = self.gateway.cancel_session(&session.id).await {
                warn!(?err, "best-effort remote sign-out failed");
            }
        }
        if let Err(err) = db::clear_session(&self.pool).await {
            warn!(?err, "failed to clear persisted session");
        }
        self.broadcast_auth().await;
    }

    /// Restore the persisted session at startup, revalidating it against
    /// the homeserver before trusting it. A session the remote no longer
    /// honors is discarded rather than presented.
    #[instrument(skip_all)]
    pub async fn restore_session(self: &Arc<Self>) {
        let Some(session) = self.session_or_none().await else {
            self.broadcast_auth().await;
            return;
        };

        let token = match (&session.status, &session.token) {
            (SessionStatus::Authenticated, Some(token)) => token.clone(),
            _ => {
                // A pending or expired leftover from a previous process is
                // stale either way.
                if let Err(err) = db::clear_session(&self.pool).await {
                    warn!(?err, "failed to discard stale session");
                }
                self.broadcast_auth().await;
                return;
            }
        };

        match self.gateway.restore_session(&token).await {
            Ok(identity) => {
                let restored = Session {
                    identity: Some(identity),
                    ..session
                };
                if let Err(err) = db::save_session(&self.pool, &restored).await {
                    warn!(?err, "failed to persist restored session");
                }
                info!("session restored");
                self.broadcast_auth().await;
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = engine.drain_queue().await {
                        warn!(?err, "post-restore drain failed");
                    }
                });
            }
            Err(err) => {
                warn!(?err, "session restore rejected; discarding");
                self.note_gateway_error(&err).await;
                if let Err(db_err) = db::clear_session(&self.pool).await {
                    warn!(?db_err, "failed to discard rejected session");
                }
                self.broadcast_auth().await;
            }
        }
    }

    /// Cancel any in-flight poll loop. Called before starting a new login
    /// and on logout so two loops never race on the same session row.
    pub(crate) async fn stop_poll_loop(&self) {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
    }
}
