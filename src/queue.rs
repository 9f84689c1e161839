//! Publish Queue: a user-authored record is eventually delivered to the
//! homeserver, without blocking the caller and without silent loss. The
//! in-line attempt has a bounded exponential-backoff budget; once queued,
//! an entry is retried at the drain alarm's pace and never auto-discarded.

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db;
use crate::engine::{payload_from_request, Engine, PublishOutcome, PublishRequest};
use crate::gateway::GatewayError;
use crate::model::{PendingPublication, PublishPayload, SessionStatus};

impl Engine {
    /// Attempt immediate delivery; on budget exhaustion, queue durably and
    /// report success-with-queued. From the user's perspective the action
    /// is accepted either way. Only a permanent rejection surfaces as an
    /// error, since retrying cannot help it.
    #[instrument(skip_all)]
    pub async fn publish(
        &self,
        req: PublishRequest,
        metadata: Option<String>,
    ) -> Result<PublishOutcome> {
        let payload = payload_from_request(req);

        let token = self.auth_token().await;
        let Some(token) = token else {
            // Auth absence is terminal-for-now: queue without burning the
            // retry budget, paced by the drain alarm afterwards.
            self.enqueue(payload, metadata, Some("not authenticated"))
                .await?;
            return Ok(PublishOutcome::Queued);
        };

        let mut last_error: Option<String> = None;
        for attempt in 0..self.cfg.immediate_attempts {
            match self.gateway.publish_record(&token, &payload).await {
                Ok(()) => {
                    self.on_delivered(&payload).await;
                    return Ok(PublishOutcome::Delivered);
                }
                Err(GatewayError::Unauthorized) => {
                    last_error = Some(GatewayError::Unauthorized.to_string());
                    break;
                }
                Err(err @ GatewayError::Rejected(_)) => {
                    self.note_gateway_error(&err).await;
                    return Err(anyhow!(err));
                }
                Err(err) => {
                    warn!(?err, attempt, "publish attempt failed");
                    self.note_gateway_error(&err).await;
                    last_error = Some(err.to_string());
                    // Exponential backoff, doubling from the base delay.
                    if attempt + 1 < self.cfg.immediate_attempts {
                        tokio::time::sleep(self.cfg.backoff_base * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        self.enqueue(payload, metadata, last_error.as_deref()).await?;
        Ok(PublishOutcome::Queued)
    }

    async fn enqueue(
        &self,
        payload: PublishPayload,
        metadata: Option<String>,
        last_error: Option<&str>,
    ) -> Result<()> {
        let entry = PendingPublication {
            id: Uuid::new_v4().to_string(),
            payload,
            metadata,
            attempts: 0,
            last_error: last_error.map(str::to_string),
            created_at: Utc::now(),
        };
        db::insert_pending(&self.pool, &entry).await?;
        info!(id = entry.id, "publication queued for later delivery");
        self.broadcast_pending().await;
        Ok(())
    }

    /// One pass over the queue: every entry gets exactly one delivery
    /// attempt, independently, so one failure never blocks another's
    /// delivery. The updated queue is broadcast once per pass.
    #[instrument(skip_all)]
    pub async fn drain_queue(&self) -> Result<()> {
        let entries = db::list_pending(&self.pool).await?;
        if entries.is_empty() {
            return Ok(());
        }

        let Some(token) = self.auth_token().await else {
            info!(
                queued = entries.len(),
                "not authenticated; leaving queue for next drain"
            );
            return Ok(());
        };

        let mut delivered_urls: Vec<String> = Vec::new();
        for entry in &entries {
            match self.gateway.publish_record(&token, &entry.payload).await {
                Ok(()) => {
                    if let Err(err) = db::delete_pending(&self.pool, &entry.id).await {
                        warn!(?err, id = entry.id, "failed to remove delivered entry");
                        continue;
                    }
                    if let Err(err) =
                        db::merge_tag_history(&self.pool, &entry.payload.tags).await
                    {
                        warn!(?err, "failed to merge tag history");
                    }
                    info!(id = entry.id, "queued publication delivered");
                    delivered_urls.push(entry.payload.url.clone());
                }
                Err(err) => {
                    warn!(?err, id = entry.id, attempts = entry.attempts, "queued delivery failed");
                    if let Err(db_err) =
                        db::mark_pending_failed(&self.pool, &entry.id, &err.to_string()).await
                    {
                        warn!(?db_err, id = entry.id, "failed to record delivery failure");
                    }
                    self.note_gateway_error(&err).await;
                }
            }
        }

        if !delivered_urls.is_empty() {
            if let Err(err) = db::mark_publish_success(&self.pool, Utc::now()).await {
                warn!(?err, "failed to stamp publish success");
            }
            self.broadcast_status().await;
        }
        self.broadcast_pending().await;

        // Delivered records change what the homeserver reports for their
        // URLs; refresh those caches best-effort.
        delivered_urls.sort();
        delivered_urls.dedup();
        for url in delivered_urls {
            if let Err(err) = self.get_feed(&url, true).await {
                warn!(?err, url, "feed refresh after delivery failed");
            }
        }
        Ok(())
    }

    /// Side effects of a successful in-line delivery: tag history merge,
    /// status stamp, best-effort feed refresh. Failures here are logged,
    /// not surfaced, since the publish itself already succeeded.
    async fn on_delivered(&self, payload: &PublishPayload) {
        if let Err(err) = db::merge_tag_history(&self.pool, &payload.tags).await {
            warn!(?err, "failed to merge tag history");
        }
        if let Err(err) = db::mark_publish_success(&self.pool, Utc::now()).await {
            warn!(?err, "failed to stamp publish success");
        }
        self.broadcast_status().await;
        if let Err(err) = self.get_feed(&payload.url, true).await {
            warn!(?err, url = payload.url, "feed refresh after publish failed");
        }
    }

    pub(crate) async fn auth_token(&self) -> Option<String> {
        self.session_or_none()
            .await
            .filter(|s| s.status == SessionStatus::Authenticated)
            .and_then(|s| s.token)
    }
}
