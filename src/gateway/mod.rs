use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;
use tracing::warn;

use crate::model::{Identity, PublishPayload, SessionStatus};
use crate::gateway::model::{
    CreateSessionResp, FollowsResp, PollSessionResp, QueryContentResp, RestoreSessionResp,
    SessionHandle, SessionPoll,
};

pub mod model;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not authenticated")]
    Unauthorized,
    #[error("homeserver rejected request: {0}")]
    Rejected(String),
    #[error("homeserver error {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid gateway response: {0}")]
    Invalid(String),
}

impl GatewayError {
    /// Transient failures are worth retrying; rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Network(_) | GatewayError::Remote { .. })
    }
}

/// Contract the engine needs from the identity/session API and the
/// content-query API. The homeserver's record schema is opaque beyond the
/// fields the feed coercion step reads.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn create_session(&self) -> Result<SessionHandle, GatewayError>;
    async fn poll_session(&self, id: &str) -> Result<SessionPoll, GatewayError>;
    /// Best-effort: callers log failures and move on.
    async fn cancel_session(&self, id: &str) -> Result<(), GatewayError>;
    /// Revalidate a persisted token; the returned identity is adopted.
    async fn restore_session(&self, token: &str) -> Result<Identity, GatewayError>;
    async fn resolve_follows(&self, identity_key: &str) -> Result<Vec<String>, GatewayError>;
    async fn query_content(
        &self,
        normalized_url: &str,
        author_filter: Option<&[String]>,
    ) -> Result<Vec<Value>, GatewayError>;
    async fn publish_record(
        &self,
        token: &str,
        record: &PublishPayload,
    ) -> Result<(), GatewayError>;
    fn set_homeserver(&self, origin: &str) -> Result<(), GatewayError>;
}

/// HTTP implementation talking to the user's homeserver.
pub struct HttpGateway {
    http: Client,
    base_url: RwLock<Url>,
}

impl fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGateway").finish_non_exhaustive()
    }
}

impl HttpGateway {
    pub fn new(origin: &str) -> Result<Self, GatewayError> {
        let base_url =
            Url::parse(origin).map_err(|e| GatewayError::Invalid(format!("origin: {e}")))?;
        let http = Client::builder()
            .user_agent("ringmark/0.1")
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: RwLock::new(base_url),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        let base = self
            .base_url
            .read()
            .map_err(|_| GatewayError::Invalid("gateway base URL lock poisoned".into()))?;
        base.join(path)
            .map_err(|e| GatewayError::Invalid(format!("endpoint {path}: {e}")))
    }

    async fn check(&self, res: Response) -> Result<Response, GatewayError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::Unauthorized);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            warn!(%status, "homeserver transient error");
            return Err(GatewayError::Remote {
                status: status.as_u16(),
                body,
            });
        }
        // Remaining 4xx means the request itself is unacceptable.
        Err(GatewayError::Rejected(format!("{status}: {body}")))
    }
}

fn net_err(e: reqwest::Error) -> GatewayError {
    GatewayError::Network(e.to_string())
}

fn invalid(e: reqwest::Error) -> GatewayError {
    GatewayError::Invalid(e.to_string())
}

/// Body for a content query, author-scoped when a follow list is given.
pub fn build_query_body(normalized_url: &str, author_filter: Option<&[String]>) -> Value {
    let mut body = json!({ "url": normalized_url });
    if let Some(authors) = author_filter.filter(|a| !a.is_empty()) {
        body["authors"] = json!(authors);
    }
    body
}

/// Wire form of an outbound record.
pub fn build_record_body(record: &PublishPayload) -> Value {
    json!({
        "url": record.url,
        "tags": record.tags,
        "title": record.title,
        "comment": record.comment,
        "created_at": record.created_at.to_rfc3339(),
    })
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn create_session(&self) -> Result<SessionHandle, GatewayError> {
        let res = self
            .http
            .post(self.endpoint("v0/sessions")?)
            .send()
            .await
            .map_err(net_err)?;
        let resp: CreateSessionResp = self.check(res).await?.json().await.map_err(invalid)?;
        Ok(SessionHandle {
            id: resp.id,
            qr_payload: resp.qr_payload,
        })
    }

    async fn poll_session(&self, id: &str) -> Result<SessionPoll, GatewayError> {
        let res = self
            .http
            .get(self.endpoint(&format!("v0/sessions/{id}"))?)
            .send()
            .await
            .map_err(net_err)?;
        let resp: PollSessionResp = self.check(res).await?.json().await.map_err(invalid)?;
        let status = SessionStatus::parse_status(&resp.status)
            .ok_or_else(|| GatewayError::Invalid(format!("session status {}", resp.status)))?;
        Ok(SessionPoll {
            status,
            token: resp.token,
            identity: resp.identity.map(Into::into),
        })
    }

    async fn cancel_session(&self, id: &str) -> Result<(), GatewayError> {
        let res = self
            .http
            .delete(self.endpoint(&format!("v0/sessions/{id}"))?)
            .send()
            .await
            .map_err(net_err)?;
        self.check(res).await?;
        Ok(())
    }

    async fn restore_session(&self, token: &str) -> Result<Identity, GatewayError> {
        let res = self
            .http
            .post(self.endpoint("v0/sessions/restore")?)
            .bearer_auth(token)
            .send()
            .await
            .map_err(net_err)?;
        let resp: RestoreSessionResp = self.check(res).await?.json().await.map_err(invalid)?;
        Ok(resp.identity.into())
    }

    async fn resolve_follows(&self, identity_key: &str) -> Result<Vec<String>, GatewayError> {
        let res = self
            .http
            .get(self.endpoint(&format!("v0/follows/{identity_key}"))?)
            .send()
            .await
            .map_err(net_err)?;
        let resp: FollowsResp = self.check(res).await?.json().await.map_err(invalid)?;
        Ok(resp.follows)
    }

    async fn query_content(
        &self,
        normalized_url: &str,
        author_filter: Option<&[String]>,
    ) -> Result<Vec<Value>, GatewayError> {
        let body = build_query_body(normalized_url, author_filter);
        let res = self
            .http
            .post(self.endpoint("v0/query")?)
            .json(&body)
            .send()
            .await
            .map_err(net_err)?;
        let resp: QueryContentResp = self.check(res).await?.json().await.map_err(invalid)?;
        Ok(resp.records)
    }

    async fn publish_record(
        &self,
        token: &str,
        record: &PublishPayload,
    ) -> Result<(), GatewayError> {
        let body = build_record_body(record);
        let res = self
            .http
            .put(self.endpoint("v0/records")?)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(net_err)?;
        self.check(res).await?;
        Ok(())
    }

    fn set_homeserver(&self, origin: &str) -> Result<(), GatewayError> {
        let parsed =
            Url::parse(origin).map_err(|e| GatewayError::Invalid(format!("origin: {e}")))?;
        let mut base = self
            .base_url
            .write()
            .map_err(|_| GatewayError::Invalid("gateway base URL lock poisoned".into()))?;
        *base = parsed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn build_query_body_without_authors() {
        let body = build_query_body("https://example.com/", None);
        assert_eq!(body["url"], "https://example.com/");
        assert!(body.get("authors").is_none());
    }

    #[test]
    fn build_query_body_with_authors() {
        let authors = vec!["key-a".to_string(), "key-b".to_string()];
        let body = build_query_body("https://example.com/", Some(&authors));
        assert_eq!(body["authors"][0], "key-a");
        assert_eq!(body["authors"][1], "key-b");
    }

    #[test]
    fn build_query_body_empty_author_list_is_unfiltered() {
        let body = build_query_body("https://example.com/", Some(&[]));
        assert!(body.get("authors").is_none());
    }

    #[test]
    fn build_record_body_includes_all_fields() {
        let record = PublishPayload {
            url: "https://example.com/".into(),
            tags: vec!["rust".into()],
            title: Some("Title".into()),
            comment: Some("nice".into()),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };
        let body = build_record_body(&record);
        assert_eq!(body["url"], "https://example.com/");
        assert_eq!(body["tags"][0], "rust");
        assert_eq!(body["title"], "Title");
        assert_eq!(body["comment"], "nice");
        assert_eq!(body["created_at"], "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn set_homeserver_repoints_endpoints() {
        let gw = HttpGateway::new("https://old.example").unwrap();
        gw.set_homeserver("https://new.example").unwrap();
        let url = gw.endpoint("v0/sessions").unwrap();
        assert_eq!(url.as_str(), "https://new.example/v0/sessions");
    }

    #[test]
    fn set_homeserver_rejects_bad_origin() {
        let gw = HttpGateway::new("https://old.example").unwrap();
        assert!(gw.set_homeserver("not a url").is_err());
    }
}
