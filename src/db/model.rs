use crate::model::{FeedItem, Identity, PublishPayload, Session, SessionStatus};
use anyhow::{anyhow, Result};

/// Flat image of the single `session` row.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub status: String,
    pub qr_payload: Option<String>,
    pub token: Option<String>,
    pub identity_key: Option<String>,
    pub identity_name: Option<String>,
    pub identity_homeserver: Option<String>,
}

impl SessionRecord {
    pub fn from_session(s: &Session) -> Self {
        Self {
            session_id: s.id.clone(),
            status: s.status.as_str().to_string(),
            qr_payload: s.qr_payload.clone(),
            token: s.token.clone(),
            identity_key: s.identity.as_ref().map(|i| i.public_key.clone()),
            identity_name: s.identity.as_ref().and_then(|i| i.display_name.clone()),
            identity_homeserver: s.identity.as_ref().and_then(|i| i.homeserver.clone()),
        }
    }

    pub fn into_session(self) -> Result<Session> {
        let status = SessionStatus::parse_status(&self.status)
            .ok_or_else(|| anyhow!("unknown session status {}", self.status))?;
        let identity = self.identity_key.map(|public_key| Identity {
            public_key,
            display_name: self.identity_name,
            homeserver: self.identity_homeserver,
        });
        Ok(Session {
            id: self.session_id,
            status,
            qr_payload: self.qr_payload,
            token: self.token,
            identity,
        })
    }
}

pub fn encode_tags(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

pub fn decode_tags(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub fn encode_payload(payload: &PublishPayload) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

pub fn decode_payload(raw: &str) -> Result<PublishPayload> {
    Ok(serde_json::from_str(raw)?)
}

pub fn encode_items(items: &[FeedItem]) -> Result<String> {
    Ok(serde_json::to_string(items)?)
}

pub fn decode_items(raw: &str) -> Result<Vec<FeedItem>> {
    Ok(serde_json::from_str(raw)?)
}
