use serde::Deserialize;

use crate::model::{Identity, SessionStatus};

/// Handle returned when a ring session is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    pub qr_payload: String,
}

/// Outcome of one session-status poll.
#[derive(Debug, Clone)]
pub struct SessionPoll {
    pub status: SessionStatus,
    pub token: Option<String>,
    pub identity: Option<Identity>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionResp {
    pub id: String,
    #[serde(alias = "qr")]
    pub qr_payload: String,
}

#[derive(Debug, Deserialize)]
pub struct IdentityResp {
    #[serde(alias = "pubkey")]
    pub public_key: String,
    #[serde(alias = "name")]
    pub display_name: Option<String>,
    pub homeserver: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PollSessionResp {
    pub status: String,
    pub token: Option<String>,
    pub identity: Option<IdentityResp>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreSessionResp {
    pub identity: IdentityResp,
}

#[derive(Debug, Deserialize)]
pub struct FollowsResp {
    pub follows: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryContentResp {
    pub records: Vec<serde_json::Value>,
}

impl From<IdentityResp> for Identity {
    fn from(r: IdentityResp) -> Self {
        Identity {
            public_key: r.public_key,
            display_name: r.display_name,
            homeserver: r.homeserver,
        }
    }
}
