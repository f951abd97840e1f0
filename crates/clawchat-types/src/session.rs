use serde::{Deserialize, Serialize};

/// A chat transcript scoped to one gateway. Uniquely identified by
/// `(gateway_id, session_key)`; the surrogate `id` exists only for message
/// foreign keys and cursors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub gateway_id: String,
    pub session_key: String,
    pub title: Option<String>,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub created_at: i64,
    pub last_activity: i64,
}

/// One `(gateway, session key)` pair inside a federated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedTarget {
    pub gateway_id: String,
    pub session_key: String,
}

/// A named collection of targets treated as one conversational surface.
/// Lifecycle is independent from the per-gateway sessions its targets
/// point at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedSession {
    pub id: String,
    pub title: Option<String>,
    pub gateways: Vec<FederatedTarget>,
    pub created_at: i64,
    pub last_activity: i64,
}
