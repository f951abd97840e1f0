use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored gateway configuration, including its credentials.
///
/// This type deliberately does not implement `Serialize`: tokens and
/// passwords must never leave the process through a response body or a
/// WebSocket frame. The public projection is [`GatewayRecord`].
#[derive(Clone)]
pub struct GatewayConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    pub password: Option<String>,
    /// Milliseconds since epoch.
    pub created_at: i64,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// The secret-free view of a gateway row, safe to return to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Cached upstream metadata, refreshed on every successful handshake.
///
/// Agents and models are kept as raw JSON values: the upstream schema for
/// them varies between gateway versions and the proxy only relays them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewaySnapshot {
    pub agents: Vec<Value>,
    pub models: Vec<Value>,
    #[serde(rename = "defaultModel")]
    pub default_model: Option<String>,
}

impl GatewaySnapshot {
    /// Best-effort name of the first agent in the snapshot, used as the
    /// source tag fallback for federated streams.
    pub fn first_agent_name(&self) -> Option<String> {
        let agent = self.agents.first()?;
        agent
            .get("name")
            .or_else(|| agent.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}
