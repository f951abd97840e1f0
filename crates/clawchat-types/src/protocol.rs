//! Upstream gateway wire protocol: one JSON object per WebSocket text frame.
//!
//! Three frame shapes exist on the wire: requests carry a correlation id and
//! a method, responses echo the id with `ok`/`payload`/`error`, and events
//! are fire-and-forget notifications keyed by event name.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: u8 = 3;

pub const OPERATOR_SCOPES: &[&str] = &[
    "operator.read",
    "operator.write",
    "operator.admin",
    "operator.approvals",
    "operator.pairing",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        #[serde(default)]
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    #[serde(default)]
    pub message: String,
}

/// Parameters of the `connect` request sent after `connect.challenge`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectParams {
    /// Omitted entirely when the gateway has device auth disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthBlock>,
    pub role: &'static str,
    pub scopes: Vec<&'static str>,
    pub permissions: Value,
    pub client: ClientInfo,
    #[serde(rename = "minProtocol")]
    pub min_protocol: u8,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
}

impl ConnectParams {
    pub fn new(gateway_id: &str, token: Option<String>, password: Option<String>) -> Self {
        let auth = if token.is_some() || password.is_some() {
            Some(AuthBlock { token, password })
        } else {
            None
        };

        Self {
            auth,
            role: "operator",
            scopes: OPERATOR_SCOPES.to_vec(),
            permissions: json!({
                "operator.admin": true,
                "operator.approvals": true,
                "operator.pairing": true,
            }),
            client: ClientInfo {
                id: "openclaw-control-ui".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: "web".to_string(),
                mode: "webchat".to_string(),
                instance_id: format!("backend_{}", gateway_id),
            },
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
        }
    }
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectPayload {
    #[serde(default)]
    pub protocol: Option<i64>,
    #[serde(default)]
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Snapshot {
    #[serde(default, rename = "sessionDefaults")]
    pub session_defaults: Option<SessionDefaults>,
    #[serde(default)]
    pub agents: Vec<Value>,
    #[serde(default)]
    pub models: Vec<Value>,
    #[serde(default, rename = "defaultModel")]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionDefaults {
    #[serde(default)]
    pub model: Option<String>,
}

impl Snapshot {
    /// The gateway-level default model, falling back to the session
    /// defaults block when the top-level field is absent.
    pub fn resolve_default_model(&self) -> Option<String> {
        self.default_model
            .clone()
            .or_else(|| self.session_defaults.as_ref().and_then(|d| d.model.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Error,
}

impl ChatState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatState::Delta => "delta",
            ChatState::Final => "final",
            ChatState::Error => "error",
        }
    }
}

/// Payload of an upstream `chat` event.
///
/// Newer gateways put the streamed text directly in `text`; older ones wrap
/// it in a message object with typed content blocks. Both are accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatEventPayload {
    #[serde(rename = "sessionKey")]
    pub session_key: Option<String>,
    pub state: Option<ChatState>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub message: Option<ChatEventMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatEventMessage {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub agent: Option<AgentRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentRef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

impl ChatEventPayload {
    /// Concatenated text of the event: the bare `text` field when present,
    /// otherwise every `{"type":"text"}` block in the message content.
    pub fn extract_text(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }

        let Some(message) = &self.message else {
            return String::new();
        };

        let mut out = String::new();
        for block in &message.content {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
        }
        out
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Object(obj)) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        }
    }

    pub fn agent_name(&self) -> Option<String> {
        let agent = self.message.as_ref()?.agent.as_ref()?;
        agent.name.clone().or_else(|| agent.id.clone())
    }
}
