//! Single-gateway chat router: WebSocket `/chat/{gateway_id}`.
//!
//! One downstream socket may interleave turns across several session keys
//! on the same gateway. The router remembers which keys this client has
//! engaged and demultiplexes upstream chat events against that set, so a
//! neighbour's stream on the same gateway is never echoed here and its
//! finals are never persisted twice.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use clawchat_core::bus::BusEvent;
use clawchat_core::strip_thinking_tags;
use clawchat_gateway::{ConnectionNotice, GatewayConnection};
use clawchat_types::{ChatEventPayload, ChatState, ContentBlock, Message as StoredMessage, MessageRole};

use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Ping,
    Chat {
        #[serde(rename = "sessionKey")]
        session_key: String,
        message: String,
        #[serde(rename = "advancedReasoning")]
        advanced_reasoning: Option<bool>,
    },
    Abort {
        #[serde(rename = "sessionKey")]
        session_key: String,
    },
    SetReasoning {
        #[serde(rename = "sessionKey")]
        session_key: String,
        enabled: bool,
    },
    History {
        #[serde(rename = "sessionKey")]
        session_key: String,
        limit: Option<i64>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Pong,
    Connected {
        agents: Vec<Value>,
        models: Vec<Value>,
        #[serde(rename = "defaultModel")]
        default_model: Option<String>,
    },
    Stream {
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    History {
        messages: Vec<StoredMessage>,
    },
    Reconnected {
        agents: Vec<Value>,
        models: Vec<Value>,
        #[serde(rename = "defaultModel")]
        default_model: Option<String>,
    },
    Error {
        error: String,
    },
}

pub async fn gateway_chat(
    Path(gateway_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, gateway_id))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, gateway_id: String) {
    let Some(conn) = state.manager.get(&gateway_id).await else {
        let frame = ServerFrame::Error {
            error: format!("Gateway '{}' not found", gateway_id),
        };
        let _ = send_frame(&mut socket, &frame).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    // The snapshot reflects the last successful handshake; `connected`
    // means this proxy endpoint is ready, even while the upstream itself
    // is still backing off.
    let snapshot = conn.snapshot();
    let connected = ServerFrame::Connected {
        agents: snapshot.agents,
        models: snapshot.models,
        default_model: snapshot.default_model,
    };
    if send_frame(&mut socket, &connected).await.is_err() {
        return;
    }

    let mut chat_rx = conn.subscribe("chat").await;
    let mut notice_rx = conn.subscribe_notices();
    let mut engaged: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            message = socket.recv() => {
                let Some(Ok(message)) = message else { break };
                let text = match message {
                    Message::Text(text) => text.to_string(),
                    Message::Close(_) => break,
                    _ => continue,
                };

                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let error = ServerFrame::Error {
                            error: format!("invalid message: {}", e),
                        };
                        if send_frame(&mut socket, &error).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let handled = handle_client_frame(
                    &mut socket,
                    &state,
                    &conn,
                    &gateway_id,
                    &mut engaged,
                    frame,
                )
                .await;
                if handled.is_err() {
                    break;
                }
            }

            event = chat_rx.recv() => {
                match event {
                    Ok(event) => {
                        let forwarded = forward_chat_event(
                            &mut socket,
                            &state,
                            &gateway_id,
                            &engaged,
                            event,
                        )
                        .await;
                        if forwarded.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(gateway = %gateway_id, skipped, "chat event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            notice = notice_rx.recv() => {
                match notice {
                    Ok(ConnectionNotice::Connected) => {
                        let snapshot = conn.snapshot();
                        let frame = ServerFrame::Reconnected {
                            agents: snapshot.agents,
                            models: snapshot.models,
                            default_model: snapshot.default_model,
                        };
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(ConnectionNotice::ReconnectFailed) => {
                        debug!(gateway = %gateway_id, "upstream gave up reconnecting");
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    debug!(gateway = %gateway_id, "chat socket closed");
}

async fn handle_client_frame(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    conn: &Arc<GatewayConnection>,
    gateway_id: &str,
    engaged: &mut HashSet<String>,
    frame: ClientFrame,
) -> Result<(), ()> {
    match frame {
        ClientFrame::Ping => send_frame(socket, &ServerFrame::Pong).await,

        ClientFrame::Chat {
            session_key,
            message,
            advanced_reasoning,
        } => {
            engaged.insert(session_key.clone());

            let content = [ContentBlock::text(message.clone())];
            if let Err(e) = state
                .messages
                .append(gateway_id, &session_key, MessageRole::User, &content, None)
                .await
            {
                error!(gateway = %gateway_id, "failed to persist user message: {}", e);
                let frame = ServerFrame::Error {
                    error: "failed to persist message".to_string(),
                };
                return send_frame(socket, &frame).await;
            }

            if let Err(e) = conn
                .chat_send(&session_key, &message, advanced_reasoning)
                .await
            {
                let frame = ServerFrame::Stream {
                    state: "error",
                    text: None,
                    error: Some(e.to_string()),
                };
                return send_frame(socket, &frame).await;
            }
            Ok(())
        }

        ClientFrame::Abort { session_key } => {
            engaged.insert(session_key.clone());
            if let Err(e) = conn.abort(&session_key).await {
                warn!(gateway = %gateway_id, session_key, "abort failed: {}", e);
            }
            Ok(())
        }

        // No downstream echo; the upstream applies the flag to subsequent
        // turns.
        ClientFrame::SetReasoning {
            session_key,
            enabled,
        } => {
            engaged.insert(session_key.clone());
            if let Err(e) = conn.set_reasoning(&session_key, enabled).await {
                warn!(gateway = %gateway_id, session_key, "set_reasoning failed: {}", e);
            }
            Ok(())
        }

        ClientFrame::History { session_key, limit } => {
            engaged.insert(session_key.clone());
            match state
                .messages
                .list(gateway_id, &session_key, limit.unwrap_or(50), None)
                .await
            {
                Ok(messages) => send_frame(socket, &ServerFrame::History { messages }).await,
                Err(e) => {
                    let frame = ServerFrame::Error {
                        error: e.to_string(),
                    };
                    send_frame(socket, &frame).await
                }
            }
        }
    }
}

async fn forward_chat_event(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    gateway_id: &str,
    engaged: &HashSet<String>,
    event: BusEvent,
) -> Result<(), ()> {
    let payload: ChatEventPayload = match serde_json::from_value(event.payload) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(gateway = %gateway_id, "unparseable chat event: {}", e);
            return Ok(());
        }
    };

    let Some(session_key) = payload.session_key.clone() else {
        return Ok(());
    };
    // Not a session this client is driving.
    if !engaged.contains(&session_key) {
        return Ok(());
    }

    match payload.state {
        Some(ChatState::Delta) => {
            let frame = ServerFrame::Stream {
                state: "delta",
                text: Some(payload.extract_text()),
                error: None,
            };
            send_frame(socket, &frame).await
        }
        Some(ChatState::Final) => {
            let text = strip_thinking_tags(&payload.extract_text());

            // Persist before forwarding: history must reflect every final
            // this proxy has ever emitted, even if the client vanishes
            // mid-send.
            let content = [ContentBlock::text(text.clone())];
            if let Err(e) = state
                .messages
                .append(gateway_id, &session_key, MessageRole::Assistant, &content, None)
                .await
            {
                error!(gateway = %gateway_id, "failed to persist assistant message: {}", e);
            }

            let frame = ServerFrame::Stream {
                state: "final",
                text: Some(text),
                error: None,
            };
            send_frame(socket, &frame).await
        }
        Some(ChatState::Error) => {
            let frame = ServerFrame::Stream {
                state: "error",
                text: None,
                error: Some(payload.error_message()),
            };
            send_frame(socket, &frame).await
        }
        None => Ok(()),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    socket.send(Message::Text(json.into())).await.map_err(|e| {
        debug!("websocket send error: {}", e);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_with_camel_case_keys() {
        let chat: ClientFrame = serde_json::from_str(
            r#"{"type":"chat","sessionKey":"s1","message":"Hi","advancedReasoning":true}"#,
        )
        .unwrap();
        match chat {
            ClientFrame::Chat {
                session_key,
                message,
                advanced_reasoning,
            } => {
                assert_eq!(session_key, "s1");
                assert_eq!(message, "Hi");
                assert_eq!(advanced_reasoning, Some(true));
            }
            other => panic!("expected chat frame, got {:?}", other),
        }

        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(
                r#"{"type":"set_reasoning","sessionKey":"s1","enabled":false}"#
            )
            .unwrap(),
            ClientFrame::SetReasoning { enabled: false, .. }
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"history","sessionKey":"s1"}"#)
                .unwrap(),
            ClientFrame::History { limit: None, .. }
        ));
    }

    #[test]
    fn server_frames_serialize_with_expected_tags() {
        let connected = serde_json::to_value(ServerFrame::Connected {
            agents: vec![],
            models: vec![],
            default_model: Some("m1".to_string()),
        })
        .unwrap();
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["defaultModel"], "m1");

        let delta = serde_json::to_value(ServerFrame::Stream {
            state: "delta",
            text: Some("He".to_string()),
            error: None,
        })
        .unwrap();
        assert_eq!(delta["type"], "stream");
        assert_eq!(delta["state"], "delta");
        assert_eq!(delta["text"], "He");
        assert!(delta.get("error").is_none());

        let pong = serde_json::to_value(ServerFrame::Pong).unwrap();
        assert_eq!(pong["type"], "pong");
    }
}
