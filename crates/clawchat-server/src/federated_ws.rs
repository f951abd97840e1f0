//! Federated chat router: WebSocket `/chat/federated`.
//!
//! No per-connection gateway binding; every chat turn carries its own
//! target list and fans out to N gateways in parallel. Each upstream event
//! is re-emitted tagged with its source, per-source order preserved by the
//! per-gateway forwarder task, while cross-source interleaving is
//! unconstrained. One failing target never cancels the others.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use clawchat_core::bus::BusEvent;
use clawchat_core::strip_thinking_tags;
use clawchat_gateway::{ConnectionNotice, GatewayConnection};
use clawchat_types::{ChatEventPayload, ChatState, ContentBlock, FederatedTarget, MessageRole};

use crate::AppState;

const OUT_QUEUE_CAPACITY: usize = 256;
const UNKNOWN_AGENT: &str = "?";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Ping,
    Chat {
        message: String,
        #[serde(default)]
        targets: Vec<FederatedTarget>,
        /// Advisory only: targets are the source of truth whether the
        /// client resolved mentions itself or addressed everyone.
        #[serde(default)]
        broadcast: bool,
    },
    Abort {
        #[serde(default)]
        targets: Vec<FederatedTarget>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Pong,
    Connected {
        federated: bool,
    },
    Stream {
        source: StreamSource,
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Reconnected {
        gateway_id: String,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Serialize)]
struct StreamSource {
    gateway_id: String,
    agent_name: String,
}

/// Per-gateway subscription state: the session keys this client has
/// engaged on that gateway, plus the forwarder task feeding the shared
/// outbound queue.
struct GatewayFeed {
    keys: Arc<RwLock<HashSet<String>>>,
    task: JoinHandle<()>,
}

/// Sources that have been sent a turn and have not yet finalized.
/// Bookkeeping only; the client decides overall completion itself.
type InflightSet = Arc<Mutex<HashSet<(String, String)>>>;

pub async fn federated_chat(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    if send_frame(&mut socket, &ServerFrame::Connected { federated: true })
        .await
        .is_err()
    {
        return;
    }

    // All forwarder tasks funnel into one queue so this task stays the
    // single writer of the downstream socket.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUT_QUEUE_CAPACITY);
    let inflight: InflightSet = Arc::new(Mutex::new(HashSet::new()));
    let mut feeds: HashMap<String, GatewayFeed> = HashMap::new();

    loop {
        tokio::select! {
            Some(frame) = out_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }

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

                let handled = match frame {
                    ClientFrame::Ping => send_frame(&mut socket, &ServerFrame::Pong).await,
                    ClientFrame::Chat { message, targets, broadcast } => {
                        handle_chat(
                            &mut socket,
                            &state,
                            &mut feeds,
                            &out_tx,
                            &inflight,
                            message,
                            targets,
                            broadcast,
                        )
                        .await
                    }
                    ClientFrame::Abort { targets } => {
                        handle_abort(&state, targets).await;
                        Ok(())
                    }
                };
                if handled.is_err() {
                    break;
                }
            }
        }
    }

    for (_, feed) in feeds {
        feed.task.abort();
    }
    debug!("federated socket closed");
}

#[allow(clippy::too_many_arguments)]
async fn handle_chat(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    feeds: &mut HashMap<String, GatewayFeed>,
    out_tx: &mpsc::Sender<ServerFrame>,
    inflight: &InflightSet,
    message: String,
    targets: Vec<FederatedTarget>,
    broadcast: bool,
) -> Result<(), ()> {
    if message.is_empty() {
        let frame = ServerFrame::Error {
            error: "Missing message".to_string(),
        };
        return send_frame(socket, &frame).await;
    }
    if targets.is_empty() {
        let frame = ServerFrame::Error {
            error: "No valid targets".to_string(),
        };
        return send_frame(socket, &frame).await;
    }
    if broadcast {
        debug!(targets = targets.len(), "broadcast turn");
    }

    // Resolve targets first; a gateway missing from the registry yields a
    // tagged error while the rest proceed.
    let mut dispatch: Vec<(FederatedTarget, Arc<GatewayConnection>)> = Vec::new();
    for target in targets {
        let Some(conn) = state.manager.get(&target.gateway_id).await else {
            let frame = ServerFrame::Stream {
                source: StreamSource {
                    gateway_id: target.gateway_id.clone(),
                    agent_name: UNKNOWN_AGENT.to_string(),
                },
                state: "error",
                text: None,
                error: Some(format!("Gateway {} not found", target.gateway_id)),
            };
            if send_frame(socket, &frame).await.is_err() {
                return Err(());
            }
            continue;
        };

        ensure_feed(state, feeds, out_tx, inflight, &conn).await;
        if let Some(feed) = feeds.get(&target.gateway_id) {
            feed.keys.write().await.insert(target.session_key.clone());
        }

        // Persist the user turn under this target's own session so each
        // transcript stays consistent when viewed singly.
        let content = [ContentBlock::text(message.clone())];
        if let Err(e) = state
            .messages
            .append(
                &target.gateway_id,
                &target.session_key,
                MessageRole::User,
                &content,
                None,
            )
            .await
        {
            error!(gateway = %target.gateway_id, "failed to persist user message: {}", e);
            let frame = ServerFrame::Stream {
                source: StreamSource {
                    gateway_id: target.gateway_id.clone(),
                    agent_name: agent_fallback(&conn),
                },
                state: "error",
                text: None,
                error: Some("failed to persist message".to_string()),
            };
            if send_frame(socket, &frame).await.is_err() {
                return Err(());
            }
            continue;
        }

        if let Ok(mut set) = inflight.lock() {
            set.insert((target.gateway_id.clone(), target.session_key.clone()));
        }
        dispatch.push((target, conn));
    }

    // Fan out in parallel; per-target failures surface as tagged errors.
    let sends = dispatch.into_iter().map(|(target, conn)| {
        let message = message.clone();
        async move {
            let result = conn.chat_send(&target.session_key, &message, None).await;
            (target, conn, result)
        }
    });

    for (target, conn, result) in futures::future::join_all(sends).await {
        if let Err(e) = result {
            if let Ok(mut set) = inflight.lock() {
                set.remove(&(target.gateway_id.clone(), target.session_key.clone()));
            }
            let frame = ServerFrame::Stream {
                source: StreamSource {
                    gateway_id: target.gateway_id.clone(),
                    agent_name: agent_fallback(&conn),
                },
                state: "error",
                text: None,
                error: Some(e.to_string()),
            };
            if send_frame(socket, &frame).await.is_err() {
                return Err(());
            }
        }
    }

    Ok(())
}

async fn handle_abort(state: &Arc<AppState>, targets: Vec<FederatedTarget>) {
    let mut aborts = Vec::new();
    for target in targets {
        if let Some(conn) = state.manager.get(&target.gateway_id).await {
            aborts.push(async move {
                if let Err(e) = conn.abort(&target.session_key).await {
                    warn!(gateway = %target.gateway_id, "abort failed: {}", e);
                }
            });
        }
    }
    futures::future::join_all(aborts).await;
}

/// Subscribe to a gateway's chat events and reconnect notices on first
/// use, spawning the forwarder that feeds the shared outbound queue.
async fn ensure_feed(
    state: &Arc<AppState>,
    feeds: &mut HashMap<String, GatewayFeed>,
    out_tx: &mpsc::Sender<ServerFrame>,
    inflight: &InflightSet,
    conn: &Arc<GatewayConnection>,
) {
    let gateway_id = conn.gateway_id().to_string();
    if feeds.contains_key(&gateway_id) {
        return;
    }

    let keys: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));
    let chat_rx = conn.subscribe("chat").await;
    let notice_rx = conn.subscribe_notices();

    let task = tokio::spawn(forward_gateway_events(
        state.clone(),
        conn.clone(),
        keys.clone(),
        inflight.clone(),
        out_tx.clone(),
        chat_rx,
        notice_rx,
    ));

    feeds.insert(gateway_id, GatewayFeed { keys, task });
}

async fn forward_gateway_events(
    state: Arc<AppState>,
    conn: Arc<GatewayConnection>,
    keys: Arc<RwLock<HashSet<String>>>,
    inflight: InflightSet,
    out: mpsc::Sender<ServerFrame>,
    mut chat_rx: broadcast::Receiver<BusEvent>,
    mut notice_rx: broadcast::Receiver<ConnectionNotice>,
) {
    let gateway_id = conn.gateway_id().to_string();

    loop {
        tokio::select! {
            event = chat_rx.recv() => {
                match event {
                    Ok(event) => {
                        let frame =
                            build_stream_frame(&state, &conn, &keys, &inflight, event).await;
                        if let Some(frame) = frame {
                            if out.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(gateway = %gateway_id, skipped, "federated subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            notice = notice_rx.recv() => {
                match notice {
                    Ok(ConnectionNotice::Connected) => {
                        let frame = ServerFrame::Reconnected {
                            gateway_id: gateway_id.clone(),
                        };
                        if out.send(frame).await.is_err() {
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
}

async fn build_stream_frame(
    state: &Arc<AppState>,
    conn: &Arc<GatewayConnection>,
    keys: &Arc<RwLock<HashSet<String>>>,
    inflight: &InflightSet,
    event: BusEvent,
) -> Option<ServerFrame> {
    let gateway_id = conn.gateway_id().to_string();
    let payload: ChatEventPayload = serde_json::from_value(event.payload).ok()?;
    let session_key = payload.session_key.clone()?;

    // Only streams for sessions this client targeted.
    if !keys.read().await.contains(&session_key) {
        return None;
    }

    let agent_name = payload
        .agent_name()
        .or_else(|| conn.snapshot().first_agent_name())
        .unwrap_or_else(|| UNKNOWN_AGENT.to_string());
    let source = StreamSource {
        gateway_id: gateway_id.clone(),
        agent_name,
    };

    match payload.state? {
        ChatState::Delta => Some(ServerFrame::Stream {
            source,
            state: "delta",
            text: Some(payload.extract_text()),
            error: None,
        }),
        ChatState::Final => {
            let text = strip_thinking_tags(&payload.extract_text());

            let content = [ContentBlock::text(text.clone())];
            if let Err(e) = state
                .messages
                .append(&gateway_id, &session_key, MessageRole::Assistant, &content, None)
                .await
            {
                error!(gateway = %gateway_id, "failed to persist assistant message: {}", e);
            }

            finish_source(inflight, &gateway_id, &session_key);
            Some(ServerFrame::Stream {
                source,
                state: "final",
                text: Some(text),
                error: None,
            })
        }
        ChatState::Error => {
            finish_source(inflight, &gateway_id, &session_key);
            Some(ServerFrame::Stream {
                source,
                state: "error",
                text: None,
                error: Some(payload.error_message()),
            })
        }
    }
}

fn finish_source(inflight: &InflightSet, gateway_id: &str, session_key: &str) {
    if let Ok(mut set) = inflight.lock() {
        set.remove(&(gateway_id.to_string(), session_key.to_string()));
        debug!(
            gateway = %gateway_id,
            session_key,
            remaining = set.len(),
            "source finalized"
        );
    }
}

fn agent_fallback(conn: &Arc<GatewayConnection>) -> String {
    conn.snapshot()
        .first_agent_name()
        .unwrap_or_else(|| UNKNOWN_AGENT.to_string())
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
    fn chat_frame_parses_targets() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"chat","message":"ping","broadcast":true,
                "targets":[{"gateway_id":"g1","session_key":"s1"},
                           {"gateway_id":"g2","session_key":"s2"}]}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Chat {
                message,
                targets,
                broadcast,
            } => {
                assert_eq!(message, "ping");
                assert!(broadcast);
                assert_eq!(targets.len(), 2);
                assert_eq!(targets[1].gateway_id, "g2");
            }
            other => panic!("expected chat frame, got {:?}", other),
        }
    }

    #[test]
    fn stream_frames_carry_source_tags() {
        let frame = ServerFrame::Stream {
            source: StreamSource {
                gateway_id: "g1".to_string(),
                agent_name: "claw".to_string(),
            },
            state: "final",
            text: Some("pong".to_string()),
            error: None,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "stream");
        assert_eq!(value["source"]["gateway_id"], "g1");
        assert_eq!(value["source"]["agent_name"], "claw");
        assert_eq!(value["state"], "final");
        assert_eq!(value["text"], "pong");

        let reconnected = serde_json::to_value(ServerFrame::Reconnected {
            gateway_id: "g1".to_string(),
        })
        .unwrap();
        assert_eq!(reconnected["type"], "reconnected");
        assert_eq!(reconnected["gateway_id"], "g1");
    }

    #[test]
    fn connected_frame_is_federated() {
        let value = serde_json::to_value(ServerFrame::Connected { federated: true }).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["federated"], true);
    }
}
