//! One persistent, authenticated WebSocket connection to an upstream
//! gateway.
//!
//! The connection owns the socket for its whole lifetime: a dedicated
//! writer task is the only place that touches the sink (frame boundaries
//! stay intact under concurrent senders), while the owning task pumps the
//! read half, resolving responses against the pending-request table and
//! fanning events out through the bus. Socket loss feeds an exponential
//! backoff ladder capped at ten attempts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use clawchat_core::bus::BusEvent;
use clawchat_core::{id, EventBus};
use clawchat_types::{ConnectParams, ConnectPayload, Frame, GatewayConfig, GatewaySnapshot};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const OPEN_TIMEOUT: Duration = Duration::from_secs(15);
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(15);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const MAX_BACKOFF_SECS: u64 = 30;
const WRITE_QUEUE_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 16;
const DEFAULT_GATEWAY_PORT: u16 = 18789;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway is not connected")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Out-of-band connection lifecycle notifications for routers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionNotice {
    /// A handshake completed, either the first connect or a reconnect.
    /// The snapshot cache is already refreshed when this fires.
    Connected,
    /// The backoff ladder is exhausted; no further dial attempts happen
    /// until an explicit `reconnect()`.
    ReconnectFailed,
}

type PendingSlot = oneshot::Sender<Result<Value, GatewayError>>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct GatewayConnection {
    gateway_id: String,
    url: String,
    token: Option<String>,
    password: Option<String>,
    connected: AtomicBool,
    snapshot: RwLock<GatewaySnapshot>,
    /// Correlation id → response slot. Only touched by `request()` and the
    /// reader; never held across an await.
    pending: Mutex<HashMap<String, PendingSlot>>,
    /// Present while a socket is up; cloned out before sending.
    writer: Mutex<Option<mpsc::Sender<WsMessage>>>,
    events: EventBus,
    notices: broadcast::Sender<ConnectionNotice>,
    /// true while reconnection is allowed; flipping to false stops the run
    /// loop wherever it is waiting.
    running: watch::Sender<bool>,
    loop_active: AtomicBool,
    seq: AtomicU64,
    /// Last chat.set_reasoning value per session key, re-applied after a
    /// reconnect handshake.
    reasoning: Mutex<HashMap<String, bool>>,
}

impl GatewayConnection {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let (running, _) = watch::channel(true);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Arc::new(Self {
            gateway_id: config.id,
            url: config.url,
            token: config.token,
            password: config.password,
            connected: AtomicBool::new(false),
            snapshot: RwLock::new(GatewaySnapshot::default()),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            events: EventBus::new(),
            notices,
            running,
            loop_active: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            reasoning: Mutex::new(HashMap::new()),
        })
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        self.snapshot
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub async fn subscribe(&self, event: &str) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe(event).await
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.notices.subscribe()
    }

    /// Start dialing in the background. Idempotent while the run loop is
    /// alive.
    pub fn spawn(self: &Arc<Self>) {
        if self.loop_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.run_loop().await;
        });
    }

    /// Leave the terminal state after an exhausted backoff ladder and dial
    /// again.
    pub fn reconnect(self: &Arc<Self>) {
        let _ = self.running.send(true);
        self.spawn();
    }

    /// Disable reconnection, close the socket, and fail every pending
    /// request.
    pub async fn stop(&self) {
        let _ = self.running.send(false);
        // Dropping the write queue makes the writer task close the sink.
        let writer = self.writer.lock().map(|mut w| w.take()).unwrap_or(None);
        drop(writer);
        self.connected.store(false, Ordering::SeqCst);
        self.fail_pending(GatewayError::ConnectionLost);
    }

    // ── Requests ───────────────────────────────────────────────────────────

    /// Send a request upstream and wait for the matching response.
    ///
    /// Fails immediately with `NotConnected` when no socket is up, with
    /// `Timeout` when the deadline passes (a late response is then
    /// discarded), and with `ConnectionLost` when the socket drops while
    /// the request is in flight.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let writer = self.writer.lock().map(|w| w.clone()).unwrap_or(None);
        let Some(writer) = writer else {
            return Err(GatewayError::NotConnected);
        };

        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.clone(), tx);
        }

        let frame = Frame::Req {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                self.remove_pending(&id);
                return Err(GatewayError::Upstream(e.to_string()));
            }
        };

        if writer.send(WsMessage::Text(text)).await.is_err() {
            self.remove_pending(&id);
            return Err(GatewayError::NotConnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // The slot was dropped without a verdict; the socket went away.
            Ok(Err(_)) => Err(GatewayError::ConnectionLost),
            Err(_) => {
                self.remove_pending(&id);
                Err(GatewayError::Timeout)
            }
        }
    }

    pub async fn chat_send(
        &self,
        session_key: &str,
        message: &str,
        advanced_reasoning: Option<bool>,
    ) -> Result<Value, GatewayError> {
        let mut params = json!({
            "sessionKey": session_key,
            "message": message,
            "deliver": false,
            "idempotencyKey": uuid::Uuid::new_v4().to_string(),
        });
        if let Some(enabled) = advanced_reasoning {
            params["advancedReasoning"] = Value::Bool(enabled);
        }
        self.request("chat.send", params, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Ask the upstream to abort the stream for `session_key`; it will emit
    /// a terminal event for the affected stream.
    pub async fn abort(&self, session_key: &str) -> Result<Value, GatewayError> {
        self.request(
            "chat.abort",
            json!({ "sessionKey": session_key }),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn set_reasoning(
        &self,
        session_key: &str,
        enabled: bool,
    ) -> Result<Value, GatewayError> {
        if let Ok(mut reasoning) = self.reasoning.lock() {
            reasoning.insert(session_key.to_string(), enabled);
        }
        self.request(
            "chat.set_reasoning",
            json!({ "sessionKey": session_key, "enabled": enabled }),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    /// Fetch transcript history from the gateway itself. The local store is
    /// authoritative for everything this proxy has observed; this exists
    /// for sessions it has not.
    pub async fn history(&self, session_key: &str, limit: i64) -> Result<Value, GatewayError> {
        self.request(
            "chat.history",
            json!({ "sessionKey": session_key, "limit": limit }),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    // ── Connection lifecycle ───────────────────────────────────────────────

    async fn run_loop(self: Arc<Self>) {
        let mut running_rx = self.running.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if !*self.running.borrow() {
                break;
            }

            match self.establish().await {
                Ok(stream) => {
                    attempt = 0;
                    self.read_loop(stream, &mut running_rx).await;
                    self.connected.store(false, Ordering::SeqCst);
                    let _ = self.writer.lock().map(|mut w| w.take());
                    self.fail_pending(GatewayError::ConnectionLost);
                    info!(gateway = %self.gateway_id, "upstream connection closed");
                }
                Err(e) => {
                    warn!(gateway = %self.gateway_id, "connect failed: {:#}", e);
                }
            }

            if !*self.running.borrow() {
                break;
            }
            if attempt >= MAX_RECONNECT_ATTEMPTS {
                warn!(gateway = %self.gateway_id, "reconnect attempts exhausted");
                let _ = self.notices.send(ConnectionNotice::ReconnectFailed);
                let _ = self.running.send(false);
                break;
            }

            let delay = backoff_delay(attempt);
            attempt += 1;
            debug!(
                gateway = %self.gateway_id,
                attempt,
                "reconnecting in {}s",
                delay.as_secs()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = running_rx.changed() => {
                    if changed.is_err() || !*running_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.loop_active.store(false, Ordering::SeqCst);
    }

    /// Dial, perform the challenge/connect handshake, cache the snapshot,
    /// and hand the sink to a fresh writer task. Returns the read half.
    async fn establish(self: &Arc<Self>) -> anyhow::Result<WsSource> {
        let request = self.client_request()?;
        info!(gateway = %self.gateway_id, url = %self.url, "dialing gateway");

        let (ws, _) = tokio::time::timeout(OPEN_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| anyhow!("websocket open timed out"))??;
        let (mut sink, mut stream) = ws.split();

        // The gateway speaks first. Without a challenge there is nothing to
        // authenticate against, so the connect request is never sent.
        let challenge = tokio::time::timeout(CHALLENGE_TIMEOUT, next_frame(&mut stream))
            .await
            .map_err(|_| anyhow!("connect.challenge not received in time"))??;
        match challenge {
            Frame::Event { ref event, .. } if event == "connect.challenge" => {}
            other => bail!("expected connect.challenge, got {:?}", other),
        }

        let connect_id = self.next_request_id();
        let params = ConnectParams::new(&self.gateway_id, self.token.clone(), self.password.clone());
        let frame = Frame::Req {
            id: connect_id.clone(),
            method: "connect".to_string(),
            params: serde_json::to_value(&params)?,
        };
        sink.send(WsMessage::Text(serde_json::to_string(&frame)?))
            .await?;

        let payload = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            loop {
                match next_frame(&mut stream).await? {
                    Frame::Res {
                        id, ok, payload, error,
                    } if id == connect_id => {
                        if ok {
                            return Ok(payload.unwrap_or(Value::Null));
                        }
                        let message = error.map(|e| e.message).unwrap_or_default();
                        bail!("connect rejected: {}", message);
                    }
                    // Events may arrive before the connect response.
                    _ => continue,
                }
            }
        })
        .await
        .map_err(|_| anyhow!("connect response not received in time"))??;

        let connect_payload: ConnectPayload =
            serde_json::from_value(payload).unwrap_or_default();
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.agents = connect_payload.snapshot.agents.clone();
            snapshot.models = connect_payload.snapshot.models.clone();
            snapshot.default_model = connect_payload.snapshot.resolve_default_model();
        }

        // Writer task: the single owner of the sink from here on.
        let (write_tx, mut write_rx) = mpsc::channel::<WsMessage>(WRITE_QUEUE_CAPACITY);
        if let Ok(mut writer) = self.writer.lock() {
            *writer = Some(write_tx);
        }
        tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.connected.store(true, Ordering::SeqCst);
        info!(gateway = %self.gateway_id, "gateway connected");
        let _ = self.notices.send(ConnectionNotice::Connected);

        // Metadata and reasoning re-apply need the reader pumping, so they
        // run once the caller has entered the read loop.
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.refresh_metadata().await;
            conn.reapply_reasoning().await;
        });

        Ok(stream)
    }

    async fn read_loop(&self, mut stream: WsSource, running_rx: &mut watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = running_rx.changed() => {
                    if changed.is_err() || !*running_rx.borrow() {
                        break;
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => self.dispatch(&text).await,
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(gateway = %self.gateway_id, "read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(gateway = %self.gateway_id, "unparseable frame: {}", e);
                return;
            }
        };

        match frame {
            Frame::Res {
                id, ok, payload, error,
            } => {
                let slot = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
                let Some(tx) = slot else {
                    debug!(gateway = %self.gateway_id, "late response {} discarded", id);
                    return;
                };
                let result = if ok {
                    Ok(payload.unwrap_or(Value::Null))
                } else {
                    let message = error
                        .map(|e| e.message)
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| "unknown error".to_string());
                    Err(GatewayError::Upstream(message))
                };
                let _ = tx.send(result);
            }
            Frame::Event { event, payload } => {
                self.events.publish(&event, payload).await;
            }
            Frame::Req { id, method, .. } => {
                debug!(gateway = %self.gateway_id, "ignoring upstream request {} ({})", method, id);
            }
        }
    }

    /// Fetch agents and models and fold them into the snapshot. Best
    /// effort: the handshake snapshot remains in place on failure.
    async fn refresh_metadata(&self) {
        match self
            .request("agents.list", json!({}), DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            Ok(payload) => {
                if let Some(agents) = payload.get("agents").and_then(Value::as_array) {
                    if let Ok(mut snapshot) = self.snapshot.write() {
                        snapshot.agents = agents.clone();
                    }
                }
            }
            Err(e) => warn!(gateway = %self.gateway_id, "agents.list failed: {}", e),
        }

        match self
            .request("models.list", json!({}), DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            Ok(payload) => {
                if let Some(models) = payload.get("models").and_then(Value::as_array) {
                    if let Ok(mut snapshot) = self.snapshot.write() {
                        snapshot.models = models.clone();
                    }
                }
            }
            Err(e) => warn!(gateway = %self.gateway_id, "models.list failed: {}", e),
        }
    }

    /// The upstream does not persist reasoning flags across its own
    /// restarts, so replay whatever sessions asked for last.
    async fn reapply_reasoning(&self) {
        let cached: Vec<(String, bool)> = self
            .reasoning
            .lock()
            .map(|r| r.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();

        for (session_key, enabled) in cached {
            let result = self
                .request(
                    "chat.set_reasoning",
                    json!({ "sessionKey": session_key, "enabled": enabled }),
                    DEFAULT_REQUEST_TIMEOUT,
                )
                .await;
            if let Err(e) = result {
                warn!(
                    gateway = %self.gateway_id,
                    session_key, "failed to re-apply reasoning flag: {}", e
                );
            }
        }
    }

    fn fail_pending(&self, error: GatewayError) {
        let drained: Vec<PendingSlot> = self
            .pending
            .lock()
            .map(|mut p| p.drain().map(|(_, tx)| tx).collect())
            .unwrap_or_default();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    fn remove_pending(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }

    fn next_request_id(&self) -> String {
        id::request_id(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Build the client handshake request with an Origin the gateway's own
    /// origin check accepts.
    fn client_request(&self) -> anyhow::Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self.url.as_str().into_client_request()?;
        let parsed = Url::parse(&self.url)?;
        let host = parsed.host_str().unwrap_or("localhost").to_string();
        let port = parsed.port().unwrap_or(DEFAULT_GATEWAY_PORT);
        let origin = format!("http://{}:{}", host, port);
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_str(&origin)?);
        Ok(request)
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = 1u64 << attempt.min(6);
    Duration::from_secs(exp.min(MAX_BACKOFF_SECS))
}

async fn next_frame(stream: &mut WsSource) -> anyhow::Result<Frame> {
    loop {
        let Some(message) = stream.next().await else {
            bail!("socket closed during handshake");
        };
        match message? {
            WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
            WsMessage::Close(_) => bail!("socket closed during handshake"),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str, url: &str) -> GatewayConfig {
        GatewayConfig {
            id: id.to_string(),
            name: id.to_string(),
            url: url.to_string(),
            token: None,
            password: None,
            created_at: 0,
        }
    }

    #[test]
    fn backoff_ladder_doubles_then_caps() {
        let delays: Vec<u64> = (0..8).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[tokio::test]
    async fn request_while_idle_fails_fast() {
        let conn = GatewayConnection::new(config("g1", "ws://127.0.0.1:1/"));
        let err = conn
            .request("chat.send", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::NotConnected);
    }

    #[tokio::test]
    async fn request_ids_are_monotonic_per_connection() {
        let conn = GatewayConnection::new(config("g1", "ws://127.0.0.1:1/"));
        let a = conn.next_request_id();
        let b = conn.next_request_id();
        assert!(a.starts_with("r1-"));
        assert!(b.starts_with("r2-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn origin_header_follows_gateway_host() {
        let conn = GatewayConnection::new(config("g1", "ws://10.0.0.7:9999/ws"));
        let request = conn.client_request().unwrap();
        assert_eq!(
            request.headers().get(ORIGIN).unwrap(),
            "http://10.0.0.7:9999"
        );

        let no_port = GatewayConnection::new(config("g2", "ws://gw.local/ws"));
        let request = no_port.client_request().unwrap();
        assert_eq!(
            request.headers().get(ORIGIN).unwrap(),
            "http://gw.local:18789"
        );
    }
}
