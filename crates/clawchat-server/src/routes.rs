use axum::{
    extract::{Path, Query, State},
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use clawchat_core::id;
use clawchat_types::{FederatedSession, FederatedTarget, GatewayConfig, Message, Session};

use crate::chat_ws;
use crate::federated_ws;
use crate::{ApiError, AppState, Result};

const DEFAULT_MESSAGE_LIMIT: i64 = 50;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        // The literal segment wins over the capture, so a gateway can never
        // shadow the federated endpoint.
        .route("/chat/federated", get(federated_ws::federated_chat))
        .route("/chat/{gateway_id}", get(chat_ws::gateway_chat))
        .nest("/api/gateways", gateway_routes())
        .nest("/api/federated-sessions", federated_routes())
}

fn gateway_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_gateways).post(add_gateway))
        .route("/{id}", delete(delete_gateway))
        .route("/{id}/status", get(gateway_status))
        .route("/{id}/sessions", get(list_sessions).post(create_session))
        .route(
            "/{id}/sessions/{key}",
            get(get_session).delete(delete_session),
        )
        .route("/{id}/sessions/{key}/messages", get(list_messages))
}

fn federated_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_federated_sessions).post(create_federated_session))
        .route(
            "/{id}",
            get(get_federated_session).delete(delete_federated_session),
        )
}

// ── Service info ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
    status: &'static str,
}

async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "clawchat",
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ── Gateways ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GatewayCreate {
    id: String,
    name: String,
    url: String,
    token: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
struct GatewayResponse {
    id: String,
    name: String,
    url: String,
    connected: bool,
    #[serde(rename = "createdAt")]
    created_at: i64,
}

async fn list_gateways(State(state): State<Arc<AppState>>) -> Result<Json<Vec<GatewayResponse>>> {
    let records = state.gateways.list().await?;

    let mut gateways = Vec::with_capacity(records.len());
    for record in records {
        let connected = state.manager.is_connected(&record.id).await;
        gateways.push(GatewayResponse {
            id: record.id,
            name: record.name,
            url: record.url,
            connected,
            created_at: record.created_at,
        });
    }

    Ok(Json(gateways))
}

async fn add_gateway(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GatewayCreate>,
) -> Result<Json<GatewayResponse>> {
    if req.id.trim().is_empty() {
        return Err(ApiError::Validation("gateway id must not be empty".into()));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::Validation("gateway name must not be empty".into()));
    }
    if req.url.trim().is_empty() {
        return Err(ApiError::Validation("gateway url must not be empty".into()));
    }

    let config = GatewayConfig {
        id: req.id,
        name: req.name,
        url: req.url,
        token: req.token,
        password: req.password,
        created_at: now_millis(),
    };

    let record = state.manager.register(config).await?;
    let connected = state.manager.is_connected(&record.id).await;

    Ok(Json(GatewayResponse {
        id: record.id,
        name: record.name,
        url: record.url,
        connected,
        created_at: record.created_at,
    }))
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Serialize)]
struct OkResponse {
    ok: bool,
}

async fn delete_gateway(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>> {
    state.manager.unregister(&id).await?;
    Ok(Json(OkResponse { ok: true }))
}

#[derive(Debug, Serialize)]
struct GatewayStatusResponse {
    id: String,
    connected: bool,
    agents: Vec<Value>,
    models: Vec<Value>,
    #[serde(rename = "defaultModel")]
    default_model: Option<String>,
}

async fn gateway_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<GatewayStatusResponse>> {
    let Some(conn) = state.manager.get(&id).await else {
        return Err(ApiError::NotFound(format!("gateway '{}' not found", id)));
    };

    let snapshot = conn.snapshot();
    Ok(Json(GatewayStatusResponse {
        id,
        connected: conn.is_connected(),
        agents: snapshot.agents,
        models: snapshot.models,
        default_model: snapshot.default_model,
    }))
}

// ── Sessions ────────────────────────────────────────────────────────────────

async fn require_gateway(state: &AppState, id: &str) -> Result<()> {
    if state.gateways.get(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("gateway '{}' not found", id)));
    }
    Ok(())
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Session>>> {
    require_gateway(&state, &id).await?;
    Ok(Json(state.sessions.list_for_gateway(&id).await?))
}

#[derive(Debug, Deserialize)]
struct SessionCreate {
    session_key: Option<String>,
    title: Option<String>,
    agent_id: Option<String>,
    model: Option<String>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SessionCreate>,
) -> Result<Json<Session>> {
    require_gateway(&state, &id).await?;

    let session_key = req
        .session_key
        .filter(|key| !key.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let session = state
        .sessions
        .upsert(
            &id,
            &session_key,
            req.title.as_deref(),
            req.agent_id.as_deref(),
            req.model.as_deref(),
        )
        .await?;

    Ok(Json(session))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, String)>,
) -> Result<Json<Session>> {
    require_gateway(&state, &id).await?;

    let session = state
        .sessions
        .get(&id, &key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session '{}' not found", key)))?;

    Ok(Json(session))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, String)>,
) -> Result<Json<OkResponse>> {
    require_gateway(&state, &id).await?;
    state.sessions.delete(&id, &key).await?;
    Ok(Json(OkResponse { ok: true }))
}

// ── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<i64>,
    before: Option<i64>,
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, String)>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>> {
    require_gateway(&state, &id).await?;

    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    let messages = state.messages.list(&id, &key, limit, query.before).await?;
    Ok(Json(messages))
}

// ── Federated sessions ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FederatedSessionCreate {
    title: Option<String>,
    gateways: Vec<FederatedTarget>,
}

async fn create_federated_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FederatedSessionCreate>,
) -> Result<Json<FederatedSession>> {
    if req.gateways.is_empty() {
        return Err(ApiError::Validation(
            "a federated session needs at least one target".into(),
        ));
    }

    let session_id = id::create(id::Prefix::Federated);
    let session = state
        .federated
        .create(&session_id, req.title.as_deref(), &req.gateways)
        .await?;

    Ok(Json(session))
}

async fn list_federated_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<FederatedSession>>> {
    Ok(Json(state.federated.list().await?))
}

async fn get_federated_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FederatedSession>> {
    let session = state
        .federated
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("federated session '{}' not found", id)))?;
    Ok(Json(session))
}

async fn delete_federated_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>> {
    state.federated.delete(&id).await?;
    Ok(Json(OkResponse { ok: true }))
}
