use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header::HeaderValue, request::Parts};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use clawchat_gateway::GatewayManager;
use clawchat_storage::{
    Database, FederatedSessionRepository, GatewayRepository, MessageRepository, SessionRepository,
};

use crate::routes;

/// Shared state accessible by all handlers and WebSocket connections.
pub struct AppState {
    pub gateways: GatewayRepository,
    pub sessions: SessionRepository,
    pub messages: MessageRepository,
    pub federated: FederatedSessionRepository,
    pub manager: Arc<GatewayManager>,
}

impl AppState {
    pub fn new(db: &Database, manager: Arc<GatewayManager>) -> Self {
        let pool = db.pool().clone();
        Self {
            gateways: GatewayRepository::new(pool.clone()),
            sessions: SessionRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            federated: FederatedSessionRepository::new(pool),
            manager,
        }
    }
}

fn normalize_origin(origin: &str) -> Option<String> {
    let trimmed = origin.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn cors_layer(origins: Vec<String>) -> CorsLayer {
    let mut allowed: HashSet<String> = origins
        .iter()
        .filter_map(|origin| normalize_origin(origin))
        .collect();

    // Local dev front-end ports when nothing is configured.
    if allowed.is_empty() {
        allowed.insert("http://localhost:3000".to_string());
        allowed.insert("http://localhost:5173".to_string());
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                origin
                    .to_str()
                    .map(|o| allowed.contains(o.trim_end_matches('/')))
                    .unwrap_or(false)
            },
        ))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn app(state: Arc<AppState>, cors_origins: Vec<String>) -> Router {
    routes::router()
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves. Bind failures bubble up as
/// unrecoverable initialization errors.
pub async fn run_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    cors_origins: Vec<String>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = app(state, cors_origins);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
