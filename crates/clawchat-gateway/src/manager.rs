use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use clawchat_storage::{GatewayRepository, StorageError};
use clawchat_types::{GatewayConfig, GatewayRecord};

use crate::connection::GatewayConnection;

/// Process-wide registry of gateway connections, keyed by gateway id.
///
/// A connection exists in the registry exactly when a persisted gateway
/// config with its id exists: registration persists before dialing and
/// removal deletes (cascading to sessions and messages) before closing.
pub struct GatewayManager {
    connections: RwLock<HashMap<String, Arc<GatewayConnection>>>,
    gateways: GatewayRepository,
}

impl GatewayManager {
    pub fn new(gateways: GatewayRepository) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            gateways,
        }
    }

    /// Construct and dial a connection for every stored config. Dialing is
    /// asynchronous with its own backoff, so one unreachable gateway never
    /// blocks the rest.
    pub async fn start(&self) -> Result<(), StorageError> {
        let configs = self.gateways.list_with_secrets().await?;
        info!("starting {} stored gateway connection(s)", configs.len());
        for config in configs {
            self.connect(config).await;
        }
        Ok(())
    }

    /// Seed a single gateway when the table is empty at startup. Returns
    /// whether a gateway was created.
    pub async fn seed_default(&self, url: &str) -> Result<bool, StorageError> {
        if self.gateways.count().await? > 0 {
            return Ok(false);
        }

        info!(url, "gateway table empty, seeding default gateway");
        let config = GatewayConfig {
            id: "default".to_string(),
            name: "Default Gateway".to_string(),
            url: url.to_string(),
            token: None,
            password: None,
            created_at: Utc::now().timestamp_millis(),
        };
        match self.register(config).await {
            Ok(_) => Ok(true),
            Err(StorageError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Persist a new gateway config, then construct its connection and
    /// start dialing. Fails with `AlreadyExists` for a duplicate id.
    pub async fn register(&self, config: GatewayConfig) -> Result<GatewayRecord, StorageError> {
        let record = self.gateways.add(&config).await?;
        self.connect(config).await;
        Ok(record)
    }

    /// Delete the stored config (cascading to sessions and messages), then
    /// stop the connection: reconnect disabled, socket closed, pending
    /// requests failed.
    pub async fn unregister(&self, id: &str) -> Result<(), StorageError> {
        self.gateways.delete(id).await?;

        let removed = self.connections.write().await.remove(id);
        if let Some(conn) = removed {
            conn.stop().await;
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<GatewayConnection>> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.get(id).await.map(|c| c.is_connected()).unwrap_or(false)
    }

    /// Close every connection and clear the registry. Pending requests are
    /// flushed with failures before this returns.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<GatewayConnection>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.stop().await;
        }
        info!("all gateway connections stopped");
    }

    async fn connect(&self, config: GatewayConfig) {
        let id = config.id.clone();
        let conn = GatewayConnection::new(config);
        conn.spawn();

        let previous = self.connections.write().await.insert(id.clone(), conn);
        if let Some(previous) = previous {
            warn!(gateway = %id, "replacing live connection");
            previous.stop().await;
        }
    }
}
