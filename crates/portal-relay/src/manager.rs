//! Registry of live relay connections.

use std::{collections::HashMap, sync::Arc};

use portal_core::{ControlPlane, ServerMessage};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::bridge::{BridgeConfig, BridgeHandle, RelayBridge};

/// Client connection identifier.
pub type ConnId = Uuid;

/// Tracks one bridge per client connection so every connection can be torn
/// down on disconnect or shutdown.
pub struct RelayRegistry {
    control: Arc<dyn ControlPlane>,
    config: BridgeConfig,
    active: RwLock<HashMap<ConnId, BridgeHandle>>,
}

impl RelayRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(control: Arc<dyn ControlPlane>, config: BridgeConfig) -> Self {
        Self {
            control,
            config,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn a bridge for a new client connection.
    pub async fn open(
        &self,
        target: &str,
        events: mpsc::Sender<ServerMessage>,
    ) -> (ConnId, BridgeHandle) {
        let conn_id = Uuid::new_v4();
        let (handle, _task) = RelayBridge::spawn(
            Arc::clone(&self.control),
            target,
            self.config.clone(),
            events,
        );
        self.active.write().await.insert(conn_id, handle.clone());
        tracing::info!(%conn_id, target_container = target, "Relay connection opened");
        (conn_id, handle)
    }

    /// Look up a live connection.
    pub async fn get(&self, conn_id: ConnId) -> Option<BridgeHandle> {
        self.active.read().await.get(&conn_id).cloned()
    }

    /// Tear down a connection. Safe to call more than once.
    pub async fn close(&self, conn_id: ConnId) {
        let handle = self.active.write().await.remove(&conn_id);
        if let Some(handle) = handle {
            handle.disconnect().await;
            tracing::info!(%conn_id, "Relay connection closed");
        }
    }

    /// Tear down every connection.
    pub async fn close_all(&self) {
        let handles: Vec<_> = self.active.write().await.drain().collect();
        for (conn_id, handle) in handles {
            handle.disconnect().await;
            tracing::debug!(%conn_id, "Relay connection closed on shutdown");
        }
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.active.read().await.len()
    }

    /// Whether no connection is live.
    pub async fn is_empty(&self) -> bool {
        self.active.read().await.is_empty()
    }
}

impl std::fmt::Debug for RelayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
