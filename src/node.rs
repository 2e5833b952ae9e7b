//! Management Node
//!
//! Wires one process together: shared store, entity registry, rebind
//! engine, HA manager, persister and HTTP API.

use std::sync::{Arc, Mutex};

use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{AppState, HttpServer};
use crate::config::{HaPlaneConfig, StoreBackend, StoreConfig};
use crate::entity::EntityRegistry;
use crate::error::Result;
use crate::ha::HaManager;
use crate::persist::Persister;
use crate::rebind::StoreRebinder;
use crate::store::{MemoryStore, SharedStore, SqliteStore};

/// Open the shared store described by the configuration
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn SharedStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            if let Some(parent) = config.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            tracing::info!("Opening shared store at {}", config.path.display());
            Ok(Arc::new(SqliteStore::open(&config.path)?))
        }
    }
}

/// One management node process
pub struct ManagementNode {
    config: HaPlaneConfig,
    registry: Arc<EntityRegistry>,
    ha: Arc<HaManager>,
    persister: Arc<Persister>,
    http: Arc<HttpServer>,
    shutdown_tx: watch::Sender<bool>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl ManagementNode {
    /// Build a node on top of an already opened store
    pub fn new(config: HaPlaneConfig, store: Arc<dyn SharedStore>) -> Self {
        let registry = Arc::new(EntityRegistry::new());
        let rebind = Arc::new(StoreRebinder::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.ha.replication_interval(),
        ));

        let ha = Arc::new(HaManager::new(
            config.node.id.clone(),
            config.ha.clone(),
            Arc::clone(&store),
            rebind,
        ));

        let persister = Arc::new(Persister::new(
            config.node.id.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            ha.subscribe(),
            ha.pending().clone(),
            config.ha.persist_interval(),
        ));

        let http = Arc::new(HttpServer::new(
            config.api.clone(),
            config.admission.clone(),
            AppState {
                ha: Arc::clone(&ha),
                registry: Arc::clone(&registry),
                persister: Arc::clone(&persister),
                store,
            },
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            registry,
            ha,
            persister,
            http,
            shutdown_tx,
            server: Mutex::new(None),
        }
    }

    /// Start HA, persistence and (if enabled) the HTTP API
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            "Starting management node {} in {} mode",
            self.config.node.id,
            self.config.ha.mode
        );

        self.ha.start().await?;
        self.persister.start();

        if self.config.api.enabled {
            let http = Arc::clone(&self.http);
            let shutdown = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                if let Err(e) = http.start(shutdown).await {
                    tracing::error!("HTTP API failed: {}", e);
                }
            });
            *self.server.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        Ok(())
    }

    /// Router with every layer applied, for serving or in-process requests
    pub fn router(&self) -> Router {
        self.http.router()
    }

    pub fn ha(&self) -> &Arc<HaManager> {
        &self.ha
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn persister(&self) -> &Arc<Persister> {
        &self.persister
    }

    /// Flush pending changes, leave the cluster and stop serving
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down management node {}", self.config.node.id);
        self.persister.stop().await;
        self.ha.stop().await;

        self.shutdown_tx.send_replace(true);
        let handle = self.server.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
