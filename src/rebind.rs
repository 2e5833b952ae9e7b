//! Rebind Engine
//!
//! Reconstructs the in-memory entity graph from the shared store's latest
//! snapshot, either once (cold start, promotion) or continuously on a
//! background task so a passive node tracks the master with bounded lag.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::entity::EntityRegistry;
use crate::error::{Error, Result};
use crate::store::SharedStore;

/// Outcome of one rebind pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebindReport {
    /// Snapshot version loaded (0 when the store holds no snapshot yet)
    pub version: u64,
    /// Entities loaded
    pub entities: usize,
    /// Pass number since the last reset
    pub pass: u64,
    pub elapsed: Duration,
}

/// Operations the HA manager drives
#[async_trait]
pub trait RebindEngine: Send + Sync {
    /// Run one full pass; fails with `Error::Rebind`
    async fn rebind_once(&self) -> Result<RebindReport>;

    /// Start background passes if not already running
    fn start_continuous_replication(&self);

    /// Stop background passes and wait for the task to finish
    async fn stop_continuous_replication(&self);

    /// Whether background passes are running
    fn is_replicating(&self) -> bool;

    /// Passes completed since the last reset
    fn completed_passes(&self) -> u64;

    /// Drop loaded state; the node no longer holds usable data
    async fn reset(&self);
}

/// Rebind engine reading snapshots from a `SharedStore`
pub struct StoreRebinder {
    store: Arc<dyn SharedStore>,
    registry: Arc<EntityRegistry>,
    passes: Arc<AtomicU64>,
    interval: Duration,
    replication: Mutex<Option<JoinHandle<()>>>,
}

impl StoreRebinder {
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: Arc<EntityRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            passes: Arc::new(AtomicU64::new(0)),
            interval,
            replication: Mutex::new(None),
        }
    }

    fn replication_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.replication.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Load the latest snapshot into the registry
async fn run_pass(
    store: &dyn SharedStore,
    registry: &EntityRegistry,
    passes: &AtomicU64,
) -> Result<RebindReport> {
    let started = Instant::now();

    let snapshot = store
        .read_latest_snapshot()
        .await
        .map_err(|e| Error::Rebind(format!("reading latest snapshot: {}", e)))?;

    let (version, entities) = match snapshot {
        Some(snapshot) => {
            registry.replace_from(&snapshot).await;
            (snapshot.version, snapshot.entities.len())
        }
        None => {
            registry.clear().await;
            (0, 0)
        }
    };

    let pass = passes.fetch_add(1, Ordering::SeqCst) + 1;
    Ok(RebindReport {
        version,
        entities,
        pass,
        elapsed: started.elapsed(),
    })
}

#[async_trait]
impl RebindEngine for StoreRebinder {
    async fn rebind_once(&self) -> Result<RebindReport> {
        let report = run_pass(self.store.as_ref(), &self.registry, &self.passes).await?;
        tracing::debug!(
            "Rebind pass {} loaded {} entities (version {}) in {:?}",
            report.pass,
            report.entities,
            report.version,
            report.elapsed
        );
        Ok(report)
    }

    fn start_continuous_replication(&self) {
        let mut slot = self.replication_slot();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let passes = Arc::clone(&self.passes);
        let interval = self.interval;

        *slot = Some(tokio::spawn(async move {
            tracing::info!("Continuous replication started (every {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_version = None;
            loop {
                ticker.tick().await;
                match run_pass(store.as_ref(), &registry, &passes).await {
                    Ok(report) => {
                        if last_version != Some(report.version) {
                            tracing::debug!(
                                "Replicated snapshot version {} ({} entities)",
                                report.version,
                                report.entities
                            );
                            last_version = Some(report.version);
                        }
                    }
                    Err(e) => tracing::warn!("Replication pass failed, will retry: {}", e),
                }
            }
        }));
    }

    async fn stop_continuous_replication(&self) {
        let handle = self.replication_slot().take();
        if let Some(handle) = handle {
            handle.abort();
            // Wait so no pass can still replace the graph after we return
            let _ = handle.await;
            tracing::info!("Continuous replication stopped");
        }
    }

    fn is_replicating(&self) -> bool {
        self.replication_slot()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn completed_passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    async fn reset(&self) {
        self.stop_continuous_replication().await;
        self.registry.clear().await;
        self.passes.store(0, Ordering::SeqCst);
    }
}
