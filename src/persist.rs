//! Snapshot Persister
//!
//! Writes the entity graph to the shared store after mutations. Writes
//! happen on a short period and only under a writer role; the master's
//! epoch travels with every snapshot so a deposed master is fenced by the
//! store. Changes accepted before a stop are still written under the role
//! they were accepted in.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::entity::EntityRegistry;
use crate::error::Result;
use crate::ha::{HaSnapshot, NodeState, PendingGuard, PendingTracker};
use crate::store::SharedStore;

#[derive(Default)]
struct Dirty {
    /// Bumped by every `mark_dirty`
    generation: u64,
    /// Held while unpersisted changes exist
    guard: Option<PendingGuard>,
    /// Last writer role seen; cleared by a passive role
    last_writer: Option<HaSnapshot>,
}

impl Dirty {
    fn observe(&mut self, ha: &HaSnapshot) {
        if ha.state.is_writer() {
            self.last_writer = Some(ha.clone());
        } else if !ha.state.is_transient() {
            self.last_writer = None;
        }
    }

    /// Role to write pending changes under, if any
    fn authority(&self, ha: &HaSnapshot) -> Option<HaSnapshot> {
        if ha.state.is_writer() {
            Some(ha.clone())
        } else if ha.state == NodeState::Terminated {
            self.last_writer.clone()
        } else {
            None
        }
    }
}

/// Periodic snapshot writer
pub struct Persister {
    node_id: String,
    registry: Arc<EntityRegistry>,
    store: Arc<dyn SharedStore>,
    ha_state: watch::Receiver<HaSnapshot>,
    pending: PendingTracker,
    interval: Duration,
    dirty: Mutex<Dirty>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<EntityRegistry>,
        store: Arc<dyn SharedStore>,
        ha_state: watch::Receiver<HaSnapshot>,
        pending: PendingTracker,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node_id: node_id.into(),
            registry,
            store,
            ha_state,
            pending,
            interval,
            dirty: Mutex::new(Dirty::default()),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    fn dirty(&self) -> std::sync::MutexGuard<'_, Dirty> {
        self.dirty.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that the registry changed and needs writing
    pub fn mark_dirty(&self) {
        let ha = self.ha_state.borrow().clone();
        let mut dirty = self.dirty();
        dirty.observe(&ha);
        dirty.generation += 1;
        if dirty.guard.is_none() {
            dirty.guard = Some(self.pending.begin());
        }
    }

    /// Whether unpersisted changes exist
    pub fn is_dirty(&self) -> bool {
        self.dirty().guard.is_some()
    }

    /// Write the registry if it changed. Returns whether a snapshot was written.
    pub async fn flush(&self) -> Result<bool> {
        let ha = self.ha_state.borrow().clone();
        let (generation, authority) = {
            let mut dirty = self.dirty();
            dirty.observe(&ha);
            if dirty.guard.is_none() {
                return Ok(false);
            }
            (dirty.generation, dirty.authority(&ha))
        };

        let Some(authority) = authority else {
            tracing::warn!(
                "Discarding unpersisted changes, node is {} and may not write",
                ha.state
            );
            self.clear_if_unchanged(generation);
            return Ok(false);
        };

        let snapshot = self
            .registry
            .to_snapshot(&self.node_id, authority.epoch)
            .await;
        match self.store.write_snapshot(&snapshot).await {
            Ok(()) => {
                tracing::debug!(
                    "Persisted snapshot version {} ({} entities)",
                    snapshot.version,
                    snapshot.entities.len()
                );
                self.clear_if_unchanged(generation);
                Ok(true)
            }
            Err(e) if e.is_fenced() => {
                tracing::warn!("Snapshot write fenced, dropping changes: {}", e);
                self.clear_if_unchanged(generation);
                Err(e)
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("Snapshot write failed, will retry: {}", e);
                Err(e)
            }
            Err(e) => {
                tracing::error!("Snapshot write failed: {}", e);
                Err(e)
            }
        }
    }

    /// Release the pending guard unless another change arrived meanwhile
    fn clear_if_unchanged(&self, generation: u64) {
        let mut dirty = self.dirty();
        if dirty.generation == generation {
            dirty.guard = None;
        }
    }

    /// Spawn the periodic flush task
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let persister = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ha = self.ha_state.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(persister.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ha_open = true;
            loop {
                // A role change flushes at once so a stop loses nothing
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {}
                    changed = ha.changed(), if ha_open => ha_open = changed.is_ok(),
                }
                if *shutdown.borrow() {
                    break;
                }
                // Errors are logged inside flush and retried next tick
                let _ = persister.flush().await;
            }
        }));
    }

    /// Stop the flush task and make a last write attempt
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(e) = self.flush().await {
            tracing::warn!("Final snapshot flush failed: {}", e);
        }
    }
}
