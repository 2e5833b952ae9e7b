//! HA Manager
//!
//! Owns this node's role. A single background task heartbeats into the
//! shared store, watches the other nodes, claims leadership when the
//! master is gone and drives the rebind engine for the resulting role.
//! Everything else reads the published `HaSnapshot` without blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HaConfig;
use crate::error::{Error, Result};
use crate::ha::election::{Decision, Election};
use crate::ha::{Epoch, HaMode, HaSnapshot, NodeState, PendingTracker};
use crate::rebind::RebindEngine;
use crate::store::{ClaimOutcome, SharedStore};

/// Per-node HA coordinator
pub struct HaManager {
    /// This node's ID
    node_id: String,
    /// HA mode and timing
    config: HaConfig,
    /// Shared durable store
    store: Arc<dyn SharedStore>,
    /// Rebind engine for the in-memory entity graph
    rebind: Arc<dyn RebindEngine>,
    /// Published state; written only by the election loop and `stop`
    state_tx: watch::Sender<HaSnapshot>,
    shutdown_tx: watch::Sender<bool>,
    /// In-flight rebind and persistence work
    pending: PendingTracker,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl HaManager {
    /// Create a manager in the INITIALIZING state
    pub fn new(
        node_id: impl Into<String>,
        config: HaConfig,
        store: Arc<dyn SharedStore>,
        rebind: Arc<dyn RebindEngine>,
    ) -> Self {
        let node_id = node_id.into();
        let (state_tx, _) = watch::channel(HaSnapshot::initializing(node_id.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            node_id,
            config,
            store,
            rebind,
            state_tx,
            shutdown_tx,
            pending: PendingTracker::new(),
            loop_handle: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// This node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Configured HA mode
    pub fn mode(&self) -> HaMode {
        self.config.mode
    }

    /// Current role
    pub fn node_state(&self) -> NodeState {
        self.state_tx.borrow().state
    }

    /// Copy of the last published snapshot
    pub fn snapshot(&self) -> HaSnapshot {
        self.state_tx.borrow().clone()
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<HaSnapshot> {
        self.state_tx.subscribe()
    }

    /// Tracker for work that `wait_for_pending_complete` should wait on
    pub fn pending(&self) -> &PendingTracker {
        &self.pending
    }

    /// Start the node. In `disabled` mode this loads the entity graph once and
    /// publishes DISABLED; otherwise it spawns the election loop. A stopped
    /// manager cannot be started again.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopping() {
            return Err(Error::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.config.mode.participates() {
            let report = {
                let _guard = self.pending.begin();
                self.rebind.rebind_once().await?
            };
            tracing::info!(
                "HA disabled, loaded {} entities (version {})",
                report.entities,
                report.version
            );
            self.publish(|s| {
                s.state = NodeState::Disabled;
                s.rebind_passes = report.pass;
            });
            return Ok(());
        }

        tracing::info!(
            "Starting HA election for {} (mode {}, heartbeat {:?}, liveness timeout {:?})",
            self.node_id,
            self.config.mode,
            self.config.heartbeat_interval(),
            self.config.liveness_timeout()
        );

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.run().await });
        *self.loop_slot() = Some(handle);
        Ok(())
    }

    /// Stop heartbeating and publish TERMINATED, then give pending
    /// persistence up to one liveness timeout to settle. Idempotent.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        self.state_tx.send_if_modified(|s| {
            if s.state == NodeState::Terminated {
                return false;
            }
            tracing::info!("Node {} state {} -> {}", self.node_id, s.state, NodeState::Terminated);
            s.state = NodeState::Terminated;
            s.epoch = None;
            s.changed_at = chrono::Utc::now();
            true
        });

        let handle = self.loop_slot().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Election loop ended abnormally: {}", e);
            }
        }
        self.rebind.stop_continuous_replication().await;

        if let Err(e) = self.pending.wait_idle(self.config.liveness_timeout()).await {
            tracing::warn!("Node {} stopped with work still pending: {}", self.node_id, e);
        }
    }

    /// Wait until rebind and persistence work started by this node settles
    pub async fn wait_for_pending_complete(&self, timeout: Duration) -> Result<()> {
        self.pending.wait_idle(timeout).await
    }

    fn stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn loop_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.loop_handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>) {
        let mut election = Election::new(
            self.node_id.clone(),
            self.config.mode,
            self.config.liveness_timeout(),
        );
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick(&mut election).await;
        }

        tracing::info!("Election loop for {} stopped", self.node_id);
    }

    /// One heartbeat/election cycle
    async fn tick(&self, election: &mut Election) {
        let current = self.snapshot();
        if current.state == NodeState::Terminated {
            return;
        }

        let heartbeat = election.heartbeat_for(&current);
        match self.store.write_heartbeat(&heartbeat).await {
            Ok(()) => election.heartbeat_written(),
            Err(e) => {
                tracing::warn!("Heartbeat write failed: {}", e);
                if current.state == NodeState::Master && election.heartbeat_overdue() {
                    self.demote("heartbeats cannot reach the store", None).await;
                }
                return;
            }
        }

        let heartbeats = match self.store.list_heartbeats().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Listing heartbeats failed: {}", e);
                return;
            }
        };
        let leadership = match self.store.read_leadership().await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Reading leadership failed: {}", e);
                return;
            }
        };

        let view = election.observe(&heartbeats, leadership, &current, Instant::now());
        match election.decide(&current, &view) {
            Decision::Lead => {}
            Decision::Demote { reason, master_id } => self.demote(&reason, master_id).await,
            Decision::Follow { master_id } => self.ensure_passive(Some(master_id)).await,
            Decision::Claim { expected } => {
                if current.state == NodeState::Initializing {
                    self.ensure_passive(None).await;
                }
                self.try_promote(election, expected).await;
            }
            Decision::Wait => self.ensure_passive(None).await,
        }
    }

    /// Claim the next epoch and, if won, become MASTER
    async fn try_promote(&self, election: &mut Election, expected: Option<Epoch>) {
        if self.config.claim_jitter_ms > 0 {
            let delay = rand::thread_rng().gen_range(0..=self.config.claim_jitter_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.stopping() {
            return;
        }

        let new_epoch = Epoch::next_after(expected);
        let record = match self
            .store
            .claim_leadership(&self.node_id, expected, new_epoch)
            .await
        {
            Ok(ClaimOutcome::Won(record)) => record,
            Ok(ClaimOutcome::Conflict { current }) => {
                let holder = current.map(|l| l.master_id);
                tracing::debug!(
                    "Claim for epoch {} lost (holder {})",
                    new_epoch,
                    holder.as_deref().unwrap_or("none")
                );
                self.ensure_passive(holder).await;
                return;
            }
            Err(e) => {
                tracing::warn!("Leadership claim failed: {}", e);
                return;
            }
        };

        election.claimed(record.epoch);
        tracing::info!("Claimed leadership at epoch {}, rebinding", record.epoch);

        let _guard = self.pending.begin();
        self.rebind.stop_continuous_replication().await;

        let report = match self.rebind.rebind_once().await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Promotion to epoch {} aborted: {}", record.epoch, e);
                self.ensure_passive(None).await;
                return;
            }
        };

        match self.store.read_leadership().await {
            Ok(Some(l)) if l.master_id == self.node_id && l.epoch == record.epoch => {}
            Ok(other) => {
                let conflict = Error::LeadershipConflict {
                    expected: Some(record.epoch.0),
                    actual: other.as_ref().map(|l| l.epoch.0),
                };
                tracing::warn!("Promotion aborted: {}", conflict);
                self.ensure_passive(other.map(|l| l.master_id)).await;
                return;
            }
            Err(e) => {
                tracing::warn!("Could not confirm epoch {}: {}", record.epoch, e);
                self.ensure_passive(None).await;
                return;
            }
        }

        if self.stopping() {
            tracing::info!("Stopped while promoting to epoch {}, not taking over", record.epoch);
            return;
        }

        let heartbeat = election.heartbeat(NodeState::Master, Some(record.epoch));
        if let Err(e) = self.store.write_heartbeat(&heartbeat).await {
            tracing::warn!("MASTER heartbeat for epoch {} failed: {}", record.epoch, e);
            self.ensure_passive(None).await;
            return;
        }
        election.heartbeat_written();

        let node_id = self.node_id.clone();
        self.publish(|s| {
            s.state = NodeState::Master;
            s.epoch = Some(record.epoch);
            s.master_id = Some(node_id);
            s.rebind_passes = report.pass;
        });
        tracing::info!(
            "Node {} is MASTER at epoch {} ({} entities loaded)",
            self.node_id,
            record.epoch,
            report.entities
        );
    }

    /// Hold the passive role; hot roles keep a rebound, replicating graph
    async fn ensure_passive(&self, master_id: Option<String>) {
        let passive = self.config.mode.passive_state();

        if passive.is_hot() {
            if self.rebind.completed_passes() == 0 {
                let _guard = self.pending.begin();
                if let Err(e) = self.rebind.rebind_once().await {
                    tracing::warn!("Rebind for {} failed, will retry: {}", passive, e);
                }
            }
            if self.rebind.completed_passes() > 0 {
                self.rebind.start_continuous_replication();
            }
        }

        let passes = self.rebind.completed_passes();
        self.publish(|s| {
            s.state = passive;
            s.epoch = None;
            s.master_id = master_id;
            s.rebind_passes = passes;
        });
    }

    /// Step down. The graph may hold changes that were never persisted, so
    /// hot roles reload it before serving reads again.
    async fn demote(&self, reason: &str, master_id: Option<String>) {
        tracing::warn!("Node {} stepping down from MASTER: {}", self.node_id, reason);
        if self.config.mode.passive_state().is_hot() {
            let _guard = self.pending.begin();
            if let Err(e) = self.rebind.rebind_once().await {
                tracing::warn!("Reload after stepping down failed: {}", e);
                self.rebind.reset().await;
            }
        } else {
            self.rebind.reset().await;
        }
        self.ensure_passive(master_id).await;
    }

    /// Replace the published snapshot; TERMINATED is final
    fn publish(&self, update: impl FnOnce(&mut HaSnapshot)) {
        self.state_tx.send_if_modified(|s| {
            if s.state == NodeState::Terminated {
                return false;
            }
            let before = s.clone();
            update(s);
            if s.state != before.state {
                s.changed_at = chrono::Utc::now();
                tracing::info!("Node {} state {} -> {}", self.node_id, before.state, s.state);
            }
            *s != before
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityRegistry};
    use crate::rebind::{RebindReport, StoreRebinder};
    use crate::retry::eventually;
    use crate::store::{HeartbeatRecord, MemoryStore};
    use std::sync::atomic::AtomicU64;

    /// Rebind engine whose full passes can be slowed down or made to fail
    struct ScriptedRebind {
        inner: StoreRebinder,
        delay: Duration,
        failures_left: AtomicU64,
        attempts: AtomicU64,
    }

    impl ScriptedRebind {
        fn attempts(&self) -> u64 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl RebindEngine for ScriptedRebind {
        async fn rebind_once(&self) -> Result<RebindReport> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::Rebind("snapshot unreadable".into()));
            }
            self.inner.rebind_once().await
        }

        fn start_continuous_replication(&self) {
            self.inner.start_continuous_replication()
        }

        async fn stop_continuous_replication(&self) {
            self.inner.stop_continuous_replication().await
        }

        fn is_replicating(&self) -> bool {
            self.inner.is_replicating()
        }

        fn completed_passes(&self) -> u64 {
            self.inner.completed_passes()
        }

        async fn reset(&self) {
            self.inner.reset().await
        }
    }

    fn fast_config(mode: HaMode) -> HaConfig {
        HaConfig {
            mode,
            heartbeat_interval_ms: 20,
            liveness_timeout_ms: 100,
            claim_jitter_ms: 5,
            replication_interval_ms: 10,
            persist_interval_ms: 10,
        }
    }

    fn manager(id: &str, mode: HaMode, store: &Arc<MemoryStore>) -> (Arc<HaManager>, Arc<EntityRegistry>) {
        let config = fast_config(mode);
        let registry = Arc::new(EntityRegistry::new());
        let rebind = Arc::new(StoreRebinder::new(
            Arc::clone(store) as Arc<dyn SharedStore>,
            Arc::clone(&registry),
            config.replication_interval(),
        ));
        let ha = HaManager::new(id, config, Arc::clone(store) as Arc<dyn SharedStore>, rebind);
        (Arc::new(ha), registry)
    }

    fn scripted_manager(
        id: &str,
        config: HaConfig,
        store: &Arc<MemoryStore>,
        delay: Duration,
        failures: u64,
    ) -> (Arc<HaManager>, Arc<ScriptedRebind>, Arc<EntityRegistry>) {
        let registry = Arc::new(EntityRegistry::new());
        let rebind = Arc::new(ScriptedRebind {
            inner: StoreRebinder::new(
                Arc::clone(store) as Arc<dyn SharedStore>,
                Arc::clone(&registry),
                config.replication_interval(),
            ),
            delay,
            failures_left: AtomicU64::new(failures),
            attempts: AtomicU64::new(0),
        });
        let ha = HaManager::new(
            id,
            config,
            Arc::clone(store) as Arc<dyn SharedStore>,
            Arc::clone(&rebind) as Arc<dyn RebindEngine>,
        );
        (Arc::new(ha), rebind, registry)
    }

    async fn wait_for_state(ha: &HaManager, state: NodeState) {
        let mut rx = ha.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| panic!("{} never reached {}", ha.node_id(), state))
            .unwrap();
    }

    #[tokio::test]
    async fn test_starts_initializing() {
        let store = Arc::new(MemoryStore::new());
        let (ha, _) = manager("n1", HaMode::Auto, &store);
        assert_eq!(ha.node_state(), NodeState::Initializing);
        assert_eq!(ha.snapshot().node_id, "n1");
    }

    #[tokio::test]
    async fn test_disabled_cold_start() {
        let store = Arc::new(MemoryStore::new());
        let seed = EntityRegistry::new();
        seed.create(Entity::new("application", "web", serde_json::json!({}))).await;
        store.write_snapshot(&seed.to_snapshot("old", None).await).await.unwrap();

        let (ha, registry) = manager("solo", HaMode::Disabled, &store);
        ha.start().await.unwrap();

        assert_eq!(ha.node_state(), NodeState::Disabled);
        assert!(ha.snapshot().has_rebound());
        assert_eq!(registry.len().await, 1);
        // Never heartbeats
        assert!(store.list_heartbeats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lone_auto_node_becomes_master() {
        let store = Arc::new(MemoryStore::new());
        let (ha, _) = manager("n1", HaMode::Auto, &store);
        ha.start().await.unwrap();
        wait_for_state(&ha, NodeState::Master).await;

        let snapshot = ha.snapshot();
        assert_eq!(snapshot.epoch, Some(Epoch(1)));
        assert_eq!(snapshot.master_id.as_deref(), Some("n1"));
        assert!(snapshot.has_rebound());

        let leadership = store.read_leadership().await.unwrap().unwrap();
        assert_eq!(leadership.master_id, "n1");
        ha.stop().await;
    }

    #[tokio::test]
    async fn test_lone_hot_backup_never_promotes() {
        let store = Arc::new(MemoryStore::new());
        let (ha, _) = manager("backup", HaMode::HotBackup, &store);
        ha.start().await.unwrap();
        wait_for_state(&ha, NodeState::HotBackup).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ha.node_state(), NodeState::HotBackup);
        assert!(ha.snapshot().has_rebound());
        assert!(store.read_leadership().await.unwrap().is_none());
        ha.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_terminal_and_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let (ha, _) = manager("n1", HaMode::Auto, &store);
        ha.start().await.unwrap();
        wait_for_state(&ha, NodeState::Master).await;

        ha.stop().await;
        ha.stop().await;
        assert_eq!(ha.node_state(), NodeState::Terminated);

        // Heartbeat stops advancing once stopped
        let before = store.list_heartbeats().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.list_heartbeats().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_start_after_stop_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let (ha, _) = manager("n1", HaMode::Auto, &store);
        ha.stop().await;

        assert!(matches!(ha.start().await, Err(Error::ShuttingDown)));
        assert_eq!(ha.node_state(), NodeState::Terminated);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.list_heartbeats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_master_demotes_when_store_unreachable() {
        let store = Arc::new(MemoryStore::new());
        let (ha, _) = manager("n1", HaMode::HotStandby, &store);
        ha.start().await.unwrap();
        wait_for_state(&ha, NodeState::Master).await;

        store.set_available(false);
        wait_for_state(&ha, NodeState::HotStandby).await;
        assert_eq!(ha.snapshot().epoch, None);

        store.set_available(true);
        wait_for_state(&ha, NodeState::Master).await;
        ha.stop().await;
    }

    #[tokio::test]
    async fn test_wait_for_pending_complete() {
        let store = Arc::new(MemoryStore::new());
        let (ha, _) = manager("n1", HaMode::Auto, &store);
        ha.wait_for_pending_complete(Duration::from_millis(10)).await.unwrap();

        let guard = ha.pending().begin();
        assert!(ha
            .wait_for_pending_complete(Duration::from_millis(20))
            .await
            .is_err());
        drop(guard);

        ha.start().await.unwrap();
        wait_for_state(&ha, NodeState::Master).await;
        ha.wait_for_pending_complete(Duration::from_secs(1)).await.unwrap();
        ha.stop().await;
    }

    #[tokio::test]
    async fn test_promotion_waits_for_successful_rebind() {
        let store = Arc::new(MemoryStore::new());
        let (ha, _) = manager("n1", HaMode::Auto, &store);
        ha.start().await.unwrap();

        let master = eventually(Duration::from_secs(5), || {
            let ha = Arc::clone(&ha);
            async move {
                let s = ha.snapshot();
                (s.state == NodeState::Master).then_some(s)
            }
        })
        .await
        .unwrap();
        assert!(master.rebind_passes > 0);
        ha.stop().await;
    }

    #[tokio::test]
    async fn test_failed_rebind_retries_promotion_on_later_cycles() {
        let store = Arc::new(MemoryStore::new());
        let (ha, rebind, _) =
            scripted_manager("n1", fast_config(HaMode::Auto), &store, Duration::ZERO, 3);

        let mut rx = ha.subscribe();
        let first_master = tokio::spawn(async move {
            let mut before = Vec::new();
            loop {
                let s = rx.borrow_and_update().clone();
                if s.state == NodeState::Master {
                    return (before, s);
                }
                before.push(s.state);
                if rx.changed().await.is_err() {
                    panic!("manager dropped before promotion");
                }
            }
        });

        ha.start().await.unwrap();
        let (before, master) = tokio::time::timeout(Duration::from_secs(5), first_master)
            .await
            .unwrap()
            .unwrap();

        // Each failed pass left the node passive and cost one epoch
        assert!(before
            .iter()
            .all(|s| matches!(s, NodeState::Initializing | NodeState::Standby)));
        assert_eq!(rebind.attempts(), 4);
        assert_eq!(master.epoch, Some(Epoch(4)));
        assert!(master.rebind_passes > 0);
        ha.stop().await;
    }

    #[tokio::test]
    async fn test_stop_during_promotion_writes_no_master_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        let (ha, _, _) = scripted_manager(
            "n1",
            fast_config(HaMode::Auto),
            &store,
            Duration::from_millis(300),
            0,
        );
        ha.start().await.unwrap();

        let store_ref = &store;
        eventually(Duration::from_secs(5), move || async move {
            store_ref.read_leadership().await.ok().flatten()
        })
        .await
        .unwrap();

        ha.stop().await;
        assert_eq!(ha.node_state(), NodeState::Terminated);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let heartbeats = store.list_heartbeats().await.unwrap();
        assert_eq!(heartbeats.len(), 1);
        assert_ne!(heartbeats[0].state, NodeState::Master);
        assert_eq!(heartbeats[0].epoch, None);
    }

    #[tokio::test]
    async fn test_demoted_hot_standby_reloads_before_serving() {
        let store = Arc::new(MemoryStore::new());
        let mut config = fast_config(HaMode::HotStandby);
        config.replication_interval_ms = 60_000;
        let (ha, rebind, registry) =
            scripted_manager("n1", config, &store, Duration::ZERO, 0);
        ha.start().await.unwrap();
        wait_for_state(&ha, NodeState::Master).await;
        let promoted_after = rebind.attempts();

        // Accepted as master but never persisted
        registry
            .create(Entity::new("application", "unsaved", serde_json::json!({})))
            .await;

        store
            .claim_leadership("n2", Some(Epoch(1)), Epoch(2))
            .await
            .unwrap();
        let peer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                loop {
                    let heartbeat = HeartbeatRecord {
                        node_id: "n2".to_string(),
                        state: NodeState::Master,
                        timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
                        epoch: Some(Epoch(2)),
                    };
                    let _ = store.write_heartbeat(&heartbeat).await;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        wait_for_state(&ha, NodeState::HotStandby).await;
        assert_eq!(rebind.attempts(), promoted_after + 1);
        assert!(registry.is_empty().await);
        assert!(ha.snapshot().has_rebound());

        peer.abort();
        ha.stop().await;
    }
}
