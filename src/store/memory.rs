//! In-process shared store
//!
//! All nodes of a single process (tests, demos) share one `MemoryStore`
//! through an `Arc`. The mutex makes the leadership claim atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    check_claim_args, check_fence, ClaimOutcome, EntitySnapshot, HeartbeatRecord,
    LeadershipRecord, SharedStore,
};
use crate::error::{Error, Result};
use crate::ha::Epoch;

#[derive(Default)]
struct Inner {
    heartbeats: HashMap<String, HeartbeatRecord>,
    leadership: Option<LeadershipRecord>,
    snapshot: Option<EntitySnapshot>,
}

/// Shared store held in memory
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Cleared to simulate an unreachable store
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every operation fail with `StoreUnavailable` until re-enabled
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("memory store disabled".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn write_heartbeat(&self, record: &HeartbeatRecord) -> Result<()> {
        self.ensure_available()?;
        let mut inner = self.inner.lock().await;
        inner.heartbeats.insert(record.node_id.clone(), record.clone());
        Ok(())
    }

    async fn list_heartbeats(&self) -> Result<Vec<HeartbeatRecord>> {
        self.ensure_available()?;
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner.heartbeats.values().cloned().collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(records)
    }

    async fn read_leadership(&self) -> Result<Option<LeadershipRecord>> {
        self.ensure_available()?;
        Ok(self.inner.lock().await.leadership.clone())
    }

    async fn claim_leadership(
        &self,
        node_id: &str,
        expected: Option<Epoch>,
        new_epoch: Epoch,
    ) -> Result<ClaimOutcome> {
        self.ensure_available()?;
        check_claim_args(expected, new_epoch)?;

        let mut inner = self.inner.lock().await;
        let current = inner.leadership.as_ref().map(|l| l.epoch);
        if current != expected {
            return Ok(ClaimOutcome::Conflict {
                current: inner.leadership.clone(),
            });
        }

        let record = LeadershipRecord {
            master_id: node_id.to_string(),
            epoch: new_epoch,
            claimed_at: chrono::Utc::now(),
        };
        inner.leadership = Some(record.clone());
        Ok(ClaimOutcome::Won(record))
    }

    async fn read_latest_snapshot(&self) -> Result<Option<EntitySnapshot>> {
        self.ensure_available()?;
        Ok(self.inner.lock().await.snapshot.clone())
    }

    async fn write_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()> {
        self.ensure_available()?;
        let mut inner = self.inner.lock().await;
        check_fence(snapshot.epoch, inner.leadership.as_ref())?;
        inner.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
