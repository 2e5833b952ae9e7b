//! Shared Durable Store
//!
//! The single source of truth shared by every management node: one
//! heartbeat record per node, one leadership record, and the latest
//! entity-graph snapshot. The leadership claim is a compare-and-swap on
//! the epoch and is the only cross-node exclusion primitive.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::Result;
use crate::ha::{Epoch, NodeState};

/// Per-node liveness and role announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Node identity
    pub node_id: String,
    /// Declared role
    pub state: NodeState,
    /// Milliseconds since the Unix epoch, strictly increasing per node
    pub timestamp_ms: u64,
    /// Leadership epoch, present only while the node is master
    pub epoch: Option<Epoch>,
}

/// The current leadership term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipRecord {
    /// Node that won the claim
    pub master_id: String,
    /// Epoch of the claim
    pub epoch: Epoch,
    /// When the claim was written
    pub claimed_at: chrono::DateTime<chrono::Utc>,
}

/// Result of a conditional leadership claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claim was written
    Won(LeadershipRecord),
    /// Another node changed the record first
    Conflict { current: Option<LeadershipRecord> },
}

impl ClaimOutcome {
    pub fn is_won(&self) -> bool {
        matches!(self, ClaimOutcome::Won(_))
    }
}

/// Persisted entity graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Graph version at the time of writing
    pub version: u64,
    /// Node that wrote the snapshot
    pub written_by: String,
    /// Leadership epoch of the writer (None in single-node mode)
    pub epoch: Option<Epoch>,
    /// When the snapshot was written
    pub written_at: chrono::DateTime<chrono::Utc>,
    /// Entities by ID
    pub entities: BTreeMap<String, Entity>,
}

/// Operations every shared store backend provides
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Overwrite this node's heartbeat record
    async fn write_heartbeat(&self, record: &HeartbeatRecord) -> Result<()>;

    /// All heartbeat records, one per node
    async fn list_heartbeats(&self) -> Result<Vec<HeartbeatRecord>>;

    /// The current leadership record, if any node ever claimed
    async fn read_leadership(&self) -> Result<Option<LeadershipRecord>>;

    /// Write `new_epoch` for `node_id` only if the stored epoch equals `expected`
    async fn claim_leadership(
        &self,
        node_id: &str,
        expected: Option<Epoch>,
        new_epoch: Epoch,
    ) -> Result<ClaimOutcome>;

    /// The latest persisted snapshot
    async fn read_latest_snapshot(&self) -> Result<Option<EntitySnapshot>>;

    /// Persist a snapshot; fails with `StaleEpoch` if a newer term has been claimed
    async fn write_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()>;
}

/// Reject a snapshot written under an epoch older than the store's leadership epoch
pub(crate) fn check_fence(
    attempted: Option<Epoch>,
    leadership: Option<&LeadershipRecord>,
) -> Result<()> {
    if let (Some(attempted), Some(current)) = (attempted, leadership) {
        if attempted < current.epoch {
            return Err(crate::Error::StaleEpoch {
                attempted: attempted.0,
                current: current.epoch.0,
            });
        }
    }
    Ok(())
}

/// Claims must move the epoch forward
pub(crate) fn check_claim_args(expected: Option<Epoch>, new_epoch: Epoch) -> Result<()> {
    if let Some(expected) = expected {
        if new_epoch <= expected {
            return Err(crate::Error::Internal(format!(
                "claim epoch {} does not advance past {}",
                new_epoch, expected
            )));
        }
    }
    Ok(())
}
