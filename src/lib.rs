//! haplane - High Availability for a Management Plane
//!
//! Coordinates several management nodes that share one durable store so
//! that exactly one of them accepts changes at a time, while the others
//! stand by and can take over within a bounded failover window.
//!
//! # Architecture
//!
//! Every node heartbeats into the shared store. When the master's heartbeat
//! stops advancing, an eligible node claims the next leadership epoch with a
//! compare-and-swap, reloads the entity graph from the latest snapshot and
//! only then starts accepting writes. An admission filter in front of the
//! HTTP API allows or refuses each request based on the node's current role.
//!
//! # Features
//!
//! - Heartbeat election with epoch fencing of stale masters
//! - Hot standby and hot backup roles that replicate persisted state
//! - Role-aware request admission (403 on non-master writes)
//! - In-memory and SQLite shared stores
//! - HTTP API for applications and HA status

pub mod api;
pub mod config;
pub mod entity;
pub mod error;
pub mod ha;
pub mod node;
pub mod persist;
pub mod rebind;
pub mod retry;
pub mod store;

pub use config::HaPlaneConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::HaPlaneConfig;
    pub use crate::error::{Error, Result};
    pub use crate::ha::{Epoch, HaManager, HaMode, HaSnapshot, NodeState};
    pub use crate::node::{open_store, ManagementNode};
    pub use crate::rebind::{RebindEngine, StoreRebinder};
    pub use crate::store::{MemoryStore, SharedStore, SqliteStore};
}
