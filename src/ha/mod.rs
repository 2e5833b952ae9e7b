//! High Availability
//!
//! Node roles, heartbeat election and the manager that runs it.

mod election;
mod manager;
mod pending;
mod state;

pub use election::{ClusterView, Decision, Election};
pub use manager::HaManager;
pub use pending::{PendingGuard, PendingTracker};
pub use state::{Epoch, HaMode, HaSnapshot, NodeState};
