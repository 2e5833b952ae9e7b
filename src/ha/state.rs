//! HA Node State
//!
//! The node's role in the HA cluster, the configured mode it may run in,
//! and the immutable snapshot the election loop publishes to readers.

use serde::{Deserialize, Serialize};

/// Role of this management node in the HA cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// Created, first election cycle not finished yet
    Initializing,
    /// HA inactive, node is the sole authority
    Disabled,
    /// Authoritative writer
    Master,
    /// Passive, holds no usable entity state
    Standby,
    /// Passive, replaying persisted state, eligible for promotion
    HotStandby,
    /// Passive, replaying persisted state, never promotes
    HotBackup,
    /// Stopped; no longer participating
    Terminated,
}

impl NodeState {
    /// Whether this node may accept mutating operations
    pub fn is_writer(&self) -> bool {
        matches!(self, NodeState::Master | NodeState::Disabled)
    }

    /// Whether this state continuously replays persisted state
    pub fn is_hot(&self) -> bool {
        matches!(self, NodeState::HotStandby | NodeState::HotBackup)
    }

    /// Lifecycle states that are not roles
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeState::Initializing | NodeState::Terminated)
    }

    /// Parse the name produced by `Display`
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "INITIALIZING" => Some(NodeState::Initializing),
            "DISABLED" => Some(NodeState::Disabled),
            "MASTER" => Some(NodeState::Master),
            "STANDBY" => Some(NodeState::Standby),
            "HOT_STANDBY" => Some(NodeState::HotStandby),
            "HOT_BACKUP" => Some(NodeState::HotBackup),
            "TERMINATED" => Some(NodeState::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Initializing => write!(f, "INITIALIZING"),
            NodeState::Disabled => write!(f, "DISABLED"),
            NodeState::Master => write!(f, "MASTER"),
            NodeState::Standby => write!(f, "STANDBY"),
            NodeState::HotStandby => write!(f, "HOT_STANDBY"),
            NodeState::HotBackup => write!(f, "HOT_BACKUP"),
            NodeState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Configured HA mode of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HaMode {
    /// No HA; single node
    #[default]
    Disabled,
    /// Participant; waits as STANDBY, may become MASTER
    Auto,
    /// Participant; waits as HOT_STANDBY, may become MASTER
    HotStandby,
    /// Backup only; stays HOT_BACKUP forever
    HotBackup,
}

impl HaMode {
    /// Role the node holds while another node is master
    pub fn passive_state(&self) -> NodeState {
        match self {
            HaMode::Disabled => NodeState::Disabled,
            HaMode::Auto => NodeState::Standby,
            HaMode::HotStandby => NodeState::HotStandby,
            HaMode::HotBackup => NodeState::HotBackup,
        }
    }

    /// Whether the node may claim leadership
    pub fn can_promote(&self) -> bool {
        matches!(self, HaMode::Auto | HaMode::HotStandby)
    }

    /// Whether the node runs the election protocol at all
    pub fn participates(&self) -> bool {
        !matches!(self, HaMode::Disabled)
    }
}

impl std::fmt::Display for HaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaMode::Disabled => write!(f, "disabled"),
            HaMode::Auto => write!(f, "auto"),
            HaMode::HotStandby => write!(f, "hot_standby"),
            HaMode::HotBackup => write!(f, "hot_backup"),
        }
    }
}

/// Leadership term. Strictly increasing per successful claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Epoch of the first ever claim
    pub const FIRST: Epoch = Epoch(1);

    /// The epoch a claim following `current` would take
    pub fn next_after(current: Option<Epoch>) -> Epoch {
        match current {
            Some(Epoch(e)) => Epoch(e + 1),
            None => Epoch::FIRST,
        }
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable view of this node's HA state, replaced as a whole on change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaSnapshot {
    /// This node's ID
    pub node_id: String,
    /// Current role
    pub state: NodeState,
    /// Epoch held, when master
    pub epoch: Option<Epoch>,
    /// Last known master (may be self)
    pub master_id: Option<String>,
    /// Completed rebind passes since the node last held no state
    pub rebind_passes: u64,
    /// When this snapshot was published
    pub changed_at: chrono::DateTime<chrono::Utc>,
}

impl HaSnapshot {
    /// Initial snapshot for a freshly created manager
    pub fn initializing(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: NodeState::Initializing,
            epoch: None,
            master_id: None,
            rebind_passes: 0,
            changed_at: chrono::Utc::now(),
        }
    }

    /// Whether in-memory entity state has been loaded at least once
    pub fn has_rebound(&self) -> bool {
        self.rebind_passes > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passive_states() {
        assert_eq!(HaMode::Auto.passive_state(), NodeState::Standby);
        assert_eq!(HaMode::HotStandby.passive_state(), NodeState::HotStandby);
        assert_eq!(HaMode::HotBackup.passive_state(), NodeState::HotBackup);
        assert!(!HaMode::HotBackup.can_promote());
        assert!(!HaMode::Disabled.participates());
    }

    #[test]
    fn test_epoch_progression() {
        assert_eq!(Epoch::next_after(None), Epoch(1));
        assert_eq!(Epoch::next_after(Some(Epoch(7))), Epoch(8));
        assert!(Epoch(3) > Epoch(2));
    }

    #[test]
    fn test_node_state_wire_names() {
        let json = serde_json::to_string(&NodeState::HotStandby).unwrap();
        assert_eq!(json, "\"HOT_STANDBY\"");
        assert_eq!(NodeState::HotBackup.to_string(), "HOT_BACKUP");
        assert_eq!(NodeState::from_wire("HOT_BACKUP"), Some(NodeState::HotBackup));
        assert_eq!(NodeState::from_wire("LEADER"), None);
        let mode: HaMode = serde_json::from_str("\"hot_backup\"").unwrap();
        assert_eq!(mode, HaMode::HotBackup);
    }
}
