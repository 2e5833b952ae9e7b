//! Heartbeat Election
//!
//! Lease-style master election over the shared store. Each node watches
//! the other nodes' heartbeat timestamps with its own clock, so skew
//! between node clocks never affects failure detection. A master is
//! absent once its heartbeat has stood still for the liveness timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::ha::{Epoch, HaMode, HaSnapshot, NodeState};
use crate::store::{HeartbeatRecord, LeadershipRecord};

/// What this node last saw of a peer
#[derive(Debug, Clone)]
struct PeerObservation {
    /// Last heartbeat timestamp read from the store
    timestamp_ms: u64,
    /// Local time at which that timestamp was first seen
    advanced_at: Instant,
}

impl PeerObservation {
    fn is_fresh(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.advanced_at) <= timeout
    }
}

/// Result of reading the cluster during one election cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// Current leadership record
    pub leadership: Option<LeadershipRecord>,
    /// Whether the leadership holder (other than self) is alive
    pub master_live: bool,
    /// Another node declaring MASTER with an epoch newer than ours
    pub newer_master: Option<(String, Epoch)>,
}

impl ClusterView {
    /// The live master's ID, if it is not self
    pub fn live_master(&self) -> Option<&str> {
        if self.master_live {
            self.leadership.as_ref().map(|l| l.master_id.as_str())
        } else {
            None
        }
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.leadership.as_ref().map(|l| l.epoch)
    }
}

/// What the election loop should do this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Self is master and nothing supersedes it
    Lead,
    /// Self is master but a newer term exists
    Demote {
        reason: String,
        master_id: Option<String>,
    },
    /// Another node is the live master
    Follow { master_id: String },
    /// No live master; try to claim the next epoch
    Claim { expected: Option<Epoch> },
    /// No live master but this node never promotes
    Wait,
}

/// Per-node election bookkeeping, owned by the election loop
pub struct Election {
    node_id: String,
    mode: HaMode,
    liveness_timeout: Duration,
    peers: HashMap<String, PeerObservation>,
    /// Leadership epoch and when this node first saw it
    epoch_seen: Option<(Epoch, Instant)>,
    /// Last timestamp written into our own heartbeat
    last_timestamp_ms: u64,
    /// When our heartbeat last reached the store
    last_heartbeat_ok: Instant,
}

impl Election {
    pub fn new(node_id: String, mode: HaMode, liveness_timeout: Duration) -> Self {
        Self {
            node_id,
            mode,
            liveness_timeout,
            peers: HashMap::new(),
            epoch_seen: None,
            last_timestamp_ms: 0,
            last_heartbeat_ok: Instant::now(),
        }
    }

    /// Next heartbeat timestamp; strictly greater than the previous one
    fn next_timestamp(&mut self) -> u64 {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let ts = now_ms.max(self.last_timestamp_ms + 1);
        self.last_timestamp_ms = ts;
        ts
    }

    /// Build this node's heartbeat for the given state
    pub fn heartbeat(&mut self, state: NodeState, epoch: Option<Epoch>) -> HeartbeatRecord {
        let declared = if state.is_transient() {
            self.mode.passive_state()
        } else {
            state
        };
        HeartbeatRecord {
            node_id: self.node_id.clone(),
            state: declared,
            timestamp_ms: self.next_timestamp(),
            epoch: if declared == NodeState::Master { epoch } else { None },
        }
    }

    /// Build the heartbeat for the current published snapshot
    pub fn heartbeat_for(&mut self, snapshot: &HaSnapshot) -> HeartbeatRecord {
        self.heartbeat(snapshot.state, snapshot.epoch)
    }

    /// Record that a heartbeat reached the store
    pub fn heartbeat_written(&mut self) {
        self.last_heartbeat_ok = Instant::now();
    }

    /// Whether our own heartbeats have failed for longer than the liveness timeout
    pub fn heartbeat_overdue(&self) -> bool {
        self.last_heartbeat_ok.elapsed() > self.liveness_timeout
    }

    /// Note an epoch this node claimed itself
    pub fn claimed(&mut self, epoch: Epoch) {
        self.epoch_seen = Some((epoch, Instant::now()));
    }

    /// Fold freshly read records into the observations and evaluate liveness
    pub fn observe(
        &mut self,
        heartbeats: &[HeartbeatRecord],
        leadership: Option<LeadershipRecord>,
        snapshot: &HaSnapshot,
        now: Instant,
    ) -> ClusterView {
        for record in heartbeats.iter().filter(|r| r.node_id != self.node_id) {
            match self.peers.get_mut(&record.node_id) {
                Some(peer) => {
                    if record.timestamp_ms > peer.timestamp_ms {
                        peer.timestamp_ms = record.timestamp_ms;
                        peer.advanced_at = now;
                    }
                }
                None => {
                    tracing::debug!("Observed node {} ({})", record.node_id, record.state);
                    self.peers.insert(
                        record.node_id.clone(),
                        PeerObservation {
                            timestamp_ms: record.timestamp_ms,
                            advanced_at: now,
                        },
                    );
                }
            }
        }

        if let Some(ref l) = leadership {
            if self.epoch_seen.map(|(e, _)| e) != Some(l.epoch) {
                self.epoch_seen = Some((l.epoch, now));
            }
        }

        let master_live = leadership
            .as_ref()
            .map(|l| self.holder_is_live(l, heartbeats, now))
            .unwrap_or(false);

        let our_epoch = if snapshot.state == NodeState::Master {
            snapshot.epoch
        } else {
            None
        };
        let newer_master = our_epoch.and_then(|ours| {
            heartbeats
                .iter()
                .filter(|r| r.node_id != self.node_id && r.state == NodeState::Master)
                .filter_map(|r| r.epoch.map(|e| (r.node_id.clone(), e)))
                .find(|(_, e)| *e > ours)
        });

        ClusterView {
            leadership,
            master_live,
            newer_master,
        }
    }

    /// Whether the leadership holder, other than self, is alive
    fn holder_is_live(
        &self,
        leadership: &LeadershipRecord,
        heartbeats: &[HeartbeatRecord],
        now: Instant,
    ) -> bool {
        if leadership.master_id == self.node_id {
            return false;
        }

        // A fresh claim counts as live while its holder rebinds
        let in_grace = matches!(
            self.epoch_seen,
            Some((e, seen)) if e == leadership.epoch
                && now.saturating_duration_since(seen) <= self.liveness_timeout
        );

        let declares_master = heartbeats.iter().any(|r| {
            r.node_id == leadership.master_id
                && r.state == NodeState::Master
                && r.epoch == Some(leadership.epoch)
        });
        let fresh = self
            .peers
            .get(&leadership.master_id)
            .is_some_and(|p| p.is_fresh(now, self.liveness_timeout));

        fresh && (declares_master || in_grace)
    }

    /// Decide the next step for a node currently in `snapshot`
    pub fn decide(&self, snapshot: &HaSnapshot, view: &ClusterView) -> Decision {
        if snapshot.state == NodeState::Master {
            let ours = snapshot.epoch;
            return match &view.leadership {
                Some(l) if l.master_id != self.node_id || Some(l.epoch) != ours => Decision::Demote {
                    reason: format!("leadership moved to {} at epoch {}", l.master_id, l.epoch),
                    master_id: Some(l.master_id.clone()),
                },
                None => Decision::Demote {
                    reason: "leadership record missing".to_string(),
                    master_id: None,
                },
                Some(_) => match &view.newer_master {
                    Some((id, epoch)) => Decision::Demote {
                        reason: format!("{} is master at newer epoch {}", id, epoch),
                        master_id: Some(id.clone()),
                    },
                    None => Decision::Lead,
                },
            };
        }

        if let Some(master_id) = view.live_master() {
            return Decision::Follow {
                master_id: master_id.to_string(),
            };
        }

        if self.mode.can_promote() {
            Decision::Claim {
                expected: view.current_epoch(),
            }
        } else {
            Decision::Wait
        }
    }
}
