//! HA Admission Filter
//!
//! Runs in front of every API route. Each request reads the last
//! published HA snapshot once and is allowed or denied with 403 based on
//! the node's role and whether the request mutates state. Only a node that
//! is still initializing makes a request wait, and only briefly.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::AdmissionConfig;
use crate::ha::{HaSnapshot, NodeState};

/// Whether a request changes entity state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    ReadOnly,
    Mutating,
}

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Mutations are only accepted by the master
    NotMaster,
    /// Node holds no replicated entity state yet
    NoReplicatedState,
    /// Node did not finish starting within the wait window
    Initializing,
    /// Node has been stopped
    Terminated,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::NotMaster => "NOT_MASTER",
            DenyReason::NoReplicatedState => "NO_REPLICATED_STATE",
            DenyReason::Initializing => "INITIALIZING",
            DenyReason::Terminated => "TERMINATED",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::NotMaster => "this node is not the master; send changes to the master",
            DenyReason::NoReplicatedState => "this node holds no replicated state to read from",
            DenyReason::Initializing => "this node is still starting",
            DenyReason::Terminated => "this node is shutting down",
        }
    }
}

/// Outcome of the admission decision table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(DenyReason),
}

/// Decide admission for one request against one snapshot. The middleware
/// gives an INITIALIZING node `startup_wait` to settle before asking.
pub fn decide(snapshot: &HaSnapshot, class: RequestClass) -> Admission {
    match (snapshot.state, class) {
        (NodeState::Master | NodeState::Disabled, _) => Admission::Allow,
        (NodeState::HotStandby | NodeState::HotBackup, RequestClass::ReadOnly) => {
            if snapshot.has_rebound() {
                Admission::Allow
            } else {
                Admission::Deny(DenyReason::NoReplicatedState)
            }
        }
        (NodeState::HotStandby | NodeState::HotBackup, RequestClass::Mutating) => {
            Admission::Deny(DenyReason::NotMaster)
        }
        (NodeState::Standby, RequestClass::ReadOnly) => {
            Admission::Deny(DenyReason::NoReplicatedState)
        }
        (NodeState::Standby, RequestClass::Mutating) => Admission::Deny(DenyReason::NotMaster),
        (NodeState::Initializing, _) => Admission::Deny(DenyReason::Initializing),
        (NodeState::Terminated, _) => Admission::Deny(DenyReason::Terminated),
    }
}

/// Path rules applied before the decision table
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    always_allowed: Vec<String>,
    read_only_paths: Vec<String>,
    startup_wait: Duration,
}

impl AdmissionPolicy {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            always_allowed: config.always_allowed.clone(),
            read_only_paths: config.read_only_paths.clone(),
            startup_wait: config.startup_wait(),
        }
    }

    /// Health and HA status endpoints skip admission entirely
    pub fn is_always_allowed(&self, path: &str) -> bool {
        self.always_allowed.iter().any(|p| path_under(path, p))
    }

    pub fn classify(&self, method: &Method, path: &str) -> RequestClass {
        if *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS {
            return RequestClass::ReadOnly;
        }
        if self.read_only_paths.iter().any(|p| path_under(path, p)) {
            return RequestClass::ReadOnly;
        }
        RequestClass::Mutating
    }
}

/// `/server/ha` covers `/server/ha` and `/server/ha/state`, not `/server/hats`
fn path_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// State handed to the middleware
#[derive(Clone)]
pub struct AdmissionState {
    policy: Arc<AdmissionPolicy>,
    ha: watch::Receiver<HaSnapshot>,
}

impl AdmissionState {
    pub fn new(policy: AdmissionPolicy, ha: watch::Receiver<HaSnapshot>) -> Self {
        Self {
            policy: Arc::new(policy),
            ha,
        }
    }
}

/// 403 body
#[derive(Debug, Serialize)]
pub struct DeniedResponse {
    pub error: String,
    pub code: String,
    pub node_state: NodeState,
}

/// Wait for the node to leave INITIALIZING, at most `wait`
async fn settle(mut rx: watch::Receiver<HaSnapshot>, wait: Duration) -> HaSnapshot {
    let _ = tokio::time::timeout(wait, rx.wait_for(|s| s.state != NodeState::Initializing)).await;
    let snapshot = rx.borrow().clone();
    snapshot
}

/// Axum middleware gating every request on the node's HA role
pub async fn ha_admission(
    State(state): State<AdmissionState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if state.policy.is_always_allowed(&path) {
        return next.run(req).await;
    }

    let class = state.policy.classify(req.method(), &path);
    let mut snapshot = state.ha.borrow().clone();
    if snapshot.state == NodeState::Initializing {
        snapshot = settle(state.ha.clone(), state.policy.startup_wait).await;
    }

    match decide(&snapshot, class) {
        Admission::Allow => next.run(req).await,
        Admission::Deny(reason) => {
            tracing::debug!(
                "Denied {} {} on {} node: {}",
                req.method(),
                path,
                snapshot.state,
                reason.code()
            );
            (
                StatusCode::FORBIDDEN,
                Json(DeniedResponse {
                    error: reason.message().to_string(),
                    code: reason.code().to_string(),
                    node_state: snapshot.state,
                }),
            )
                .into_response()
        }
    }
}
