//! HTTP API Server
//!
//! REST API for application management and HA status. Every route sits
//! behind the HA admission filter; health and HA status routes bypass it.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::admission::{ha_admission, AdmissionPolicy, AdmissionState};
use crate::config::{AdmissionConfig, ApiConfig};
use crate::entity::{Entity, EntityRegistry};
use crate::error::{Error, Result};
use crate::ha::{HaManager, HaMode, HaSnapshot, NodeState};
use crate::persist::Persister;
use crate::store::{HeartbeatRecord, LeadershipRecord, SharedStore};

/// Entity kind served under `/applications`
const APPLICATION: &str = "application";

/// Shared application state
pub struct AppState {
    /// HA manager of this node
    pub ha: Arc<HaManager>,
    /// In-memory entity graph
    pub registry: Arc<EntityRegistry>,
    /// Snapshot writer, told about every mutation
    pub persister: Arc<Persister>,
    /// Shared store, for cluster status queries
    pub store: Arc<dyn SharedStore>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    admission: AdmissionConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, admission: AdmissionConfig, state: AppState) -> Self {
        Self {
            config,
            admission,
            state: Arc::new(state),
        }
    }

    /// Build the router with admission, tracing and (optionally) CORS layers
    pub fn router(&self) -> Router {
        let admission = AdmissionState::new(
            AdmissionPolicy::new(&self.admission),
            self.state.ha.subscribe(),
        );

        let router = Router::new()
            // Infrastructure
            .route("/health", get(handle_health))
            .route("/server/ha/state", get(handle_ha_state))
            .route("/server/ha/nodes", get(handle_ha_nodes))
            // Applications
            .route(
                "/applications",
                get(handle_list_applications).post(handle_create_application),
            )
            .route(
                "/applications/:id",
                get(handle_get_application)
                    .put(handle_update_application)
                    .delete(handle_delete_application),
            )
            .with_state(Arc::clone(&self.state))
            .layer(axum::middleware::from_fn_with_state(admission, ha_admission))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
        } else {
            router
        }
    }

    /// Serve until `shutdown` flips to true
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Create application request
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateApplicationRequest {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Update application request
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UpdateApplicationRequest {
    pub name: Option<String>,
    pub config: Option<serde_json::Value>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub state: NodeState,
}

/// HA state response
#[derive(Debug, Serialize)]
pub struct HaStateResponse {
    pub mode: HaMode,
    #[serde(flatten)]
    pub snapshot: HaSnapshot,
}

/// Cluster view from the shared store
#[derive(Debug, Serialize, Deserialize)]
pub struct HaNodesResponse {
    pub leadership: Option<LeadershipRecord>,
    pub nodes: Vec<HeartbeatRecord>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(err: Error) -> Response {
    let (status, code) = match &err {
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        Error::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.ha.snapshot();
    Json(HealthResponse {
        healthy: snapshot.state != NodeState::Terminated,
        node_id: snapshot.node_id,
        state: snapshot.state,
    })
}

async fn handle_ha_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HaStateResponse {
        mode: state.ha.mode(),
        snapshot: state.ha.snapshot(),
    })
}

async fn handle_ha_nodes(State(state): State<Arc<AppState>>) -> Response {
    let nodes = match state.store.list_heartbeats().await {
        Ok(mut nodes) => {
            nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            nodes
        }
        Err(e) => return error_response(e),
    };
    match state.store.read_leadership().await {
        Ok(leadership) => Json(HaNodesResponse { leadership, nodes }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_list_applications(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list(APPLICATION).await)
}

async fn handle_create_application(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateApplicationRequest>,
) -> Response {
    let created = state
        .registry
        .create(Entity::new(APPLICATION, req.name, req.config))
        .await;
    state.persister.mark_dirty();
    tracing::info!("Created application {} ({})", created.name, created.id);
    (StatusCode::CREATED, Json(created)).into_response()
}

async fn handle_get_application(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.registry.get(&id).await {
        Some(entity) if entity.kind == APPLICATION => Json(entity).into_response(),
        _ => error_response(Error::NotFound(format!("application {}", id))),
    }
}

async fn handle_update_application(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateApplicationRequest>,
) -> Response {
    if !is_application(&state, &id).await {
        return error_response(Error::NotFound(format!("application {}", id)));
    }
    match state.registry.update(&id, req.name, req.config).await {
        Ok(updated) => {
            state.persister.mark_dirty();
            Json(updated).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_delete_application(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    if !is_application(&state, &id).await {
        return error_response(Error::NotFound(format!("application {}", id)));
    }
    match state.registry.delete(&id).await {
        Ok(removed) => {
            state.persister.mark_dirty();
            tracing::info!("Deleted application {} ({})", removed.name, removed.id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn is_application(state: &AppState, id: &str) -> bool {
    state
        .registry
        .get(id)
        .await
        .is_some_and(|e| e.kind == APPLICATION)
}
