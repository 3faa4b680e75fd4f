//! REST API.
//!
//! - `GET /health`: health check
//! - `GET /api/v4/discovery`: committed discovery tree
//! - `POST /api/v4/discovery`: register (or refresh) a plugin
//! - `POST /api/v4/discovery/:id`: publish a plugin subtree
//! - `DELETE /api/v4/discovery/:id`: deregister a plugin
//! - `GET /api/v4/discovery_plugins[/:id]`: plugin records
//! - `GET|POST /api/v4/targets`, `DELETE /api/v4/targets/:id`: targets and
//!   custom targets
//!
//! Plugin tokens are read from `Authorization: Bearer <token>` or a `token`
//! query parameter.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::discovery::custom::{CustomTargetRequest, CustomTargets};
use crate::error::DiscoveryError;
use crate::model::{NodeId, Target, TargetDto};
use crate::plugins::{Caller, PluginDto, PluginRegistry, PublishedNode, RegisterRequest, Registration};
use crate::topology::{ReconcileOutcome, Topology, TreeNode};

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub topology: Topology,
    pub plugins: PluginRegistry,
    pub custom: CustomTargets,
}

/// `DiscoveryError` as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub DiscoveryError);

impl From<DiscoveryError> for ApiError {
    fn from(err: DiscoveryError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &DiscoveryError) -> StatusCode {
    match err {
        DiscoveryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        DiscoveryError::Admission(_) => StatusCode::BAD_REQUEST,
        DiscoveryError::Forbidden(_) => StatusCode::FORBIDDEN,
        DiscoveryError::NotFound(_) => StatusCode::NOT_FOUND,
        DiscoveryError::Conflict(_) => StatusCode::CONFLICT,
        DiscoveryError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        DiscoveryError::Storage(_) | DiscoveryError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Start the REST server and run until `cancel` fires.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "discovery REST API listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v4/discovery", get(discovery_tree).post(register))
        .route("/api/v4/discovery/:id", post(publish).delete(deregister))
        .route("/api/v4/discovery_plugins", get(list_plugins))
        .route("/api/v4/discovery_plugins/:id", get(get_plugin))
        .route("/api/v4/targets", get(list_targets).post(create_target))
        .route("/api/v4/targets/:id", delete(delete_target))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetView {
    pub id: NodeId,
    #[serde(flatten)]
    pub target: TargetDto,
}

impl TargetView {
    fn new(id: NodeId, target: &Target) -> Self {
        Self {
            id,
            target: TargetDto::from(target),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PublishSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

impl From<&ReconcileOutcome> for PublishSummary {
    fn from(outcome: &ReconcileOutcome) -> Self {
        Self {
            added: outcome.added.len(),
            removed: outcome.removed.len(),
            modified: outcome.modified.len(),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn bearer_token(headers: &HeaderMap, query: &TokenQuery) -> Result<String, ApiError> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    from_header
        .or_else(|| query.token.clone())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError(DiscoveryError::Unauthorized("missing plugin token".to_string())))
}

/// First `X-Forwarded-For` hop, else the peer address.
fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn discovery_tree(State(state): State<AppState>) -> ApiResult<Json<TreeNode>> {
    let tree = state
        .topology
        .tree()
        .await?
        .ok_or_else(|| DiscoveryError::NotFound("discovery tree is empty".to_string()))?;
    Ok(Json(tree))
}

async fn register(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Registration>)> {
    let address = client_address(&headers, peer.map(|ConnectInfo(addr)| addr));
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let registration = state
        .plugins
        .register(
            request,
            Caller {
                address: &address,
                authorization,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

async fn publish(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(nodes): Json<Vec<PublishedNode>>,
) -> ApiResult<Json<PublishSummary>> {
    let token = bearer_token(&headers, &query)?;
    let outcome = state.plugins.publish(id, &token, nodes).await?;
    Ok(Json(PublishSummary::from(&outcome)))
}

async fn deregister(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let token = bearer_token(&headers, &query)?;
    state.plugins.deregister(id, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_plugins(State(state): State<AppState>) -> ApiResult<Json<Vec<PluginDto>>> {
    let plugins = state.plugins.list().await?;
    Ok(Json(plugins.iter().map(PluginDto::from).collect()))
}

async fn get_plugin(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<PluginDto>> {
    let plugin = state.plugins.get(id).await?;
    Ok(Json(PluginDto::from(&plugin)))
}

async fn list_targets(State(state): State<AppState>) -> ApiResult<Json<Vec<TargetView>>> {
    let targets = state.topology.targets().await?;
    Ok(Json(
        targets
            .iter()
            .map(|(id, target)| TargetView::new(*id, target))
            .collect(),
    ))
}

async fn create_target(
    State(state): State<AppState>,
    Json(request): Json<CustomTargetRequest>,
) -> ApiResult<(StatusCode, Json<TargetView>)> {
    let (id, target) = state.custom.create(request).await?;
    Ok((StatusCode::CREATED, Json(TargetView::new(id, &target))))
}

async fn delete_target(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.custom.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
