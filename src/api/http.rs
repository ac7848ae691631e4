//! HTTP API Server
//!
//! Federation endpoints (receive, changes, identity) authenticate peers by
//! signature. Management endpoints (mirrors, policies, logs, sync triggers)
//! sit behind the optional admin token.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::error::ApiError;
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::model::{
    ConflictPolicy, EntityKind, LogSummary, MirrorInstance, MirrorUpdate, NewMirror, Strategy,
    SyncLogEntry,
};
use crate::replication::{
    ReceiveResponse, ReplicationService, RoundReport, RoundState, SignedPayload, SyncAllReport,
    SyncOrchestrator, INSTANCE_HEADER, SIGNATURE_HEADER,
};

type ApiResult<T> = std::result::Result<T, ApiError>;

const DEFAULT_LOG_LIMIT: u32 = 100;
const DEFAULT_CONFLICT_LIMIT: u32 = 50;
const MAX_LOG_LIMIT: u32 = 1000;

/// Shared application state
pub struct AppState {
    pub service: Arc<ReplicationService>,
    pub orchestrator: Arc<SyncOrchestrator>,
    /// Bearer token for management routes, if configured
    pub admin_token: Option<String>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        service: Arc<ReplicationService>,
        orchestrator: Arc<SyncOrchestrator>,
    ) -> Self {
        let state = Arc::new(AppState {
            service,
            orchestrator,
            admin_token: config.admin_token.clone(),
        });
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Self::create_router(self.state(), self.config.cors_enabled)
    }

    fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let management = Router::new()
            .route("/replication/mirrors", get(handle_list_mirrors).post(handle_create_mirror))
            .route(
                "/replication/mirrors/:id",
                get(handle_get_mirror)
                    .patch(handle_update_mirror)
                    .delete(handle_delete_mirror),
            )
            .route("/replication/mirrors/:id/sync", post(handle_sync_mirror))
            .route("/replication/mirrors/:id/logs", get(handle_mirror_logs))
            .route("/replication/mirrors/:id/summary", get(handle_mirror_summary))
            .route("/replication/sync-all", post(handle_sync_all))
            .route("/replication/logs/conflicts", get(handle_conflict_logs))
            .route(
                "/replication/conflict-resolution/:entity_type",
                get(handle_get_policy).put(handle_put_policy),
            )
            .route("/replication/status", get(handle_status))
            .route_layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                require_admin,
            ));

        let federation = Router::new()
            .route("/replication/receive", post(handle_receive))
            .route("/replication/changes", get(handle_changes))
            .route("/replication/identity", get(handle_identity))
            .route("/health", get(handle_health));

        let mut app = Router::new()
            .merge(management)
            .merge(federation)
            .layer(TraceLayer::new_for_http());
        if cors_enabled {
            app = app.layer(CorsLayer::permissive());
        }
        app.with_state(state)
    }

    /// Start the HTTP server
    /// Serve until the process shuts down. A disabled API never resolves,
    /// so callers selecting on it keep the scheduler alive.
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            futures::future::pending::<()>().await;
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    pub since: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

impl LimitQuery {
    fn or(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default).clamp(1, MAX_LOG_LIMIT)
    }
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub instance_id: String,
    pub mirrors: Vec<MirrorStatus>,
}

#[derive(Debug, Serialize)]
pub struct MirrorStatus {
    pub mirror_id: i64,
    pub instance_id: String,
    pub sync_enabled: bool,
    pub state: RoundState,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub instance_id: String,
}

// ============ Middleware ============

async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    if let Some(token) = state.admin_token.as_deref() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(token) {
            return Err(ApiError::Unauthorized("missing or invalid admin token".into()));
        }
    }
    Ok(next.run(request).await)
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> ApiResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", name)))
}

fn parse_entity_kind(raw: &str) -> ApiResult<EntityKind> {
    Ok(raw.parse::<EntityKind>()?)
}

// ============ Federation Handlers ============

async fn handle_receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ReceiveResponse>> {
    let payload = SignedPayload {
        signature: required_header(&headers, SIGNATURE_HEADER)?.to_string(),
        instance: required_header(&headers, INSTANCE_HEADER)?.to_string(),
        body: body.to_vec(),
    };
    let stats = state.service.receive(payload).await?;
    Ok(Json(ReceiveResponse {
        status: "success".to_string(),
        entities_synced: stats.synced(),
        conflicts: stats.conflicts,
        failed: stats.failed,
    }))
}

async fn handle_changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ChangesQuery>,
) -> ApiResult<Response> {
    let requester = headers.get(INSTANCE_HEADER).and_then(|v| v.to_str().ok());
    let payload = state.service.changes_since(query.since, requester).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::HeaderName::from_static("x-signature"), payload.signature),
        ],
        payload.body,
    )
        .into_response())
}

async fn handle_identity(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.identity())
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        instance_id: state.service.config().instance_id.clone(),
    })
}

// ============ Mirror Registry Handlers ============

async fn handle_list_mirrors(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<MirrorInstance>>> {
    Ok(Json(state.service.store().list_mirrors().await?))
}

async fn handle_create_mirror(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewMirror>,
) -> ApiResult<(StatusCode, Json<MirrorInstance>)> {
    let mirror = state.service.store().create_mirror(new).await?;
    tracing::info!("Registered mirror {} ({})", mirror.instance_id, mirror.instance_url);
    Ok((StatusCode::CREATED, Json(mirror)))
}

async fn handle_get_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<MirrorInstance>> {
    Ok(Json(state.service.store().get_mirror(id).await?))
}

async fn handle_update_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(update): Json<MirrorUpdate>,
) -> ApiResult<Json<MirrorInstance>> {
    Ok(Json(state.service.store().update_mirror(id, update).await?))
}

async fn handle_delete_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.service.store().delete_mirror(id).await?;
    state.orchestrator.forget(id).await;
    tracing::info!("Removed mirror {}", id);
    Ok(StatusCode::NO_CONTENT)
}

// ============ Sync Handlers ============

async fn handle_sync_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RoundReport>> {
    Ok(Json(state.orchestrator.sync_mirror(id).await?))
}

async fn handle_sync_all(State(state): State<Arc<AppState>>) -> ApiResult<Json<SyncAllReport>> {
    Ok(Json(state.orchestrator.sync_all().await?))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let mirrors = state.service.store().list_mirrors().await?;
    let states = state.orchestrator.states().await;
    Ok(Json(StatusResponse {
        instance_id: state.service.config().instance_id.clone(),
        mirrors: mirrors
            .into_iter()
            .map(|m| MirrorStatus {
                mirror_id: m.id,
                state: states.get(&m.id).copied().unwrap_or(RoundState::Idle),
                instance_id: m.instance_id,
                sync_enabled: m.sync_enabled,
                last_sync: m.last_sync,
            })
            .collect(),
    }))
}

// ============ Log Handlers ============

async fn handle_mirror_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<SyncLogEntry>>> {
    let store = state.service.store();
    store.get_mirror(id).await?;
    Ok(Json(store.logs_for_mirror(id, query.or(DEFAULT_LOG_LIMIT)).await?))
}

async fn handle_mirror_summary(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<LogSummary>> {
    let store = state.service.store();
    store.get_mirror(id).await?;
    Ok(Json(store.log_summary(id).await?))
}

async fn handle_conflict_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<SyncLogEntry>>> {
    Ok(Json(
        state
            .service
            .store()
            .conflict_logs(query.or(DEFAULT_CONFLICT_LIMIT))
            .await?,
    ))
}

// ============ Policy Handlers ============

async fn handle_get_policy(
    State(state): State<Arc<AppState>>,
    Path(entity_type): Path<String>,
) -> ApiResult<Json<ConflictPolicy>> {
    let kind = parse_entity_kind(&entity_type)?;
    let default = &state.service.config().default_strategy;
    Ok(Json(state.service.store().conflict_policy(kind, default).await?))
}

async fn handle_put_policy(
    State(state): State<Arc<AppState>>,
    Path(entity_type): Path<String>,
    Json(strategy): Json<Strategy>,
) -> ApiResult<Json<ConflictPolicy>> {
    let kind = parse_entity_kind(&entity_type)?;
    let policy = state.service.store().set_conflict_policy(kind, strategy).await?;
    tracing::info!("Conflict policy for {} set to {}", kind, policy.strategy.name());
    Ok(Json(policy))
}
