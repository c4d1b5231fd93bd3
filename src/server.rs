//! HTTP surface: a small JSON API over the search, session, bootstrap,
//! and hook services.

use crate::bootstrap::{BootstrapBuilder, BootstrapOptions};
use crate::error::SearchError;
use crate::hooks::{HookService, EXIT_OK};
use crate::pipeline::EmbeddingPipeline;
use crate::search::{SearchMode, SearchOptions, SearchService};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub struct AppState {
    pub search: Arc<SearchService>,
    pub bootstrap: Arc<BootstrapBuilder>,
    pub hooks: Arc<HookService>,
    pub pipeline: Arc<EmbeddingPipeline>,
    pub default_project: String,
}

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn internal(message: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        match &err {
            SearchError::GuardRejected(_) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "guard_rejected",
                message: err.to_string(),
            },
            SearchError::UpstreamUnavailable(_) => Self {
                status: StatusCode::BAD_GATEWAY,
                code: "upstream_unavailable",
                message: err.to_string(),
            },
            SearchError::Index(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "index",
                message: err.to_string(),
            },
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/search", post(search))
        .route("/session", get(session_get).post(session_set))
        .route("/gate-check", post(gate_check))
        .route("/bootstrap", post(bootstrap))
        .route("/validate-session", post(validate_session))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "brain server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "model": state.pipeline.model_name(),
        "dims": state.pipeline.dims(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    query: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    depth: Option<usize>,
    #[serde(default)]
    full_content: Option<bool>,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    after_date: Option<DateTime<Utc>>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Value>, ApiError> {
    let project = req.project.unwrap_or_else(|| state.default_project.clone());
    let mut opts = SearchOptions::new(&project);
    if let Some(mode) = req.mode.as_deref() {
        opts.mode = SearchMode::parse(mode).ok_or(ApiError {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: format!("unknown search mode '{mode}'"),
        })?;
    }
    if let Some(limit) = req.limit {
        opts.limit = limit;
    }
    if let Some(threshold) = req.threshold {
        opts.threshold = threshold;
    }
    if let Some(depth) = req.depth {
        opts.depth = depth;
    }
    if let Some(full_content) = req.full_content {
        opts.full_content = full_content;
    }
    opts.types = req.types;
    opts.after_date = req.after_date;

    let results = state.search.search(&req.query, &opts).await?;
    Ok(Json(json!({ "results": results })))
}

#[derive(Deserialize)]
struct ProjectParam {
    #[serde(default)]
    project: Option<String>,
}

async fn session_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProjectParam>,
) -> Result<Json<Value>, ApiError> {
    let project = params.project.unwrap_or_else(|| state.default_project.clone());
    let output = state.hooks.session_state_get(&project).await;
    if output.exit_code == EXIT_OK {
        Ok(Json(output.body))
    } else {
        Err(ApiError::internal(output.body))
    }
}

#[derive(Deserialize)]
struct SessionSetRequest {
    #[serde(default)]
    project: Option<String>,
    updates: Value,
}

async fn session_set(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionSetRequest>,
) -> Result<Json<Value>, ApiError> {
    let project = req.project.unwrap_or_else(|| state.default_project.clone());
    let output = state.hooks.session_state_set(&project, req.updates).await;
    if output.exit_code == EXIT_OK {
        Ok(Json(output.body))
    } else {
        Err(ApiError::internal(output.body))
    }
}

#[derive(Deserialize)]
struct GateCheckRequest {
    #[serde(default)]
    project: Option<String>,
    tool: String,
}

async fn gate_check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GateCheckRequest>,
) -> Result<Json<Value>, ApiError> {
    let project = req.project.unwrap_or_else(|| state.default_project.clone());
    let decision = state.hooks.gate_check(&project, &req.tool).await;
    serde_json::to_value(&decision)
        .map(Json)
        .map_err(ApiError::internal)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapRequest {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    timeframe: Option<String>,
    #[serde(default)]
    depth: Option<usize>,
    #[serde(default)]
    full_content: Option<bool>,
}

async fn bootstrap(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BootstrapRequest>,
) -> Result<Json<Value>, ApiError> {
    let project = req.project.unwrap_or_else(|| state.default_project.clone());
    let mut opts = BootstrapOptions::new(&project);
    if let Some(timeframe) = req.timeframe {
        opts.timeframe = timeframe;
    }
    if let Some(depth) = req.depth {
        opts.depth = depth;
    }
    if let Some(full_content) = req.full_content {
        opts.full_content = full_content;
    }
    let payload = state
        .bootstrap
        .build(&opts)
        .await
        .map_err(ApiError::internal)?;
    serde_json::to_value(&payload)
        .map(Json)
        .map_err(ApiError::internal)
}

#[derive(Deserialize)]
struct ValidateSessionRequest {
    path: PathBuf,
}

async fn validate_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    let (_, output) = state.hooks.validate_session(&req.path);
    Ok(Json(output.body))
}
