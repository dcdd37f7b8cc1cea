//! JSON API over the paper catalog plus the sync trigger.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use papersync_core::{PaperQuery, DEFAULT_PAGE_SIZE, HOT_PHRASE_LIMIT, MAX_PAGE_SIZE};
use papersync_storage::{Catalog, StoreError};
use papersync_sync::{build_driver, maybe_build_scheduler, SyncConfig, SyncService, TriggerOutcome};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "papersync-web";

/// Decides whether a request may start a sync.
pub trait TriggerAuthorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> bool;
}

/// Accepts `Authorization: Bearer <token>` matching the configured admin token.
/// With no token configured every trigger is refused.
#[derive(Debug, Clone, Default)]
pub struct BearerTokenAuthorizer {
    token: Option<String>,
}

impl BearerTokenAuthorizer {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("PAPERSYNC_ADMIN_TOKEN").ok())
    }
}

impl TriggerAuthorizer for BearerTokenAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return false;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|presented| presented.trim() == expected)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sync: SyncService,
    pub authorizer: Arc<dyn TriggerAuthorizer>,
}

impl AppState {
    pub fn new(sync: SyncService, authorizer: Arc<dyn TriggerAuthorizer>) -> Self {
        Self { sync, authorizer }
    }

    fn catalog(&self) -> &Catalog {
        self.sync.catalog()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/arxiv/latest", get(latest_handler))
        .route("/api/arxiv/papers", get(papers_handler))
        .route("/api/arxiv/papers/{arxiv_id}", get(paper_detail_handler))
        .route("/api/arxiv/runs", get(runs_handler))
        .route("/api/arxiv/hot-phrases", get(hot_phrases_handler))
        .route("/api/arxiv/trigger", post(trigger_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PAPERSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let service = SyncService::new(build_driver(&config).await?);

    let scheduler = maybe_build_scheduler(&config, service.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
    }

    let state = AppState::new(service, Arc::new(BearerTokenAuthorizer::from_env()));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(what) => detail(StatusCode::NOT_FOUND, format!("{what} not found")),
        StoreError::InvalidPage(msg) => detail(StatusCode::UNPROCESSABLE_ENTITY, msg),
        StoreError::AlreadyRunning => detail(StatusCode::CONFLICT, "arxiv sync already running"),
        StoreError::RunInProgress(run_id) => {
            detail(StatusCode::CONFLICT, format!("run {run_id} is still running"))
        }
        other => {
            error!(error = %other, "catalog request failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn latest_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.catalog().latest_run_with_papers().await {
        Ok(latest) => Json(latest).into_response(),
        Err(StoreError::NotFound(_)) => detail(StatusCode::NOT_FOUND, "no arxiv crawl run found"),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct PapersParams {
    skip: Option<i64>,
    limit: Option<i64>,
    keyword: Option<String>,
}

impl PapersParams {
    fn into_query(self) -> Result<PaperQuery, String> {
        let skip = self.skip.unwrap_or(0);
        let limit = self.limit.unwrap_or(i64::from(DEFAULT_PAGE_SIZE));
        if skip < 0 {
            return Err(format!("skip must be >= 0, got {skip}"));
        }
        if !(1..=i64::from(MAX_PAGE_SIZE)).contains(&limit) {
            return Err(format!("limit must be between 1 and {MAX_PAGE_SIZE}, got {limit}"));
        }
        let skip = u32::try_from(skip).map_err(|_| format!("skip out of range: {skip}"))?;
        let limit = u32::try_from(limit).map_err(|_| format!("limit out of range: {limit}"))?;
        Ok(PaperQuery::new(skip, limit, self.keyword))
    }
}

async fn papers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PapersParams>,
) -> Response {
    let query = match params.into_query() {
        Ok(query) => query,
        Err(msg) => return detail(StatusCode::UNPROCESSABLE_ENTITY, msg),
    };
    match state.catalog().list_papers(&query).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => store_error(err),
    }
}

async fn paper_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(arxiv_id): Path<String>,
) -> Response {
    match state.catalog().get_paper(&arxiv_id).await {
        Ok(paper) => Json(paper).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct LimitParams {
    limit: Option<u32>,
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    match state.catalog().list_runs(limit).await {
        Ok(runs) => Json(json!({ "items": runs })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn hot_phrases_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Response {
    let limit = params.limit.map_or(HOT_PHRASE_LIMIT, |l| l as usize);
    match state.catalog().list_hot_phrases(limit).await {
        Ok(items) => Json(json!({ "items": items })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn trigger_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.authorizer.authorize(&headers) {
        warn!("sync trigger refused: missing or invalid admin token");
        return detail(StatusCode::FORBIDDEN, "admin privileges required");
    }
    match state.sync.trigger().await {
        Ok(TriggerOutcome::Accepted { run_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({ "detail": "arxiv sync triggered", "run_id": run_id })),
        )
            .into_response(),
        Ok(TriggerOutcome::AlreadyRunning) => {
            detail(StatusCode::CONFLICT, "arxiv sync already running")
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "sync trigger failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
