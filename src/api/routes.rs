use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::{SeenStore, StoreStats};
use crate::error::AppError;
use crate::registry::WatchRegistry;
use crate::scheduler::{Scheduler, StatsSnapshot};
use crate::types::{CycleOutcome, CycleReport, PollStatus, RawListing};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<WatchRegistry>,
    pub store: SeenStore,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/watches", get(get_watches))
        .route("/watches/:name/poll", post(post_poll))
        .route("/watches/:name/clear-seen", post(post_clear_seen))
        .route("/status", get(get_status))
        .route("/reload", post(post_reload))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PollQuery {
    pub dry_run: Option<bool>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub stats: StatsSnapshot,
    pub store: StoreStats,
}

#[derive(Serialize)]
pub struct PollResponse {
    pub outcome: &'static str,
    pub reason: Option<String>,
    pub fetched: usize,
    pub notified: usize,
    pub dispatch_failures: usize,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub would_notify: Vec<RawListing>,
}

impl PollResponse {
    fn from_report(report: CycleReport, dry_run: bool) -> Self {
        let reason = match &report.outcome {
            CycleOutcome::Success => None,
            CycleOutcome::SoftFail(r) | CycleOutcome::FatalFail(r) => Some(r.clone()),
        };
        Self {
            outcome: report.outcome.label(),
            reason,
            fetched: report.fetched,
            notified: report.notified,
            dispatch_failures: report.dispatch_failures,
            dry_run,
            would_notify: report.would_notify,
        }
    }
}

#[derive(Serialize)]
pub struct ClearSeenResponse {
    pub watch: String,
    pub cleared: u64,
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub watches: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Per-watch poll status: last result, failure streak, next due time and
/// any disabled reason.
async fn get_watches(State(state): State<ApiState>) -> Json<Vec<PollStatus>> {
    Json(state.scheduler.statuses())
}

async fn get_status(
    State(state): State<ApiState>,
) -> Result<Json<StatusResponse>, AppError> {
    Ok(Json(StatusResponse {
        stats: state.scheduler.stats_snapshot(),
        store: state.store.stats().await?,
    }))
}

/// Trigger one immediate poll cycle. With ?dry_run=true the cycle reports
/// what it would notify without sending or persisting anything.
async fn post_poll(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<PollQuery>,
) -> Result<Json<PollResponse>, AppError> {
    let dry_run = params.dry_run.unwrap_or(false);
    let report = state.scheduler.trigger_now(&name, dry_run).await?;
    Ok(Json(PollResponse::from_report(report, dry_run)))
}

/// Forget every seen listing for a watch, so current listings notify again
/// on its next cycle.
async fn post_clear_seen(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<ClearSeenResponse>, AppError> {
    if state.registry.get(&name).is_none() {
        return Err(AppError::UnknownWatch(name));
    }
    let cleared = state.store.clear(&name).await?;
    Ok(Json(ClearSeenResponse { watch: name, cleared }))
}

/// Re-read the watch file. On a validation error the active set is left
/// unchanged and the error is returned.
async fn post_reload(
    State(state): State<ApiState>,
) -> Result<Json<ReloadResponse>, AppError> {
    let watches = state.scheduler.reload()?;
    Ok(Json(ReloadResponse { watches }))
}
