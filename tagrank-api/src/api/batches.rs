//! Migration batch control
//!
//! Each POST runs one batch to completion (or until shutdown) and returns
//! its result. Only one batch runs at a time per process; a second request
//! gets 409.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tagrank_engine::batch::BatchWorkError;
use tagrank_engine::{BatchResult, MigrationBatch};
use tracing::info;

use crate::api::works::resolve_rule_version;
use crate::{ApiError, ApiResult, AppState};

const MAX_LISTED_BATCHES: i64 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct RunBatchRequest {
    pub rule_version: Option<i64>,
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BatchDetail {
    #[serde(flatten)]
    pub batch: MigrationBatch,
    pub errors: Vec<BatchWorkError>,
}

/// POST /api/migration/batches
pub async fn run_batch(
    State(state): State<AppState>,
    Json(request): Json<RunBatchRequest>,
) -> ApiResult<Json<BatchResult>> {
    let _guard = state
        .migration_lock
        .try_lock()
        .map_err(|_| ApiError::Conflict("A migration batch is already running".to_string()))?;

    let rule_version = resolve_rule_version(&state, request.rule_version).await?;
    let batch_size = request
        .batch_size
        .unwrap_or(state.engine.config().batch.batch_size);

    info!(rule_version, batch_size, dry_run = request.dry_run, "Migration batch requested");

    let result = state
        .engine
        .batch_runner(request.dry_run)
        .run_batch(batch_size, rule_version, &state.shutdown.child_token())
        .await?;
    Ok(Json(result))
}

/// GET /api/migration/batches?limit=N
pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<MigrationBatch>>> {
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_LISTED_BATCHES);
    Ok(Json(state.engine.recent_batches(limit).await?))
}

/// GET /api/migration/batches/:number
pub async fn get_batch(State(state): State<AppState>, Path(number): Path<i64>) -> ApiResult<Json<BatchDetail>> {
    let (batch, errors) = state.engine.batch(number).await?;
    Ok(Json(BatchDetail { batch, errors }))
}

pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/api/migration/batches", get(list_batches).post(run_batch))
        .route("/api/migration/batches/:number", get(get_batch))
}
