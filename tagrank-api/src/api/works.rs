//! Work ingest, engagement snapshots and per-work reads
//!
//! Ingest and reclassification take an optional `rule_version` query
//! parameter; without it the latest stored rule version applies.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tagrank_common::models::{EngagementCounters, WorkInput, WorkTagMetrics, WorkTagSummary};
use tagrank_common::WorkId;
use tagrank_engine::{ClassifyOutcome, ScoreDocument};
use tracing::info;
use uuid::Uuid;

use crate::{ApiError, ApiResult, AppState};

/// Work metadata body; the id comes from the path
#[derive(Debug, Deserialize)]
pub struct WorkBody {
    pub word_count: i64,
    #[serde(default)]
    pub fandom_tags: Vec<String>,
    #[serde(default)]
    pub character_tags: Vec<String>,
    #[serde(default)]
    pub relationship_tags: Vec<String>,
    #[serde(default)]
    pub freeform_tags: Vec<String>,
    #[serde(default)]
    pub rating_tags: Vec<String>,
    #[serde(default)]
    pub warning_tags: Vec<String>,
    #[serde(default)]
    pub category_tags: Vec<String>,
    #[serde(default)]
    pub additional_tags: Vec<String>,
}

impl WorkBody {
    fn into_input(self, id: WorkId) -> WorkInput {
        WorkInput {
            id,
            word_count: self.word_count,
            fandom_tags: self.fandom_tags,
            character_tags: self.character_tags,
            relationship_tags: self.relationship_tags,
            freeform_tags: self.freeform_tags,
            rating_tags: self.rating_tags,
            warning_tags: self.warning_tags,
            category_tags: self.category_tags,
            additional_tags: self.additional_tags,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RuleVersionQuery {
    pub rule_version: Option<i64>,
}

/// Classification result returned by ingest and reclassify
#[derive(Debug, Serialize)]
pub struct ClassifyResponse {
    pub work_id: WorkId,
    pub rule_version: i64,
    #[serde(flatten)]
    pub outcome: ClassifyOutcome,
}

#[derive(Debug, Serialize)]
pub struct EngagementResponse {
    pub work_id: WorkId,
    pub engagement_version: i64,
}

pub(crate) fn parse_work_id(raw: &str) -> ApiResult<WorkId> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid work id: {}", raw)))
}

pub(crate) async fn resolve_rule_version(state: &AppState, requested: Option<i64>) -> ApiResult<i64> {
    match requested {
        Some(version) if version < 0 => Err(ApiError::BadRequest(format!(
            "rule_version must be non-negative, got {}",
            version
        ))),
        Some(version) => Ok(version),
        None => Ok(state.engine.latest_rule_version().await?),
    }
}

/// PUT /api/works/:id
pub async fn upsert_work(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RuleVersionQuery>,
    Json(body): Json<WorkBody>,
) -> ApiResult<Json<ClassifyResponse>> {
    let work_id = parse_work_id(&id)?;
    let rule_version = resolve_rule_version(&state, query.rule_version).await?;

    let outcome = state.engine.upsert_work(&body.into_input(work_id), rule_version).await?;

    Ok(Json(ClassifyResponse {
        work_id,
        rule_version,
        outcome,
    }))
}

/// DELETE /api/works/:id
pub async fn delete_work(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let work_id = parse_work_id(&id)?;
    state.engine.delete_work(work_id).await?;
    info!(work_id = %work_id, "Work deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/works/:id/engagement
pub async fn record_engagement(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(counters): Json<EngagementCounters>,
) -> ApiResult<Json<EngagementResponse>> {
    let work_id = parse_work_id(&id)?;
    if counters.hits < 0 || counters.kudos_count < 0 || counters.comment_count < 0 || counters.bookmark_count < 0 {
        return Err(ApiError::BadRequest("Engagement counters must be non-negative".to_string()));
    }

    let engagement_version = state.engine.record_engagement(work_id, &counters).await?;
    Ok(Json(EngagementResponse {
        work_id,
        engagement_version,
    }))
}

/// POST /api/works/:id/classify
pub async fn classify_work(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RuleVersionQuery>,
) -> ApiResult<Json<ClassifyResponse>> {
    let work_id = parse_work_id(&id)?;
    let rule_version = resolve_rule_version(&state, query.rule_version).await?;

    let outcome = state.engine.classify_work(work_id, rule_version).await?;
    Ok(Json(ClassifyResponse {
        work_id,
        rule_version,
        outcome,
    }))
}

/// GET /api/works/:id/summary
pub async fn get_summary(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<WorkTagSummary>> {
    let work_id = parse_work_id(&id)?;
    Ok(Json(state.engine.summary(work_id).await?))
}

/// GET /api/works/:id/metrics
pub async fn get_metrics(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<WorkTagMetrics>> {
    let work_id = parse_work_id(&id)?;
    Ok(Json(state.engine.metrics(work_id).await?))
}

/// GET /api/works/:id/scores
///
/// Same document the search index receives.
pub async fn get_scores(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<ScoreDocument>> {
    let work_id = parse_work_id(&id)?;
    let cached = state.engine.scores(work_id).await?;
    Ok(Json(ScoreDocument::from(&cached)))
}

/// Build work routes
pub fn work_routes() -> Router<AppState> {
    Router::new()
        .route("/api/works/:id", put(upsert_work).delete(delete_work))
        .route("/api/works/:id/engagement", put(record_engagement))
        .route("/api/works/:id/classify", post(classify_work))
        .route("/api/works/:id/summary", get(get_summary))
        .route("/api/works/:id/metrics", get(get_metrics))
        .route("/api/works/:id/scores", get(get_scores))
}
