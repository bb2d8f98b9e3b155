//! Crossover and universe-family queries

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tagrank_common::{TagId, WorkId};

use crate::api::works::parse_work_id;
use crate::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct CrossoverQuery {
    pub work_a: String,
    pub work_b: String,
}

#[derive(Debug, Serialize)]
pub struct CrossoverResponse {
    pub work_a: WorkId,
    pub work_b: WorkId,
    pub is_crossover: bool,
}

#[derive(Debug, Serialize)]
pub struct UniverseFamilyResponse {
    pub tag_id: TagId,
    /// `null` when the fandom belongs to no family
    pub universe_family: Option<TagId>,
}

/// GET /api/crossover?work_a=UUID&work_b=UUID
pub async fn crossover(
    State(state): State<AppState>,
    Query(query): Query<CrossoverQuery>,
) -> ApiResult<Json<CrossoverResponse>> {
    let work_a = parse_work_id(&query.work_a)?;
    let work_b = parse_work_id(&query.work_b)?;

    let is_crossover = state.engine.crossover(work_a, work_b).await?;
    Ok(Json(CrossoverResponse {
        work_a,
        work_b,
        is_crossover,
    }))
}

/// GET /api/tags/:id/universe-family
pub async fn universe_family(
    State(state): State<AppState>,
    Path(tag_id): Path<TagId>,
) -> ApiResult<Json<UniverseFamilyResponse>> {
    let universe_family = state.engine.universe_family_of(tag_id).await?;
    Ok(Json(UniverseFamilyResponse {
        tag_id,
        universe_family,
    }))
}

pub fn crossover_routes() -> Router<AppState> {
    Router::new()
        .route("/api/crossover", get(crossover))
        .route("/api/tags/:id/universe-family", get(universe_family))
}
