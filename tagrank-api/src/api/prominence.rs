//! Author prominence overrides

use axum::{
    extract::{Path, State},
    routing::put,
    Json, Router,
};
use serde::Deserialize;
use tagrank_common::{Prominence, TagId};
use tagrank_engine::OverrideOutcome;
use tracing::info;

use crate::api::works::parse_work_id;
use crate::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct ProminenceBody {
    pub prominence: Prominence,
}

/// PUT /api/works/:id/tags/:tag_id/prominence
///
/// A primary that would exceed the cap is rejected with 409 and the
/// blocking tags in `details`; nothing is written.
pub async fn set_prominence(
    State(state): State<AppState>,
    Path((id, tag_id)): Path<(String, TagId)>,
    Json(body): Json<ProminenceBody>,
) -> ApiResult<Json<OverrideOutcome>> {
    let work_id = parse_work_id(&id)?;

    let outcome = state.engine.set_prominence(work_id, tag_id, body.prominence).await?;
    info!(work_id = %work_id, tag_id, prominence = %body.prominence, "Prominence overridden");
    Ok(Json(outcome))
}

pub fn prominence_routes() -> Router<AppState> {
    Router::new().route("/api/works/:id/tags/:tag_id/prominence", put(set_prominence))
}
