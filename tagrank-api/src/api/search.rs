//! Filtered, sorted, paginated search
//!
//! Query parameters use the filter contract names (`primaryOnly`,
//! `hideTagSpam`, `maxRelationshipTags`, `minWordsPerMajorTag`) plus
//! `hideCrossovers`, `relationshipCount` (`1-2`, `3-5`, `6-10`, `10+`),
//! comma-separated `relationships`, `sort`, `order` and `page`.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tagrank_engine::{RankedWork, RelationshipBucket, SearchFilter, SearchQuery, SortField, SortOrder};

use crate::pagination::{calculate_pagination, requested_offset, PAGE_SIZE};
use crate::{ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    #[serde(default)]
    pub primary_only: bool,
    #[serde(default)]
    pub hide_tag_spam: bool,
    pub max_relationship_tags: Option<i64>,
    pub min_words_per_major_tag: Option<i64>,
    #[serde(default)]
    pub hide_crossovers: bool,
    pub relationship_count: Option<String>,
    pub relationships: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub page: Option<i64>,
}

impl SearchParams {
    fn filter(&self) -> ApiResult<SearchFilter> {
        let relationship_count = self
            .relationship_count
            .as_deref()
            .map(str::parse::<RelationshipBucket>)
            .transpose()?;

        let relationships = self
            .relationships
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(SearchFilter {
            primary_only: self.primary_only,
            hide_tag_spam: self.hide_tag_spam,
            max_relationship_tags: self.max_relationship_tags,
            min_words_per_major_tag: self.min_words_per_major_tag,
            hide_crossovers: self.hide_crossovers,
            relationship_count,
            relationships,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub total_results: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
    pub sort: SortField,
    pub order: SortOrder,
    pub works: Vec<RankedWork>,
}

/// GET /api/search
pub async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> ApiResult<Json<SearchResponse>> {
    let sort = params.sort.as_deref().map(str::parse::<SortField>).transpose()?.unwrap_or_default();
    let order = params.order.as_deref().map(str::parse::<SortOrder>).transpose()?.unwrap_or_default();
    let requested_page = params.page.unwrap_or(1);

    let mut query = SearchQuery {
        filter: params.filter()?,
        sort,
        order,
        offset: requested_offset(requested_page),
        limit: PAGE_SIZE,
    };
    let mut results = state.engine.search(&query).await?;

    // Past the last page: serve the last page instead
    let pagination = calculate_pagination(results.total, requested_page);
    if pagination.offset != query.offset {
        query.offset = pagination.offset;
        results = state.engine.search(&query).await?;
    }

    Ok(Json(SearchResponse {
        total_results: results.total,
        page: pagination.page,
        page_size: PAGE_SIZE,
        total_pages: pagination.total_pages,
        sort,
        order,
        works: results.works,
    }))
}

pub fn search_routes() -> Router<AppState> {
    Router::new().route("/api/search", get(search))
}
