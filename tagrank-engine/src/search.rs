//! Filtered, sorted search over cached ranking scores
//!
//! Stale or missing cache entries are refreshed before a page is read, so a
//! page never mixes scores from different input versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use tagrank_common::config::TomlConfig;
use tagrank_common::models::RankingScores;
use tagrank_common::{time, Error, Result};

use crate::cache;
use crate::filter::SearchFilter;
use crate::ranking::{RankedWork, SortField, SortOrder};
use crate::works::parse_work_id;

/// Largest page the engine will return
pub const MAX_LIMIT: i64 = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub filter: SearchFilter,
    pub sort: SortField,
    pub order: SortOrder,
    pub offset: i64,
    pub limit: i64,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            filter: SearchFilter::default(),
            sort: SortField::default(),
            order: SortOrder::default(),
            offset: 0,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    /// Works matching the filter across all pages
    pub total: i64,
    pub works: Vec<RankedWork>,
}

fn push_from(qb: &mut QueryBuilder<'_, Sqlite>, filter: &SearchFilter) {
    qb.push(
        " FROM works w \
         JOIN work_ranking_scores s ON s.work_id = w.guid \
         LEFT JOIN work_tag_summaries ws ON ws.work_id = w.guid \
         LEFT JOIN work_tag_metrics wm ON wm.work_id = w.guid \
         WHERE 1 = 1",
    );
    filter.push_predicates(qb);
}

fn ranked_from_row(row: &SqliteRow) -> Result<RankedWork> {
    let guid: String = row.get("guid");
    let updated_at: String = row.get("updated_at");
    Ok(RankedWork {
        work_id: parse_work_id(&guid)?,
        word_count: row.get("word_count"),
        updated_at: time::from_db(&updated_at)?,
        scores: RankingScores {
            quality_score: row.get::<i64, _>("quality_score") as u8,
            engagement_rate: row.get::<i64, _>("engagement_rate") as u8,
            comment_quality: row.get::<i64, _>("comment_quality") as u8,
            discovery_boost: row.get::<i64, _>("discovery_boost") as u8,
        },
    })
}

/// Count works matching the filter
pub async fn count_matching(conn: &mut SqliteConnection, filter: &SearchFilter) -> Result<i64> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*)");
    push_from(&mut qb, filter);
    let total: i64 = qb.build_query_scalar().fetch_one(&mut *conn).await?;
    Ok(total)
}

/// Run a search: refresh stale scores, count, then read one page
pub async fn search(
    conn: &mut SqliteConnection,
    query: &SearchQuery,
    config: &TomlConfig,
    now: DateTime<Utc>,
) -> Result<SearchResults> {
    query.filter.validate()?;
    if query.offset < 0 || query.limit <= 0 || query.limit > MAX_LIMIT {
        return Err(Error::InvalidInput(format!(
            "offset must be >= 0 and limit within 1..={}",
            MAX_LIMIT
        )));
    }

    cache::refresh_stale_scores(conn, config, now).await?;

    let total = count_matching(conn, &query.filter).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT w.guid, w.word_count, w.updated_at, \
         s.quality_score, s.engagement_rate, s.comment_quality, s.discovery_boost",
    );
    push_from(&mut qb, &query.filter);
    qb.push(format!(
        " ORDER BY s.{} {}, w.updated_at DESC, w.guid ASC LIMIT ",
        query.sort.column(),
        query.order.as_sql()
    ))
    .push_bind(query.limit)
    .push(" OFFSET ")
    .push_bind(query.offset);

    let rows = qb.build().fetch_all(&mut *conn).await?;
    let works = rows.iter().map(ranked_from_row).collect::<Result<Vec<_>>>()?;

    Ok(SearchResults { total, works })
}
