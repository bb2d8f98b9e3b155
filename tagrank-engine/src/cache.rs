//! Persisted ranking score cache
//!
//! Each entry carries the work's `tag_version` and `engagement_version` at
//! computation time. An entry is stale when either version moved or when it
//! is older than `ranking.max_staleness_secs`; stale entries are recomputed,
//! never served.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqliteConnection};
use tagrank_common::config::{RankingConfig, TomlConfig};
use tagrank_common::models::RankingScores;
use tagrank_common::{time, Result, WorkId};
use tracing::debug;

use crate::ranking::{self, RankingInput};
use crate::works::{self, parse_work_id};
use crate::{metrics, summary};

/// Cached scores plus the versions they were computed from
#[derive(Debug, Clone, PartialEq)]
pub struct CachedScores {
    pub work_id: WorkId,
    pub scores: RankingScores,
    pub tag_version: i64,
    pub engagement_version: i64,
    pub computed_at: DateTime<Utc>,
}

impl CachedScores {
    pub fn is_fresh(
        &self,
        tag_version: i64,
        engagement_version: i64,
        now: DateTime<Utc>,
        config: &RankingConfig,
    ) -> bool {
        self.tag_version == tag_version
            && self.engagement_version == engagement_version
            && now - self.computed_at <= Duration::seconds(config.max_staleness_secs)
    }
}

pub async fn load_cached(
    conn: &mut SqliteConnection,
    work_id: WorkId,
) -> Result<Option<CachedScores>> {
    let row = sqlx::query(
        r#"
        SELECT quality_score, engagement_rate, comment_quality, discovery_boost,
               tag_version, engagement_version, computed_at
        FROM work_ranking_scores WHERE work_id = ?
        "#,
    )
    .bind(work_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let computed_at: String = row.get("computed_at");
    Ok(Some(CachedScores {
        work_id,
        scores: RankingScores {
            quality_score: row.get::<i64, _>("quality_score") as u8,
            engagement_rate: row.get::<i64, _>("engagement_rate") as u8,
            comment_quality: row.get::<i64, _>("comment_quality") as u8,
            discovery_boost: row.get::<i64, _>("discovery_boost") as u8,
        },
        tag_version: row.get("tag_version"),
        engagement_version: row.get("engagement_version"),
        computed_at: time::from_db(&computed_at)?,
    }))
}

/// Compute scores for a work from its stored state and write them to the cache
pub async fn recompute(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    config: &TomlConfig,
    now: DateTime<Utc>,
) -> Result<CachedScores> {
    let work = works::require_work(conn, work_id).await?;
    let assignments = works::load_assignments(conn, work_id).await?;
    let (engagement, engagement_version) = works::load_engagement(conn, work_id).await?;

    let summary = match summary::load_summary(conn, work_id).await? {
        Some(summary) => summary,
        None => summary::compute_summary(work_id, &assignments, &config.metrics),
    };
    let metrics = match metrics::load_metrics(conn, work_id).await? {
        Some(metrics) => metrics,
        None => {
            metrics::refresh_metrics(
                conn,
                work_id,
                work.word_count,
                &assignments,
                &config.metrics,
                &config.taxonomy,
            )
            .await?
        }
    };

    let input = RankingInput::new(engagement, &summary, &metrics, &assignments);
    let scores = ranking::score(&input, &config.ranking);

    sqlx::query(
        r#"
        INSERT INTO work_ranking_scores (
            work_id, quality_score, engagement_rate, comment_quality, discovery_boost,
            tag_version, engagement_version, computed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(work_id) DO UPDATE SET
            quality_score = excluded.quality_score,
            engagement_rate = excluded.engagement_rate,
            comment_quality = excluded.comment_quality,
            discovery_boost = excluded.discovery_boost,
            tag_version = excluded.tag_version,
            engagement_version = excluded.engagement_version,
            computed_at = excluded.computed_at
        "#,
    )
    .bind(work_id.to_string())
    .bind(scores.quality_score as i64)
    .bind(scores.engagement_rate as i64)
    .bind(scores.comment_quality as i64)
    .bind(scores.discovery_boost as i64)
    .bind(work.tag_version)
    .bind(engagement_version)
    .bind(time::to_db(now))
    .execute(&mut *conn)
    .await?;

    debug!(
        work_id = %work_id,
        quality_score = scores.quality_score,
        tag_version = work.tag_version,
        engagement_version,
        "Recomputed ranking scores"
    );

    Ok(CachedScores {
        work_id,
        scores,
        tag_version: work.tag_version,
        engagement_version,
        // Stored precision, so a later cache hit compares equal
        computed_at: time::from_db(&time::to_db(now))?,
    })
}

/// Serve cached scores when fresh, recompute otherwise
pub async fn get_scores(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    config: &TomlConfig,
    now: DateTime<Utc>,
) -> Result<CachedScores> {
    let work = works::require_work(conn, work_id).await?;
    let (_, engagement_version) = works::load_engagement(conn, work_id).await?;

    if let Some(cached) = load_cached(conn, work_id).await? {
        if cached.is_fresh(work.tag_version, engagement_version, now, &config.ranking) {
            return Ok(cached);
        }
    }

    recompute(conn, work_id, config, now).await
}

/// Recompute missing or stale cache entries; returns how many were refreshed
///
/// At most `ranking.max_refresh_per_pass` entries per call. Entries whose
/// versions moved go first, then the oldest aged-out ones.
pub async fn refresh_stale_scores(
    conn: &mut SqliteConnection,
    config: &TomlConfig,
    now: DateTime<Utc>,
) -> Result<usize> {
    let cutoff = now - Duration::seconds(config.ranking.max_staleness_secs);

    let stale: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT w.guid
        FROM works w
        LEFT JOIN work_engagement e ON e.work_id = w.guid
        LEFT JOIN work_ranking_scores s ON s.work_id = w.guid
        WHERE s.work_id IS NULL
           OR s.tag_version != w.tag_version
           OR s.engagement_version != COALESCE(e.engagement_version, 0)
           OR s.computed_at < ?
        ORDER BY
            CASE WHEN s.work_id IS NULL
                   OR s.tag_version != w.tag_version
                   OR s.engagement_version != COALESCE(e.engagement_version, 0)
                 THEN 0 ELSE 1 END,
            s.computed_at,
            w.guid
        LIMIT ?
        "#,
    )
    .bind(time::to_db(cutoff))
    .bind(config.ranking.max_refresh_per_pass)
    .fetch_all(&mut *conn)
    .await?;

    for guid in &stale {
        recompute(conn, parse_work_id(guid)?, config, now).await?;
    }

    if !stale.is_empty() {
        debug!(
            refreshed = stale.len(),
            limit = config.ranking.max_refresh_per_pass,
            "Refreshed stale ranking scores"
        );
    }
    Ok(stale.len())
}
