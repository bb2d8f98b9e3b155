//! Tag metrics computer
//!
//! Per-work abuse/quality signals. [`compute_metrics`] is pure; the
//! `refresh_*` functions persist results inside the caller's transaction.

use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use tagrank_common::config::{MetricsConfig, TaxonomyConfig};
use tagrank_common::models::{WorkTagAssignment, WorkTagMetrics};
use tagrank_common::{time, Prominence, Result, TagId, TagType, WorkId};
use tracing::debug;

use crate::taxonomy::Taxonomy;

/// Fandom tags that count toward fandom and crossover signals
pub fn counted_fandoms(assignments: &[WorkTagAssignment], config: &MetricsConfig) -> Vec<TagId> {
    assignments
        .iter()
        .filter(|a| a.tag_type == TagType::Fandom)
        .filter(|a| config.micro_counts_toward_fandoms || a.prominence != Prominence::Micro)
        .map(|a| a.tag_id)
        .collect()
}

/// Compute metrics from word count, assignments and the fandom taxonomy
pub fn compute_metrics(
    work_id: WorkId,
    word_count: i64,
    assignments: &[WorkTagAssignment],
    taxonomy: &Taxonomy,
    config: &MetricsConfig,
) -> WorkTagMetrics {
    let total_tag_count = assignments.len() as i64;
    let relationship_tag_count = assignments
        .iter()
        .filter(|a| a.tag_type == TagType::Relationship)
        .count() as i64;
    let primary_relationship_count = assignments
        .iter()
        .filter(|a| a.tag_type == TagType::Relationship && a.prominence == Prominence::Primary)
        .count();

    let tags_per_1k_words = total_tag_count as f64 / word_count.max(1) as f64 * 1000.0;
    let relationship_tag_ratio = relationship_tag_count as f64 / total_tag_count.max(1) as f64;

    let fandoms = counted_fandoms(assignments, config);
    let unique_fandom_count = taxonomy.canonical_set(&fandoms).len() as i64;

    let potential_tag_spam = total_tag_count > config.spam_tag_count_threshold
        && tags_per_1k_words > config.spam_tags_per_1k_threshold
        && primary_relationship_count == 0;

    WorkTagMetrics {
        work_id,
        tags_per_1k_words,
        relationship_tag_ratio,
        unique_fandom_count,
        potential_tag_spam,
        is_crossover: taxonomy.work_is_crossover(&fandoms),
    }
}

/// Recompute and store metrics for a work
pub async fn refresh_metrics(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    word_count: i64,
    assignments: &[WorkTagAssignment],
    metrics_config: &MetricsConfig,
    taxonomy_config: &TaxonomyConfig,
) -> Result<WorkTagMetrics> {
    let fandoms = counted_fandoms(assignments, metrics_config);
    let taxonomy = Taxonomy::load_neighborhood(conn, &fandoms, taxonomy_config).await?;
    let metrics = compute_metrics(work_id, word_count, assignments, &taxonomy, metrics_config);

    sqlx::query(
        r#"
        INSERT INTO work_tag_metrics (
            work_id, tags_per_1k_words, relationship_tag_ratio, unique_fandom_count,
            potential_tag_spam, is_crossover, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(work_id) DO UPDATE SET
            tags_per_1k_words = excluded.tags_per_1k_words,
            relationship_tag_ratio = excluded.relationship_tag_ratio,
            unique_fandom_count = excluded.unique_fandom_count,
            potential_tag_spam = excluded.potential_tag_spam,
            is_crossover = excluded.is_crossover,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(work_id.to_string())
    .bind(metrics.tags_per_1k_words)
    .bind(metrics.relationship_tag_ratio)
    .bind(metrics.unique_fandom_count)
    .bind(metrics.potential_tag_spam as i64)
    .bind(metrics.is_crossover as i64)
    .bind(time::to_db(time::now()))
    .execute(&mut *conn)
    .await?;

    debug!(
        work_id = %work_id,
        tags_per_1k_words = metrics.tags_per_1k_words,
        potential_tag_spam = metrics.potential_tag_spam,
        "Refreshed tag metrics"
    );

    Ok(metrics)
}

pub async fn load_metrics(
    conn: &mut SqliteConnection,
    work_id: WorkId,
) -> Result<Option<WorkTagMetrics>> {
    let row = sqlx::query(
        r#"
        SELECT tags_per_1k_words, relationship_tag_ratio, unique_fandom_count,
               potential_tag_spam, is_crossover
        FROM work_tag_metrics WHERE work_id = ?
        "#,
    )
    .bind(work_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| WorkTagMetrics {
        work_id,
        tags_per_1k_words: row.get("tags_per_1k_words"),
        relationship_tag_ratio: row.get("relationship_tag_ratio"),
        unique_fandom_count: row.get("unique_fandom_count"),
        potential_tag_spam: row.get::<i64, _>("potential_tag_spam") != 0,
        is_crossover: row.get::<i64, _>("is_crossover") != 0,
    }))
}

/// Recount `use_count` for the given tags from their assignments
pub async fn refresh_tag_use_counts(conn: &mut SqliteConnection, tag_ids: &[TagId]) -> Result<()> {
    if tag_ids.is_empty() {
        return Ok(());
    }

    let mut qb = QueryBuilder::<Sqlite>::new(
        "UPDATE tags SET use_count = \
         (SELECT COUNT(*) FROM work_tag_assignments a WHERE a.tag_id = tags.id) \
         WHERE id IN (",
    );
    let mut separated = qb.separated(", ");
    for id in tag_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
    qb.build().execute(&mut *conn).await?;

    Ok(())
}
