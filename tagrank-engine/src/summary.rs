//! Work tag summary maintenance
//!
//! The summary is a pure function of a work's assignments. It is rewritten
//! inside the same transaction as every assignment change.

use sqlx::{Row, SqliteConnection};
use tagrank_common::config::MetricsConfig;
use tagrank_common::models::{WorkTagAssignment, WorkTagSummary};
use tagrank_common::{time, Prominence, Result, TagType, WorkId};

/// Recompute the summary from assignment rows
pub fn compute_summary(
    work_id: WorkId,
    assignments: &[WorkTagAssignment],
    config: &MetricsConfig,
) -> WorkTagSummary {
    let relationship_with = |level: Prominence| {
        assignments
            .iter()
            .filter(|a| a.tag_type == TagType::Relationship && a.prominence == level)
            .count() as i64
    };

    let total_tag_count = assignments.len() as i64;
    let rule_review = assignments.iter().any(|a| a.auto_assigned && a.needs_review);

    WorkTagSummary {
        work_id,
        primary_relationship_count: relationship_with(Prominence::Primary),
        secondary_relationship_count: relationship_with(Prominence::Secondary),
        micro_relationship_count: relationship_with(Prominence::Micro),
        relationship_tag_count: assignments
            .iter()
            .filter(|a| a.tag_type == TagType::Relationship)
            .count() as i64,
        major_tag_count: assignments.iter().filter(|a| a.prominence.is_major()).count() as i64,
        total_tag_count,
        auto_assigned_count: assignments.iter().filter(|a| a.auto_assigned).count() as i64,
        needs_author_review: rule_review || total_tag_count > config.review_tag_count_threshold,
    }
}

/// Recompute and store the summary for a work
pub async fn refresh_summary(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    assignments: &[WorkTagAssignment],
    config: &MetricsConfig,
) -> Result<WorkTagSummary> {
    let summary = compute_summary(work_id, assignments, config);

    sqlx::query(
        r#"
        INSERT INTO work_tag_summaries (
            work_id, primary_relationship_count, secondary_relationship_count,
            micro_relationship_count, relationship_tag_count, major_tag_count,
            total_tag_count, auto_assigned_count, needs_author_review, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(work_id) DO UPDATE SET
            primary_relationship_count = excluded.primary_relationship_count,
            secondary_relationship_count = excluded.secondary_relationship_count,
            micro_relationship_count = excluded.micro_relationship_count,
            relationship_tag_count = excluded.relationship_tag_count,
            major_tag_count = excluded.major_tag_count,
            total_tag_count = excluded.total_tag_count,
            auto_assigned_count = excluded.auto_assigned_count,
            needs_author_review = excluded.needs_author_review,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(work_id.to_string())
    .bind(summary.primary_relationship_count)
    .bind(summary.secondary_relationship_count)
    .bind(summary.micro_relationship_count)
    .bind(summary.relationship_tag_count)
    .bind(summary.major_tag_count)
    .bind(summary.total_tag_count)
    .bind(summary.auto_assigned_count)
    .bind(summary.needs_author_review as i64)
    .bind(time::to_db(time::now()))
    .execute(&mut *conn)
    .await?;

    Ok(summary)
}

pub async fn load_summary(
    conn: &mut SqliteConnection,
    work_id: WorkId,
) -> Result<Option<WorkTagSummary>> {
    let row = sqlx::query(
        r#"
        SELECT primary_relationship_count, secondary_relationship_count, micro_relationship_count,
               relationship_tag_count, major_tag_count, total_tag_count, auto_assigned_count,
               needs_author_review
        FROM work_tag_summaries WHERE work_id = ?
        "#,
    )
    .bind(work_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| WorkTagSummary {
        work_id,
        primary_relationship_count: row.get("primary_relationship_count"),
        secondary_relationship_count: row.get("secondary_relationship_count"),
        micro_relationship_count: row.get("micro_relationship_count"),
        relationship_tag_count: row.get("relationship_tag_count"),
        major_tag_count: row.get("major_tag_count"),
        total_tag_count: row.get("total_tag_count"),
        auto_assigned_count: row.get("auto_assigned_count"),
        needs_author_review: row.get::<i64, _>("needs_author_review") != 0,
    }))
}
