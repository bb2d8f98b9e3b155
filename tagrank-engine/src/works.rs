//! Work, tag and assignment storage
//!
//! Every function takes `&mut SqliteConnection` so callers can compose them
//! inside one transaction.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::HashSet;
use tagrank_common::models::{EngagementCounters, WorkTagAssignment};
use tagrank_common::{time, Error, Result, TagId, TagType, WorkId};
use tracing::debug;
use uuid::Uuid;

/// Work row owned by this subsystem
#[derive(Debug, Clone, PartialEq)]
pub struct WorkRecord {
    pub id: WorkId,
    pub word_count: i64,
    /// Incremented whenever assignments or word count change
    pub tag_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tags attached and detached by [`sync_assignments`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub attached: Vec<TagId>,
    pub detached: Vec<TagId>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

pub(crate) fn parse_work_id(text: &str) -> Result<WorkId> {
    Uuid::parse_str(text).map_err(|e| Error::Internal(format!("Invalid work id '{}': {}", text, e)))
}

fn work_from_row(row: &SqliteRow) -> Result<WorkRecord> {
    let guid: String = row.get("guid");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(WorkRecord {
        id: parse_work_id(&guid)?,
        word_count: row.get("word_count"),
        tag_version: row.get("tag_version"),
        created_at: time::from_db(&created_at)?,
        updated_at: time::from_db(&updated_at)?,
    })
}

pub async fn load_work(conn: &mut SqliteConnection, work_id: WorkId) -> Result<Option<WorkRecord>> {
    let row = sqlx::query(
        "SELECT guid, word_count, tag_version, created_at, updated_at FROM works WHERE guid = ?",
    )
    .bind(work_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(work_from_row).transpose()
}

/// Load a work or fail with `NotFound`
pub async fn require_work(conn: &mut SqliteConnection, work_id: WorkId) -> Result<WorkRecord> {
    load_work(conn, work_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Work {}", work_id)))
}

/// Insert the work or update its word count
///
/// Returns true when the row was created or its word count changed.
pub async fn upsert_work_record(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    word_count: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    if word_count < 0 {
        return Err(Error::InvalidInput(format!(
            "word_count must be non-negative, got {}",
            word_count
        )));
    }

    match load_work(conn, work_id).await? {
        Some(existing) if existing.word_count == word_count => Ok(false),
        Some(_) => {
            sqlx::query("UPDATE works SET word_count = ?, updated_at = ? WHERE guid = ?")
                .bind(word_count)
                .bind(time::to_db(now))
                .bind(work_id.to_string())
                .execute(&mut *conn)
                .await?;
            Ok(true)
        }
        None => {
            sqlx::query(
                "INSERT INTO works (guid, word_count, tag_version, created_at, updated_at) VALUES (?, ?, 0, ?, ?)",
            )
            .bind(work_id.to_string())
            .bind(word_count)
            .bind(time::to_db(now))
            .bind(time::to_db(now))
            .execute(&mut *conn)
            .await?;
            Ok(true)
        }
    }
}

/// Increment the work's tag version and touch `updated_at`
pub async fn bump_tag_version(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE works SET tag_version = tag_version + 1, updated_at = ? WHERE guid = ?")
        .bind(time::to_db(now))
        .bind(work_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Delete a work; assignments, summary, metrics, engagement and cached scores cascade
///
/// Returns the tags that were attached so callers can refresh their use counts.
pub async fn delete_work(conn: &mut SqliteConnection, work_id: WorkId) -> Result<Vec<TagId>> {
    let tag_ids: Vec<TagId> =
        sqlx::query_scalar("SELECT tag_id FROM work_tag_assignments WHERE work_id = ?")
            .bind(work_id.to_string())
            .fetch_all(&mut *conn)
            .await?;

    let result = sqlx::query("DELETE FROM works WHERE guid = ?")
        .bind(work_id.to_string())
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Work {}", work_id)));
    }

    Ok(tag_ids)
}

/// Find a tag by name (case-insensitive) or create it as a canonical tag
///
/// Tag names are unique across types; reusing a name with another type fails.
pub async fn find_or_create_tag(
    conn: &mut SqliteConnection,
    name: &str,
    tag_type: TagType,
    now: DateTime<Utc>,
) -> Result<TagId> {
    let existing = sqlx::query("SELECT id, type FROM tags WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(row) = existing {
        let existing_type: String = row.get("type");
        if existing_type != tag_type.as_str() {
            return Err(Error::InvalidInput(format!(
                "Tag '{}' already exists with type {}",
                name, existing_type
            )));
        }
        return Ok(row.get("id"));
    }

    let id = sqlx::query("INSERT INTO tags (name, type, is_canonical, use_count, created_at) VALUES (?, ?, 1, 0, ?)")
        .bind(name)
        .bind(tag_type.as_str())
        .bind(time::to_db(now))
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

    debug!(tag_id = id, name, tag_type = %tag_type, "Created tag");
    Ok(id)
}

/// Make the work's attached tags equal to `tags`
///
/// New tags start `unassigned` and auto-assigned; tags no longer listed are
/// detached. Tags that stay keep their classification state.
pub async fn sync_assignments(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    tags: &[(TagType, String)],
    now: DateTime<Utc>,
) -> Result<SyncReport> {
    let mut wanted: Vec<TagId> = Vec::with_capacity(tags.len());
    let mut seen = HashSet::new();
    for (tag_type, name) in tags {
        let tag_id = find_or_create_tag(conn, name, *tag_type, now).await?;
        if seen.insert(tag_id) {
            wanted.push(tag_id);
        }
    }

    let current: HashSet<TagId> =
        sqlx::query_scalar("SELECT tag_id FROM work_tag_assignments WHERE work_id = ?")
            .bind(work_id.to_string())
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();

    let mut report = SyncReport::default();

    for tag_id in &wanted {
        if current.contains(tag_id) {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO work_tag_assignments
                (work_id, tag_id, prominence, prominence_score, auto_assigned, needs_review, created_at, updated_at)
            VALUES (?, ?, 'unassigned', 0.0, 1, 0, ?, ?)
            "#,
        )
        .bind(work_id.to_string())
        .bind(tag_id)
        .bind(time::to_db(now))
        .bind(time::to_db(now))
        .execute(&mut *conn)
        .await?;
        report.attached.push(*tag_id);
    }

    let mut stale: Vec<TagId> = current.into_iter().filter(|id| !seen.contains(id)).collect();
    stale.sort_unstable();
    for tag_id in stale {
        sqlx::query("DELETE FROM work_tag_assignments WHERE work_id = ? AND tag_id = ?")
            .bind(work_id.to_string())
            .bind(tag_id)
            .execute(&mut *conn)
            .await?;
        report.detached.push(tag_id);
    }

    Ok(report)
}

fn assignment_from_row(row: &SqliteRow) -> Result<WorkTagAssignment> {
    let work_id: String = row.get("work_id");
    let tag_type: String = row.get("type");
    let prominence: String = row.get("prominence");
    let created_at: String = row.get("created_at");

    Ok(WorkTagAssignment {
        work_id: parse_work_id(&work_id)?,
        tag_id: row.get("tag_id"),
        tag_name: row.get("name"),
        tag_type: tag_type.parse()?,
        prominence: prominence.parse()?,
        prominence_score: row.get("prominence_score"),
        auto_assigned: row.get::<i64, _>("auto_assigned") != 0,
        migration_batch: row.get("migration_batch"),
        needs_review: row.get::<i64, _>("needs_review") != 0,
        created_at: time::from_db(&created_at)?,
    })
}

/// All assignments of a work in attachment order
pub async fn load_assignments(
    conn: &mut SqliteConnection,
    work_id: WorkId,
) -> Result<Vec<WorkTagAssignment>> {
    let rows = sqlx::query(
        r#"
        SELECT a.work_id, a.tag_id, t.name, t.type, a.prominence, a.prominence_score,
               a.auto_assigned, a.migration_batch, a.needs_review, a.created_at
        FROM work_tag_assignments a
        JOIN tags t ON t.id = a.tag_id
        WHERE a.work_id = ?
        ORDER BY a.created_at, a.tag_id
        "#,
    )
    .bind(work_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(assignment_from_row).collect()
}

/// Persist the mutable classification state of one assignment
pub async fn write_assignment(
    conn: &mut SqliteConnection,
    assignment: &WorkTagAssignment,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE work_tag_assignments
        SET prominence = ?, prominence_score = ?, auto_assigned = ?,
            migration_batch = ?, needs_review = ?, updated_at = ?
        WHERE work_id = ? AND tag_id = ?
        "#,
    )
    .bind(assignment.prominence.as_str())
    .bind(assignment.prominence_score)
    .bind(assignment.auto_assigned as i64)
    .bind(assignment.migration_batch)
    .bind(assignment.needs_review as i64)
    .bind(time::to_db(now))
    .bind(assignment.work_id.to_string())
    .bind(assignment.tag_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Store an engagement snapshot and bump its version
pub async fn upsert_engagement(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    counters: &EngagementCounters,
    now: DateTime<Utc>,
) -> Result<i64> {
    let values = [
        ("hits", counters.hits),
        ("kudos_count", counters.kudos_count),
        ("comment_count", counters.comment_count),
        ("bookmark_count", counters.bookmark_count),
    ];
    if let Some((name, value)) = values.iter().find(|(_, v)| *v < 0) {
        return Err(Error::InvalidInput(format!("{} must be non-negative, got {}", name, value)));
    }

    let version: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO work_engagement
            (work_id, hits, kudos_count, comment_count, bookmark_count, engagement_version, updated_at)
        VALUES (?, ?, ?, ?, ?, 1, ?)
        ON CONFLICT(work_id) DO UPDATE SET
            hits = excluded.hits,
            kudos_count = excluded.kudos_count,
            comment_count = excluded.comment_count,
            bookmark_count = excluded.bookmark_count,
            engagement_version = work_engagement.engagement_version + 1,
            updated_at = excluded.updated_at
        RETURNING engagement_version
        "#,
    )
    .bind(work_id.to_string())
    .bind(counters.hits)
    .bind(counters.kudos_count)
    .bind(counters.comment_count)
    .bind(counters.bookmark_count)
    .bind(time::to_db(now))
    .fetch_one(&mut *conn)
    .await?;

    Ok(version)
}

/// Engagement counters and version; zero counters at version 0 when none recorded
pub async fn load_engagement(
    conn: &mut SqliteConnection,
    work_id: WorkId,
) -> Result<(EngagementCounters, i64)> {
    let row = sqlx::query(
        r#"
        SELECT hits, kudos_count, comment_count, bookmark_count, engagement_version
        FROM work_engagement WHERE work_id = ?
        "#,
    )
    .bind(work_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(match row {
        Some(row) => (
            EngagementCounters {
                hits: row.get("hits"),
                kudos_count: row.get("kudos_count"),
                comment_count: row.get("comment_count"),
                bookmark_count: row.get("bookmark_count"),
            },
            row.get("engagement_version"),
        ),
        None => (EngagementCounters::default(), 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagrank_common::db::init_memory_database;
    use tagrank_common::Prominence;

    fn tags(list: &[(TagType, &str)]) -> Vec<(TagType, String)> {
        list.iter().map(|(t, n)| (*t, n.to_string())).collect()
    }

    #[tokio::test]
    async fn test_sync_attaches_and_detaches() {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let work_id = Uuid::new_v4();
        let now = time::now();

        upsert_work_record(&mut conn, work_id, 1200, now).await.unwrap();
        let first = sync_assignments(
            &mut conn,
            work_id,
            &tags(&[(TagType::Relationship, "A/B"), (TagType::Character, "E"), (TagType::Character, "e")]),
            now,
        )
        .await
        .unwrap();
        assert_eq!(first.attached.len(), 2, "case-insensitive duplicate collapses");

        let second = sync_assignments(&mut conn, work_id, &tags(&[(TagType::Relationship, "a/b")]), now)
            .await
            .unwrap();
        assert!(second.attached.is_empty());
        assert_eq!(second.detached.len(), 1);

        let remaining = load_assignments(&mut conn, work_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].tag_name, "A/B");
        assert_eq!(remaining[0].prominence, Prominence::Unassigned);
        assert!(remaining[0].auto_assigned);
    }

    #[tokio::test]
    async fn test_tag_name_reused_with_other_type_rejected() {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = time::now();

        find_or_create_tag(&mut conn, "Angst", TagType::Freeform, now).await.unwrap();
        let result = find_or_create_tag(&mut conn, "angst", TagType::Character, now).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_engagement_version_increments() {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let work_id = Uuid::new_v4();
        let now = time::now();
        upsert_work_record(&mut conn, work_id, 100, now).await.unwrap();

        let counters = EngagementCounters { hits: 10, kudos_count: 2, comment_count: 1, bookmark_count: 0 };
        assert_eq!(upsert_engagement(&mut conn, work_id, &counters, now).await.unwrap(), 1);
        assert_eq!(upsert_engagement(&mut conn, work_id, &counters, now).await.unwrap(), 2);

        let (loaded, version) = load_engagement(&mut conn, work_id).await.unwrap();
        assert_eq!(loaded, counters);
        assert_eq!(version, 2);

        let negative = EngagementCounters { hits: -1, ..counters };
        assert!(upsert_engagement(&mut conn, work_id, &negative, now).await.is_err());
    }

    #[tokio::test]
    async fn test_word_count_change_detected() {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let work_id = Uuid::new_v4();
        let now = time::now();

        assert!(upsert_work_record(&mut conn, work_id, 500, now).await.unwrap());
        assert!(!upsert_work_record(&mut conn, work_id, 500, now).await.unwrap());
        assert!(upsert_work_record(&mut conn, work_id, 750, now).await.unwrap());
        assert!(upsert_work_record(&mut conn, work_id, -1, now).await.is_err());
    }
}
