//! Migration batch runner
//!
//! Reclassifies works whose assignments are out of date for a rule version:
//! any tag still `unassigned`, or auto-assigned under a different
//! `migration_batch`. Manually set tags never match, so overrides are never
//! reprocessed.
//!
//! Each batch is a persisted row moving `pending → running → completed |
//! failed`, with `cancelled` as a resumable pause. Counters are written after
//! every work so a crashed or cancelled batch resumes where it stopped.
//! Every work is classified in its own transaction; a failing work is
//! recorded in `migration_batch_errors` and skipped, and is not selected
//! again for the same rule version until the work itself is edited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tagrank_common::config::TomlConfig;
use tagrank_common::events::{EngineEvent, EventBus};
use tagrank_common::{time, Error, Result, WorkId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier;
use crate::publish;
use crate::retry::retry_on_lock;
use crate::rules::RuleSet;
use crate::works::parse_work_id;

/// Works between two `BatchProgress` events
const PROGRESS_EVERY: i64 = 100;

/// Persisted batch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Stopped between works; resumable
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Cancelled, Running)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "cancelled" => Ok(BatchStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("Unknown batch status: {}", other))),
        }
    }
}

/// One row of `tag_migration_batches`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationBatch {
    pub batch_number: i64,
    pub rule_version: i64,
    pub status: BatchStatus,
    pub migration_strategy: String,
    pub dry_run: bool,
    pub works_total: i64,
    pub works_processed: i64,
    pub works_skipped: i64,
    pub errors_count: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl MigrationBatch {
    /// Move to `next`, stamping start/completion times
    pub fn transition_to(&mut self, next: BatchStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "Batch {} cannot move from {} to {}",
                self.batch_number, self.status, next
            )));
        }

        let now = time::now();
        if next == BatchStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if matches!(next, BatchStatus::Completed | BatchStatus::Failed) {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Completed and failed batches are never resumed
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Works this batch has finished with, whatever the outcome
    pub fn attempted(&self) -> i64 {
        self.works_processed + self.works_skipped + self.errors_count
    }

    pub fn remaining(&self) -> i64 {
        (self.works_total - self.attempted()).max(0)
    }

    pub fn error_rate(&self) -> f64 {
        let attempted = self.attempted();
        if attempted == 0 {
            0.0
        } else {
            self.errors_count as f64 / attempted as f64
        }
    }
}

/// A work that failed inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchWorkError {
    pub work_id: WorkId,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of one `run_batch` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// `None` when nothing needed migrating
    pub batch_number: Option<i64>,
    pub processed: i64,
    pub skipped: i64,
    pub errors: i64,
    pub status: BatchStatus,
}

fn batch_from_row(row: &SqliteRow) -> Result<MigrationBatch> {
    let status: String = row.get("status");
    let started_at: Option<String> = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(MigrationBatch {
        batch_number: row.get("batch_number"),
        rule_version: row.get("rule_version"),
        status: status.parse()?,
        migration_strategy: row.get("migration_strategy"),
        dry_run: row.get::<i64, _>("dry_run") != 0,
        works_total: row.get("works_total"),
        works_processed: row.get("works_processed"),
        works_skipped: row.get("works_skipped"),
        errors_count: row.get("errors_count"),
        started_at: started_at.as_deref().map(time::from_db).transpose()?,
        completed_at: completed_at.as_deref().map(time::from_db).transpose()?,
        last_error: row.get("last_error"),
    })
}

const BATCH_COLUMNS: &str = "batch_number, rule_version, status, migration_strategy, dry_run, \
    works_total, works_processed, works_skipped, errors_count, started_at, completed_at, last_error";

pub async fn load_batch(conn: &mut SqliteConnection, batch_number: i64) -> Result<Option<MigrationBatch>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM tag_migration_batches WHERE batch_number = ?",
        BATCH_COLUMNS
    ))
    .bind(batch_number)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(batch_from_row).transpose()
}

/// Most recent batches first
pub async fn list_batches(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<MigrationBatch>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM tag_migration_batches ORDER BY batch_number DESC LIMIT ?",
        BATCH_COLUMNS
    ))
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(batch_from_row).collect()
}

pub async fn load_batch_errors(
    conn: &mut SqliteConnection,
    batch_number: i64,
) -> Result<Vec<BatchWorkError>> {
    let rows = sqlx::query(
        "SELECT work_id, error, recorded_at FROM migration_batch_errors WHERE batch_number = ? ORDER BY recorded_at, work_id",
    )
    .bind(batch_number)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            let work_id: String = row.get("work_id");
            let recorded_at: String = row.get("recorded_at");
            Ok(BatchWorkError {
                work_id: parse_work_id(&work_id)?,
                error: row.get("error"),
                recorded_at: time::from_db(&recorded_at)?,
            })
        })
        .collect()
}

async fn save_batch(conn: &mut SqliteConnection, batch: &MigrationBatch) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tag_migration_batches
        SET status = ?, works_total = ?, works_processed = ?, works_skipped = ?, errors_count = ?,
            started_at = ?, completed_at = ?, last_error = ?
        WHERE batch_number = ?
        "#,
    )
    .bind(batch.status.as_str())
    .bind(batch.works_total)
    .bind(batch.works_processed)
    .bind(batch.works_skipped)
    .bind(batch.errors_count)
    .bind(batch.started_at.map(time::to_db))
    .bind(batch.completed_at.map(time::to_db))
    .bind(&batch.last_error)
    .bind(batch.batch_number)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Predicate over `work_tag_assignments a` binding the rule version once
const NEEDS_MIGRATION: &str = "(a.prominence = 'unassigned' \
    OR (a.auto_assigned = 1 AND (a.migration_batch IS NULL OR a.migration_batch != ?)))";

/// Works needing migration
///
/// Skips works that already failed in this batch, and works that failed
/// under `rule_version` in an earlier batch and have not been edited since.
async fn select_candidates(
    conn: &mut SqliteConnection,
    rule_version: i64,
    batch_number: Option<i64>,
    dry_run: bool,
    after: Option<&str>,
    limit: i64,
) -> Result<Vec<String>> {
    let sql = format!(
        r#"
        SELECT DISTINCT a.work_id FROM work_tag_assignments a
        WHERE {}
          AND a.work_id NOT IN (
              SELECT e.work_id FROM migration_batch_errors e
              JOIN tag_migration_batches b ON b.batch_number = e.batch_number
              JOIN works w ON w.guid = e.work_id
              WHERE e.batch_number = ?
                 OR (b.rule_version = ? AND b.dry_run = ? AND e.recorded_at >= w.updated_at)
          )
          AND a.work_id > ?
        ORDER BY a.work_id
        LIMIT ?
        "#,
        NEEDS_MIGRATION
    );

    let ids = sqlx::query_scalar(&sql)
        .bind(rule_version)
        .bind(batch_number.unwrap_or(-1))
        .bind(rule_version)
        .bind(dry_run)
        .bind(after.unwrap_or(""))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;
    Ok(ids)
}

async fn still_needs_migration(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    rule_version: i64,
) -> Result<bool> {
    let sql = format!(
        "SELECT EXISTS (SELECT 1 FROM work_tag_assignments a WHERE a.work_id = ? AND {})",
        NEEDS_MIGRATION
    );
    let exists: i64 = sqlx::query_scalar(&sql)
        .bind(work_id.to_string())
        .bind(rule_version)
        .fetch_one(&mut *conn)
        .await?;
    Ok(exists != 0)
}

enum WorkOutcome {
    Classified { changed: usize },
    Skipped,
}

/// Classify one work in its own transaction
///
/// A dry run classifies and rolls back. With `queue_publish`, a changed work's
/// scores are queued in the same transaction.
async fn classify_one(
    pool: &SqlitePool,
    work_id: WorkId,
    rules: &RuleSet,
    config: &TomlConfig,
    dry_run: bool,
    queue_publish: bool,
) -> Result<WorkOutcome> {
    let mut tx = pool.begin().await?;

    // An author edit may have settled this work since it was selected
    if !still_needs_migration(&mut tx, work_id, rules.version()).await? {
        tx.rollback().await?;
        return Ok(WorkOutcome::Skipped);
    }

    let outcome = classifier::classify_work(&mut tx, work_id, rules, config).await?;

    if dry_run {
        for assignment in outcome.assignments.iter().filter(|a| a.auto_assigned) {
            info!(
                work_id = %work_id,
                tag = %assignment.tag_name,
                tag_type = %assignment.tag_type,
                prominence = %assignment.prominence,
                score = assignment.prominence_score,
                "Dry run: would assign prominence"
            );
        }
        tx.rollback().await?;
    } else {
        if queue_publish && outcome.changed > 0 {
            publish::queue_score_publish(&mut tx, work_id, config, time::now()).await?;
        }
        tx.commit().await?;
    }

    Ok(WorkOutcome::Classified {
        changed: outcome.changed,
    })
}

/// Drives migration batches for one database
pub struct BatchRunner {
    pool: SqlitePool,
    config: Arc<TomlConfig>,
    events: EventBus,
    dry_run: bool,
    publish: bool,
    /// Last work visited by a dry run; dry runs leave the selection unchanged
    dry_run_cursor: Option<String>,
}

impl BatchRunner {
    pub fn new(pool: SqlitePool, config: Arc<TomlConfig>, events: EventBus) -> Self {
        Self {
            pool,
            config,
            events,
            dry_run: false,
            publish: false,
            dry_run_cursor: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Queue score publishes for works a batch commits
    pub fn with_publishing(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    /// Find a batch to resume, or refuse when another version is mid-run
    async fn resumable_batch(&self, conn: &mut SqliteConnection, rule_version: i64) -> Result<Option<MigrationBatch>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tag_migration_batches WHERE status IN ('running', 'cancelled') AND dry_run = 0 ORDER BY batch_number DESC",
            BATCH_COLUMNS
        ))
        .fetch_all(&mut *conn)
        .await?;

        let open = rows.iter().map(batch_from_row).collect::<Result<Vec<_>>>()?;
        if let Some(other) = open
            .iter()
            .find(|b| b.status == BatchStatus::Running && b.rule_version != rule_version)
        {
            return Err(Error::InvalidInput(format!(
                "Batch {} for rule version {} is still running",
                other.batch_number, other.rule_version
            )));
        }

        Ok(open.into_iter().find(|b| b.rule_version == rule_version))
    }

    async fn create_batch(
        &self,
        conn: &mut SqliteConnection,
        rule_version: i64,
        works_total: i64,
    ) -> Result<MigrationBatch> {
        let batch_number: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tag_migration_batches (rule_version, status, migration_strategy, dry_run, works_total)
            VALUES (?, 'pending', ?, ?, ?)
            RETURNING batch_number
            "#,
        )
        .bind(rule_version)
        .bind(&self.config.batch.strategy)
        .bind(self.dry_run)
        .bind(works_total)
        .fetch_one(&mut *conn)
        .await?;

        load_batch(conn, batch_number)
            .await?
            .ok_or_else(|| Error::Internal(format!("Batch {} vanished after insert", batch_number)))
    }

    /// Process up to `batch_size` works for `rule_version`
    ///
    /// Resumes an interrupted batch for the same version before opening a
    /// new one. Cancellation is checked between works, never inside one.
    pub async fn run_batch(
        &mut self,
        batch_size: i64,
        rule_version: i64,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        if batch_size <= 0 {
            return Err(Error::InvalidInput("batch_size must be positive".to_string()));
        }

        let (mut batch, candidates, rules) = {
            let mut conn = self.pool.acquire().await?;
            let rules = Arc::new(RuleSet::load(&mut conn, rule_version).await?);

            let resumed = if self.dry_run {
                None
            } else {
                self.resumable_batch(&mut conn, rule_version).await?
            };

            match resumed {
                Some(mut batch) => {
                    let candidates = select_candidates(
                        &mut conn,
                        rule_version,
                        Some(batch.batch_number),
                        false,
                        None,
                        batch.remaining(),
                    )
                    .await?;
                    info!(
                        batch_number = batch.batch_number,
                        rule_version,
                        attempted = batch.attempted(),
                        works_total = batch.works_total,
                        "Resuming migration batch"
                    );
                    if batch.status == BatchStatus::Cancelled {
                        batch.transition_to(BatchStatus::Running)?;
                    }
                    save_batch(&mut conn, &batch).await?;
                    (batch, candidates, rules)
                }
                None => {
                    let after = if self.dry_run { self.dry_run_cursor.clone() } else { None };
                    let candidates =
                        select_candidates(&mut conn, rule_version, None, self.dry_run, after.as_deref(), batch_size)
                            .await?;
                    if candidates.is_empty() {
                        debug!(rule_version, "No works need migration");
                        return Ok(BatchResult {
                            batch_number: None,
                            processed: 0,
                            skipped: 0,
                            errors: 0,
                            status: BatchStatus::Completed,
                        });
                    }

                    let mut batch = self
                        .create_batch(&mut conn, rule_version, candidates.len() as i64)
                        .await?;
                    batch.transition_to(BatchStatus::Running)?;
                    save_batch(&mut conn, &batch).await?;
                    info!(
                        batch_number = batch.batch_number,
                        rule_version,
                        works_total = batch.works_total,
                        dry_run = self.dry_run,
                        strategy = %batch.migration_strategy,
                        "Started migration batch"
                    );
                    (batch, candidates, rules)
                }
            }
        };

        let mut cancelled = false;
        for guid in &candidates {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let work_id = parse_work_id(guid)?;
            self.run_one(&mut batch, work_id, rules.clone()).await?;

            if self.dry_run {
                self.dry_run_cursor = Some(guid.clone());
            }
            if batch.attempted() % PROGRESS_EVERY == 0 {
                self.emit_progress(&batch);
            }
        }

        let next = if cancelled {
            BatchStatus::Cancelled
        } else if batch.error_rate() > self.config.batch.max_error_rate {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        batch.transition_to(next)?;

        {
            let mut conn = self.pool.acquire().await?;
            save_batch(&mut conn, &batch).await?;
        }

        self.emit_progress(&batch);
        self.events.emit_lossy(EngineEvent::BatchFinished {
            batch_number: batch.batch_number,
            status: batch.status.to_string(),
            works_processed: batch.works_processed,
            errors: batch.errors_count,
        });

        if batch.status == BatchStatus::Failed {
            warn!(
                batch_number = batch.batch_number,
                errors = batch.errors_count,
                error_rate = batch.error_rate(),
                max_error_rate = self.config.batch.max_error_rate,
                "Migration batch failed: error rate above threshold"
            );
        } else {
            info!(
                batch_number = batch.batch_number,
                status = %batch.status,
                processed = batch.works_processed,
                skipped = batch.works_skipped,
                errors = batch.errors_count,
                "Migration batch finished"
            );
        }

        Ok(BatchResult {
            batch_number: Some(batch.batch_number),
            processed: batch.works_processed,
            skipped: batch.works_skipped,
            errors: batch.errors_count,
            status: batch.status,
        })
    }

    /// Classify one work and record its outcome on the batch
    async fn run_one(&self, batch: &mut MigrationBatch, work_id: WorkId, rules: Arc<RuleSet>) -> Result<()> {
        let pool = self.pool.clone();
        let config = self.config.clone();
        let dry_run = self.dry_run;
        let queue_publish = self.publish;

        let result = retry_on_lock("migrate work", self.config.batch.max_lock_wait_ms, || {
            let pool = pool.clone();
            let config = config.clone();
            let rules = rules.clone();
            async move { classify_one(&pool, work_id, &rules, &config, dry_run, queue_publish).await }
        })
        .await;

        let committed_change = !dry_run && matches!(result, Ok(WorkOutcome::Classified { changed }) if changed > 0);

        let mut conn = self.pool.acquire().await?;
        match result {
            Ok(WorkOutcome::Classified { changed }) => {
                batch.works_processed += 1;
                if committed_change {
                    self.events.emit_lossy(EngineEvent::WorkClassified {
                        work_id,
                        changed,
                        rule_version: batch.rule_version,
                        timestamp: time::now(),
                    });
                }
            }
            Ok(WorkOutcome::Skipped) | Err(Error::NotFound(_)) => {
                batch.works_skipped += 1;
            }
            Err(e) => {
                let err = Error::Classification {
                    work_id,
                    reason: e.to_string(),
                };
                warn!(batch_number = batch.batch_number, error = %err, "Skipping work after classification error");

                sqlx::query(
                    "INSERT OR REPLACE INTO migration_batch_errors (batch_number, work_id, error, recorded_at) VALUES (?, ?, ?, ?)",
                )
                .bind(batch.batch_number)
                .bind(work_id.to_string())
                .bind(err.to_string())
                .bind(time::to_db(time::now()))
                .execute(&mut *conn)
                .await?;

                batch.errors_count += 1;
                batch.last_error = Some(err.to_string());
            }
        }
        save_batch(&mut conn, batch).await?;
        Ok(())
    }

    fn emit_progress(&self, batch: &MigrationBatch) {
        self.events.emit_lossy(EngineEvent::BatchProgress {
            batch_number: batch.batch_number,
            works_processed: batch.works_processed,
            works_total: batch.works_total,
            errors: batch.errors_count,
        });
    }

    /// Run batches until nothing is left, a batch fails or attempts no
    /// work, or `cancel` fires
    ///
    /// Works that fail are not selected again by later batches, so a batch
    /// of nothing but tolerated failures still moves the run forward.
    pub async fn run_to_completion(
        &mut self,
        batch_size: i64,
        rule_version: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchResult>> {
        let mut results = Vec::new();
        loop {
            let result = self.run_batch(batch_size, rule_version, cancel).await?;
            let stalled = result.processed + result.skipped + result.errors == 0;
            if stalled && result.batch_number.is_some() {
                warn!(batch_number = ?result.batch_number, "Migration batch attempted no works; stopping");
            }
            let stop = result.batch_number.is_none() || stalled || result.status != BatchStatus::Completed;
            if result.batch_number.is_some() {
                results.push(result);
            }
            if stop {
                break;
            }
        }
        Ok(results)
    }
}
