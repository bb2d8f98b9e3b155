//! Search-index publisher
//!
//! Scores are a derived projection. A work's score document is written to
//! `score_publish_outbox` in the same transaction as the change it reflects;
//! the [`Publisher`] drains due rows to a [`SearchIndex`] with exponential
//! backoff per row.
//! Delivery is at-least-once, and a failed publish never touches the
//! classification state it was derived from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tagrank_common::config::{PublishConfig, TomlConfig};
use tagrank_common::events::{EngineEvent, EventBus};
use tagrank_common::models::RankingScores;
use tagrank_common::{time, Error, Result, WorkId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{self, CachedScores};
use crate::works::parse_work_id;

/// Rows examined per drain pass
const DRAIN_LIMIT: i64 = 100;

/// Document sent to the search index; field names are the index contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDocument {
    pub work_id: WorkId,
    pub quality_score: u8,
    pub engagement_rate: u8,
    pub comment_quality: u8,
    pub discovery_boost: u8,
    pub tag_version: i64,
    pub engagement_version: i64,
    pub computed_at: DateTime<Utc>,
}

impl ScoreDocument {
    pub fn scores(&self) -> RankingScores {
        RankingScores {
            quality_score: self.quality_score,
            engagement_rate: self.engagement_rate,
            comment_quality: self.comment_quality,
            discovery_boost: self.discovery_boost,
        }
    }
}

impl From<&CachedScores> for ScoreDocument {
    fn from(cached: &CachedScores) -> Self {
        Self {
            work_id: cached.work_id,
            quality_score: cached.scores.quality_score,
            engagement_rate: cached.scores.engagement_rate,
            comment_quality: cached.scores.comment_quality,
            discovery_boost: cached.scores.discovery_boost,
            tag_version: cached.tag_version,
            engagement_version: cached.engagement_version,
            computed_at: cached.computed_at,
        }
    }
}

/// Destination for score documents
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Upsert one document; repeated delivery of the same document must be harmless
    async fn publish(&self, document: &ScoreDocument) -> Result<()>;
}

/// JSON-over-HTTP index: `PUT {endpoint}/{work_id}`
pub struct HttpSearchIndex {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpSearchIndex {
    pub fn new(endpoint: &str, request_timeout_ms: u64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("tagrank/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()
            .map_err(|e| Error::Publish(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn publish(&self, document: &ScoreDocument) -> Result<()> {
        let url = format!("{}/{}", self.endpoint, document.work_id);

        let response = self
            .http_client
            .put(&url)
            .json(document)
            .send()
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Publish(format!("{} returned {}: {}", url, status.as_u16(), body)));
        }

        debug!(work_id = %document.work_id, url = %url, "Published score document");
        Ok(())
    }
}

/// Index held in memory, with injectable failures
#[derive(Default)]
pub struct InMemorySearchIndex {
    documents: Mutex<HashMap<WorkId, ScoreDocument>>,
    failures_remaining: AtomicUsize,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, work_id: WorkId) -> Option<ScoreDocument> {
        self.documents
            .lock()
            .ok()
            .and_then(|docs| docs.get(&work_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn publish(&self, document: &ScoreDocument) -> Result<()> {
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::Publish("injected failure".to_string()));
        }

        let mut documents = self
            .documents
            .lock()
            .map_err(|_| Error::Internal("search index lock poisoned".to_string()))?;
        documents.insert(document.work_id, document.clone());
        Ok(())
    }
}

/// Queue a document, replacing any pending one for the same work
pub async fn enqueue(
    conn: &mut SqliteConnection,
    document: &ScoreDocument,
    now: DateTime<Utc>,
) -> Result<()> {
    let payload = serde_json::to_string(document)
        .map_err(|e| Error::Internal(format!("Failed to serialize score document: {}", e)))?;

    let updated = sqlx::query(
        r#"
        UPDATE score_publish_outbox
        SET payload = ?, attempts = 0, next_attempt_at_ms = ?, last_error = NULL
        WHERE work_id = ? AND status = 'pending'
        "#,
    )
    .bind(&payload)
    .bind(now.timestamp_millis())
    .bind(document.work_id.to_string())
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        sqlx::query(
            r#"
            INSERT INTO score_publish_outbox (work_id, payload, status, attempts, next_attempt_at_ms, created_at)
            VALUES (?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(document.work_id.to_string())
        .bind(&payload)
        .bind(now.timestamp_millis())
        .bind(time::to_db(now))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Recompute the work's scores and queue them on `conn`
///
/// Callers pass the transaction that wrote the work, so the outbox row
/// commits or rolls back with it. Delivery happens later on the publisher.
pub async fn queue_score_publish(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    config: &TomlConfig,
    now: DateTime<Utc>,
) -> Result<()> {
    let cached = cache::recompute(conn, work_id, config, now).await?;
    enqueue(conn, &ScoreDocument::from(&cached), now).await
}

/// Backoff before retry number `attempts` (1-based)
pub fn backoff_ms(attempts: i64, config: &PublishConfig) -> u64 {
    let exponent = (attempts.max(1) - 1).min(32) as u32;
    config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(config.max_backoff_ms)
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Counts of outbox rows by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub pending: i64,
    pub delivered: i64,
    pub failed: i64,
}

pub async fn outbox_counts(conn: &mut SqliteConnection) -> Result<OutboxCounts> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM score_publish_outbox GROUP BY status")
        .fetch_all(&mut *conn)
        .await?;

    let mut counts = OutboxCounts::default();
    for row in rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        match status.as_str() {
            "pending" => counts.pending = n,
            "delivered" => counts.delivered = n,
            "failed" => counts.failed = n,
            _ => {}
        }
    }
    Ok(counts)
}

/// Background worker draining the outbox
pub struct Publisher {
    pool: SqlitePool,
    index: Arc<dyn SearchIndex>,
    config: PublishConfig,
    events: EventBus,
}

impl Publisher {
    pub fn new(
        pool: SqlitePool,
        index: Arc<dyn SearchIndex>,
        config: PublishConfig,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            index,
            config,
            events,
        }
    }

    /// Deliver every row due at `now_ms`
    pub async fn drain_once(&self, now_ms: i64) -> Result<DrainReport> {
        let rows = sqlx::query(
            r#"
            SELECT id, work_id, payload, attempts
            FROM score_publish_outbox
            WHERE status = 'pending' AND next_attempt_at_ms <= ?
            ORDER BY next_attempt_at_ms, id
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(DRAIN_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        let mut report = DrainReport::default();

        for row in rows {
            let id: i64 = row.get("id");
            let work_id: String = row.get("work_id");
            let payload: String = row.get("payload");
            let attempts: i64 = row.get::<i64, _>("attempts") + 1;

            let outcome = match serde_json::from_str::<ScoreDocument>(&payload) {
                Ok(document) => self.index.publish(&document).await.map(|_| document),
                Err(e) => Err(Error::Publish(format!("Corrupt outbox payload: {}", e))),
            };

            match outcome {
                Ok(document) => {
                    sqlx::query(
                        "UPDATE score_publish_outbox SET status = 'delivered', attempts = ?, delivered_at = ?, last_error = NULL WHERE id = ?",
                    )
                    .bind(attempts)
                    .bind(time::to_db(time::now()))
                    .bind(id)
                    .execute(&self.pool)
                    .await?;

                    report.delivered += 1;
                    self.events.emit_lossy(EngineEvent::ScorePublished {
                        work_id: document.work_id,
                        scores: document.scores(),
                    });
                }
                Err(e) if attempts >= self.config.max_attempts => {
                    sqlx::query(
                        "UPDATE score_publish_outbox SET status = 'failed', attempts = ?, last_error = ? WHERE id = ?",
                    )
                    .bind(attempts)
                    .bind(e.to_string())
                    .bind(id)
                    .execute(&self.pool)
                    .await?;

                    error!(work_id = %work_id, attempts, error = %e, "Giving up on score publish");
                    report.failed += 1;
                    self.events.emit_lossy(EngineEvent::ScorePublishFailed {
                        work_id: parse_work_id(&work_id)?,
                        attempts,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = backoff_ms(attempts, &self.config);
                    sqlx::query(
                        "UPDATE score_publish_outbox SET attempts = ?, next_attempt_at_ms = ?, last_error = ? WHERE id = ?",
                    )
                    .bind(attempts)
                    .bind(now_ms + delay as i64)
                    .bind(e.to_string())
                    .bind(id)
                    .execute(&self.pool)
                    .await?;

                    warn!(work_id = %work_id, attempts, backoff_ms = delay, error = %e, "Score publish failed, will retry");
                    report.retried += 1;
                }
            }
        }

        Ok(report)
    }

    /// Poll the outbox until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(poll_interval_ms = self.config.poll_interval_ms, "Score publisher started");
        let interval = time::millis_to_duration(self.config.poll_interval_ms);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.drain_once(Utc::now().timestamp_millis()).await {
                        warn!(error = %e, "Score publisher pass failed");
                    }
                }
            }
        }

        info!("Score publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagrank_common::db::init_memory_database;
    use uuid::Uuid;

    fn document(work_id: WorkId, quality: u8) -> ScoreDocument {
        ScoreDocument {
            work_id,
            quality_score: quality,
            engagement_rate: 10,
            comment_quality: 20,
            discovery_boost: 30,
            tag_version: 1,
            engagement_version: 0,
            computed_at: time::now(),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = PublishConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..PublishConfig::default()
        };
        assert_eq!(backoff_ms(1, &config), 100);
        assert_eq!(backoff_ms(2, &config), 200);
        assert_eq!(backoff_ms(4, &config), 800);
        assert_eq!(backoff_ms(5, &config), 1000);
        assert_eq!(backoff_ms(60, &config), 1000);
    }

    #[test]
    fn test_document_uses_contract_field_names() {
        let json = serde_json::to_value(document(Uuid::nil(), 55)).unwrap();
        for field in ["quality_score", "engagement_rate", "comment_quality", "discovery_boost"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_after_backoff() {
        let pool = init_memory_database().await.unwrap();
        let index = Arc::new(InMemorySearchIndex::new());
        let config = PublishConfig {
            initial_backoff_ms: 100,
            ..PublishConfig::default()
        };
        let publisher = Publisher::new(pool.clone(), index.clone(), config, EventBus::default());
        let work_id = Uuid::new_v4();
        let now = time::now();

        {
            let mut conn = pool.acquire().await.unwrap();
            enqueue(&mut conn, &document(work_id, 70), now).await.unwrap();
        }

        index.fail_next(1);
        let first = publisher.drain_once(now.timestamp_millis()).await.unwrap();
        assert_eq!(first, DrainReport { delivered: 0, retried: 1, failed: 0 });
        assert!(index.get(work_id).is_none());

        // Not yet due
        let early = publisher.drain_once(now.timestamp_millis() + 50).await.unwrap();
        assert_eq!(early, DrainReport::default());

        let second = publisher.drain_once(now.timestamp_millis() + 100).await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(index.get(work_id).unwrap().quality_score, 70);
    }

    #[tokio::test]
    async fn test_exhausted_publish_is_marked_failed() {
        let pool = init_memory_database().await.unwrap();
        let index = Arc::new(InMemorySearchIndex::new());
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let config = PublishConfig {
            max_attempts: 2,
            initial_backoff_ms: 0,
            ..PublishConfig::default()
        };
        let publisher = Publisher::new(pool.clone(), index.clone(), config, events);
        let work_id = Uuid::new_v4();
        let now = time::now();

        let mut conn = pool.acquire().await.unwrap();
        enqueue(&mut conn, &document(work_id, 70), now).await.unwrap();
        drop(conn);

        index.fail_next(5);
        publisher.drain_once(now.timestamp_millis()).await.unwrap();
        let last = publisher.drain_once(now.timestamp_millis()).await.unwrap();
        assert_eq!(last.failed, 1);

        let mut conn = pool.acquire().await.unwrap();
        let counts = outbox_counts(&mut conn).await.unwrap();
        assert_eq!(counts, OutboxCounts { pending: 0, delivered: 0, failed: 1 });

        match rx.recv().await.unwrap() {
            EngineEvent::ScorePublishFailed { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_queued_publish_follows_its_transaction() {
        let pool = init_memory_database().await.unwrap();
        let config = TomlConfig::default();
        let work_id = Uuid::new_v4();
        let now = time::now();

        let mut tx = pool.begin().await.unwrap();
        crate::works::upsert_work_record(&mut tx, work_id, 1200, now).await.unwrap();
        queue_score_publish(&mut tx, work_id, &config, now).await.unwrap();
        tx.rollback().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(outbox_counts(&mut conn).await.unwrap(), OutboxCounts::default());
        drop(conn);

        let mut tx = pool.begin().await.unwrap();
        crate::works::upsert_work_record(&mut tx, work_id, 1200, now).await.unwrap();
        queue_score_publish(&mut tx, work_id, &config, now).await.unwrap();
        tx.commit().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(outbox_counts(&mut conn).await.unwrap().pending, 1);
        let cached = cache::load_cached(&mut conn, work_id).await.unwrap().unwrap();
        assert_eq!(cached.tag_version, 0);
    }

    #[tokio::test]
    async fn test_pending_document_is_replaced() {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let work_id = Uuid::new_v4();
        let now = time::now();

        enqueue(&mut conn, &document(work_id, 10), now).await.unwrap();
        enqueue(&mut conn, &document(work_id, 90), now).await.unwrap();

        let counts = outbox_counts(&mut conn).await.unwrap();
        assert_eq!(counts.pending, 1);
        drop(conn);

        let index = Arc::new(InMemorySearchIndex::new());
        let publisher = Publisher::new(pool.clone(), index.clone(), PublishConfig::default(), EventBus::default());
        publisher.drain_once(now.timestamp_millis()).await.unwrap();
        assert_eq!(index.get(work_id).unwrap().quality_score, 90);
    }
}
