//! Engine facade
//!
//! [`TagEngine`] owns the pool, configuration and event bus, and runs every
//! per-work mutation in a single transaction: assignment writes, tag version
//! bump, summary, metrics and the queued score publish all commit together
//! or not at all.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tagrank_common::config::TomlConfig;
use tagrank_common::events::{EngineEvent, EventBus};
use tagrank_common::models::{
    EngagementCounters, ProminenceRule, WorkInput, WorkTagAssignment, WorkTagMetrics, WorkTagSummary,
};
use tagrank_common::{time, Error, Prominence, Result, TagId, WorkId};
use tracing::info;

use crate::batch::{self, BatchRunner, BatchWorkError, MigrationBatch};
use crate::cache::{self, CachedScores};
use crate::classifier::{self, ClassifyOutcome, OverrideOutcome};
use crate::families::{self, LinkReport, UniverseFamilyRule};
use crate::metrics;
use crate::publish;
use crate::rules::{self, RuleSet};
use crate::search::{self, SearchQuery, SearchResults};
use crate::summary;
use crate::taxonomy::Taxonomy;
use crate::works;

#[derive(Clone)]
pub struct TagEngine {
    pool: SqlitePool,
    config: Arc<TomlConfig>,
    events: EventBus,
    publish: bool,
}

impl TagEngine {
    /// Score publishing is enabled when a search index endpoint is configured
    pub fn new(pool: SqlitePool, config: Arc<TomlConfig>, events: EventBus) -> Self {
        let publish = config.publish.endpoint.is_some();
        Self {
            pool,
            config,
            events,
            publish,
        }
    }

    pub fn with_publishing(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &TomlConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn queue_publish(&self, conn: &mut SqliteConnection, work_id: WorkId) -> Result<()> {
        if self.publish {
            publish::queue_score_publish(conn, work_id, &self.config, time::now()).await?;
        }
        Ok(())
    }

    fn emit_classified(&self, work_id: WorkId, outcome: &ClassifyOutcome, rule_version: i64) {
        self.events.emit_lossy(EngineEvent::WorkClassified {
            work_id,
            changed: outcome.changed,
            rule_version,
            timestamp: Utc::now(),
        });
    }

    /// Ingest a work's metadata and classify it
    ///
    /// Creates missing tags, attaches new tags as unassigned, detaches tags
    /// no longer listed, then classifies under `rule_version`.
    pub async fn upsert_work(&self, input: &WorkInput, rule_version: i64) -> Result<ClassifyOutcome> {
        let work_id = input.id;
        let tags = input.typed_tags();
        let now = time::now();

        let mut tx = self.pool.begin().await?;

        let word_count_changed = works::upsert_work_record(&mut tx, work_id, input.word_count, now).await?;
        let sync = works::sync_assignments(&mut tx, work_id, &tags, now).await?;
        if !sync.is_empty() {
            let touched: Vec<TagId> = sync.attached.iter().chain(&sync.detached).copied().collect();
            metrics::refresh_tag_use_counts(&mut tx, &touched).await?;
        }
        if word_count_changed || !sync.is_empty() {
            works::bump_tag_version(&mut tx, work_id, now).await?;
        }

        let rules = RuleSet::load(&mut tx, rule_version).await?;
        let outcome = classifier::classify_work(&mut tx, work_id, &rules, &self.config).await?;
        self.queue_publish(&mut tx, work_id).await?;

        tx.commit().await?;

        info!(
            work_id = %work_id,
            word_count = input.word_count,
            attached = sync.attached.len(),
            detached = sync.detached.len(),
            changed = outcome.changed,
            "Upserted work"
        );

        self.emit_classified(work_id, &outcome, rule_version);
        Ok(outcome)
    }

    /// Delete a work and everything derived from it
    pub async fn delete_work(&self, work_id: WorkId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let tag_ids = works::delete_work(&mut tx, work_id).await?;
        metrics::refresh_tag_use_counts(&mut tx, &tag_ids).await?;
        sqlx::query("DELETE FROM score_publish_outbox WHERE work_id = ? AND status = 'pending'")
            .bind(work_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(work_id = %work_id, tags = tag_ids.len(), "Deleted work");
        Ok(())
    }

    /// Store an engagement snapshot; returns the new engagement version
    pub async fn record_engagement(&self, work_id: WorkId, counters: &EngagementCounters) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        works::require_work(&mut tx, work_id).await?;
        let version = works::upsert_engagement(&mut tx, work_id, counters, time::now()).await?;
        self.queue_publish(&mut tx, work_id).await?;
        tx.commit().await?;

        Ok(version)
    }

    /// Author override of one tag's prominence
    pub async fn set_prominence(
        &self,
        work_id: WorkId,
        tag_id: TagId,
        level: Prominence,
    ) -> Result<OverrideOutcome> {
        let mut tx = self.pool.begin().await?;
        // Dropping the transaction on error rolls back, so a rejected override writes nothing
        let outcome = classifier::set_prominence(&mut tx, work_id, tag_id, level, &self.config).await?;
        self.queue_publish(&mut tx, work_id).await?;
        tx.commit().await?;

        self.events.emit_lossy(EngineEvent::ProminenceOverridden {
            work_id,
            tag_id,
            prominence: level,
            timestamp: Utc::now(),
        });
        Ok(outcome)
    }

    /// Reclassify a stored work under `rule_version`
    pub async fn classify_work(&self, work_id: WorkId, rule_version: i64) -> Result<ClassifyOutcome> {
        let mut tx = self.pool.begin().await?;
        let rules = RuleSet::load(&mut tx, rule_version).await?;
        let outcome = classifier::classify_work(&mut tx, work_id, &rules, &self.config).await?;
        if outcome.changed > 0 {
            self.queue_publish(&mut tx, work_id).await?;
        }
        tx.commit().await?;

        self.emit_classified(work_id, &outcome, rule_version);
        Ok(outcome)
    }

    pub async fn assignments(&self, work_id: WorkId) -> Result<Vec<WorkTagAssignment>> {
        let mut conn = self.pool.acquire().await?;
        works::require_work(&mut conn, work_id).await?;
        works::load_assignments(&mut conn, work_id).await
    }

    pub async fn summary(&self, work_id: WorkId) -> Result<WorkTagSummary> {
        let mut conn = self.pool.acquire().await?;
        works::require_work(&mut conn, work_id).await?;
        summary::load_summary(&mut conn, work_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Summary for work {}", work_id)))
    }

    pub async fn metrics(&self, work_id: WorkId) -> Result<WorkTagMetrics> {
        let mut conn = self.pool.acquire().await?;
        works::require_work(&mut conn, work_id).await?;
        metrics::load_metrics(&mut conn, work_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Metrics for work {}", work_id)))
    }

    /// Current scores, recomputed if the cache entry is stale
    pub async fn scores(&self, work_id: WorkId) -> Result<CachedScores> {
        let mut conn = self.pool.acquire().await?;
        cache::get_scores(&mut conn, work_id, &self.config, time::now()).await
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults> {
        let mut conn = self.pool.acquire().await?;
        search::search(&mut conn, query, &self.config, time::now()).await
    }

    /// Whether two works form a crossover pair
    pub async fn crossover(&self, work_a: WorkId, work_b: WorkId) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        works::require_work(&mut conn, work_a).await?;
        works::require_work(&mut conn, work_b).await?;

        let fandoms_a = metrics::counted_fandoms(
            &works::load_assignments(&mut conn, work_a).await?,
            &self.config.metrics,
        );
        let fandoms_b = metrics::counted_fandoms(
            &works::load_assignments(&mut conn, work_b).await?,
            &self.config.metrics,
        );

        let seeds: Vec<TagId> = fandoms_a.iter().chain(&fandoms_b).copied().collect();
        let taxonomy = Taxonomy::load_neighborhood(&mut conn, &seeds, &self.config.taxonomy).await?;
        Ok(taxonomy.pair_is_crossover(&fandoms_a, &fandoms_b))
    }

    /// Universe family of a fandom tag, if any
    pub async fn universe_family_of(&self, tag_id: TagId) -> Result<Option<TagId>> {
        let mut conn = self.pool.acquire().await?;
        let taxonomy = Taxonomy::load_neighborhood(&mut conn, &[tag_id], &self.config.taxonomy).await?;
        if taxonomy.tag(tag_id).is_none() {
            return Err(Error::NotFound(format!("Tag {}", tag_id)));
        }
        Ok(taxonomy.universe_family_of(tag_id))
    }

    /// Highest stored rule version, or 0 when no rules exist
    pub async fn latest_rule_version(&self) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        Ok(rules::latest_rule_version(&mut conn).await?.unwrap_or(0))
    }

    pub async fn save_rule(&self, rule: &ProminenceRule) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        rules::save_rule(&mut conn, rule).await
    }

    pub async fn save_family_rule(&self, rule: &UniverseFamilyRule) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        families::save_family_rule(&mut conn, rule).await
    }

    /// Create universe-family tags and links for `rule_version`
    pub async fn link_universe_families(&self, rule_version: i64) -> Result<LinkReport> {
        let mut tx = self.pool.begin().await?;
        let report = families::link_universe_families(&mut tx, rule_version, &self.config.taxonomy).await?;
        tx.commit().await?;
        Ok(report)
    }

    /// A migration batch with its per-work errors
    pub async fn batch(&self, batch_number: i64) -> Result<(MigrationBatch, Vec<BatchWorkError>)> {
        let mut conn = self.pool.acquire().await?;
        let found = batch::load_batch(&mut conn, batch_number)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Migration batch {}", batch_number)))?;
        let errors = batch::load_batch_errors(&mut conn, batch_number).await?;
        Ok((found, errors))
    }

    pub async fn recent_batches(&self, limit: i64) -> Result<Vec<MigrationBatch>> {
        let mut conn = self.pool.acquire().await?;
        batch::list_batches(&mut conn, limit).await
    }

    pub fn batch_runner(&self, dry_run: bool) -> BatchRunner {
        BatchRunner::new(self.pool.clone(), self.config.clone(), self.events.clone())
            .dry_run(dry_run)
            .with_publishing(self.publish)
    }
}
