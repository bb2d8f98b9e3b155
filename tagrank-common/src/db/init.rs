//! Database initialization
//!
//! Creates the database file on first run, applies connection pragmas,
//! upgrades legacy tables in place and then creates every missing table
//! and index idempotently.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(250));

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    crate::db::migrations::run_migrations(&pool).await?;
    create_schema(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema (tests, dry runs)
///
/// The pool never recycles its connection; doing so would drop the database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    crate::db::migrations::run_migrations(&pool).await?;
    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;

    // Taxonomy
    create_tags_table(pool).await?;
    create_tag_relationships_table(pool).await?;

    // Works and classification state
    create_works_table(pool).await?;
    create_work_tag_assignments_table(pool).await?;
    create_work_tag_summaries_table(pool).await?;
    create_work_tag_metrics_table(pool).await?;

    // Reference data
    create_tag_prominence_rules_table(pool).await?;
    create_universe_family_rules_table(pool).await?;

    // Batch processing
    create_tag_migration_batches_table(pool).await?;
    create_migration_batch_errors_table(pool).await?;

    // Ranking
    create_work_engagement_table(pool).await?;
    create_work_ranking_scores_table(pool).await?;
    create_score_publish_outbox_table(pool).await?;

    Ok(())
}

pub(crate) async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the tags table
///
/// Names are unique case-insensitively. Exactly one of `is_canonical` and
/// `canonical_name` holds.
pub async fn create_tags_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL COLLATE NOCASE UNIQUE,
            type TEXT NOT NULL CHECK (type IN (
                'fandom', 'character', 'relationship', 'freeform',
                'rating', 'warning', 'category', 'additional'
            )),
            is_canonical INTEGER NOT NULL DEFAULT 1,
            canonical_name TEXT,
            use_count INTEGER NOT NULL DEFAULT 0 CHECK (use_count >= 0),
            created_at TEXT NOT NULL,
            CHECK (
                (is_canonical = 1 AND canonical_name IS NULL)
                OR (is_canonical = 0 AND canonical_name IS NOT NULL)
            )
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tags_type ON tags(type)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the tag_relationships table (directed edges, no self-loops)
pub async fn create_tag_relationships_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_relationships (
            parent_tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            child_tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            relationship_type TEXT NOT NULL CHECK (relationship_type IN ('parent_child', 'synonym', 'related')),
            created_at TEXT NOT NULL,
            PRIMARY KEY (parent_tag_id, child_tag_id, relationship_type),
            CHECK (parent_tag_id != child_tag_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tag_relationships_child ON tag_relationships(child_tag_id, relationship_type)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the works table
///
/// Only the fields this subsystem needs; the host application owns the rest.
/// `tag_version` increments on every assignment or word count change.
pub async fn create_works_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS works (
            guid TEXT PRIMARY KEY,
            word_count INTEGER NOT NULL DEFAULT 0 CHECK (word_count >= 0),
            tag_version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the work_tag_assignments join table
pub async fn create_work_tag_assignments_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_tag_assignments (
            work_id TEXT NOT NULL REFERENCES works(guid) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            prominence TEXT NOT NULL DEFAULT 'unassigned'
                CHECK (prominence IN ('primary', 'secondary', 'micro', 'unassigned')),
            prominence_score REAL NOT NULL DEFAULT 0.0
                CHECK (prominence_score >= 0.0 AND prominence_score <= 1.0),
            auto_assigned INTEGER NOT NULL DEFAULT 1,
            migration_batch INTEGER,
            needs_review INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (work_id, tag_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_assignments_prominence ON work_tag_assignments(prominence)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_assignments_migration ON work_tag_assignments(auto_assigned, migration_batch)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the work_tag_summaries table (1:1 with works)
pub async fn create_work_tag_summaries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_tag_summaries (
            work_id TEXT PRIMARY KEY REFERENCES works(guid) ON DELETE CASCADE,
            primary_relationship_count INTEGER NOT NULL DEFAULT 0,
            secondary_relationship_count INTEGER NOT NULL DEFAULT 0,
            micro_relationship_count INTEGER NOT NULL DEFAULT 0,
            relationship_tag_count INTEGER NOT NULL DEFAULT 0,
            major_tag_count INTEGER NOT NULL DEFAULT 0,
            total_tag_count INTEGER NOT NULL DEFAULT 0,
            auto_assigned_count INTEGER NOT NULL DEFAULT 0,
            needs_author_review INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the work_tag_metrics table (1:1 with works)
pub async fn create_work_tag_metrics_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_tag_metrics (
            work_id TEXT PRIMARY KEY REFERENCES works(guid) ON DELETE CASCADE,
            tags_per_1k_words REAL NOT NULL DEFAULT 0.0,
            relationship_tag_ratio REAL NOT NULL DEFAULT 0.0,
            unique_fandom_count INTEGER NOT NULL DEFAULT 0,
            potential_tag_spam INTEGER NOT NULL DEFAULT 0,
            is_crossover INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the tag_prominence_rules table (versioned reference data)
pub async fn create_tag_prominence_rules_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_prominence_rules (
            rule_version INTEGER NOT NULL,
            tag_name TEXT NOT NULL COLLATE NOCASE,
            tag_type TEXT NOT NULL,
            default_prominence TEXT NOT NULL
                CHECK (default_prominence IN ('primary', 'secondary', 'micro')),
            min_word_threshold INTEGER NOT NULL DEFAULT 0,
            requires_manual_review INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (rule_version, tag_name, tag_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the universe_family_rules table (pattern rules stored as data)
pub async fn create_universe_family_rules_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS universe_family_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_version INTEGER NOT NULL,
            family_name TEXT NOT NULL,
            match_kind TEXT NOT NULL CHECK (match_kind IN ('exact', 'prefix', 'contains')),
            pattern TEXT NOT NULL,
            UNIQUE (rule_version, family_name, match_kind, pattern)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the tag_migration_batches table
pub async fn create_tag_migration_batches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_migration_batches (
            batch_number INTEGER PRIMARY KEY,
            rule_version INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
            migration_strategy TEXT NOT NULL,
            dry_run INTEGER NOT NULL DEFAULT 0,
            works_total INTEGER NOT NULL DEFAULT 0,
            works_processed INTEGER NOT NULL DEFAULT 0,
            works_skipped INTEGER NOT NULL DEFAULT 0,
            errors_count INTEGER NOT NULL DEFAULT 0,
            started_at TEXT,
            completed_at TEXT,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the migration_batch_errors table (per-work failures)
pub async fn create_migration_batch_errors_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migration_batch_errors (
            batch_number INTEGER NOT NULL REFERENCES tag_migration_batches(batch_number) ON DELETE CASCADE,
            work_id TEXT NOT NULL,
            error TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (batch_number, work_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the work_engagement table (host-supplied counters)
pub async fn create_work_engagement_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_engagement (
            work_id TEXT PRIMARY KEY REFERENCES works(guid) ON DELETE CASCADE,
            hits INTEGER NOT NULL DEFAULT 0 CHECK (hits >= 0),
            kudos_count INTEGER NOT NULL DEFAULT 0 CHECK (kudos_count >= 0),
            comment_count INTEGER NOT NULL DEFAULT 0 CHECK (comment_count >= 0),
            bookmark_count INTEGER NOT NULL DEFAULT 0 CHECK (bookmark_count >= 0),
            engagement_version INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the work_ranking_scores table (score cache)
pub async fn create_work_ranking_scores_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_ranking_scores (
            work_id TEXT PRIMARY KEY REFERENCES works(guid) ON DELETE CASCADE,
            quality_score INTEGER NOT NULL,
            engagement_rate INTEGER NOT NULL,
            comment_quality INTEGER NOT NULL,
            discovery_boost INTEGER NOT NULL,
            tag_version INTEGER NOT NULL,
            engagement_version INTEGER NOT NULL,
            computed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ranking_quality ON work_ranking_scores(quality_score)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the score_publish_outbox table
pub async fn create_score_publish_outbox_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS score_publish_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'delivered', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at_ms INTEGER NOT NULL,
            last_error TEXT,
            created_at TEXT NOT NULL,
            delivered_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_outbox_due ON score_publish_outbox(status, next_attempt_at_ms)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
