//! Database schema migrations
//!
//! Versioned, idempotent upgrades for databases created by older releases.
//! Migrations run before table creation: a table that does not exist yet is
//! skipped here and later created with the current schema.
//!
//! Never modify an existing migration; add a new one and bump
//! `CURRENT_SCHEMA_VERSION`.

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database (0 when none recorded)
async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
    )
    .bind(table)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Add columns that are missing from `table`
///
/// Returns how many columns were added. Column names and definitions are
/// compile-time constants, never user input.
async fn add_missing_columns(
    pool: &SqlitePool,
    table: &str,
    columns: &[(&str, &str)],
) -> Result<usize> {
    let mut added = 0;

    for (column_name, definition) in columns {
        let has_column: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
                .bind(table)
                .bind(column_name)
                .fetch_one(pool)
                .await?;

        if has_column > 0 {
            continue;
        }

        match sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column_name, definition
        ))
        .execute(pool)
        .await
        {
            Ok(_) => added += 1,
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("duplicate column") => {
                // Concurrent initializer won the race
                info!("  {}.{} added concurrently - skipping", table, column_name);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(added)
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    crate::db::init::create_schema_version_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("✓ Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("✓ Migration v2 completed");
    }

    Ok(())
}

/// Migration v1: prominence columns on work_tag_assignments
///
/// Assignment tables from before prominence classification carry only
/// (work_id, tag_id, created_at). Existing rows become unassigned,
/// auto-assigned tags so the migration batch runner picks them up.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: prominence columns on work_tag_assignments");

    if !table_exists(pool, "work_tag_assignments").await? {
        info!("  work_tag_assignments doesn't exist yet - skipping migration");
        return Ok(());
    }

    let added = add_missing_columns(
        pool,
        "work_tag_assignments",
        &[
            ("prominence", "TEXT NOT NULL DEFAULT 'unassigned'"),
            ("prominence_score", "REAL NOT NULL DEFAULT 0.0"),
            ("auto_assigned", "INTEGER NOT NULL DEFAULT 1"),
            ("migration_batch", "INTEGER"),
            ("updated_at", "TEXT NOT NULL DEFAULT ''"),
        ],
    )
    .await?;

    if added > 0 {
        sqlx::query("UPDATE work_tag_assignments SET updated_at = created_at WHERE updated_at = ''")
            .execute(pool)
            .await?;
        info!("  ✓ Added {} columns to work_tag_assignments", added);
    } else {
        info!("  Prominence columns already exist - skipping");
    }

    Ok(())
}

/// Migration v2: review flags, crossover flag and work versioning
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: review, crossover and version columns");

    if table_exists(pool, "work_tag_assignments").await? {
        let added = add_missing_columns(
            pool,
            "work_tag_assignments",
            &[("needs_review", "INTEGER NOT NULL DEFAULT 0")],
        )
        .await?;
        if added > 0 {
            info!("  ✓ Added needs_review to work_tag_assignments");
        }
    }

    if table_exists(pool, "work_tag_metrics").await? {
        let added = add_missing_columns(
            pool,
            "work_tag_metrics",
            &[("is_crossover", "INTEGER NOT NULL DEFAULT 0")],
        )
        .await?;
        if added > 0 {
            info!("  ✓ Added is_crossover to work_tag_metrics");
        }
    }

    if table_exists(pool, "works").await? {
        let added = add_missing_columns(
            pool,
            "works",
            &[("tag_version", "INTEGER NOT NULL DEFAULT 0")],
        )
        .await?;
        if added > 0 {
            info!("  ✓ Added tag_version to works");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn columns(pool: &SqlitePool, table: &str) -> Vec<String> {
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
            .bind(table)
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_database_records_current_version() {
        let pool = setup_test_db().await;

        run_migrations(&pool).await.unwrap();

        assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_legacy_assignments_gain_prominence_columns() {
        let pool = setup_test_db().await;

        sqlx::query(
            "CREATE TABLE work_tag_assignments (work_id TEXT NOT NULL, tag_id INTEGER NOT NULL, created_at TEXT NOT NULL, PRIMARY KEY (work_id, tag_id))",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO work_tag_assignments VALUES ('w1', 7, '2023-05-01T00:00:00.000Z')")
            .execute(&pool)
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();

        let cols = columns(&pool, "work_tag_assignments").await;
        for expected in ["prominence", "prominence_score", "auto_assigned", "migration_batch", "needs_review", "updated_at"] {
            assert!(cols.iter().any(|c| c == expected), "missing column {}", expected);
        }

        let (prominence, auto, updated_at): (String, i64, String) = sqlx::query_as(
            "SELECT prominence, auto_assigned, updated_at FROM work_tag_assignments WHERE work_id = 'w1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(prominence, "unassigned");
        assert_eq!(auto, 1);
        assert_eq!(updated_at, "2023-05-01T00:00:00.000Z");
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = setup_test_db().await;

        run_migrations(&pool).await.unwrap();
        crate::db::create_schema(&pool).await.unwrap();

        // Re-running both on an up-to-date database changes nothing
        run_migrations(&pool).await.unwrap();
        crate::db::create_schema(&pool).await.unwrap();

        let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(versions, CURRENT_SCHEMA_VERSION as i64);
    }
}
