//! Integration tests for migration batches
//!
//! Works are seeded with every tag unassigned, the way rows look right after
//! a bulk import and before any classifier has run.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tagrank_common::config::TomlConfig;
use tagrank_common::db::{init_database, init_memory_database};
use tagrank_common::events::{EngineEvent, EventBus};
use tagrank_common::models::WorkInput;
use tagrank_common::{time, Error, Prominence, WorkId};
use tagrank_engine::batch::{list_batches, load_batch, load_batch_errors};
use tagrank_engine::{works, BatchResult, BatchRunner, BatchStatus, TagEngine};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn input(id: WorkId, index: usize) -> WorkInput {
    WorkInput {
        id,
        word_count: 2000,
        fandom_tags: vec!["Seed Fandom".to_string()],
        relationship_tags: vec![format!("Seed {}/Other", index)],
        freeform_tags: vec!["Angst".to_string()],
        ..Default::default()
    }
}

/// Test helper: store works without classifying them
async fn seed_unclassified(pool: &SqlitePool, count: usize) -> Vec<WorkId> {
    let mut conn = pool.acquire().await.unwrap();
    let now = time::now();
    let mut ids = Vec::with_capacity(count);
    for index in 0..count {
        let id = Uuid::new_v4();
        works::upsert_work_record(&mut conn, id, 2000, now).await.unwrap();
        works::sync_assignments(&mut conn, id, &input(id, index).typed_tags(), now)
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

fn runner(pool: &SqlitePool, config: TomlConfig) -> BatchRunner {
    BatchRunner::new(pool.clone(), Arc::new(config), EventBus::default())
}

async fn all_assigned(pool: &SqlitePool, ids: &[WorkId], rule_version: i64) -> bool {
    let mut conn = pool.acquire().await.unwrap();
    for id in ids {
        for a in works::load_assignments(&mut conn, *id).await.unwrap() {
            if a.prominence == Prominence::Unassigned || a.migration_batch != Some(rule_version) {
                return false;
            }
        }
    }
    true
}

#[tokio::test]
async fn test_batches_migrate_every_work() {
    let pool = init_memory_database().await.unwrap();
    let ids = seed_unclassified(&pool, 5).await;
    let cancel = CancellationToken::new();

    let mut runner = runner(&pool, TomlConfig::default());
    let results = runner.run_to_completion(2, 1, &cancel).await.unwrap();

    let processed: Vec<i64> = results.iter().map(|r| r.processed).collect();
    assert_eq!(processed, vec![2, 2, 1]);
    assert!(results.iter().all(|r| r.status == BatchStatus::Completed));
    assert!(all_assigned(&pool, &ids, 1).await);

    // Nothing left for this version
    let again = runner.run_to_completion(2, 1, &cancel).await.unwrap();
    assert!(again.is_empty());

    let mut conn = pool.acquire().await.unwrap();
    let batches = list_batches(&mut conn, 10).await.unwrap();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|b| b.is_terminal() && b.completed_at.is_some()));
}

#[tokio::test]
async fn test_new_rule_version_leaves_overrides_alone() {
    let pool = init_memory_database().await.unwrap();
    let engine = TagEngine::new(pool.clone(), Arc::new(TomlConfig::default()), EventBus::default());
    let id = Uuid::new_v4();
    engine.upsert_work(&input(id, 0), 1).await.unwrap();

    let angst = engine
        .assignments(id)
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.tag_name == "Angst")
        .unwrap();
    engine.set_prominence(id, angst.tag_id, Prominence::Micro).await.unwrap();

    let results = engine
        .batch_runner(false)
        .run_to_completion(10, 2, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].processed, 1);

    for a in engine.assignments(id).await.unwrap() {
        if a.tag_id == angst.tag_id {
            assert_eq!(a.prominence, Prominence::Micro);
            assert!(!a.auto_assigned);
        } else {
            assert_eq!(a.migration_batch, Some(2), "{}", a.tag_name);
        }
    }
}

#[tokio::test]
async fn test_cancelled_batch_resumes() {
    let pool = init_memory_database().await.unwrap();
    let ids = seed_unclassified(&pool, 3).await;
    let mut runner = runner(&pool, TomlConfig::default());

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let first = runner.run_batch(10, 1, &cancelled).await.unwrap();
    assert_eq!(first.status, BatchStatus::Cancelled);
    assert_eq!(first.processed, 0);
    assert!(!all_assigned(&pool, &ids, 1).await);

    let second = runner.run_batch(10, 1, &CancellationToken::new()).await.unwrap();
    assert_eq!(second.batch_number, first.batch_number);
    assert_eq!(second.status, BatchStatus::Completed);
    assert_eq!(second.processed, 3);
    assert!(all_assigned(&pool, &ids, 1).await);
}

#[tokio::test]
async fn test_running_batch_of_other_version_blocks() {
    let pool = init_memory_database().await.unwrap();
    seed_unclassified(&pool, 1).await;

    sqlx::query(
        "INSERT INTO tag_migration_batches (rule_version, status, migration_strategy, works_total) VALUES (7, 'running', 'rule_table_prominence', 1)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let result = runner(&pool, TomlConfig::default())
        .run_batch(10, 1, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

/// Test helper: three works, one of which cannot be read back
async fn seed_with_broken_work(pool: &SqlitePool) -> WorkId {
    let ids = seed_unclassified(pool, 3).await;
    let broken = ids[1];
    sqlx::query("UPDATE work_tag_assignments SET created_at = 'not a timestamp' WHERE work_id = ?")
        .bind(broken.to_string())
        .execute(pool)
        .await
        .unwrap();
    broken
}

#[tokio::test]
async fn test_failing_work_is_isolated() {
    let pool = init_memory_database().await.unwrap();
    let broken = seed_with_broken_work(&pool).await;

    let mut config = TomlConfig::default();
    config.batch.max_error_rate = 0.5;
    let result = runner(&pool, config)
        .run_batch(10, 1, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.processed, 2);
    assert_eq!(result.errors, 1);

    let mut conn = pool.acquire().await.unwrap();
    let batch_number = result.batch_number.unwrap();
    let errors = load_batch_errors(&mut conn, batch_number).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].work_id, broken);

    let batch = load_batch(&mut conn, batch_number).await.unwrap().unwrap();
    assert!(batch.last_error.unwrap().contains(&broken.to_string()));
}

#[tokio::test]
async fn test_error_rate_above_threshold_fails_batch() {
    let pool = init_memory_database().await.unwrap();
    seed_with_broken_work(&pool).await;

    let result = runner(&pool, TomlConfig::default())
        .run_batch(10, 1, &CancellationToken::new())
        .await
        .unwrap();

    // 1 of 3 is well above the default 5%
    assert_eq!(result.status, BatchStatus::Failed);
    assert_eq!(result.processed, 2);
}

async fn run_all(pool: &SqlitePool, config: TomlConfig, batch_size: i64) -> Vec<BatchResult> {
    let mut runner = runner(pool, config);
    let cancel = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(5), runner.run_to_completion(batch_size, 1, &cancel))
        .await
        .expect("migration run did not finish")
        .unwrap()
}

#[tokio::test]
async fn test_failed_work_is_not_retried_by_later_batches() {
    let pool = init_memory_database().await.unwrap();
    let broken = seed_with_broken_work(&pool).await;

    let mut config = TomlConfig::default();
    config.batch.max_error_rate = 0.5;
    let results = run_all(&pool, config.clone(), 10).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, BatchStatus::Completed);
    assert_eq!(results[0].processed, 2);
    assert_eq!(results[0].errors, 1);

    // A fresh run finds nothing new to do
    assert!(run_all(&pool, config, 10).await.is_empty());

    let mut conn = pool.acquire().await.unwrap();
    assert_eq!(list_batches(&mut conn, 10).await.unwrap().len(), 1);
    let errors = load_batch_errors(&mut conn, results[0].batch_number.unwrap()).await.unwrap();
    assert_eq!(errors[0].work_id, broken);
}

#[tokio::test]
async fn test_run_ends_when_every_error_is_tolerated() {
    let pool = init_memory_database().await.unwrap();
    seed_with_broken_work(&pool).await;

    let mut config = TomlConfig::default();
    config.batch.max_error_rate = 1.0;
    let results = run_all(&pool, config, 1).await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == BatchStatus::Completed));
    assert_eq!(results.iter().map(|r| r.errors).sum::<i64>(), 1);
    assert_eq!(results.iter().map(|r| r.processed).sum::<i64>(), 2);
}

#[tokio::test]
async fn test_edited_work_is_retried() {
    let pool = init_memory_database().await.unwrap();
    let broken = seed_with_broken_work(&pool).await;

    let mut config = TomlConfig::default();
    config.batch.max_error_rate = 0.5;
    run_all(&pool, config.clone(), 10).await;

    let later = time::to_db(time::now() + chrono::Duration::seconds(1));
    sqlx::query("UPDATE work_tag_assignments SET created_at = ? WHERE work_id = ?")
        .bind(&later)
        .bind(broken.to_string())
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE works SET updated_at = ? WHERE guid = ?")
        .bind(&later)
        .bind(broken.to_string())
        .execute(&pool)
        .await
        .unwrap();

    let results = run_all(&pool, config, 10).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].processed, 1);
    assert_eq!(results[0].errors, 0);
    assert!(all_assigned(&pool, &[broken], 1).await);
}

#[tokio::test]
async fn test_dry_run_writes_no_assignments() {
    let pool = init_memory_database().await.unwrap();
    let ids = seed_unclassified(&pool, 4).await;

    let results = runner(&pool, TomlConfig::default())
        .dry_run(true)
        .run_to_completion(3, 1, &CancellationToken::new())
        .await
        .unwrap();

    let processed: i64 = results.iter().map(|r| r.processed).sum();
    assert_eq!(processed, 4);

    let mut conn = pool.acquire().await.unwrap();
    for id in &ids {
        let assignments = works::load_assignments(&mut conn, *id).await.unwrap();
        assert!(assignments.iter().all(|a| a.prominence == Prominence::Unassigned));
    }
    let batches = list_batches(&mut conn, 10).await.unwrap();
    assert!(batches.iter().all(|b| b.dry_run));
}

#[tokio::test]
async fn test_finished_batch_is_announced() {
    let pool = init_memory_database().await.unwrap();
    seed_unclassified(&pool, 2).await;

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let mut runner = BatchRunner::new(pool.clone(), Arc::new(TomlConfig::default()), events);
    let result = runner.run_batch(10, 1, &CancellationToken::new()).await.unwrap();

    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::BatchFinished { batch_number, status, works_processed, .. } = event {
            finished = Some((batch_number, status, works_processed));
        }
    }
    assert_eq!(
        finished,
        Some((result.batch_number.unwrap(), "completed".to_string(), 2))
    );
}

#[tokio::test]
async fn test_batch_on_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("tagrank.db")).await.unwrap();
    let ids = seed_unclassified(&pool, 3).await;

    let results = runner(&pool, TomlConfig::default())
        .run_to_completion(2, 1, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(all_assigned(&pool, &ids, 1).await);
}
