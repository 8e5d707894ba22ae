//! Tests against a live PostgreSQL. Run with
//! `DATABASE_URL=postgres://... cargo test -- --ignored`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use csv_ingest::db::{self, DestinationStore, PgCheckpointStore, PgDestination};
use csv_ingest::ingestion::{
    CheckpointStore, IngestProgress, RunStatus, SchemaCatalog, TEXT_COLUMN_TYPE,
};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn pool(max_connections: u32) -> Option<db::DbPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    Some(db::init_pool(&url, max_connections, TIMEOUT).await.unwrap())
}

fn unique_table(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

async fn drop_table(pool: &db::DbPool, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table))
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_ensure_table_is_stable_across_calls() {
    let Some(pool) = pool(4).await else { return };
    let table = unique_table("stable_csv");
    let catalog = SchemaCatalog::new(Arc::new(PgDestination::new(pool.clone())), TIMEOUT);

    let created = catalog
        .ensure_table(&table, &header(), Some("Batting statistics"))
        .await
        .unwrap();
    let described = catalog
        .ensure_table(&table, &header(), Some("Batting statistics"))
        .await
        .unwrap();

    assert_eq!(created, described);
    assert!(described.columns.iter().all(|c| c.data_type == TEXT_COLUMN_TYPE));
    assert_eq!(described.primary_key(), vec!["playerid"]);

    drop_table(&pool, &table).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_table_found_on_search_path_is_described() {
    // One connection so the search_path setting applies to every query.
    let Some(pool) = pool(1).await else { return };
    let schema = unique_table("ingest_other");
    let table = unique_table("elsewhere_csv");

    sqlx::query(&format!("CREATE SCHEMA \"{}\"", schema))
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(&format!(
        "CREATE TABLE \"{}\".\"{}\" (playerid VARCHAR PRIMARY KEY, yearid VARCHAR, g VARCHAR)",
        schema, table
    ))
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(&format!("SET search_path TO public, \"{}\"", schema))
        .execute(&pool)
        .await
        .unwrap();

    let store = PgDestination::new(pool.clone());
    assert!(store.table_exists(&table).await.unwrap());
    let described = store.describe_table(&table).await.unwrap().unwrap();
    assert_eq!(described.column_names(), vec!["playerid", "yearid", "g"]);

    let catalog = SchemaCatalog::new(Arc::new(store), TIMEOUT);
    let ensured = catalog.ensure_table(&table, &header(), None).await.unwrap();
    assert_eq!(ensured, described);

    let copies: i64 = sqlx::query_scalar("SELECT count(*) FROM pg_class WHERE relname = $1")
        .bind(&table)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(copies, 1);

    sqlx::query(&format!("DROP SCHEMA \"{}\" CASCADE", schema))
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_redelivered_file_completes_on_keyed_table() {
    let Some(pool) = pool(8).await else { return };
    let store = Arc::new(PgDestination::new(pool.clone()));
    let checkpoints = Arc::new(PgCheckpointStore::new(pool.clone(), TIMEOUT));
    checkpoints.ensure_schema().await.unwrap();

    let mut event = event(2500);
    event.table_name = unique_table("redelivered_csv");
    let orchestrator = orchestrator(store, checkpoints.clone(), options(1000, 100, 4));

    let first = run(&orchestrator, &event).await;
    let second = run(&orchestrator, &event).await;

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.rows_written, 2500);

    let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM \"{}\"", event.table_name))
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2500);

    let progress = checkpoints.load(&second.run_key).await.unwrap().unwrap();
    assert_eq!(progress.status, RunStatus::Completed);

    drop_table(&pool, &event.table_name).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_checkpoint_round_trip() {
    let Some(pool) = pool(2).await else { return };
    let checkpoints = PgCheckpointStore::new(pool, TIMEOUT);
    checkpoints.ensure_schema().await.unwrap();

    let mut event = event(10);
    event.table_name = unique_table("checkpoint_csv");
    let mut progress = IngestProgress::new(&event, 5);
    progress.total_batches = Some(2);
    progress.record_commit(0, 5);
    checkpoints.save(&progress).await.unwrap();

    let loaded = checkpoints.load(&progress.run_key).await.unwrap().unwrap();
    assert_eq!(loaded.last_committed, Some(0));
    assert_eq!(loaded.rows_written, 5);
}
