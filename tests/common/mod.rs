#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use csv_ingest::config::RedeliveryPolicy;
use csv_ingest::db::{CreateOutcome, DestinationStore, MemoryDestination};
use csv_ingest::error::StoreError;
use csv_ingest::ingestion::{
    BatchWriter, CheckpointStore, CsvRowFetcher, IngestEvent, IngestOptions, IngestOrchestrator,
    IngestReport, Row, RowSource, RunStatus, SchemaCatalog, TableSchema,
};
use csv_ingest::safety::RetryPolicy;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const TABLE: &str = "batting_csv";
pub const FILE: &str = "Batting.csv";

pub fn header() -> Vec<String> {
    vec!["playerid".to_string(), "yearid".to_string(), "g".to_string()]
}

/// Row `i` has playerid `p{i:05}`.
pub fn rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| {
            json!({"playerid": format!("p{:05}", i), "yearid": 2004, "g": i % 162})
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect()
}

pub fn event(n: usize) -> IngestEvent {
    IngestEvent {
        file_name: FILE.to_string(),
        table_name: TABLE.to_string(),
        header: header(),
        description: Some("Batting statistics".to_string()),
        rows: RowSource::Inline(rows(n)),
    }
}

pub fn options(batch_size: usize, sub_batch_size: usize, concurrency: usize) -> IngestOptions {
    IngestOptions {
        batch_size: NonZeroUsize::new(batch_size).unwrap(),
        sub_batch_size: NonZeroUsize::new(sub_batch_size).unwrap(),
        max_concurrent_writes: NonZeroUsize::new(concurrency).unwrap(),
        retry: RetryPolicy::immediate(3),
        redelivery: RedeliveryPolicy::Reingest,
    }
}

pub fn orchestrator(
    store: Arc<dyn DestinationStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    options: IngestOptions,
) -> Arc<IngestOrchestrator> {
    orchestrator_with_timeout(store, checkpoints, options, Duration::from_secs(5))
}

pub fn orchestrator_with_timeout(
    store: Arc<dyn DestinationStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    options: IngestOptions,
    timeout: Duration,
) -> Arc<IngestOrchestrator> {
    Arc::new(IngestOrchestrator::new(
        SchemaCatalog::new(store.clone(), timeout),
        BatchWriter::new(store, timeout),
        Arc::new(CsvRowFetcher::with_client(reqwest::Client::new())),
        checkpoints,
        options,
    ))
}

pub async fn run(orchestrator: &IngestOrchestrator, event: &IngestEvent) -> IngestReport {
    run_with_token(orchestrator, event, &CancellationToken::new()).await
}

pub async fn run_with_token(
    orchestrator: &IngestOrchestrator,
    event: &IngestEvent,
    cancel: &CancellationToken,
) -> IngestReport {
    let (tx, _rx) = watch::channel(RunStatus::Received);
    orchestrator.ingest(event, cancel, &tx).await
}

fn row_index(row: &[Option<String>]) -> Option<usize> {
    row.first()?.as_deref()?.strip_prefix('p')?.parse().ok()
}

/// Destination wrapper with scripted faults around a `MemoryDestination`.
pub struct ScriptedDestination {
    pub inner: Arc<MemoryDestination>,
    /// Inserts touching any of these row indices always fail.
    failing_rows: Option<Range<usize>>,
    /// Fail this many inserts before letting any through.
    transient_failures: AtomicUsize,
    /// Cancel this token when the n-th successful insert starts.
    cancel_after: Option<(usize, CancellationToken)>,
    /// Report every table as missing so that creators race.
    hide_tables: AtomicBool,
    /// The first n inserts stall for this long before reaching the table.
    slow_inserts: AtomicUsize,
    slow_delay: Duration,
    pub attempted_inserts: AtomicUsize,
    pub failed_inserts: AtomicUsize,
    pub insert_sizes: Mutex<Vec<usize>>,
}

impl ScriptedDestination {
    pub fn new(inner: Arc<MemoryDestination>) -> Self {
        Self {
            inner,
            failing_rows: None,
            transient_failures: AtomicUsize::new(0),
            cancel_after: None,
            hide_tables: AtomicBool::new(false),
            slow_inserts: AtomicUsize::new(0),
            slow_delay: Duration::ZERO,
            attempted_inserts: AtomicUsize::new(0),
            failed_inserts: AtomicUsize::new(0),
            insert_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_rows(mut self, rows: Range<usize>) -> Self {
        self.failing_rows = Some(rows);
        self
    }

    pub fn transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn cancel_after(mut self, inserts: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((inserts, token));
        self
    }

    pub fn slow_inserts(mut self, count: usize, delay: Duration) -> Self {
        self.slow_inserts.store(count, Ordering::SeqCst);
        self.slow_delay = delay;
        self
    }

    pub fn hide_tables(self) -> Self {
        self.hide_tables.store(true, Ordering::SeqCst);
        self
    }

    pub fn failed_inserts(&self) -> usize {
        self.failed_inserts.load(Ordering::SeqCst)
    }

    pub fn attempted_inserts(&self) -> usize {
        self.attempted_inserts.load(Ordering::SeqCst)
    }

    pub fn insert_sizes(&self) -> Vec<usize> {
        self.insert_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DestinationStore for ScriptedDestination {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        if self.hide_tables.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.table_exists(table).await
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        self.inner.describe_table(table).await
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<CreateOutcome, StoreError> {
        tokio::task::yield_now().await;
        self.inner.create_table(schema).await
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<u64, StoreError> {
        self.attempted_inserts.fetch_add(1, Ordering::SeqCst);
        let slow = self
            .slow_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if slow {
            // The writer's deadline drops this future before the rows land.
            tokio::time::sleep(self.slow_delay).await;
        }

        let indices: Vec<usize> = rows.iter().filter_map(|r| row_index(r)).collect();

        let scripted = self
            .failing_rows
            .as_ref()
            .map_or(false, |range| indices.iter().any(|i| range.contains(i)));
        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if scripted || transient {
            self.failed_inserts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Rejected("connection reset by peer".to_string()));
        }

        let started = {
            let mut sizes = self.insert_sizes.lock().unwrap();
            sizes.push(rows.len());
            sizes.len()
        };
        if let Some((n, token)) = &self.cancel_after {
            if started == *n {
                token.cancel();
            }
        }

        self.inner.insert_rows(table, columns, rows).await
    }
}
