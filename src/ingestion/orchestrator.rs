//! Ingestion Orchestrator - Durable driver for one file's ingestion
//!
//! Received -> SchemaEnsuring -> Splitting -> BatchInFlight(i) ->
//! BatchCommitted(i) -> ... -> Completed, with Failed and Cancelled reachable
//! from any state. Progress is saved after every committed batch, so a
//! redelivered event resumes at the first batch not yet committed.

use std::num::NonZeroUsize;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    split, sub_split, Batch, BatchWriter, CheckpointStore, IngestEvent, IngestProgress, Row,
    RowFetcher, RowSource, RunKey, RunStatus, SchemaCatalog,
};
use crate::config::RedeliveryPolicy;
use crate::error::{IngestError, Result, WriteError};
use crate::safety::{FailureRecovery, RetryExhausted, RetryPolicy};

/// Options controlling batching, concurrency and retry
#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub batch_size: NonZeroUsize,
    pub sub_batch_size: NonZeroUsize,
    /// Sub-batch inserts in flight at once within a batch
    pub max_concurrent_writes: NonZeroUsize,
    pub retry: RetryPolicy,
    pub redelivery: RedeliveryPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(1000).unwrap_or(NonZeroUsize::MIN),
            sub_batch_size: NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN),
            max_concurrent_writes: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            retry: RetryPolicy::default(),
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

/// Outcome of one orchestration.
#[derive(Clone, Debug, Serialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub run_key: RunKey,
    pub table_name: String,
    pub status: RunStatus,
    pub total_batches: usize,
    pub batches_committed: usize,
    /// Rows written by this run, including batches committed before a resume
    pub rows_written: u64,
    /// First batch of this invocation when resuming from a checkpoint
    pub resumed_from: Option<usize>,
    /// Completed earlier and acknowledged without writing
    pub skipped: bool,
}

/// Live view of a spawned orchestration.
pub struct RunHandle {
    run_key: RunKey,
    status: watch::Receiver<RunStatus>,
    cancel: CancellationToken,
    join: JoinHandle<IngestReport>,
}

impl RunHandle {
    pub fn run_key(&self) -> &RunKey {
        &self.run_key
    }

    /// Most recently published status.
    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    /// Stop after the in-flight sub-batches finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> std::result::Result<IngestReport, JoinError> {
        self.join.await
    }
}

enum RunOutcome {
    Completed,
    Cancelled,
}

enum BatchOutcome {
    Committed(u64),
    Interrupted,
}

enum SubBatchOutcome {
    Written(u64),
    Skipped,
    Failed(RetryExhausted<WriteError>),
}

/// Ingestion Orchestrator - Drives one event through the state machine
pub struct IngestOrchestrator {
    catalog: SchemaCatalog,
    writer: BatchWriter,
    fetcher: Arc<dyn RowFetcher>,
    checkpoints: Arc<dyn CheckpointStore>,
    options: IngestOptions,
}

impl IngestOrchestrator {
    pub fn new(
        catalog: SchemaCatalog,
        writer: BatchWriter,
        fetcher: Arc<dyn RowFetcher>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: IngestOptions,
    ) -> Self {
        Self {
            catalog,
            writer,
            fetcher,
            checkpoints,
            options,
        }
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Run the orchestration as its own task.
    pub fn spawn(self: &Arc<Self>, event: IngestEvent, cancel: CancellationToken) -> RunHandle {
        let (tx, rx) = watch::channel(RunStatus::Received);
        let run_key = event.run_key();
        let orchestrator = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { orchestrator.ingest(&event, &token, &tx).await });

        RunHandle {
            run_key,
            status: rx,
            cancel,
            join,
        }
    }

    /// Ingest one event to a terminal state.
    ///
    /// Errors never escape: they end the run as `Failed` with the reason
    /// recorded in the checkpoint and the report.
    pub async fn ingest(
        &self,
        event: &IngestEvent,
        cancel: &CancellationToken,
        status: &watch::Sender<RunStatus>,
    ) -> IngestReport {
        let run_id = Uuid::new_v4();
        let run_key = event.run_key();
        status.send_replace(RunStatus::Received);
        info!(run_key = %run_key, %run_id, "Ingestion received");

        let mut progress = IngestProgress::new(event, self.options.batch_size.get());
        let mut resumed_from = None;

        let result = match self.checkpoints.load(&run_key).await {
            Err(e) => Err(IngestError::from(e)),
            Ok(Some(previous)) if previous.status.is_completed() => match self.options.redelivery {
                RedeliveryPolicy::SkipCompleted => {
                    info!(run_key = %run_key, "Run already completed, acknowledging redelivery");
                    status.send_replace(RunStatus::Completed);
                    return Self::report(run_id, &previous, None, true);
                }
                RedeliveryPolicy::Reingest => {
                    info!(run_key = %run_key, "Run already completed, ingesting the file again");
                    self.drive(event, &mut progress, cancel, status).await
                }
            },
            Ok(Some(previous)) => {
                let next = previous.next_batch();
                info!(
                    run_key = %run_key,
                    next_batch = next,
                    previous_status = %previous.status,
                    "Resuming from checkpoint"
                );
                resumed_from = Some(next);
                progress = previous;
                self.drive(event, &mut progress, cancel, status).await
            }
            Ok(None) => self.drive(event, &mut progress, cancel, status).await,
        };

        let final_status = match result {
            Ok(RunOutcome::Completed) => RunStatus::Completed,
            Ok(RunOutcome::Cancelled) => RunStatus::Cancelled,
            Err(e) => {
                error!(run_key = %run_key, reason = %e.reason(), error = %e, "Ingestion failed");
                Self::failed(&e)
            }
        };
        progress.set_status(final_status);

        if let Err(e) = self.checkpoints.save(&progress).await {
            error!(run_key = %run_key, error = %e, "Failed to persist final status");
            if !matches!(progress.status, RunStatus::Failed { .. }) {
                progress.set_status(Self::failed(&IngestError::from(e)));
            }
        }

        status.send_replace(progress.status.clone());
        info!(
            run_key = %run_key,
            status = %progress.status,
            rows_written = progress.rows_written,
            "Ingestion finished"
        );
        Self::report(run_id, &progress, resumed_from, false)
    }

    async fn drive(
        &self,
        event: &IngestEvent,
        progress: &mut IngestProgress,
        cancel: &CancellationToken,
        status: &watch::Sender<RunStatus>,
    ) -> Result<RunOutcome> {
        if !progress.schema_ensured {
            Self::publish(progress, status, RunStatus::SchemaEnsuring);
            self.catalog
                .ensure_table(&event.table_name, &event.header, event.description.as_deref())
                .await?;
            progress.schema_ensured = true;
            self.checkpoints.save(progress).await?;
        }

        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        Self::publish(progress, status, RunStatus::Splitting);
        let rows = self.materialize(event).await?;
        let row_count = rows.len();
        let batch_size = NonZeroUsize::new(progress.batch_size)
            .ok_or_else(|| IngestError::Split("checkpoint records a zero batch size".to_string()))?;
        let batches = split(rows, batch_size);

        match progress.total_batches {
            Some(recorded) if recorded != batches.len() => {
                return Err(IngestError::Split(format!(
                    "row set now splits into {} batches, checkpoint recorded {}",
                    batches.len(),
                    recorded
                )));
            }
            Some(_) => {}
            None => {
                progress.total_batches = Some(batches.len());
                self.checkpoints.save(progress).await?;
            }
        }

        let start = progress.next_batch();
        info!(
            run_key = %progress.run_key,
            rows = row_count,
            batches = batches.len(),
            start_batch = start,
            "Row set split"
        );

        let table: Arc<str> = Arc::from(event.table_name.as_str());
        let columns: Arc<[String]> = Arc::from(event.header.clone());

        for batch in batches.into_iter().skip(start) {
            if cancel.is_cancelled() {
                info!(run_key = %progress.run_key, next_batch = batch.index, "Cancelled between batches");
                return Ok(RunOutcome::Cancelled);
            }

            let index = batch.index;
            Self::publish(progress, status, RunStatus::BatchInFlight { batch: index });

            match self.write_batch(&table, &columns, batch, cancel).await? {
                BatchOutcome::Committed(written) => {
                    if !progress.record_commit(index, written) {
                        return Err(IngestError::Split(format!(
                            "batch {} committed out of order",
                            index
                        )));
                    }
                    self.checkpoints.save(progress).await?;
                    status.send_replace(progress.status.clone());
                    info!(
                        run_key = %progress.run_key,
                        batch = index,
                        rows = written,
                        "Batch committed"
                    );
                }
                BatchOutcome::Interrupted => {
                    warn!(run_key = %progress.run_key, batch = index, "Batch interrupted by cancellation");
                    return Ok(RunOutcome::Cancelled);
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    async fn materialize(&self, event: &IngestEvent) -> Result<Vec<Row>> {
        match &event.rows {
            RowSource::Inline(rows) => Ok(rows.clone()),
            RowSource::Remote(url) => self
                .fetcher
                .fetch(url, &event.header)
                .await
                .map_err(|source| IngestError::RowFetch {
                    file: event.file_name.clone(),
                    source,
                }),
        }
    }

    /// Write every sub-batch of a batch, up to `max_concurrent_writes` at once.
    ///
    /// A sub-batch that exhausts its attempts fails the batch; sub-batches not
    /// yet started are then skipped, in-flight ones are awaited.
    async fn write_batch(
        &self,
        table: &Arc<str>,
        columns: &Arc<[String]>,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let index = batch.index;
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_writes.get()));
        let recovery = FailureRecovery::with_retry_policy(self.options.retry.clone());
        let batch_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for sub_batch in sub_split(batch, self.options.sub_batch_size) {
            let writer = self.writer.clone();
            let recovery = recovery.clone();
            let semaphore = semaphore.clone();
            let batch_cancel = batch_cancel.clone();
            let table = table.clone();
            let columns = columns.clone();

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return SubBatchOutcome::Skipped,
                };
                if batch_cancel.is_cancelled() {
                    return SubBatchOutcome::Skipped;
                }

                let label = format!(
                    "{} batch {} sub-batch {}",
                    table, sub_batch.batch_index, sub_batch.index
                );
                let result = recovery
                    .retry_with_backoff(&label, || {
                        writer.write_sub_batch(&table, &columns, &sub_batch)
                    })
                    .await;
                match result {
                    Ok(written) => SubBatchOutcome::Written(written),
                    Err(exhausted) => {
                        batch_cancel.cancel();
                        SubBatchOutcome::Failed(exhausted)
                    }
                }
            });
        }

        let mut written = 0u64;
        let mut interrupted = false;
        let mut failure: Option<IngestError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(SubBatchOutcome::Written(rows)) => written += rows,
                Ok(SubBatchOutcome::Skipped) => interrupted = true,
                Ok(SubBatchOutcome::Failed(exhausted)) => {
                    if failure.is_none() {
                        failure = Some(IngestError::BatchWrite {
                            batch: index,
                            attempts: exhausted.attempts,
                            source: exhausted.last_error,
                        });
                    }
                }
                Err(source) => {
                    batch_cancel.cancel();
                    if failure.is_none() {
                        failure = Some(IngestError::WriterTask {
                            batch: index,
                            source,
                        });
                    }
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if interrupted {
            return Ok(BatchOutcome::Interrupted);
        }
        Ok(BatchOutcome::Committed(written))
    }

    fn publish(progress: &mut IngestProgress, status: &watch::Sender<RunStatus>, next: RunStatus) {
        progress.set_status(next.clone());
        status.send_replace(next);
    }

    fn failed(err: &IngestError) -> RunStatus {
        RunStatus::Failed {
            reason: err.reason(),
            cause: err.to_string(),
        }
    }

    fn report(
        run_id: Uuid,
        progress: &IngestProgress,
        resumed_from: Option<usize>,
        skipped: bool,
    ) -> IngestReport {
        IngestReport {
            run_id,
            run_key: progress.run_key.clone(),
            table_name: progress.table_name.clone(),
            status: progress.status.clone(),
            total_batches: progress.total_batches.unwrap_or(0),
            batches_committed: progress.last_committed.map_or(0, |i| i + 1),
            rows_written: progress.rows_written,
            resumed_from,
            skipped,
        }
    }
}
