//! Queue consumer - newline-delimited JSON messages, one file per line
//!
//! Each accepted message becomes an independent orchestration. At most
//! `max_files` run at once; reading the input waits for a free slot.

use std::num::NonZeroUsize;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{IngestMessage, IngestOrchestrator, IngestReport, RunStatus};

/// What happened to one input line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsumeOutcome {
    /// The message failed validation and was not ingested.
    Rejected { line: usize, error: String },
    Finished { line: usize, report: IngestReport },
    /// The orchestration task panicked. Its input line is not known, so `line` is 0.
    Aborted { line: usize, error: String },
}

impl ConsumeOutcome {
    pub fn line(&self) -> usize {
        match self {
            ConsumeOutcome::Rejected { line, .. }
            | ConsumeOutcome::Finished { line, .. }
            | ConsumeOutcome::Aborted { line, .. } => *line,
        }
    }
}

/// Consume messages until the input ends or `cancel` fires, then wait for
/// every started orchestration.
pub async fn consume_lines<R>(
    reader: R,
    orchestrator: Arc<IngestOrchestrator>,
    max_files: NonZeroUsize,
    cancel: CancellationToken,
) -> std::io::Result<Vec<ConsumeOutcome>>
where
    R: AsyncBufRead + Unpin,
{
    let slots = Arc::new(Semaphore::new(max_files.get()));
    let mut lines = reader.lines();
    let mut tasks = JoinSet::new();
    let mut outcomes = Vec::new();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        if cancel.is_cancelled() {
            info!(line = line_no, "Consumer cancelled, not reading further messages");
            break;
        }

        let event = match IngestMessage::parse(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "Rejected message");
                outcomes.push(ConsumeOutcome::Rejected {
                    line: line_no,
                    error: e.to_string(),
                });
                continue;
            }
        };

        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = cancel.cancelled() => break,
        };

        let orchestrator = orchestrator.clone();
        let token = cancel.child_token();
        let line = line_no;
        tasks.spawn(async move {
            let _permit = permit;
            let (tx, _rx) = watch::channel(RunStatus::Received);
            let report = orchestrator.ingest(&event, &token, &tx).await;
            (line, report)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((line, report)) => outcomes.push(ConsumeOutcome::Finished { line, report }),
            Err(e) => {
                error!(error = %e, "Orchestration task did not finish");
                outcomes.push(ConsumeOutcome::Aborted {
                    line: 0,
                    error: e.to_string(),
                });
            }
        }
    }

    outcomes.sort_by_key(ConsumeOutcome::line);
    Ok(outcomes)
}
