mod common;

use std::num::NonZeroUsize;
use std::sync::Arc;

use common::*;
use csv_ingest::db::MemoryDestination;
use csv_ingest::ingestion::upload::prepare_message;
use csv_ingest::ingestion::{consume_lines, ConsumeOutcome, MemoryCheckpointStore, RunStatus};
use serde_json::json;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

fn inline_message(file_name: &str, rows: usize) -> String {
    let batchrows: Vec<_> = (0..rows)
        .map(|i| json!({"playerID": format!("p{:05}", i), "yearID": "2004", "G": "1"}))
        .collect();
    json!({
        "file_name": file_name,
        "table_name": file_name.replace('.', "_").to_lowercase(),
        "header": ["playerID", "yearID", "G"],
        "file_description": "inline rows",
        "batchrows": batchrows,
    })
    .to_string()
}

#[tokio::test]
async fn test_consume_runs_valid_messages_and_rejects_invalid_ones() {
    let memory = Arc::new(MemoryDestination::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let orchestrator = orchestrator(memory.clone(), checkpoints, options(100, 10, 2));

    let input = [
        inline_message("Batting.csv", 250),
        json!({"file_name": "Broken.csv", "table_name": "broken_csv", "header": []}).to_string(),
        String::new(),
        inline_message("Pitching.csv", 40),
    ]
    .join("\n");

    let outcomes = consume_lines(
        BufReader::new(input.as_bytes()),
        orchestrator,
        NonZeroUsize::new(2).unwrap(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes.iter().map(|o| o.line()).collect::<Vec<_>>(), vec![1, 2, 4]);
    assert!(matches!(&outcomes[1], ConsumeOutcome::Rejected { line: 2, .. }));

    for outcome in [&outcomes[0], &outcomes[2]] {
        match outcome {
            ConsumeOutcome::Finished { report, .. } => {
                assert_eq!(report.status, RunStatus::Completed)
            }
            other => panic!("expected a finished run, got {:?}", other),
        }
    }

    assert_eq!(memory.row_count("batting_csv"), 250);
    assert_eq!(memory.row_count("pitching_csv"), 40);
}

#[tokio::test]
async fn test_cancelled_consumer_starts_nothing() {
    let memory = Arc::new(MemoryDestination::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let orchestrator = orchestrator(memory.clone(), checkpoints, options(100, 10, 2));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let input = inline_message("Batting.csv", 10);
    let outcomes = consume_lines(
        BufReader::new(input.as_bytes()),
        orchestrator,
        NonZeroUsize::new(1).unwrap(),
        cancel,
    )
    .await
    .unwrap();

    assert!(outcomes.is_empty());
    assert_eq!(memory.table_count(), 0);
}

#[tokio::test]
async fn test_prepared_message_round_trips_through_consumer() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("Batting.csv");
    std::fs::write(&path, "playerID,yearID,G\naardsda01,2004,11\nabbotje01,2006,45\n").unwrap();

    let message = prepare_message(&path, Some("Batting statistics".to_string()), None).unwrap();
    let line = serde_json::to_string(&message).unwrap();

    let memory = Arc::new(MemoryDestination::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let orchestrator = orchestrator(memory.clone(), checkpoints, options(100, 10, 2));

    let outcomes = consume_lines(
        BufReader::new(line.as_bytes()),
        orchestrator,
        NonZeroUsize::new(1).unwrap(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(memory.row_count("batting_csv"), 2);
    let schema = memory.schema("batting_csv").expect("table was provisioned");
    assert_eq!(schema.primary_key(), vec!["playerid"]);
    assert_eq!(schema.description.as_deref(), Some("Batting statistics"));
}
