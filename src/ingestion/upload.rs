//! Upload preparation - builds the inbound message for a local CSV file

use std::path::Path;

use chrono::Utc;
use csv::ReaderBuilder;

use super::message::IngestMessage;
use super::normalize_identifier;
use crate::error::FetchError;

/// Table name for an uploaded file: dots become underscores, lower-cased.
pub fn table_name_for(file_name: &str) -> String {
    file_name.replace('.', "_").to_lowercase()
}

/// Read only the header row of a CSV file, lower-cased.
pub fn read_header(path: &Path) -> Result<Vec<String>, FetchError> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
    Ok(rdr.headers()?.iter().map(normalize_identifier).collect())
}

/// Message announcing `path` as a new file.
///
/// `file_url` defaults to a `file://` URL of the canonical path.
pub fn prepare_message(
    path: &Path,
    description: Option<String>,
    file_url: Option<String>,
) -> Result<IngestMessage, FetchError> {
    let io_err = |source: std::io::Error| FetchError::Io {
        path: path.display().to_string(),
        source,
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            io_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path has no file name",
            ))
        })?;

    let header = read_header(path)?;
    let file_url = match file_url {
        Some(url) => url,
        None => format!("file://{}", path.canonicalize().map_err(io_err)?.display()),
    };

    Ok(IngestMessage {
        table_name: table_name_for(&file_name),
        file_name,
        header,
        file_description: description,
        file_url: Some(file_url),
        batchrows: None,
        timestamp: Some(Utc::now().to_rfc3339()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::RowSource;

    #[test]
    fn test_table_name_for() {
        assert_eq!(table_name_for("Batting.csv"), "batting_csv");
        assert_eq!(table_name_for("AllstarFull.2024.CSV"), "allstarfull_2024_csv");
    }

    #[test]
    fn test_prepared_message_is_ingestible() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("Batting.csv");
        std::fs::write(&path, "playerID,yearID,G\naardsda01,2004,11\n").unwrap();

        let message = prepare_message(&path, Some("Batting".to_string()), None).unwrap();
        assert_eq!(message.table_name, "batting_csv");
        assert_eq!(message.header, vec!["playerid", "yearid", "g"]);
        assert!(message.file_url.as_deref().unwrap().starts_with("file://"));

        let event = message.into_event().unwrap();
        assert!(matches!(event.rows, RowSource::Remote(_)));
    }
}
