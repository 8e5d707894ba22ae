//! Row Source - Materializes a file's rows from its URL

use std::time::Duration;

use async_trait::async_trait;
use csv::ReaderBuilder;
use serde_json::Value;
use tracing::debug;

use super::Row;
use crate::error::FetchError;

/// Fetches the full row set of a file.
///
/// Implementations:
/// - CsvRowFetcher: `http(s)://` through reqwest, `file://` or a plain path
///   from the local filesystem
#[async_trait]
pub trait RowFetcher: Send + Sync {
    /// Rows of the file keyed by `header`, in file order.
    async fn fetch(&self, url: &str, header: &[String]) -> Result<Vec<Row>, FetchError>;
}

/// CSV fetcher - reads delimited text whose first row is the header.
#[derive(Clone)]
pub struct CsvRowFetcher {
    client: reqwest::Client,
}

impl CsvRowFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn read_text(&self, url: &str) -> Result<String, FetchError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let http_err = |source: reqwest::Error| FetchError::Http {
                url: url.to_string(),
                source,
            };
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(http_err)?;
            return response.text().await.map_err(http_err);
        }

        let path = match url.strip_prefix("file://") {
            Some(path) => path,
            None if url.contains("://") => return Err(FetchError::UnsupportedUrl(url.to_string())),
            None => url,
        };
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| FetchError::Io {
                path: path.to_string(),
                source,
            })
    }
}

#[async_trait]
impl RowFetcher for CsvRowFetcher {
    async fn fetch(&self, url: &str, header: &[String]) -> Result<Vec<Row>, FetchError> {
        let text = self.read_text(url).await?;
        let rows = parse_csv_rows(&text, header)?;
        debug!(url, rows = rows.len(), "Fetched row set");
        Ok(rows)
    }
}

/// Parse CSV text into rows keyed by `header`.
///
/// The file's own header row must have the same width as `header`, and so
/// must every record. Empty cells become `Null`; everything else is kept as
/// text.
pub fn parse_csv_rows(text: &str, header: &[String]) -> Result<Vec<Row>, FetchError> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let found = rdr.headers()?.len();
    if found != header.len() {
        return Err(FetchError::HeaderMismatch {
            expected: header.len(),
            found,
        });
    }

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        if record.len() != header.len() {
            return Err(FetchError::RowWidth {
                line: record.position().map_or(0, |p| p.line()),
                expected: header.len(),
                found: record.len(),
            });
        }

        let row: Row = header
            .iter()
            .zip(record.iter())
            .map(|(name, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (name.clone(), value)
            })
            .collect();
        rows.push(row);
    }

    Ok(rows)
}
