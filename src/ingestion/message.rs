//! Inbound queue message - wire format of a "new file" event

use serde::{Deserialize, Serialize};

use super::{normalize_identifier, IngestEvent, Row, RowSource};
use crate::error::MessageError;

/// Inline rows, either flat or already pre-chunked by the producer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InlineRows {
    Flat(Vec<Row>),
    Chunked(Vec<Vec<Row>>),
}

impl InlineRows {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            InlineRows::Flat(rows) => rows,
            InlineRows::Chunked(chunks) => chunks.into_iter().flatten().collect(),
        }
    }
}

/// JSON message pushed by the upload collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestMessage {
    #[serde(default)]
    pub file_name: String,

    #[serde(default)]
    pub table_name: String,

    #[serde(default)]
    pub header: Vec<String>,

    #[serde(default)]
    pub file_description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batchrows: Option<InlineRows>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl IngestMessage {
    /// Parse and validate a raw message body.
    pub fn parse(body: &str) -> Result<IngestEvent, MessageError> {
        let message: IngestMessage = serde_json::from_str(body)?;
        message.into_event()
    }

    /// Validate the message and normalize it into an event.
    pub fn into_event(self) -> Result<IngestEvent, MessageError> {
        if self.file_name.trim().is_empty() {
            return Err(MessageError::MissingField("file_name"));
        }
        if self.table_name.trim().is_empty() {
            return Err(MessageError::MissingField("table_name"));
        }
        if self.header.is_empty() {
            return Err(MessageError::MissingField("header"));
        }

        let rows = match (self.file_url, self.batchrows) {
            (Some(_), Some(_)) => return Err(MessageError::AmbiguousRowSource),
            (None, None) => return Err(MessageError::NoRowSource),
            (Some(url), None) => {
                if url.trim().is_empty() {
                    return Err(MessageError::MissingField("file_url"));
                }
                RowSource::Remote(url)
            }
            (None, Some(inline)) => RowSource::Inline(
                inline
                    .into_rows()
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(|(k, v)| (normalize_identifier(&k), v))
                            .collect()
                    })
                    .collect(),
            ),
        };

        let description = self
            .file_description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        Ok(IngestEvent {
            file_name: self.file_name,
            table_name: normalize_identifier(&self.table_name),
            header: self.header.iter().map(|h| normalize_identifier(h)).collect(),
            description,
            rows,
        })
    }
}
