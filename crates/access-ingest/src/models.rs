//! Shared typed models used across the source, parser, and store layers.

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::{IngestError, IngestResult};
use crate::ingest::hasher::content_hash;

// ---------------------------------------------------------------------------
// Format constants
// ---------------------------------------------------------------------------

/// Date layout inside the bracketed access-log timestamp, offset excluded.
pub const LOG_TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S";

/// ISO-8601 layout used for the persisted `timestamp` column.
pub const ISO_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Query parameter names that every persisted event needs.
pub const USERID_PARAM: &str = "userid";
pub const OPERATION_PARAM: &str = "operation";
pub const STATUS_PARAM: &str = "status";
pub const ROW_COUNT_PARAM: &str = "rowCount";

/// Query string as an ordered name -> value mapping.
pub type QueryParams = IndexMap<String, String>;

// ---------------------------------------------------------------------------
// 1. RawLine
// ---------------------------------------------------------------------------

/// One line of text as read from a backing store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawLine {
    /// Backing store the line came from. Traceability only.
    pub source: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// 2. ParsedLogEntry
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
}

impl HttpMethod {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A log line that matched the access-log grammar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedLogEntry {
    pub raw_line: String,
    pub source_file: String,
    pub server_name: String,
    pub client_ip: String,
    /// Raw log date, e.g. `01/Jan/2024:12:00:00`.
    pub timestamp: String,
    pub http_method: HttpMethod,
    pub path: String,
    /// `None` when the request target carried no `?`.
    pub query_params: Option<QueryParams>,
}

impl ParsedLogEntry {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query_params
            .as_ref()
            .and_then(|params| params.get(name))
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// 3. EventFields
// ---------------------------------------------------------------------------

/// The query parameters an event is built from.
///
/// `row_count` keeps the text exactly as it appeared in the URL because the
/// content hash is computed over that text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventFields {
    pub userid: String,
    pub operation: String,
    pub status: String,
    pub row_count: String,
}

impl EventFields {
    /// Pull the required parameters out of a query mapping. Extra keys are
    /// ignored; the first missing key is reported.
    pub fn from_params(params: &QueryParams) -> IngestResult<Self> {
        let take = |name: &'static str| -> IngestResult<String> {
            params
                .get(name)
                .cloned()
                .ok_or(IngestError::MissingField(name))
        };
        Ok(Self {
            userid: take(USERID_PARAM)?,
            operation: take(OPERATION_PARAM)?,
            status: take(STATUS_PARAM)?,
            row_count: take(ROW_COUNT_PARAM)?,
        })
    }
}

// ---------------------------------------------------------------------------
// 4. PersistedEvent
// ---------------------------------------------------------------------------

/// One row of the `events` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub content_hash: String,
    pub timestamp: String,
    pub user_id: String,
    pub client_ip: String,
    pub operation: String,
    pub status: String,
    pub row_count: i64,
    pub raw_line: String,
}

impl PersistedEvent {
    /// Build the row for a parsed entry, deriving its content hash.
    pub fn from_entry(entry: &ParsedLogEntry) -> IngestResult<Self> {
        let empty = QueryParams::new();
        let params = entry.query_params.as_ref().unwrap_or(&empty);
        let fields = EventFields::from_params(params)?;

        let timestamp = normalize_timestamp(&entry.timestamp)?;
        let row_count =
            fields
                .row_count
                .trim()
                .parse::<i64>()
                .map_err(|_| IngestError::InvalidField {
                    field: ROW_COUNT_PARAM,
                    value: fields.row_count.clone(),
                })?;
        let content_hash = content_hash(&timestamp, &fields);

        Ok(Self {
            content_hash,
            timestamp,
            user_id: fields.userid,
            client_ip: entry.client_ip.clone(),
            operation: fields.operation,
            status: fields.status,
            row_count,
            raw_line: entry.raw_line.clone(),
        })
    }
}

/// Convert a log date (`01/Jan/2024:12:00:00`) to `2024-01-01T12:00:00`.
pub fn normalize_timestamp(raw: &str) -> IngestResult<String> {
    let parsed = NaiveDateTime::parse_from_str(raw, LOG_TIMESTAMP_FORMAT).map_err(|source| {
        IngestError::Timestamp {
            value: raw.to_string(),
            source,
        }
    })?;
    Ok(parsed.format(ISO_TIMESTAMP_FORMAT).to_string())
}

// ---------------------------------------------------------------------------
// 5. Outcomes
// ---------------------------------------------------------------------------

/// Result of offering one event to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}
