//! Error types for the access-ingest library.

/// Top-level error enum for the ingestion pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Missing query parameter: {0}")]
    MissingField(&'static str),

    #[error("Invalid value {value:?} for query parameter {field}")]
    InvalidField { field: &'static str, value: String },

    #[error("Unparseable timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Pattern error: {0}")]
    Pattern(String),
}

/// Failure to turn an encoded `userid` back into plaintext.
///
/// Each variant names the decoding stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum DecryptionError {
    #[error("url-safe base64 decode failed: {0}")]
    OuterBase64(#[source] base64::DecodeError),

    #[error("base64 decode failed: {0}")]
    InnerBase64(#[source] base64::DecodeError),

    #[error("RSA decryption failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("plaintext is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type IngestResult<T> = Result<T, IngestError>;
