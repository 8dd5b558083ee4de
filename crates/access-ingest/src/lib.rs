//! access-ingest: pull web-server access logs, decode the extension's
//! telemetry query parameters, and append new events to a SQLite store.
//!
//! Data flows `source` -> `parser` (with `decrypt` for the `userid` field)
//! -> `models::PersistedEvent` (hashed by `hasher`) -> `store`.

pub mod errors;
pub mod ingest;
pub mod models;
pub mod store;

pub use errors::{DecryptionError, IngestError, IngestResult};
pub use ingest::decrypt::FieldDecryptor;
pub use ingest::parser::LineParser;
pub use ingest::pipeline::RunReport;
pub use ingest::source::{LineSource, StoreDescriptor};
pub use models::{ParsedLogEntry, PersistedEvent, UpsertOutcome};
pub use store::database::EventStore;
