//! Pipeline orchestration for the two run modes.
//!
//! * inspect: parse every line and print each entry as one JSON object.
//! * ingest: parse, convert to events, and upsert new events into the store.
//!
//! Line- and record-level problems are counted and skipped. Only store
//! failures abort a run.

use std::io::Write;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::errors::IngestResult;
use crate::ingest::parser::LineParser;
use crate::models::{PersistedEvent, RawLine, UpsertOutcome};
use crate::store::database::EventStore;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub lines_read: u64,
    pub entries_parsed: u64,
    /// Lines outside the grammar.
    pub lines_skipped: u64,
    pub decrypt_failures: u64,
    /// Parsed entries that could not become events.
    pub events_rejected: u64,
    pub inserted: u64,
    pub already_present: u64,
    pub elapsed_ms: u64,
}

/// Write every parsed entry to `out` as JSON lines.
pub fn inspect<I, W>(lines: I, parser: &LineParser<'_>, out: &mut W) -> IngestResult<RunReport>
where
    I: IntoIterator<Item = RawLine>,
    W: Write,
{
    let started = Instant::now();
    let mut report = RunReport::default();

    for line in lines {
        report.lines_read += 1;
        let Some(entry) = parser.parse(&line.text) else {
            report.lines_skipped += 1;
            continue;
        };
        report.entries_parsed += 1;
        serde_json::to_writer(&mut *out, &entry)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    report.decrypt_failures = parser.decrypt_failures();
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

/// Parse `lines` and store every previously unseen event.
pub fn ingest<I>(lines: I, parser: &LineParser<'_>, store: &mut EventStore) -> IngestResult<RunReport>
where
    I: IntoIterator<Item = RawLine>,
{
    let started = Instant::now();
    let mut report = RunReport::default();

    for line in lines {
        report.lines_read += 1;
        let Some(entry) = parser.parse(&line.text) else {
            report.lines_skipped += 1;
            continue;
        };
        report.entries_parsed += 1;

        let event = match PersistedEvent::from_entry(&entry) {
            Ok(event) => event,
            Err(e) => {
                warn!("rejecting entry from {}: {e}", line.source);
                report.events_rejected += 1;
                continue;
            }
        };

        match store.upsert_if_new(&event)? {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::AlreadyPresent => report.already_present += 1,
        }
    }

    report.decrypt_failures = parser.decrypt_failures();
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        "ingest finished: {} lines, {} entries, {} inserted, {} already present, {} rejected",
        report.lines_read,
        report.entries_parsed,
        report.inserted,
        report.already_present,
        report.events_rejected
    );
    Ok(report)
}
