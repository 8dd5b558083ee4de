//! Backing stores and the line sequence read from them.
//!
//! Stores are read one at a time, in the order given, each one fully before
//! the next. A store that cannot be read contributes no lines.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Output};

use flate2::read::MultiGzDecoder;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::errors::{IngestError, IngestResult};
use crate::models::RawLine;

const GZIP_EXTENSION: &str = "gz";

/// Pattern handed to a remote grep when no filter is configured.
const MATCH_ANY_PATTERN: &str = ".";

/// grep exit status for "no lines selected".
const GREP_NO_MATCH: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Plain,
    Gzip,
}

/// One backing store: a live log, a rotated log, or a compressed archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub location: String,
    pub compression: Compression,
}

impl StoreDescriptor {
    pub fn plain(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            compression: Compression::Plain,
        }
    }

    pub fn gzip(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            compression: Compression::Gzip,
        }
    }

    /// Infer compression from a `.gz` suffix.
    pub fn from_location(location: impl Into<String>) -> Self {
        let location = location.into();
        let is_gzip = Path::new(&location)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(GZIP_EXTENSION));
        if is_gzip {
            Self::gzip(location)
        } else {
            Self::plain(location)
        }
    }
}

/// Expand local glob patterns into store descriptors.
///
/// Each pattern keeps its position in the overall order; its matches are
/// sorted by path. A literal path is kept even when it does not exist so
/// that the read step reports it.
pub fn expand_local_stores(patterns: &[String]) -> IngestResult<Vec<StoreDescriptor>> {
    let mut stores = Vec::new();
    for pattern in patterns {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        if !pattern.contains(['*', '?', '[']) {
            stores.push(StoreDescriptor::from_location(pattern));
            continue;
        }
        let paths = glob::glob(pattern).map_err(|e| IngestError::Pattern(e.to_string()))?;
        let mut matched = 0usize;
        for path in paths {
            match path {
                Ok(path) => {
                    matched += 1;
                    stores.push(StoreDescriptor::from_location(
                        path.to_string_lossy().into_owned(),
                    ));
                }
                Err(e) => warn!("Skipping unreadable glob match for {pattern}: {e}"),
            }
        }
        if matched == 0 {
            debug!("glob {pattern} matched no files");
        }
    }
    Ok(stores)
}

// ---------------------------------------------------------------------------
// Fetchers
// ---------------------------------------------------------------------------

/// Reads the full contents of one store as lines.
pub trait LineFetcher {
    /// An `Err` means the store is unavailable.
    fn fetch(&self, store: &StoreDescriptor) -> IngestResult<Vec<String>>;
}

impl<T: LineFetcher + ?Sized> LineFetcher for Box<T> {
    fn fetch(&self, store: &StoreDescriptor) -> IngestResult<Vec<String>> {
        (**self).fetch(store)
    }
}

/// Reads stores from the local filesystem.
///
/// Lines are prefixed with `"{location}:"`, as `grep -H` would print them,
/// and optionally filtered.
#[derive(Debug, Default)]
pub struct LocalFetcher {
    filter: Option<Regex>,
}

impl LocalFetcher {
    pub fn new(filter: Option<Regex>) -> Self {
        Self { filter }
    }

    fn open(store: &StoreDescriptor) -> IngestResult<Box<dyn BufRead>> {
        let file = File::open(&store.location)?;
        let reader: Box<dyn Read> = match store.compression {
            Compression::Plain => Box::new(file),
            Compression::Gzip => Box::new(MultiGzDecoder::new(file)),
        };
        Ok(Box::new(BufReader::new(reader)))
    }
}

impl LineFetcher for LocalFetcher {
    fn fetch(&self, store: &StoreDescriptor) -> IngestResult<Vec<String>> {
        let mut reader = Self::open(store)?;
        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&buf);
            let text = text.trim_end_matches(['\r', '\n']);
            if let Some(filter) = &self.filter {
                if !filter.is_match(text) {
                    continue;
                }
            }
            lines.push(format!("{}:{}", store.location, text));
        }
        Ok(lines)
    }
}

/// Reads stores on a remote host with `ssh <host> grep|zgrep -E -H <pattern> <path>`.
///
/// The path is passed unquoted so the remote shell can expand globs.
#[derive(Debug)]
pub struct RemoteFetcher {
    host: String,
    pattern: String,
}

impl RemoteFetcher {
    pub fn new(host: impl Into<String>, pattern: Option<String>) -> Self {
        Self {
            host: host.into(),
            pattern: pattern.unwrap_or_else(|| MATCH_ANY_PATTERN.to_string()),
        }
    }

    pub fn command(&self, store: &StoreDescriptor) -> Command {
        let grep = match store.compression {
            Compression::Plain => "grep",
            Compression::Gzip => "zgrep",
        };
        let mut cmd = Command::new("ssh");
        cmd.arg(&self.host)
            .arg(grep)
            .arg("-E")
            .arg("-H")
            .arg(shell_quote(&self.pattern))
            .arg(&store.location);
        cmd
    }
}

impl RemoteFetcher {
    /// Turn a finished remote grep into the store's lines.
    ///
    /// Exit status 1 is grep's "nothing selected" and yields no lines. Any
    /// other failure makes the store unavailable unless some output arrived,
    /// in which case that output is kept.
    fn collect_output(
        &self,
        store: &StoreDescriptor,
        output: Output,
    ) -> IngestResult<Vec<String>> {
        if !output.status.success() {
            if output.status.code() == Some(GREP_NO_MATCH) {
                debug!("no matching lines in {} on {}", store.location, self.host);
                return Ok(vec![]);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            if output.stdout.is_empty() {
                return Err(IngestError::Io(std::io::Error::other(format!(
                    "ssh {} exited with {}: {}",
                    self.host,
                    output.status,
                    stderr.trim()
                ))));
            }
            warn!(
                "ssh {} exited with {} for {}; keeping partial output: {}",
                self.host,
                output.status,
                store.location,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl LineFetcher for RemoteFetcher {
    fn fetch(&self, store: &StoreDescriptor) -> IngestResult<Vec<String>> {
        debug!("fetching {} from {}", store.location, self.host);
        let output = self.command(store).output()?;
        self.collect_output(store, output)
    }
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// LineSource
// ---------------------------------------------------------------------------

/// Lazy, single-pass iterator over the lines of all stores, in order.
pub struct LineSource<F: LineFetcher> {
    fetcher: F,
    pending: VecDeque<StoreDescriptor>,
    current: Option<(String, std::vec::IntoIter<String>)>,
    stores_failed: usize,
}

impl<F: LineFetcher> LineSource<F> {
    pub fn new(fetcher: F, stores: Vec<StoreDescriptor>) -> Self {
        Self {
            fetcher,
            pending: stores.into(),
            current: None,
            stores_failed: 0,
        }
    }

    /// Stores that could not be read so far.
    pub fn stores_failed(&self) -> usize {
        self.stores_failed
    }

    fn advance_store(&mut self) -> bool {
        let Some(store) = self.pending.pop_front() else {
            return false;
        };
        let lines = match self.fetcher.fetch(&store) {
            Ok(lines) => {
                info!("read {} lines from {}", lines.len(), store.location);
                lines
            }
            Err(e) => {
                warn!("store {} unavailable: {e}", store.location);
                self.stores_failed += 1;
                vec![]
            }
        };
        self.current = Some((store.location, lines.into_iter()));
        true
    }
}

impl<F: LineFetcher> Iterator for LineSource<F> {
    type Item = RawLine;

    fn next(&mut self) -> Option<RawLine> {
        loop {
            if let Some((source, lines)) = &mut self.current {
                if let Some(text) = lines.next() {
                    return Some(RawLine {
                        source: source.clone(),
                        text,
                    });
                }
            }
            if !self.advance_store() {
                self.current = None;
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;

    use super::*;

    fn write_plain(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn write_gzip(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::default());
        encoder.write_all(body.as_bytes()).unwrap();
        encoder.finish().unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn descriptor_infers_compression() {
        assert_eq!(
            StoreDescriptor::from_location("/var/log/access.log.2.gz").compression,
            Compression::Gzip
        );
        assert_eq!(
            StoreDescriptor::from_location("/var/log/access.log.1").compression,
            Compression::Plain
        );
    }

    #[test]
    fn stores_concatenate_in_descriptor_order() {
        let dir = tempfile::tempdir().unwrap();
        let live = write_plain(dir.path(), "access.log", "c1\nc2\n");
        let rotated = write_plain(dir.path(), "access.log.1", "b1\nb2");
        let archived = write_gzip(dir.path(), "access.log.2.gz", "a1\na2\n");

        let source = LineSource::new(
            LocalFetcher::default(),
            vec![
                StoreDescriptor::from_location(&live),
                StoreDescriptor::from_location(&rotated),
                StoreDescriptor::from_location(&archived),
            ],
        );
        let lines: Vec<RawLine> = source.collect();
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                format!("{live}:c1"),
                format!("{live}:c2"),
                format!("{rotated}:b1"),
                format!("{rotated}:b2"),
                format!("{archived}:a1"),
                format!("{archived}:a2"),
            ]
        );
        assert_eq!(lines[4].source, archived);
    }

    #[test]
    fn missing_and_empty_stores_yield_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write_plain(dir.path(), "empty.log", "");
        let present = write_plain(dir.path(), "present.log", "only\n");
        let missing = dir.path().join("missing.log").to_string_lossy().into_owned();

        let mut source = LineSource::new(
            LocalFetcher::default(),
            vec![
                StoreDescriptor::plain(&missing),
                StoreDescriptor::plain(&empty),
                StoreDescriptor::plain(&present),
            ],
        );
        let first = source.next().unwrap();
        assert_eq!(first.text, format!("{present}:only"));
        assert_eq!(source.next(), None);
        assert_eq!(source.stores_failed(), 1);
    }

    #[test]
    fn corrupt_gzip_counts_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = write_plain(dir.path(), "bogus.log.gz", "not gzip at all\n");
        let mut source = LineSource::new(
            LocalFetcher::default(),
            vec![StoreDescriptor::from_location(&bogus)],
        );
        assert_eq!(source.next(), None);
        assert_eq!(source.stores_failed(), 1);
    }

    #[test]
    fn local_filter_applies_to_line_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plain(
            dir.path(),
            "access.log",
            "keep operation=fetch\ndrop this\nkeep operation=list\n",
        );
        let fetcher = LocalFetcher::new(Some(Regex::new("operation").unwrap()));
        let lines = fetcher.fetch(&StoreDescriptor::plain(&path)).unwrap();
        assert_eq!(
            lines,
            vec![
                format!("{path}:keep operation=fetch"),
                format!("{path}:keep operation=list"),
            ]
        );
    }

    #[test]
    fn expand_local_stores_keeps_pattern_order() {
        let dir = tempfile::tempdir().unwrap();
        let live = write_plain(dir.path(), "access.log", "");
        let gz3 = write_gzip(dir.path(), "access.log.3.gz", "");
        let gz2 = write_gzip(dir.path(), "access.log.2.gz", "");
        let glob_pattern = format!("{}/access.log.*.gz", dir.path().display());

        let stores = expand_local_stores(&[live.clone(), glob_pattern]).unwrap();
        assert_eq!(
            stores,
            vec![
                StoreDescriptor::plain(live),
                StoreDescriptor::gzip(gz2),
                StoreDescriptor::gzip(gz3),
            ]
        );
    }

    #[test]
    fn remote_command_shape() {
        let fetcher = RemoteFetcher::new("logs.example", Some("host.*operation".to_string()));
        let cmd = fetcher.command(&StoreDescriptor::gzip("/var/log/apache2/access.log.*.gz"));
        assert_eq!(cmd.get_program(), "ssh");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "logs.example",
                "zgrep",
                "-E",
                "-H",
                "'host.*operation'",
                "/var/log/apache2/access.log.*.gz",
            ]
        );
    }

    #[cfg(unix)]
    fn finished(code: i32, stdout: &str, stderr: &str) -> Output {
        use std::os::unix::process::ExitStatusExt;
        Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn remote_success_drops_blank_lines() {
        let fetcher = RemoteFetcher::new("logs.example", None);
        let store = StoreDescriptor::plain("/var/log/access.log");
        let lines = fetcher
            .collect_output(&store, finished(0, "/var/log/access.log:a\n\n/var/log/access.log:b\n", ""))
            .unwrap();
        assert_eq!(lines, vec!["/var/log/access.log:a", "/var/log/access.log:b"]);
    }

    #[cfg(unix)]
    #[test]
    fn remote_no_match_is_empty_not_failure() {
        let fetcher = RemoteFetcher::new("logs.example", None);
        let store = StoreDescriptor::gzip("/var/log/access.log.2.gz");
        let lines = fetcher.collect_output(&store, finished(1, "", "")).unwrap();
        assert!(lines.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn remote_failure_without_output_is_unavailable() {
        let fetcher = RemoteFetcher::new("logs.example", None);
        let store = StoreDescriptor::plain("/var/log/access.log");
        let err = fetcher
            .collect_output(&store, finished(255, "", "ssh: connect to host logs.example: Connection refused"))
            .unwrap_err();
        assert!(matches!(err, IngestError::Io(_)));
        assert!(err.to_string().contains("Connection refused"));
    }

    #[cfg(unix)]
    #[test]
    fn remote_failure_keeps_partial_output() {
        let fetcher = RemoteFetcher::new("logs.example", None);
        let store = StoreDescriptor::gzip("/var/log/access.log.*.gz");
        let lines = fetcher
            .collect_output(
                &store,
                finished(2, "/var/log/access.log.2.gz:a\n", "gzip: access.log.3.gz: unexpected end of file"),
            )
            .unwrap();
        assert_eq!(lines, vec!["/var/log/access.log.2.gz:a"]);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
