//! Access-log line grammar.
//!
//! Lines look like `grep -H` output over an Apache `vhost_combined` log:
//!
//! ```text
//! other_vhosts_access.log:host.example:443 10.0.0.1 - - [01/Jan/2024:12:00:00 +0000] "GET /path?a=b HTTP/1.1" 200 ...
//! ```
//!
//! The grammar is one regex with named groups. It assumes the server token
//! holds no literal `:` other than an optional port, and that query values
//! never contain an encoded `&` or `=`. A port is only taken when whitespace
//! follows it, so in `host:1.2.3.4` the digits belong to the client address.
//!
//! `source_file` is everything before the first `:`. A store path that itself
//! contains `:` is therefore split too early, and the rest of the path leaks
//! into the server field or stops the line from matching.

use std::cell::Cell;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, trace, warn};

use crate::ingest::decrypt::FieldDecryptor;
use crate::models::{HttpMethod, ParsedLogEntry, QueryParams, USERID_PARAM};

static LOG_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?P<file>[^:]*):",
        r"(?P<server>[a-zA-Z0-9.\-]+(?::[0-9]+)?)[\s:]",
        r".*?\b(?P<client>[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3})\b",
        r".*?\[(?P<date>[^\]\s]+) [+-][0-9]{4}\]",
        r#"[^"]*"(?P<method>GET|HEAD) (?P<target>[^ "]+)"#,
    ))
    .unwrap()
});

/// Turns raw lines into [`ParsedLogEntry`] values.
///
/// Without a decryptor, `userid` values are passed through still encoded.
pub struct LineParser<'k> {
    decryptor: Option<&'k FieldDecryptor>,
    decrypt_failures: Cell<u64>,
}

impl<'k> LineParser<'k> {
    pub fn new(decryptor: Option<&'k FieldDecryptor>) -> Self {
        Self {
            decryptor,
            decrypt_failures: Cell::new(0),
        }
    }

    /// Number of `userid` values that failed to decrypt so far.
    pub fn decrypt_failures(&self) -> u64 {
        self.decrypt_failures.get()
    }

    /// Parse one line. Lines outside the grammar yield `None`.
    pub fn parse(&self, source_line: &str) -> Option<ParsedLogEntry> {
        let line = source_line.trim_end_matches(['\r', '\n']);
        let Some(caps) = LOG_LINE_RE.captures(line) else {
            trace!("skipping unmatched line: {line}");
            return None;
        };

        let http_method = HttpMethod::from_token(&caps["method"])?;
        let (path, query) = split_target(&caps["target"]);
        let query_params = query.map(|raw| self.parse_query(raw));

        Some(ParsedLogEntry {
            raw_line: line.to_string(),
            source_file: caps["file"].to_string(),
            server_name: caps["server"].to_string(),
            client_ip: caps["client"].to_string(),
            timestamp: caps["date"].to_string(),
            http_method,
            path: path.to_string(),
            query_params,
        })
    }

    /// Split a raw query string into an ordered mapping, decrypting `userid`.
    ///
    /// Empty segments are skipped. A segment with no `=` is kept as a key with
    /// an empty value. Repeated keys keep their first position and last value.
    pub fn parse_query(&self, raw: &str) -> QueryParams {
        let mut params = QueryParams::new();
        for segment in raw.split('&').filter(|s| !s.is_empty()) {
            let (key, value) = match segment.split_once('=') {
                Some(pair) => pair,
                None => {
                    debug!("query segment without '=': {segment:?}");
                    (segment, "")
                }
            };
            let value = if key == USERID_PARAM {
                self.decrypt_userid(value)
            } else {
                value.to_string()
            };
            params.insert(key.to_string(), value);
        }
        params
    }

    fn decrypt_userid(&self, encoded: &str) -> String {
        let Some(decryptor) = self.decryptor else {
            return encoded.to_string();
        };
        match decryptor.decrypt(encoded) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!("caught {err} while decrypting {USERID_PARAM}");
                self.decrypt_failures.set(self.decrypt_failures.get() + 1);
                encoded.to_string()
            }
        }
    }
}

/// Split a request target on its first `?`.
fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}
