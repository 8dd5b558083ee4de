//! Content hashing for event deduplication.
//!
//! The digest covers only the fields that identify a logical event. The
//! client address, source file and raw line are left out: rotated copies of
//! the same log line must hash identically.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::models::EventFields;

type Blake2b256 = Blake2b<U32>;

/// Field separator inside the hashed string. Changing it invalidates every
/// stored hash.
const HASH_FIELD_SEPARATOR: char = '#';

/// Build the exact string that gets hashed.
pub fn hash_input(timestamp: &str, fields: &EventFields) -> String {
    let sep = HASH_FIELD_SEPARATOR;
    format!(
        "{timestamp}{sep}{}{sep}{}{sep}{}{sep}{}",
        fields.userid, fields.operation, fields.status, fields.row_count
    )
}

/// BLAKE2b-256 hex digest of `timestamp#userid#operation#status#rowcount`.
pub fn content_hash(timestamp: &str, fields: &EventFields) -> String {
    let mut hasher = Blake2b256::new();
    hasher.update(hash_input(timestamp, fields).as_bytes());
    format!("{:x}", hasher.finalize())
}
