//! SHA-256 digests used by the audit chain.
//!
//! Payload digests (`input_hash` / `output_hash`) are taken over the JSON form
//! of whatever the caller passes; the entry hash is taken over the
//! unit-separator-joined chain fields so no field boundary is ambiguous.

use serde::Serialize;
use sha2::{Digest, Sha256};

const FIELD_SEPARATOR: [u8; 1] = [0x1f];

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn digest_str(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Digest of a value's canonical JSON encoding.
///
/// Types used here serialize deterministically (ordered maps, no floats in
/// keys), so equal values always produce equal digests. A value that cannot
/// be encoded is an error, never the digest of an empty buffer.
pub fn digest_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(value)?;
    Ok(sha256_hex(&encoded))
}

/// The fields an entry hash commits to, in hashing order.
pub struct EntryFields<'a> {
    pub prev_hash: &'a str,
    pub sequence_no: &'a str,
    pub actor: &'a str,
    pub stage: &'a str,
    pub input_hash: &'a str,
    pub output_hash: &'a str,
    pub verdict: Option<&'a str>,
    pub timestamp: &'a str,
}

/// `H(prev_hash || sequence_no || actor || stage || input_hash || output_hash || verdict || timestamp)`
pub fn entry_hash(fields: &EntryFields<'_>) -> String {
    let parts: [&str; 8] = [
        fields.prev_hash,
        fields.sequence_no,
        fields.actor,
        fields.stage,
        fields.input_hash,
        fields.output_hash,
        fields.verdict.unwrap_or(""),
        fields.timestamp,
    ];

    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(FIELD_SEPARATOR);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
