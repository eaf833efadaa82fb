//! xxHash-based key fingerprints.
//!
//! Deterministic 64-bit hashes used to identify rows by primary key (fan-in
//! dedup, join probe dedup) and to fingerprint schema layouts.

use xxhash_rust::xxh64;

use crate::row::{Row, Value};

/// Fixed seed for deterministic hashing.
const SEED: u64 = 0x517cc1b727220a95;

/// Compute a 64-bit fingerprint of a text representation.
pub fn hash_text(input: &str) -> u64 {
    xxh64::xxh64(input.as_bytes(), SEED)
}

/// Compute a fingerprint over multiple encoded values.
///
/// Values are joined with a record separator; `None` uses a NUL-framed
/// marker so it cannot collide with the literal string "NULL".
pub fn hash_parts(inputs: &[Option<String>]) -> u64 {
    let mut combined = String::new();
    for (i, input) in inputs.iter().enumerate() {
        if i > 0 {
            combined.push('\x1E');
        }
        match input {
            Some(val) => combined.push_str(val),
            None => combined.push_str("\x00NULL\x00"),
        }
    }
    xxh64::xxh64(combined.as_bytes(), SEED)
}

/// Encode a value for hashing. Type-tagged so `1`, `"1"`, and `true` hash
/// differently.
fn encode_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(format!("b:{}", if *b { "t" } else { "f" })),
        Value::Number(n) => Some(format!("n:{n}")),
        Value::Text(s) => Some(format!("s:{s}")),
        Value::Json(j) => Some(format!("j:{j}")),
    }
}

/// Fingerprint a row by the given key columns. Missing columns hash as NULL.
pub fn row_key_hash(row: &Row, key_columns: &[String]) -> u64 {
    let parts: Vec<Option<String>> = key_columns
        .iter()
        .map(|c| row.get(c).and_then(encode_value))
        .collect();
    hash_parts(&parts)
}
