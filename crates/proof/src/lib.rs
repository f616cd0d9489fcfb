//! Content hashing and batch Merkle commitments.

use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash of the canonical JSON rendering of `value`: object keys sorted,
/// no whitespace. `serde_json::Map` is ordered by key, so the default
/// serializer already produces the canonical form.
pub fn sha256_json(value: &Value) -> Result<String> {
    let canonical = serde_json::to_string(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Merkle root over hex leaf digests. Parents hash the concatenation of
/// the two child hex strings; an odd level duplicates its last node.
/// Empty input yields an empty root, a single leaf is its own root.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return String::new();
    }
    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1].clone();
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| sha256_hex(format!("{}{}", pair[0], pair[1]).as_bytes()))
            .collect();
    }
    level.swap_remove(0)
}
