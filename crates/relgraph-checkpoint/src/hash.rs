//! BLAKE3 content hashing for checkpoint integrity.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Checkpoint;

/// Hashable representation of a checkpoint (excludes content_hash).
#[derive(Serialize)]
struct HashableCheckpoint<'a> {
    plan_fingerprint: &'a str,
    rule: &'a str,
    next_offset: u64,
    batches_done: u64,
    updated_at: &'a DateTime<Utc>,
}

/// Hex-encoded BLAKE3 hash of the checkpoint's canonical JSON.
pub fn compute_checkpoint_hash(cp: &Checkpoint) -> String {
    let hashable = HashableCheckpoint {
        plan_fingerprint: &cp.plan_fingerprint,
        rule: &cp.rule,
        next_offset: cp.next_offset,
        batches_done: cp.batches_done,
        updated_at: &cp.updated_at,
    };
    // Plain scalars always serialize.
    let json = serde_json::to_vec(&hashable).unwrap_or_default();
    blake3::hash(&json).to_hex().to_string()
}
