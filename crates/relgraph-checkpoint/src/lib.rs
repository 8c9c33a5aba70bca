//! relgraph-checkpoint: resumable migration progress.
//!
//! After every batch reaches a terminal state the executor records, per
//! rule, the first source offset not yet covered. Checkpoints are scoped to
//! a plan fingerprint so a changed mapping never resumes from a stale
//! offset, and each record carries a BLAKE3 hash of its content so a
//! corrupted or hand-edited file is detected instead of trusted.

pub mod hash;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

/// Progress of one rule under one plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Fingerprint of the plan the offset belongs to.
    pub plan_fingerprint: String,
    /// Rule id.
    pub rule: String,
    /// First offset not covered by a committed or partially committed batch.
    pub next_offset: u64,
    /// Terminal batches recorded so far.
    pub batches_done: u64,
    pub updated_at: DateTime<Utc>,
    /// BLAKE3 content hash (hex) over every other field.
    pub content_hash: String,
}

impl Checkpoint {
    /// Build a sealed checkpoint.
    pub fn new(plan_fingerprint: &str, rule: &str, next_offset: u64, batches_done: u64) -> Self {
        let mut cp = Self {
            plan_fingerprint: plan_fingerprint.to_string(),
            rule: rule.to_string(),
            next_offset,
            batches_done,
            updated_at: Utc::now(),
            content_hash: String::new(),
        };
        cp.content_hash = cp.compute_hash();
        cp
    }

    pub fn compute_hash(&self) -> String {
        hash::compute_checkpoint_hash(self)
    }

    /// Verify that the stored content_hash matches a freshly computed hash.
    pub fn verify_integrity(&self) -> bool {
        self.content_hash == self.compute_hash()
    }
}
