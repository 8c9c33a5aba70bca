//! Settings for the migration engine.
//!
//! Loaded from `relgraph.toml` (sections `[source]`, `[neo4j]`,
//! `[migration]`, `[analyzer]`, `[audit]`) or `RELGRAPH__<SECTION>__<KEY>`
//! environment variables.

use serde::Deserialize;

use relgraph_core::config::{load_settings, section};
use relgraph_graph::GraphConfig;
use relgraph_source::SqliteConfig;

use crate::error::Result;

/// `[migration]` settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Rows per batch transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rules allowed to run at the same time.
    #[serde(default = "default_max_concurrent_rules")]
    pub max_concurrent_rules: usize,

    /// Batches fetched ahead of the one being written.
    #[serde(default = "default_prefetch_batches")]
    pub prefetch_batches: usize,

    /// Per-row write timeout; an expired row is skipped.
    #[serde(default)]
    pub row_timeout_ms: Option<u64>,

    /// Wall-clock budget for a run, observed at batch boundaries.
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    /// Create a uniqueness constraint per node key before loading.
    #[serde(default = "default_true")]
    pub create_constraints: bool,

    /// Directory for resume checkpoints.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,

    /// Skipped rows kept verbatim in the report; the rest are only counted.
    #[serde(default = "default_max_skipped_samples")]
    pub max_skipped_samples: usize,
}

fn default_batch_size() -> usize {
    500
}

fn default_max_concurrent_rules() -> usize {
    4
}

fn default_prefetch_batches() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> String {
    "./checkpoints".to_string()
}

fn default_max_skipped_samples() -> usize {
    1000
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_rules: default_max_concurrent_rules(),
            prefetch_batches: default_prefetch_batches(),
            row_timeout_ms: None,
            deadline_secs: None,
            create_constraints: default_true(),
            checkpoint_dir: default_checkpoint_dir(),
            max_skipped_samples: default_max_skipped_samples(),
        }
    }
}

/// `[analyzer]` settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzerConfig {
    /// Tables never introspected.
    #[serde(default)]
    pub exclude_tables: Vec<String>,
}

/// `[audit]` settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Missing keys listed per rule.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

fn default_sample_size() -> usize {
    20
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
        }
    }
}

/// Every section the `relgraph` binary reads.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub source: SqliteConfig,
    pub neo4j: GraphConfig,
    pub migration: MigrationConfig,
    pub analyzer: AnalyzerConfig,
    pub audit: AuditConfig,
}

impl Settings {
    pub fn load(file_prefix: &str) -> Result<Self> {
        let settings = load_settings(file_prefix)?;
        Ok(Self {
            source: section(&settings, "source")?,
            neo4j: section(&settings, "neo4j")?,
            migration: section(&settings, "migration")?,
            analyzer: section(&settings, "analyzer")?,
            audit: section(&settings, "audit")?,
        })
    }
}
