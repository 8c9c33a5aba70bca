//! Error types for the relgraph-migrate crate.

use thiserror::Error;

use crate::aggregate::AggregateError;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Mapping rule {rule} is invalid: {detail}")]
    SchemaValidation { rule: String, detail: String },

    #[error("Mapping rules form a dependency cycle: {}", cycle.join(" -> "))]
    CyclicMapping { cycle: Vec<String> },

    #[error("Batch size must be a positive integer")]
    InvalidBatchSize,

    #[error("Source error: {0}")]
    Source(#[from] relgraph_source::SourceError),

    #[error("Graph error: {0}")]
    Graph(#[from] relgraph_graph::GraphError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] relgraph_checkpoint::CheckpointError),

    #[error("Aggregation error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Core(#[from] relgraph_core::RelgraphError),
}

impl MigrateError {
    pub(crate) fn invalid(rule: &str, detail: impl Into<String>) -> Self {
        Self::SchemaValidation {
            rule: rule.to_string(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrateError>;
