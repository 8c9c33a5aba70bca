//! relgraph-migrate: Relational-to-graph migration engine.
//!
//! Introspects a relational source, turns a declarative mapping into an
//! ordered plan, loads the graph in batched transactions with per-row
//! isolation and resumable checkpoints, and audits the result against the
//! source. Regional aggregates are derived on the way through a weighted
//! crosswalk.

pub mod aggregate;
pub mod analyzer;
pub mod auditor;
pub mod config;
pub mod error;
pub mod executor;
pub mod mapper;
pub mod rows;

pub use aggregate::{AggregateError, WeightedAggregator};
pub use analyzer::SchemaAnalyzer;
pub use auditor::IntegrityAuditor;
pub use config::{AnalyzerConfig, AuditConfig, MigrationConfig, Settings};
pub use error::{MigrateError, Result};
pub use executor::{CancelHandle, MigrationExecutor, ResumeFrom};
pub use mapper::{GraphMapper, MigrationPlan, PlannedRule};
pub use rows::RowError;
