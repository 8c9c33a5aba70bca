//! relgraph-core: Shared types, configuration, and error handling for relgraph.
//!
//! This crate provides the vocabulary every other relgraph crate speaks:
//! - Cell values and source rows read from the relational store
//! - The portable schema descriptor produced by introspection
//! - Declarative mapping rules (node and relationship rules)
//! - Crosswalk entries and aggregate records for weighted aggregation
//! - Migration and audit report types
//! - Settings loading

pub mod config;
pub mod error;
pub mod mapping;
pub mod report;
pub mod types;

pub use error::RelgraphError;
pub use mapping::{
    AggregateRecord, AggregateSource, CrosswalkEntry, CrosswalkSpec, EndpointRef, MappingConfig,
    MappingRule, MetricScale, MetricSpec, NodeRule, PropertyKind, PropertySpec, RelationshipRule,
    RuleSource, ValueSpec,
};
pub use report::{
    AuditReport, AuditSeverity, BatchReport, BatchState, MigrationReport, RuleAudit, RuleKind,
    RuleReport, RuleState, SkippedRow,
};
pub use types::{
    CellValue, ColumnDescriptor, ForeignKeyDescriptor, OmittedTable, SchemaDescriptor,
    SemanticType, SourceRow, TableDescriptor, TableKind,
};
