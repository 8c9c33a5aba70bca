//! relgraph-graph: the target side of a migration.
//!
//! Every graph write the engine issues is a [`WriteOp`]: a match-or-create
//! (MERGE) of one node or one relationship identified by an explicit key.
//! Writes go through a [`GraphTxn`] opened from a [`GraphStore`]; the store
//! also answers the count and key-set reads the auditor needs.
//!
//! Two stores are provided: [`GraphClient`] for Neo4j and [`MemoryGraph`]
//! for dry runs and tests.

pub mod client;
pub mod memory;
pub mod mutations;
pub mod queries;

use std::collections::BTreeMap;

use async_trait::async_trait;

use relgraph_core::CellValue;

pub use client::{GraphClient, GraphConfig, GraphError, WriteError};
pub use memory::MemoryGraph;

/// Identifies one node by label and key properties.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRef {
    pub label: String,
    /// (property name, value) in key order.
    pub key: Vec<(String, CellValue)>,
}

impl NodeRef {
    /// Canonical key string, comparable with source-side keys.
    pub fn rendered_key(&self) -> String {
        relgraph_core::types::render_key(self.key.iter().map(|(_, v)| v))
    }

    /// Key string that keeps value types apart the way Cypher equality
    /// does: `1` and `"1"` are different nodes, `1` and `1.0` are the same.
    pub fn identity(&self) -> String {
        self.key
            .iter()
            .map(|(_, v)| match v {
                CellValue::Null => "null".to_string(),
                CellValue::Boolean(b) => format!("bool:{b}"),
                CellValue::Integer(i) => format!("num:{i}"),
                CellValue::Float(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => {
                    format!("num:{}", *f as i64)
                }
                CellValue::Float(f) => format!("num:{f:?}"),
                CellValue::Text(t) => format!("str:{t}"),
                CellValue::Bytes(_) => format!("bytes:{}", v.render()),
            })
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

/// One idempotent graph write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create the node if absent, then set `properties`.
    MergeNode {
        node: NodeRef,
        properties: BTreeMap<String, CellValue>,
    },
    /// Create the relationship between two existing nodes if absent, then
    /// set `properties`. A missing endpoint is a row-level failure.
    MergeRelationship {
        rel_type: String,
        start: NodeRef,
        end: NodeRef,
        properties: BTreeMap<String, CellValue>,
        directed: bool,
    },
}

/// Target graph store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), GraphError>;

    /// Open a write transaction.
    async fn begin(&self) -> Result<Box<dyn GraphTxn>, GraphError>;

    /// Make `key` unique within `label`. Idempotent.
    async fn ensure_node_key(&self, label: &str, key: &[String]) -> Result<(), GraphError>;

    async fn count_nodes(&self, label: &str) -> Result<u64, GraphError>;

    /// Relationships of `rel_type` between the two labels. Undirected counts
    /// each relationship once regardless of stored direction.
    async fn count_relationships(
        &self,
        rel_type: &str,
        start_label: &str,
        end_label: &str,
        directed: bool,
    ) -> Result<u64, GraphError>;

    /// Rendered keys of every `label` node carrying all `key` properties.
    async fn node_keys(&self, label: &str, key: &[String]) -> Result<Vec<String>, GraphError>;

    /// Rendered (start key, end key) pairs of every `rel_type` relationship.
    async fn relationship_keys(
        &self,
        rel_type: &str,
        start: (&str, &[String]),
        end: (&str, &[String]),
        directed: bool,
    ) -> Result<Vec<(String, String)>, GraphError>;
}

/// A batch-scoped write transaction.
///
/// Nothing applied through a transaction is visible to other readers until
/// [`GraphTxn::commit`]. A row-level [`WriteError`] leaves the transaction
/// unusable; the caller rolls it back.
#[async_trait]
pub trait GraphTxn: Send {
    async fn apply(&mut self, op: &WriteOp) -> Result<(), WriteError>;

    async fn commit(self: Box<Self>) -> Result<(), GraphError>;

    async fn rollback(self: Box<Self>) -> Result<(), GraphError>;
}
