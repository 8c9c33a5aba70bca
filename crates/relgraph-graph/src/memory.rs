//! In-memory graph store.
//!
//! Used for dry runs and tests. Transactions stage their writes and apply
//! them atomically on commit, so an uncommitted batch is never visible.
//! Fault injection hooks let tests simulate constraint violations, slow
//! writes and a store that goes away mid-run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use relgraph_core::types::render_key;
use relgraph_core::CellValue;

use crate::client::{GraphError, WriteError};
use crate::{GraphStore, GraphTxn, NodeRef, WriteOp};

/// A committed node.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    pub key: Vec<(String, CellValue)>,
    /// Every property including the key properties. Null is never stored.
    pub properties: BTreeMap<String, CellValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RelId {
    rel_type: String,
    start_label: String,
    start_key: String,
    end_label: String,
    end_key: String,
    directed: bool,
}

impl RelId {
    fn new(rel_type: &str, start: &NodeRef, end: &NodeRef, directed: bool) -> Self {
        let mut a = (start.label.clone(), start.identity());
        let mut b = (end.label.clone(), end.identity());
        if !directed && b < a {
            std::mem::swap(&mut a, &mut b);
        }
        Self {
            rel_type: rel_type.to_string(),
            start_label: a.0,
            start_key: a.1,
            end_label: b.0,
            end_key: b.1,
            directed,
        }
    }

    fn connects(&self, start_label: &str, end_label: &str, directed: bool) -> bool {
        if directed {
            self.start_label == start_label && self.end_label == end_label
        } else {
            (self.start_label == start_label && self.end_label == end_label)
                || (self.start_label == end_label && self.end_label == start_label)
        }
    }
}

#[derive(Default)]
struct State {
    /// label -> node identity -> node.
    nodes: BTreeMap<String, BTreeMap<String, StoredNode>>,
    relationships: BTreeMap<RelId, BTreeMap<String, CellValue>>,
    constraints: BTreeSet<(String, Vec<String>)>,
}

#[derive(Default)]
struct Faults {
    outage: bool,
    commits_before_outage: Option<u64>,
    rejected: BTreeSet<String>,
    delayed: BTreeMap<String, Duration>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    faults: Mutex<Faults>,
}

/// Shared in-memory graph. Clone is cheap (inner Arc).
#[derive(Clone, Default)]
pub struct MemoryGraph {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unavailable() -> GraphError {
    GraphError::Connection("in-memory graph is unavailable".into())
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Inspection ───────────────────────────────────────────────

    /// First node of `label` whose key renders as `rendered_key`.
    pub fn node(&self, label: &str, rendered_key: &str) -> Option<StoredNode> {
        lock(&self.inner.state)
            .nodes
            .get(label)
            .and_then(|nodes| {
                nodes
                    .values()
                    .find(|n| render_key(n.key.iter().map(|(_, v)| v)) == rendered_key)
            })
            .cloned()
    }

    pub fn node_count(&self, label: &str) -> usize {
        lock(&self.inner.state)
            .nodes
            .get(label)
            .map_or(0, BTreeMap::len)
    }

    /// Sorted rendered keys of every node with `label`.
    pub fn rendered_keys(&self, label: &str) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.inner.state)
            .nodes
            .get(label)
            .map(|nodes| {
                nodes
                    .values()
                    .map(|n| render_key(n.key.iter().map(|(_, v)| v)))
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn relationship_count(&self, rel_type: &str) -> usize {
        lock(&self.inner.state)
            .relationships
            .keys()
            .filter(|r| r.rel_type == rel_type)
            .count()
    }

    pub fn has_constraint(&self, label: &str, key: &[String]) -> bool {
        lock(&self.inner.state)
            .constraints
            .contains(&(label.to_string(), key.to_vec()))
    }

    /// Remove the nodes whose key renders as `rendered_key`, with their
    /// relationships.
    pub fn delete_node(&self, label: &str, rendered_key: &str) -> bool {
        let mut state = lock(&self.inner.state);
        let mut removed = BTreeSet::new();
        if let Some(nodes) = state.nodes.get_mut(label) {
            nodes.retain(|identity, n| {
                let hit = render_key(n.key.iter().map(|(_, v)| v)) == rendered_key;
                if hit {
                    removed.insert(identity.clone());
                }
                !hit
            });
        }
        state.relationships.retain(|r, _| {
            !((r.start_label == label && removed.contains(&r.start_key))
                || (r.end_label == label && removed.contains(&r.end_key)))
        });
        !removed.is_empty()
    }

    // ── Fault Injection ──────────────────────────────────────────

    /// Make the store unreachable (or reachable again).
    pub fn set_outage(&self, down: bool) {
        lock(&self.inner.faults).outage = down;
    }

    /// Let `n` more commits succeed, then fail every call as an outage
    /// until [`MemoryGraph::set_outage`] clears it.
    pub fn fail_after_commits(&self, n: u64) {
        lock(&self.inner.faults).commits_before_outage = Some(n);
    }

    /// Reject node writes with this rendered key (and relationship writes
    /// starting at it) as a constraint violation.
    pub fn reject_key(&self, rendered_key: &str) {
        lock(&self.inner.faults)
            .rejected
            .insert(rendered_key.to_string());
    }

    /// Delay node writes with this rendered key.
    pub fn delay_key(&self, rendered_key: &str, delay: Duration) {
        lock(&self.inner.faults)
            .delayed
            .insert(rendered_key.to_string(), delay);
    }

    fn is_down(&self) -> bool {
        lock(&self.inner.faults).outage
    }

    fn node_exists(&self, node: &NodeRef, staged: &[WriteOp]) -> bool {
        let key = node.identity();
        let committed = lock(&self.inner.state)
            .nodes
            .get(&node.label)
            .is_some_and(|nodes| nodes.contains_key(&key));
        committed
            || staged.iter().any(|op| {
                matches!(op, WriteOp::MergeNode { node: n, .. }
                    if n.label == node.label && n.identity() == key)
            })
    }

    fn apply_committed(state: &mut State, op: WriteOp) {
        match op {
            WriteOp::MergeNode { node, properties } => {
                let key = node.identity();
                let stored = state
                    .nodes
                    .entry(node.label.clone())
                    .or_default()
                    .entry(key)
                    .or_insert_with(|| StoredNode {
                        key: node.key.clone(),
                        properties: node.key.iter().cloned().collect(),
                    });
                merge_properties(&mut stored.properties, properties);
            }
            WriteOp::MergeRelationship {
                rel_type,
                start,
                end,
                properties,
                directed,
            } => {
                let id = RelId::new(&rel_type, &start, &end, directed);
                let stored = state.relationships.entry(id).or_default();
                merge_properties(stored, properties);
            }
        }
    }

    /// Key property values of a committed node, rendered.
    fn key_of(state: &State, label: &str, identity: &str, key: &[String]) -> Option<String> {
        let node = state.nodes.get(label)?.get(identity)?;
        let mut parts = Vec::with_capacity(key.len());
        for k in key {
            match node.properties.get(k) {
                Some(v) if !v.is_null() => parts.push(v),
                _ => return None,
            }
        }
        Some(render_key(parts))
    }
}

/// `SET x.p = v` semantics: null removes the property.
fn merge_properties(target: &mut BTreeMap<String, CellValue>, source: BTreeMap<String, CellValue>) {
    for (name, value) in source {
        match value.normalized() {
            CellValue::Null => {
                target.remove(&name);
            }
            v => {
                target.insert(name, v);
            }
        }
    }
}

fn check_values(node: &NodeRef, properties: &BTreeMap<String, CellValue>) -> Result<(), WriteError> {
    for (name, value) in &node.key {
        if value.is_null() {
            return Err(WriteError::Row(format!(
                "null value in key property {name} of {}",
                node.label
            )));
        }
    }
    let binary = node
        .key
        .iter()
        .map(|(_, v)| v)
        .chain(properties.values())
        .any(|v| matches!(v, CellValue::Bytes(_)));
    if binary {
        return Err(WriteError::Row(
            "binary values cannot be stored as properties".into(),
        ));
    }
    Ok(())
}

/// Staged writes for one batch.
pub struct MemoryTxn {
    graph: MemoryGraph,
    staged: Vec<WriteOp>,
}

#[async_trait]
impl GraphTxn for MemoryTxn {
    async fn apply(&mut self, op: &WriteOp) -> Result<(), WriteError> {
        if self.graph.is_down() {
            return Err(unavailable().into());
        }

        let subject = match op {
            WriteOp::MergeNode { node, properties } => {
                check_values(node, properties)?;
                node.rendered_key()
            }
            WriteOp::MergeRelationship {
                start,
                end,
                properties,
                ..
            } => {
                check_values(start, properties)?;
                check_values(end, &BTreeMap::new())?;
                if !self.graph.node_exists(start, &self.staged)
                    || !self.graph.node_exists(end, &self.staged)
                {
                    return Err(WriteError::Row("relationship endpoint not found".into()));
                }
                start.rendered_key()
            }
        };

        let (rejected, delay) = {
            let faults = lock(&self.graph.inner.faults);
            (
                faults.rejected.contains(&subject),
                faults.delayed.get(&subject).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if rejected {
            return Err(WriteError::Row(format!(
                "constraint violation for key {subject}"
            )));
        }

        self.staged.push(op.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), GraphError> {
        {
            let mut faults = lock(&self.graph.inner.faults);
            if faults.outage {
                return Err(unavailable());
            }
            match faults.commits_before_outage {
                Some(0) => {
                    faults.commits_before_outage = None;
                    faults.outage = true;
                    return Err(unavailable());
                }
                Some(n) => faults.commits_before_outage = Some(n - 1),
                None => {}
            }
        }
        let mut state = lock(&self.graph.inner.state);
        for op in self.staged {
            MemoryGraph::apply_committed(&mut state, op);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), GraphError> {
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn ping(&self) -> Result<(), GraphError> {
        if self.is_down() {
            return Err(unavailable());
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn GraphTxn>, GraphError> {
        if self.is_down() {
            return Err(unavailable());
        }
        Ok(Box::new(MemoryTxn {
            graph: self.clone(),
            staged: Vec::new(),
        }))
    }

    async fn ensure_node_key(&self, label: &str, key: &[String]) -> Result<(), GraphError> {
        if self.is_down() {
            return Err(unavailable());
        }
        lock(&self.inner.state)
            .constraints
            .insert((label.to_string(), key.to_vec()));
        Ok(())
    }

    async fn count_nodes(&self, label: &str) -> Result<u64, GraphError> {
        Ok(self.node_count(label) as u64)
    }

    async fn count_relationships(
        &self,
        rel_type: &str,
        start_label: &str,
        end_label: &str,
        directed: bool,
    ) -> Result<u64, GraphError> {
        let state = lock(&self.inner.state);
        let n = state
            .relationships
            .keys()
            .filter(|r| r.rel_type == rel_type && r.connects(start_label, end_label, directed))
            .count();
        Ok(n as u64)
    }

    async fn node_keys(&self, label: &str, key: &[String]) -> Result<Vec<String>, GraphError> {
        let state = lock(&self.inner.state);
        let Some(nodes) = state.nodes.get(label) else {
            return Ok(Vec::new());
        };
        Ok(nodes
            .keys()
            .filter_map(|identity| Self::key_of(&state, label, identity, key))
            .collect())
    }

    async fn relationship_keys(
        &self,
        rel_type: &str,
        start: (&str, &[String]),
        end: (&str, &[String]),
        directed: bool,
    ) -> Result<Vec<(String, String)>, GraphError> {
        let state = lock(&self.inner.state);
        let mut out = Vec::new();
        for r in state.relationships.keys() {
            if r.rel_type != rel_type || !r.connects(start.0, end.0, directed) {
                continue;
            }
            // Stored orientation may be reversed for undirected relationships.
            let (s_label, s_key, e_label, e_key) = if r.start_label == start.0 {
                (&r.start_label, &r.start_key, &r.end_label, &r.end_key)
            } else {
                (&r.end_label, &r.end_key, &r.start_label, &r.start_key)
            };
            let a = Self::key_of(&state, s_label, s_key, start.1);
            let b = Self::key_of(&state, e_label, e_key, end.1);
            if let (Some(a), Some(b)) = (a, b) {
                out.push((a, b));
            }
        }
        Ok(out)
    }
}
