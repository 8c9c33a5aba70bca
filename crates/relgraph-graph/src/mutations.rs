//! Write operations for the target graph.
//!
//! All writes use MERGE (match-or-create) semantics keyed by explicit key
//! properties, so re-applying a write never duplicates an entity.

use neo4rs::{BoltNull, BoltType, Query};

use relgraph_core::CellValue;

use crate::client::{ident, GraphClient, GraphError, WriteError};
use crate::{GraphTxn, NodeRef, WriteOp};

/// A parameterized Cypher statement before it is bound to the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub cypher: String,
    pub params: Vec<(String, CellValue)>,
    /// The statement returns `cnt`, which must be positive for the write to count.
    pub returns_count: bool,
}

impl Statement {
    fn to_query(&self) -> Result<Query, WriteError> {
        let mut q = neo4rs::query(&self.cypher);
        for (name, value) in &self.params {
            q = q.param(name, bolt(value)?);
        }
        Ok(q)
    }
}

fn bolt(value: &CellValue) -> Result<BoltType, WriteError> {
    Ok(match value {
        CellValue::Null => BoltType::Null(BoltNull),
        CellValue::Boolean(b) => BoltType::from(*b),
        CellValue::Integer(i) => BoltType::from(*i),
        CellValue::Float(f) if f.is_finite() => BoltType::from(*f),
        CellValue::Float(_) => BoltType::Null(BoltNull),
        CellValue::Text(s) => BoltType::from(s.clone()),
        CellValue::Bytes(_) => {
            return Err(WriteError::Row("binary values cannot be stored as properties".into()))
        }
    })
}

/// `{`k`: $p0, ...}` for a key, pushing the parameters.
fn key_map(
    node: &NodeRef,
    prefix: &str,
    params: &mut Vec<(String, CellValue)>,
) -> Result<String, WriteError> {
    let mut parts = Vec::with_capacity(node.key.len());
    for (i, (name, value)) in node.key.iter().enumerate() {
        if value.is_null() {
            return Err(WriteError::Row(format!(
                "null value in key property {name} of {}",
                node.label
            )));
        }
        let param = format!("{prefix}{i}");
        parts.push(format!("{}: ${param}", ident(name)?));
        params.push((param, value.clone()));
    }
    Ok(format!("{{{}}}", parts.join(", ")))
}

fn set_clause(
    var: &str,
    properties: &std::collections::BTreeMap<String, CellValue>,
    params: &mut Vec<(String, CellValue)>,
) -> Result<String, WriteError> {
    if properties.is_empty() {
        return Ok(String::new());
    }
    let mut parts = Vec::with_capacity(properties.len());
    for (i, (name, value)) in properties.iter().enumerate() {
        let param = format!("p{i}");
        parts.push(format!("{var}.{} = ${param}", ident(name)?));
        params.push((param, value.clone()));
    }
    Ok(format!("\nSET {}", parts.join(", ")))
}

/// Build the MERGE statement for one write.
pub fn merge_statement(op: &WriteOp) -> Result<Statement, WriteError> {
    let mut params = Vec::new();
    match op {
        WriteOp::MergeNode { node, properties } => {
            let key = key_map(node, "k", &mut params)?;
            let set = set_clause("n", properties, &mut params)?;
            Ok(Statement {
                cypher: format!("MERGE (n:{} {key}){set}", ident(&node.label)?),
                params,
                returns_count: false,
            })
        }
        WriteOp::MergeRelationship {
            rel_type,
            start,
            end,
            properties,
            directed,
        } => {
            let a = key_map(start, "a", &mut params)?;
            let b = key_map(end, "b", &mut params)?;
            let set = set_clause("r", properties, &mut params)?;
            let arrow = if *directed { "->" } else { "-" };
            Ok(Statement {
                cypher: format!(
                    "MATCH (a:{} {a})\nMATCH (b:{} {b})\nMERGE (a)-[r:{}]{arrow}(b){set}\nRETURN count(r) AS cnt",
                    ident(&start.label)?,
                    ident(&end.label)?,
                    ident(rel_type)?,
                ),
                params,
                returns_count: true,
            })
        }
    }
}

/// `CREATE CONSTRAINT` making `key` unique within `label`.
pub fn constraint_statement(label: &str, key: &[String]) -> Result<String, GraphError> {
    let name = format!("relgraph_{}_{}", label, key.join("_")).to_lowercase();
    let props = key
        .iter()
        .map(|k| Ok(format!("n.{}", ident(k)?)))
        .collect::<Result<Vec<_>, GraphError>>()?;
    let require = if props.len() == 1 {
        props[0].clone()
    } else {
        format!("({})", props.join(", "))
    };
    Ok(format!(
        "CREATE CONSTRAINT {} IF NOT EXISTS FOR (n:{}) REQUIRE {require} IS UNIQUE",
        ident(&name)?,
        ident(label)?
    ))
}

// ── Neo4j Transactions ────────────────────────────────────────────

/// A batch transaction on Neo4j.
pub struct Neo4jTxn {
    txn: neo4rs::Txn,
}

#[async_trait::async_trait]
impl GraphTxn for Neo4jTxn {
    async fn apply(&mut self, op: &WriteOp) -> Result<(), WriteError> {
        let stmt = merge_statement(op)?;
        let q = stmt.to_query()?;

        if !stmt.returns_count {
            return self.txn.run(q).await.map_err(WriteError::classify);
        }

        let mut stream = self.txn.execute(q).await.map_err(WriteError::classify)?;
        let mut cnt = 0i64;
        while let Some(row) = stream
            .next(self.txn.handle())
            .await
            .map_err(WriteError::classify)?
        {
            cnt += row.get::<i64>("cnt").unwrap_or(0);
        }
        if cnt == 0 {
            return Err(WriteError::Row("relationship endpoint not found".into()));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), GraphError> {
        self.txn
            .commit()
            .await
            .map_err(|e| GraphError::Transaction(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<(), GraphError> {
        self.txn
            .rollback()
            .await
            .map_err(|e| GraphError::Transaction(e.to_string()))
    }
}

impl GraphClient {
    /// Open a batch transaction.
    pub async fn begin_batch(&self) -> Result<Neo4jTxn, GraphError> {
        Ok(Neo4jTxn {
            txn: self.start_txn().await?,
        })
    }

    /// Create the uniqueness constraint for a node key if it does not exist.
    pub async fn create_key_constraint(&self, label: &str, key: &[String]) -> Result<(), GraphError> {
        let cypher = constraint_statement(label, key)?;
        self.run(neo4rs::query(&cypher)).await?;
        tracing::info!(label, key = ?key, "Ensured node key constraint");
        Ok(())
    }
}
