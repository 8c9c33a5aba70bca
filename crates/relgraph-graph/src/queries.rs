//! Read operations against Neo4j and the `GraphStore` implementation.

use async_trait::async_trait;
use neo4rs::query;

use crate::client::{ident, GraphClient, GraphError};
use crate::{GraphStore, GraphTxn};

/// `[toString(v.`a`), toString(v.`b`)]` plus the matching non-null filter.
fn key_projection(var: &str, key: &[String]) -> Result<(String, String), GraphError> {
    let mut items = Vec::with_capacity(key.len());
    let mut filters = Vec::with_capacity(key.len());
    for k in key {
        let prop = format!("{var}.{}", ident(k)?);
        items.push(format!("toString({prop})"));
        filters.push(format!("{prop} IS NOT NULL"));
    }
    Ok((format!("[{}]", items.join(", ")), filters.join(" AND ")))
}

fn rel_pattern(
    rel_type: &str,
    start_label: &str,
    end_label: &str,
    directed: bool,
) -> Result<String, GraphError> {
    let arrow = if directed { "->" } else { "-" };
    Ok(format!(
        "(a:{})-[r:{}]{arrow}(b:{})",
        ident(start_label)?,
        ident(rel_type)?,
        ident(end_label)?
    ))
}

fn count_of(row: Option<neo4rs::Row>) -> Result<u64, GraphError> {
    match row {
        Some(row) => row
            .get::<i64>("cnt")
            .map(|n| n.max(0) as u64)
            .map_err(|e| GraphError::Decode(e.to_string())),
        None => Ok(0),
    }
}

#[async_trait]
impl GraphStore for GraphClient {
    async fn ping(&self) -> Result<(), GraphError> {
        self.query_one(query("RETURN 1 AS ok"))
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn GraphTxn>, GraphError> {
        Ok(Box::new(self.begin_batch().await?))
    }

    async fn ensure_node_key(&self, label: &str, key: &[String]) -> Result<(), GraphError> {
        self.create_key_constraint(label, key).await
    }

    async fn count_nodes(&self, label: &str) -> Result<u64, GraphError> {
        let cypher = format!("MATCH (n:{}) RETURN count(n) AS cnt", ident(label)?);
        count_of(self.query_one(query(&cypher)).await?)
    }

    async fn count_relationships(
        &self,
        rel_type: &str,
        start_label: &str,
        end_label: &str,
        directed: bool,
    ) -> Result<u64, GraphError> {
        let cypher = format!(
            "MATCH {} RETURN count(DISTINCT r) AS cnt",
            rel_pattern(rel_type, start_label, end_label, directed)?
        );
        count_of(self.query_one(query(&cypher)).await?)
    }

    async fn node_keys(&self, label: &str, key: &[String]) -> Result<Vec<String>, GraphError> {
        let (projection, filter) = key_projection("n", key)?;
        let cypher = format!(
            "MATCH (n:{}) WHERE {filter} RETURN {projection} AS k",
            ident(label)?
        );
        let rows = self.query_rows(query(&cypher)).await?;
        rows.into_iter()
            .map(|row| {
                row.get::<Vec<String>>("k")
                    .map(|parts| parts.join("|"))
                    .map_err(|e| GraphError::Decode(e.to_string()))
            })
            .collect()
    }

    async fn relationship_keys(
        &self,
        rel_type: &str,
        start: (&str, &[String]),
        end: (&str, &[String]),
        directed: bool,
    ) -> Result<Vec<(String, String)>, GraphError> {
        let (a_proj, a_filter) = key_projection("a", start.1)?;
        let (b_proj, b_filter) = key_projection("b", end.1)?;
        let cypher = format!(
            "MATCH {} WHERE {a_filter} AND {b_filter} RETURN DISTINCT {a_proj} AS a, {b_proj} AS b",
            rel_pattern(rel_type, start.0, end.0, directed)?
        );
        let rows = self.query_rows(query(&cypher)).await?;
        rows.into_iter()
            .map(|row| {
                let a = row
                    .get::<Vec<String>>("a")
                    .map_err(|e| GraphError::Decode(e.to_string()))?;
                let b = row
                    .get::<Vec<String>>("b")
                    .map_err(|e| GraphError::Decode(e.to_string()))?;
                Ok((a.join("|"), b.join("|")))
            })
            .collect()
    }
}
