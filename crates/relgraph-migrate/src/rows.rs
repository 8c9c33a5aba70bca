//! Rule sources as row streams, and rows as graph writes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use relgraph_core::{CellValue, MappingRule, PropertyKind, PropertySpec, RuleSource, SourceRow};
use relgraph_graph::{NodeRef, WriteOp};
use relgraph_source::{RowQuery, SourceStore};

use crate::aggregate::{TableValues, TableWeights, WeightedAggregator};
use crate::error::{MigrateError, Result};
use crate::mapper::MigrationPlan;

/// Why a single row was skipped. The display form is the recorded reason.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
    #[error("null value in key column {0}")]
    NullKey(String),

    #[error("column {0} is missing from the source row")]
    MissingColumn(String),

    #[error("column {column} value {value:?} cannot be coerced to {kind:?}")]
    TypeMismatch {
        column: String,
        kind: PropertyKind,
        value: String,
    },

    #[error("column {0} holds binary data, which cannot be stored as a property")]
    Binary(String),

    #[error("write rejected: {0}")]
    Write(String),

    #[error("write timed out after {0} ms")]
    Timeout(u64),
}

// ── Row Streams ───────────────────────────────────────────────────

/// Where a rule's rows come from once the run starts.
#[derive(Debug, Clone)]
pub enum RuleRows {
    /// Paged from the source in key order.
    Query(RowQuery),
    /// Computed up front (aggregates) and paged in memory.
    Materialized(Arc<Vec<SourceRow>>),
}

impl RuleRows {
    /// Resolve a rule source. Aggregates are computed here, in full.
    pub async fn open(rule: &MappingRule, source: &Arc<dyn SourceStore>) -> Result<Self> {
        let order: Vec<String> = rule.key_columns().iter().map(|c| c.to_string()).collect();
        match rule.source() {
            RuleSource::Table(table) => Ok(Self::Query(RowQuery::table(table, &order))),
            RuleSource::Query(sql) => Ok(Self::Query(RowQuery::sql(sql, &order))),
            RuleSource::Aggregate(agg) => {
                let weights = TableWeights::new(source.clone(), agg.crosswalk.clone());
                let values = TableValues::new(source.clone(), agg.values.clone());
                let rows = WeightedAggregator::new(agg.allowed_missing.iter().cloned())
                    .aggregate_rows(agg, &weights, &values)
                    .await
                    .map_err(MigrateError::from)?;
                Ok(Self::Materialized(Arc::new(rows)))
            }
        }
    }

    pub async fn fetch(
        &self,
        source: &dyn SourceStore,
        offset: u64,
        limit: usize,
    ) -> relgraph_source::Result<Vec<SourceRow>> {
        match self {
            Self::Query(query) => source.fetch_rows(query, offset, limit).await,
            Self::Materialized(rows) => Ok(rows
                .iter()
                .skip(usize::try_from(offset).unwrap_or(usize::MAX))
                .take(limit)
                .cloned()
                .collect()),
        }
    }

    /// Exact count of distinct non-null keys over `columns`.
    pub async fn count_distinct(&self, source: &dyn SourceStore, columns: &[String]) -> Result<u64> {
        match self {
            Self::Query(query) => Ok(source.count_distinct(query, columns).await?),
            Self::Materialized(rows) => Ok(materialized_keys(rows, columns).len() as u64),
        }
    }

    /// Distinct non-null key tuples over `columns`, each part rendered.
    pub async fn distinct_keys(
        &self,
        source: &dyn SourceStore,
        columns: &[String],
    ) -> Result<Vec<Vec<String>>> {
        match self {
            Self::Query(query) => Ok(source
                .distinct_keys(query, columns)
                .await?
                .iter()
                .map(|tuple| tuple.iter().map(CellValue::render).collect())
                .collect()),
            Self::Materialized(rows) => Ok(materialized_keys(rows, columns).into_iter().collect()),
        }
    }
}

fn materialized_keys(rows: &[SourceRow], columns: &[String]) -> BTreeSet<Vec<String>> {
    rows.iter()
        .filter_map(|row| {
            columns
                .iter()
                .map(|c| match row.get(c) {
                    None | Some(CellValue::Null) => None,
                    Some(v) => Some(v.render()),
                })
                .collect::<Option<Vec<String>>>()
        })
        .collect()
}

// ── Row Conversion ────────────────────────────────────────────────

/// (source column, graph property) pairs in key order.
#[derive(Debug, Clone)]
struct KeyMap {
    label: String,
    parts: Vec<(String, String)>,
}

impl KeyMap {
    fn node_ref(&self, row: &SourceRow) -> std::result::Result<NodeRef, RowError> {
        let mut key = Vec::with_capacity(self.parts.len());
        for (column, property) in &self.parts {
            let value = row
                .get(column)
                .ok_or_else(|| RowError::MissingColumn(column.clone()))?
                .clone()
                .normalized();
            match value {
                CellValue::Null => return Err(RowError::NullKey(column.clone())),
                CellValue::Bytes(_) => return Err(RowError::Binary(column.clone())),
                v => key.push((property.clone(), v)),
            }
        }
        Ok(NodeRef {
            label: self.label.clone(),
            key,
        })
    }
}

#[derive(Debug, Clone)]
enum Target {
    Node(KeyMap),
    Relationship {
        rel_type: String,
        start: KeyMap,
        end: KeyMap,
        directed: bool,
    },
}

/// Converts source rows of one rule into [`WriteOp`]s.
#[derive(Debug, Clone)]
pub struct RowConverter {
    target: Target,
    properties: Vec<PropertySpec>,
}

impl RowConverter {
    /// Resolve endpoint key names against the plan's node rules.
    pub fn for_rule(rule: &MappingRule, plan: &MigrationPlan) -> Result<Self> {
        let target = match rule {
            MappingRule::Node(node) => Target::Node(KeyMap {
                label: node.label.clone(),
                parts: node.key.iter().map(|k| (k.clone(), k.clone())).collect(),
            }),
            MappingRule::Relationship(rel) => {
                let endpoint = |label: &str, columns: &[String]| -> Result<KeyMap> {
                    let node = plan.node_rule_for_label(label).ok_or_else(|| {
                        MigrateError::invalid(
                            rule.id(),
                            format!("endpoint label {label} is not produced by any node rule"),
                        )
                    })?;
                    Ok(KeyMap {
                        label: label.to_string(),
                        parts: columns.iter().cloned().zip(node.key.iter().cloned()).collect(),
                    })
                };
                Target::Relationship {
                    rel_type: rel.rel_type.clone(),
                    start: endpoint(&rel.start.label, &rel.start.key)?,
                    end: endpoint(&rel.end.label, &rel.end.key)?,
                    directed: rel.directed,
                }
            }
        };
        Ok(Self {
            target,
            properties: rule.properties().to_vec(),
        })
    }

    /// Build the write for one row.
    pub fn convert(&self, row: &SourceRow) -> std::result::Result<WriteOp, RowError> {
        let mut properties = BTreeMap::new();
        for spec in &self.properties {
            let cell = row
                .get(&spec.column)
                .ok_or_else(|| RowError::MissingColumn(spec.column.clone()))?;
            let value = coerce(&spec.column, cell.clone().normalized(), spec.kind)?;
            if matches!(value, CellValue::Bytes(_)) {
                return Err(RowError::Binary(spec.column.clone()));
            }
            properties.insert(spec.name.clone(), value);
        }

        match &self.target {
            Target::Node(key) => Ok(WriteOp::MergeNode {
                node: key.node_ref(row)?,
                properties,
            }),
            Target::Relationship {
                rel_type,
                start,
                end,
                directed,
            } => Ok(WriteOp::MergeRelationship {
                rel_type: rel_type.clone(),
                start: start.node_ref(row)?,
                end: end.node_ref(row)?,
                properties,
                directed: *directed,
            }),
        }
    }
}

/// Apply an explicit property kind. Null passes through unchanged.
fn coerce(
    column: &str,
    value: CellValue,
    kind: Option<PropertyKind>,
) -> std::result::Result<CellValue, RowError> {
    let Some(kind) = kind else {
        return Ok(value);
    };
    let mismatch = |v: &CellValue| RowError::TypeMismatch {
        column: column.to_string(),
        kind,
        value: v.render(),
    };

    let coerced = match (&value, kind) {
        (CellValue::Null, _) => Some(CellValue::Null),
        (CellValue::Bytes(_), _) => return Err(RowError::Binary(column.to_string())),

        (CellValue::Integer(_), PropertyKind::Integer) => Some(value.clone()),
        (CellValue::Float(f), PropertyKind::Integer) => whole(*f),
        (CellValue::Text(s), PropertyKind::Integer) => s
            .trim()
            .parse::<i64>()
            .ok()
            .map(CellValue::Integer)
            .or_else(|| s.trim().parse::<f64>().ok().and_then(whole)),

        (CellValue::Boolean(_), PropertyKind::Float) => None,
        (_, PropertyKind::Float) => value.as_f64().map(CellValue::Float),

        (_, PropertyKind::Text) => Some(CellValue::Text(value.render())),

        (CellValue::Boolean(_), PropertyKind::Boolean) => Some(value.clone()),
        (CellValue::Integer(0), PropertyKind::Boolean) => Some(CellValue::Boolean(false)),
        (CellValue::Integer(1), PropertyKind::Boolean) => Some(CellValue::Boolean(true)),
        (CellValue::Text(s), PropertyKind::Boolean) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(CellValue::Boolean(true)),
                "false" | "f" | "no" | "n" | "0" => Some(CellValue::Boolean(false)),
                _ => None,
            }
        }

        _ => None,
    };
    coerced.ok_or_else(|| mismatch(&value))
}

fn whole(f: f64) -> Option<CellValue> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
        .then(|| CellValue::Integer(f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_core::{MappingConfig, SchemaDescriptor};

    use crate::mapper::GraphMapper;

    const MAPPING: &str = r#"
rules:
  - kind: node
    label: Project
    source: { query: "SELECT * FROM projects" }
    key: [id]
    properties:
      - name
      - { column: units, kind: integer }
      - { column: subsidized, name: is_subsidized, kind: boolean }
  - kind: node
    label: Zipcode
    source: { query: "SELECT * FROM zipcodes" }
    key: [zip_code]
  - kind: relationship
    type: LOCATED_IN
    source: { query: "SELECT * FROM projects" }
    start: { label: Project, key: [id] }
    end: { label: Zipcode, key: [postcode] }
"#;

    fn plan() -> MigrationPlan {
        GraphMapper::new()
            .build_plan(
                &SchemaDescriptor::default(),
                &MappingConfig::from_yaml(MAPPING).unwrap(),
            )
            .unwrap()
    }

    fn converter(id: &str) -> RowConverter {
        let plan = plan();
        RowConverter::for_rule(&plan.rule(id).unwrap().rule, &plan).unwrap()
    }

    fn project_row() -> SourceRow {
        SourceRow::new(0)
            .with("id", 7i64)
            .with("name", "Riverside")
            .with("units", "120")
            .with("subsidized", 1i64)
            .with("postcode", "10451")
    }

    #[test]
    fn test_node_row_converts_with_coercion() {
        let op = converter("Project").convert(&project_row()).unwrap();
        let WriteOp::MergeNode { node, properties } = op else {
            panic!("expected node write");
        };
        assert_eq!(node.label, "Project");
        assert_eq!(node.key, vec![("id".to_string(), CellValue::Integer(7))]);
        assert_eq!(properties["units"], CellValue::Integer(120));
        assert_eq!(properties["is_subsidized"], CellValue::Boolean(true));
        assert_eq!(properties["name"], CellValue::Text("Riverside".into()));
    }

    #[test]
    fn test_relationship_endpoints_use_node_key_names() {
        let op = converter("LOCATED_IN").convert(&project_row()).unwrap();
        let WriteOp::MergeRelationship { start, end, directed, .. } = op else {
            panic!("expected relationship write");
        };
        assert!(directed);
        assert_eq!(start.key, vec![("id".to_string(), CellValue::Integer(7))]);
        assert_eq!(
            end.key,
            vec![("zip_code".to_string(), CellValue::Text("10451".into()))]
        );
    }

    #[test]
    fn test_row_errors() {
        let c = converter("Project");

        let null_key = project_row().with("id", CellValue::Null);
        assert_eq!(c.convert(&null_key), Err(RowError::NullKey("id".into())));

        let nan_key = project_row().with("id", f64::NAN);
        assert_eq!(c.convert(&nan_key), Err(RowError::NullKey("id".into())));

        let mut missing = project_row();
        missing.cells.remove("name");
        assert_eq!(c.convert(&missing), Err(RowError::MissingColumn("name".into())));

        let bad_units = project_row().with("units", "many");
        assert!(matches!(
            c.convert(&bad_units),
            Err(RowError::TypeMismatch { kind: PropertyKind::Integer, .. })
        ));

        let blob = project_row().with("name", CellValue::Bytes(vec![1, 2]));
        assert_eq!(c.convert(&blob), Err(RowError::Binary("name".into())));
    }

    #[test]
    fn test_null_property_passes_through() {
        let op = converter("Project")
            .convert(&project_row().with("units", CellValue::Null))
            .unwrap();
        let WriteOp::MergeNode { properties, .. } = op else {
            panic!("expected node write");
        };
        assert_eq!(properties["units"], CellValue::Null);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(
            coerce("c", CellValue::Float(3.0), Some(PropertyKind::Integer)),
            Ok(CellValue::Integer(3))
        );
        assert!(coerce("c", CellValue::Float(3.5), Some(PropertyKind::Integer)).is_err());
        assert_eq!(
            coerce("c", CellValue::Integer(2), Some(PropertyKind::Text)),
            Ok(CellValue::Text("2".into()))
        );
        assert_eq!(
            coerce("c", CellValue::Text("No".into()), Some(PropertyKind::Boolean)),
            Ok(CellValue::Boolean(false))
        );
        assert!(coerce("c", CellValue::Boolean(true), Some(PropertyKind::Float)).is_err());
    }

    #[tokio::test]
    async fn test_materialized_rows_page_and_count() {
        let rows: Vec<SourceRow> = (0..5)
            .map(|i| {
                let g = if i == 4 {
                    CellValue::Null
                } else {
                    CellValue::Integer(i as i64 % 2)
                };
                SourceRow::new(i).with("g", g)
            })
            .collect();
        let source: Arc<dyn SourceStore> = Arc::new(relgraph_source::SqliteSource::from_connection(
            rusqlite::Connection::open_in_memory().unwrap(),
        ));
        let stream = RuleRows::Materialized(Arc::new(rows));

        let page = stream.fetch(source.as_ref(), 3, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].offset, 3);

        let cols = vec!["g".to_string()];
        assert_eq!(stream.count_distinct(source.as_ref(), &cols).await.unwrap(), 2);
        assert_eq!(
            stream.distinct_keys(source.as_ref(), &cols).await.unwrap(),
            vec![vec!["0".to_string()], vec!["1".to_string()]]
        );
    }
}
