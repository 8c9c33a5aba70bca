//! Core value and schema types for relgraph.
//!
//! These types describe what the relational source holds (cell values, rows)
//! and what introspection learned about it (the schema descriptor).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelgraphError;

// ── Cell Values ───────────────────────────────────────────────────

/// A single scalar read from the relational source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Replace non-finite floats with null; the graph store cannot hold them.
    pub fn normalized(self) -> Self {
        match self {
            Self::Float(f) if !f.is_finite() => Self::Null,
            other => other,
        }
    }

    /// Numeric view of the value, if it has one.
    ///
    /// Text is parsed after trimming; booleans are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) if f.is_finite() => Some(*f),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    /// Canonical string form used to compare keys across stores.
    ///
    /// Floats render with a trailing fraction (`5.0`), matching Cypher `toString`.
    pub fn render(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => format!("{f:?}"),
            Self::Text(s) => s.clone(),
            Self::Bytes(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Join rendered key components into one comparable key string.
pub fn render_key<'a>(parts: impl IntoIterator<Item = &'a CellValue>) -> String {
    parts
        .into_iter()
        .map(CellValue::render)
        .collect::<Vec<_>>()
        .join("|")
}

/// One row streamed from a rule source, tagged with its position in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub offset: u64,
    pub cells: BTreeMap<String, CellValue>,
}

impl SourceRow {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            cells: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: &str, value: impl Into<CellValue>) -> Self {
        self.cells.insert(column.to_string(), value.into());
        self
    }

    /// The cell for a column; a column the source did not return reads as `None`.
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells.get(column)
    }
}

// ── Schema Descriptor ─────────────────────────────────────────────

/// Portable semantic type derived from a column's declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Integer,
    Float,
    Text,
    Boolean,
    Date,
    Timestamp,
    Json,
    Binary,
    Geometry,
    Other(String),
}

impl SemanticType {
    /// Classify a declared SQL type name (SQLite affinity rules plus common
    /// PostgreSQL spellings).
    pub fn from_declared(declared: &str) -> Self {
        let t = declared.trim().to_lowercase();

        if t.ends_with("[]") || t.starts_with("array") || t.starts_with("interval") {
            return Self::Other(declared.to_string());
        }
        if ["geometry", "geography", "point", "polygon", "linestring"]
            .iter()
            .any(|g| t.contains(g))
        {
            return Self::Geometry;
        }
        if t.contains("bool") {
            return Self::Boolean;
        }
        if t.contains("timestamp") || t.contains("datetime") {
            return Self::Timestamp;
        }
        if t.contains("date") {
            return Self::Date;
        }
        if t.contains("int") || t.contains("serial") {
            return Self::Integer;
        }
        if t.contains("json") {
            return Self::Json;
        }
        if ["char", "text", "clob", "uuid"].iter().any(|s| t.contains(s)) {
            return Self::Text;
        }
        if ["real", "floa", "doub", "numeric", "decimal", "money"]
            .iter()
            .any(|s| t.contains(s))
        {
            return Self::Float;
        }
        if t.contains("blob") || t.contains("bytea") || t.contains("binary") {
            return Self::Binary;
        }
        Self::Other(declared.to_string())
    }
}

/// A column as reported by the source catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub semantic_type: SemanticType,
    pub declared_type: String,
    pub nullable: bool,
}

/// A (possibly composite) foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// How a table is likely to map into the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Becomes a node label.
    #[default]
    Entity,
    /// Pure link table; becomes a relationship type.
    Junction,
    /// Small reference/enum table.
    Lookup,
    /// Spatial reference bookkeeping; never migrated.
    System,
}

const SYSTEM_TABLES: &[&str] = &["spatial_ref_sys", "geography_columns", "geometry_columns"];
const LOOKUP_INDICATORS: &[&str] = &["code", "name", "type", "category", "description", "value"];
const LOOKUP_MAX_ROWS: u64 = 1000;

/// Introspected shape of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    /// Cheap estimate, not an exact count.
    pub approximate_rows: Option<u64>,
    #[serde(default)]
    pub kind: TableKind,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Classify the table for graph conversion.
    pub fn classify(&self) -> TableKind {
        if SYSTEM_TABLES.contains(&self.name.as_str()) {
            TableKind::System
        } else if self.is_junction() {
            TableKind::Junction
        } else if self.is_lookup() {
            TableKind::Lookup
        } else {
            TableKind::Entity
        }
    }

    /// Exactly two single-column foreign keys forming a two-column primary key,
    /// with at most two payload columns.
    fn is_junction(&self) -> bool {
        if self.foreign_keys.len() != 2 || self.primary_key.len() != 2 {
            return false;
        }
        let fk_columns: BTreeSet<&str> = self
            .foreign_keys
            .iter()
            .flat_map(|fk| fk.columns.iter().map(String::as_str))
            .collect();
        let pk_columns: BTreeSet<&str> = self.primary_key.iter().map(String::as_str).collect();
        if fk_columns != pk_columns {
            return false;
        }
        let payload = self
            .columns
            .iter()
            .filter(|c| !pk_columns.contains(c.name.as_str()))
            .count();
        payload <= 2
    }

    fn is_lookup(&self) -> bool {
        if self.approximate_rows.is_some_and(|n| n > LOOKUP_MAX_ROWS) {
            return false;
        }
        let indicators = self
            .columns
            .iter()
            .filter(|c| LOOKUP_INDICATORS.contains(&c.name.to_lowercase().as_str()))
            .count();
        let external_fk = self
            .foreign_keys
            .iter()
            .any(|fk| fk.referenced_table != self.name);
        indicators >= 2 && !external_fk
    }
}

/// A table left out of the descriptor, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmittedTable {
    pub name: String,
    pub reason: String,
}

/// The result of one analysis run: every readable table, plus omissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: Vec<TableDescriptor>,
    #[serde(default)]
    pub omitted: Vec<OmittedTable>,
}

/// One line of the flat descriptor artifact.
#[derive(Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum DescriptorRecord {
    Table(TableDescriptor),
    Omitted(OmittedTable),
}

impl SchemaDescriptor {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Serialize as JSON Lines: one record per table, then one per omission.
    ///
    /// Line order follows descriptor order, so two runs over an unchanged
    /// catalog produce byte-identical artifacts.
    pub fn to_jsonl(&self) -> Result<String, RelgraphError> {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&serde_json::to_string(&DescriptorRecord::Table(table.clone()))?);
            out.push('\n');
        }
        for omitted in &self.omitted {
            out.push_str(&serde_json::to_string(&DescriptorRecord::Omitted(
                omitted.clone(),
            ))?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse an artifact written by [`SchemaDescriptor::to_jsonl`].
    pub fn from_jsonl(input: &str) -> Result<Self, RelgraphError> {
        let mut descriptor = Self::default();
        for (idx, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: DescriptorRecord =
                serde_json::from_str(line).map_err(|e| RelgraphError::Descriptor {
                    line: idx + 1,
                    detail: e.to_string(),
                })?;
            match record {
                DescriptorRecord::Table(t) => descriptor.tables.push(t),
                DescriptorRecord::Omitted(o) => descriptor.omitted.push(o),
            }
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, declared: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            semantic_type: SemanticType::from_declared(declared),
            declared_type: declared.to_string(),
            nullable: true,
        }
    }

    fn table(name: &str, columns: Vec<ColumnDescriptor>, pk: &[&str]) -> TableDescriptor {
        TableDescriptor {
            name: name.to_string(),
            columns,
            primary_key: pk.iter().map(|s| s.to_string()).collect(),
            foreign_keys: vec![],
            approximate_rows: None,
            kind: TableKind::Entity,
        }
    }

    fn fk(column: &str, target: &str) -> ForeignKeyDescriptor {
        ForeignKeyDescriptor {
            columns: vec![column.to_string()],
            referenced_table: target.to_string(),
            referenced_columns: vec!["id".to_string()],
        }
    }

    #[test]
    fn test_semantic_type_mapping() {
        assert_eq!(SemanticType::from_declared("INTEGER"), SemanticType::Integer);
        assert_eq!(SemanticType::from_declared("bigint"), SemanticType::Integer);
        assert_eq!(SemanticType::from_declared("VARCHAR(32)"), SemanticType::Text);
        assert_eq!(SemanticType::from_declared("double precision"), SemanticType::Float);
        assert_eq!(SemanticType::from_declared("NUMERIC(10,2)"), SemanticType::Float);
        assert_eq!(SemanticType::from_declared("boolean"), SemanticType::Boolean);
        assert_eq!(SemanticType::from_declared("DATETIME"), SemanticType::Timestamp);
        assert_eq!(SemanticType::from_declared("date"), SemanticType::Date);
        assert_eq!(SemanticType::from_declared("jsonb"), SemanticType::Json);
        assert_eq!(SemanticType::from_declared("BLOB"), SemanticType::Binary);
        // "point" must not be read as an integer type.
        assert_eq!(SemanticType::from_declared("POINT"), SemanticType::Geometry);
        assert_eq!(
            SemanticType::from_declared("integer[]"),
            SemanticType::Other("integer[]".to_string())
        );
    }

    #[test]
    fn test_float_keys_render_like_cypher() {
        assert_eq!(CellValue::Float(5.0).render(), "5.0");
        assert_eq!(CellValue::Integer(5).render(), "5");
        assert_eq!(
            render_key(&[CellValue::from("a"), CellValue::Integer(2)]),
            "a|2"
        );
    }

    #[test]
    fn test_non_finite_floats_normalize_to_null() {
        assert_eq!(CellValue::Float(f64::NAN).normalized(), CellValue::Null);
        assert_eq!(CellValue::Float(f64::INFINITY).normalized(), CellValue::Null);
        assert_eq!(CellValue::Float(1.5).normalized(), CellValue::Float(1.5));
    }

    #[test]
    fn test_junction_classification() {
        let mut t = table(
            "project_owners",
            vec![col("project_id", "integer"), col("owner_id", "integer"), col("since", "date")],
            &["project_id", "owner_id"],
        );
        t.foreign_keys = vec![fk("project_id", "projects"), fk("owner_id", "owners")];
        assert_eq!(t.classify(), TableKind::Junction);
    }

    #[test]
    fn test_lookup_classification() {
        let mut t = table(
            "building_types",
            vec![col("id", "integer"), col("code", "text"), col("description", "text")],
            &["id"],
        );
        t.approximate_rows = Some(12);
        assert_eq!(t.classify(), TableKind::Lookup);

        t.approximate_rows = Some(50_000);
        assert_eq!(t.classify(), TableKind::Entity);
    }

    #[test]
    fn test_system_table_classification() {
        let t = table("spatial_ref_sys", vec![col("srid", "integer")], &["srid"]);
        assert_eq!(t.classify(), TableKind::System);
    }

    #[test]
    fn test_descriptor_jsonl_is_one_line_per_table() {
        let descriptor = SchemaDescriptor {
            tables: vec![
                table("a", vec![col("id", "integer")], &["id"]),
                table("b", vec![col("id", "integer")], &["id"]),
            ],
            omitted: vec![OmittedTable {
                name: "secret".to_string(),
                reason: "permission denied".to_string(),
            }],
        };

        let artifact = descriptor.to_jsonl().unwrap();
        assert_eq!(artifact.lines().count(), 3);
        assert!(artifact.lines().next().unwrap().contains("\"record\":\"table\""));

        let parsed = SchemaDescriptor::from_jsonl(&artifact).unwrap();
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn test_descriptor_jsonl_reports_bad_line() {
        let err = SchemaDescriptor::from_jsonl("{\"record\":\"table\"}\nnot json").unwrap_err();
        assert!(matches!(err, RelgraphError::Descriptor { line: 1, .. }));
    }
}
