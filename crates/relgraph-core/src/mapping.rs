//! Declarative mapping from relational structure to graph structure.
//!
//! A mapping configuration is a closed list of [`MappingRule`]s. Node rules
//! produce labeled, keyed nodes; relationship rules connect nodes produced by
//! node rules. Rules are validated and ordered by the migrate crate before
//! any data moves.

use serde::{Deserialize, Serialize};

use crate::error::RelgraphError;

// ── Rules ─────────────────────────────────────────────────────────

/// One unit of mapping work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingRule {
    Node(NodeRule),
    Relationship(RelationshipRule),
}

/// Produce one node per distinct key from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRule {
    /// Rule identity; defaults to the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub label: String,
    pub source: RuleSource,
    /// Columns whose values identify a node within its label.
    pub key: Vec<String>,
    #[serde(default)]
    pub properties: Vec<PropertySpec>,
    /// Extra ordering constraints on other rules, by rule id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Connect two nodes produced by node rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRule {
    /// Rule identity; defaults to the relationship type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub source: RuleSource,
    pub start: EndpointRef,
    pub end: EndpointRef,
    #[serde(default)]
    pub properties: Vec<PropertySpec>,
    #[serde(default = "default_true")]
    pub directed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Which node a relationship endpoint refers to.
///
/// `key` lists columns of the relationship's source, matched positionally
/// against the key of the node rule producing `label`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRef {
    pub label: String,
    pub key: Vec<String>,
}

/// Where a rule's rows come from.
///
/// Written as a single-key map: `{ table: .. }`, `{ query: .. }` or
/// `{ aggregate: { .. } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SourceEntry", into = "SourceEntry")]
pub enum RuleSource {
    /// Every row of a table.
    Table(String),
    /// A read-only SELECT statement.
    Query(String),
    /// Rows derived by weighted aggregation over a crosswalk.
    Aggregate(AggregateSource),
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregate: Option<AggregateSource>,
}

impl TryFrom<SourceEntry> for RuleSource {
    type Error = String;

    fn try_from(entry: SourceEntry) -> Result<Self, Self::Error> {
        match (entry.table, entry.query, entry.aggregate) {
            (Some(t), None, None) => Ok(Self::Table(t)),
            (None, Some(q), None) => Ok(Self::Query(q)),
            (None, None, Some(a)) => Ok(Self::Aggregate(a)),
            _ => Err("source must name exactly one of table, query, aggregate".to_string()),
        }
    }
}

impl From<RuleSource> for SourceEntry {
    fn from(source: RuleSource) -> Self {
        let mut entry = SourceEntry {
            table: None,
            query: None,
            aggregate: None,
        };
        match source {
            RuleSource::Table(t) => entry.table = Some(t),
            RuleSource::Query(q) => entry.query = Some(q),
            RuleSource::Aggregate(a) => entry.aggregate = Some(a),
        }
        entry
    }
}

impl RuleSource {
    /// Short human-readable description for logs and reports.
    pub fn describe(&self) -> String {
        match self {
            Self::Table(t) => format!("table {t}"),
            Self::Query(_) => "query".to_string(),
            Self::Aggregate(a) => format!("aggregate over {}", a.crosswalk.table),
        }
    }
}

/// A property copied from a source column onto a node or relationship.
///
/// Accepts either a bare column name or `{ column, name, kind }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PropertyEntry")]
pub struct PropertySpec {
    pub column: String,
    /// Property name in the graph; defaults to the column name.
    pub name: String,
    /// Explicit coercion; absent means "write the value as read".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<PropertyKind>,
}

impl PropertySpec {
    pub fn column(column: &str) -> Self {
        Self {
            column: column.to_string(),
            name: column.to_string(),
            kind: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PropertyEntry {
    Column(String),
    Detailed {
        column: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        kind: Option<PropertyKind>,
    },
}

impl From<PropertyEntry> for PropertySpec {
    fn from(entry: PropertyEntry) -> Self {
        match entry {
            PropertyEntry::Column(column) => Self::column(&column),
            PropertyEntry::Detailed { column, name, kind } => Self {
                name: name.unwrap_or_else(|| column.clone()),
                column,
                kind,
            },
        }
    }
}

/// Target type for an explicitly coerced property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Integer,
    Float,
    Text,
    Boolean,
}

fn default_true() -> bool {
    true
}

impl MappingRule {
    /// Stable identity of the rule within a configuration.
    pub fn id(&self) -> &str {
        match self {
            Self::Node(n) => n.name.as_deref().unwrap_or(&n.label),
            Self::Relationship(r) => r.name.as_deref().unwrap_or(&r.rel_type),
        }
    }

    pub fn source(&self) -> &RuleSource {
        match self {
            Self::Node(n) => &n.source,
            Self::Relationship(r) => &r.source,
        }
    }

    pub fn properties(&self) -> &[PropertySpec] {
        match self {
            Self::Node(n) => &n.properties,
            Self::Relationship(r) => &r.properties,
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            Self::Node(n) => &n.depends_on,
            Self::Relationship(r) => &r.depends_on,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Self::Node(_))
    }

    /// Source columns whose values identify the written entity, in order.
    pub fn key_columns(&self) -> Vec<&str> {
        match self {
            Self::Node(n) => n.key.iter().map(String::as_str).collect(),
            Self::Relationship(r) => r
                .start
                .key
                .iter()
                .chain(r.end.key.iter())
                .map(String::as_str)
                .collect(),
        }
    }

    /// Every source column the rule reads.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut cols = self.key_columns();
        for p in self.properties() {
            if !cols.contains(&p.column.as_str()) {
                cols.push(p.column.as_str());
            }
        }
        cols
    }

    /// The label (node rules) or relationship type this rule writes.
    pub fn target_name(&self) -> &str {
        match self {
            Self::Node(n) => &n.label,
            Self::Relationship(r) => &r.rel_type,
        }
    }
}

/// The externally supplied list of rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub rules: Vec<MappingRule>,
}

impl MappingConfig {
    pub fn from_yaml(input: &str) -> Result<Self, RelgraphError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn to_yaml(&self) -> Result<String, RelgraphError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

// ── Weighted Aggregation ──────────────────────────────────────────

/// Aggregate-backed rule source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSource {
    pub crosswalk: CrosswalkSpec,
    pub values: ValueSpec,
    pub metrics: Vec<MetricSpec>,
    /// Members that may be absent from the value table; they count as null.
    #[serde(default)]
    pub allowed_missing: Vec<String>,
}

impl AggregateSource {
    /// Name of the contributor-count column emitted for a metric.
    pub fn contributors_column(metric: &str) -> String {
        format!("{metric}_contributors")
    }

    /// Columns every aggregate row carries.
    pub fn output_columns(&self) -> Vec<String> {
        let mut cols = vec![self.crosswalk.group.clone()];
        for m in &self.metrics {
            cols.push(m.name.clone());
            cols.push(Self::contributors_column(&m.name));
        }
        cols
    }
}

/// Table holding (group, member, weight) triples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosswalkSpec {
    pub table: String,
    pub group: String,
    pub member: String,
    pub weight: String,
}

/// Table holding raw per-member metric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSpec {
    pub table: String,
    pub member: String,
}

/// One derived metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Output column name.
    pub name: String,
    /// Value-table column holding the raw member value.
    pub column: String,
    #[serde(default)]
    pub scale: MetricScale,
}

/// Value convention for a metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricScale {
    /// Unbounded quantity (counts, currency).
    #[default]
    Absolute,
    /// Rate stored as a fraction in [0, 1]. Percentages are rejected, never rescaled.
    Fraction,
}

/// Partial membership of one member unit in a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosswalkEntry {
    pub group: String,
    pub member: String,
    /// Overlap ratio in (0, 1].
    pub weight: f64,
}

impl CrosswalkEntry {
    pub fn new(group: &str, member: &str, weight: f64) -> Self {
        Self {
            group: group.to_string(),
            member: member.to_string(),
            weight,
        }
    }
}

/// Derived value for one group and metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub group: String,
    pub metric: String,
    /// `None` when no member contributed a value; never a fabricated zero.
    pub value: Option<f64>,
    pub contributors: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"
rules:
  - kind: node
    label: Zipcode
    source: { table: zipcodes }
    key: [zip_code]
    properties:
      - borough
      - { column: pop_2020, name: population, kind: integer }
  - kind: relationship
    type: LOCATED_IN
    source: { table: housing_projects }
    start: { label: HousingProject, key: [id] }
    end: { label: Zipcode, key: [postcode] }
  - kind: node
    name: zip_rent_burden
    label: ZipRentBurden
    source:
      aggregate:
        crosswalk: { table: zip_tract, group: zip_code, member: tract_id, weight: overlap }
        values: { table: tract_rent, member: tract_id }
        metrics:
          - { name: rent_burden, column: burden_rate, scale: fraction }
    key: [zip_code]
    properties: [rent_burden, rent_burden_contributors]
"#;

    #[test]
    fn test_mapping_yaml_parses_all_rule_shapes() {
        let config = MappingConfig::from_yaml(MAPPING).unwrap();
        assert_eq!(config.rules.len(), 3);

        let MappingRule::Node(zip) = &config.rules[0] else {
            panic!("expected node rule");
        };
        assert_eq!(zip.properties[0], PropertySpec::column("borough"));
        assert_eq!(zip.properties[1].name, "population");
        assert_eq!(zip.properties[1].kind, Some(PropertyKind::Integer));

        let MappingRule::Relationship(rel) = &config.rules[1] else {
            panic!("expected relationship rule");
        };
        assert!(rel.directed);
        assert_eq!(config.rules[1].id(), "LOCATED_IN");
        assert_eq!(config.rules[1].key_columns(), vec!["id", "postcode"]);

        assert_eq!(config.rules[2].id(), "zip_rent_burden");
        let RuleSource::Aggregate(agg) = config.rules[2].source() else {
            panic!("expected aggregate source");
        };
        assert_eq!(agg.metrics[0].scale, MetricScale::Fraction);
        assert_eq!(
            agg.output_columns(),
            vec!["zip_code", "rent_burden", "rent_burden_contributors"]
        );
    }

    #[test]
    fn test_mapping_yaml_round_trips() {
        let config = MappingConfig::from_yaml(MAPPING).unwrap();
        let again = MappingConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_unknown_rule_kind_is_rejected() {
        let err = MappingConfig::from_yaml("rules:\n  - kind: hyperedge\n    label: X\n");
        assert!(err.is_err());
    }
}
