//! Mapping validation, dependency ordering and rule suggestion.
//!
//! [`GraphMapper::build_plan`] is static: it checks a [`MappingConfig`]
//! against a [`SchemaDescriptor`] and orders the rules so that every
//! relationship rule follows the node rules producing its endpoints. No data
//! is read.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use relgraph_core::{
    EndpointRef, MappingConfig, MappingRule, NodeRule, PropertySpec, RelationshipRule,
    RelgraphError, RuleSource, SchemaDescriptor, SemanticType, TableDescriptor, TableKind,
};

use crate::error::{MigrateError, Result};

/// One rule of a plan with its resolved dependencies.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedRule {
    pub rule: MappingRule,
    /// Plan positions of the rules that must complete first.
    pub depends_on: Vec<usize>,
    /// Length of the longest dependency chain ending at this rule.
    pub stage: usize,
}

impl PlannedRule {
    pub fn id(&self) -> &str {
        self.rule.id()
    }
}

/// Validated rules in dependency order.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    /// BLAKE3 over the ordered rules; checkpoints are scoped to it.
    pub fingerprint: String,
    pub rules: Vec<PlannedRule>,
}

impl MigrationPlan {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule(&self, id: &str) -> Option<&PlannedRule> {
        self.rules.iter().find(|r| r.id() == id)
    }

    /// The node rule producing `label`.
    pub fn node_rule_for_label(&self, label: &str) -> Option<&NodeRule> {
        self.rules.iter().find_map(|r| match &r.rule {
            MappingRule::Node(n) if n.label == label => Some(n),
            _ => None,
        })
    }

    pub fn stage_count(&self) -> usize {
        self.rules.iter().map(|r| r.stage + 1).max().unwrap_or(0)
    }
}

/// Turns a descriptor plus mapping configuration into a [`MigrationPlan`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphMapper;

impl GraphMapper {
    pub fn new() -> Self {
        Self
    }

    /// Validate every rule and order the set topologically.
    pub fn build_plan(
        &self,
        descriptor: &SchemaDescriptor,
        config: &MappingConfig,
    ) -> Result<MigrationPlan> {
        let rules = &config.rules;

        let mut index_by_id: BTreeMap<&str, usize> = BTreeMap::new();
        let mut node_by_label: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, rule) in rules.iter().enumerate() {
            if index_by_id.insert(rule.id(), i).is_some() {
                return Err(MigrateError::invalid(rule.id(), "duplicate rule id"));
            }
            if let MappingRule::Node(node) = rule {
                if let Some(&other) = node_by_label.get(node.label.as_str()) {
                    return Err(MigrateError::invalid(
                        rule.id(),
                        format!(
                            "label {} is already produced by rule {}",
                            node.label,
                            rules[other].id()
                        ),
                    ));
                }
                node_by_label.insert(&node.label, i);
            }
        }

        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); rules.len()];
        for (i, rule) in rules.iter().enumerate() {
            validate_rule(descriptor, rule)?;

            if let MappingRule::Relationship(rel) = rule {
                for endpoint in [&rel.start, &rel.end] {
                    let node_idx = endpoint_rule(rule.id(), endpoint, &node_by_label)?;
                    let MappingRule::Node(node) = &rules[node_idx] else {
                        continue;
                    };
                    if endpoint.key.len() != node.key.len() {
                        return Err(MigrateError::invalid(
                            rule.id(),
                            format!(
                                "endpoint {} names {} key column(s) but rule {} keys on {}",
                                endpoint.label,
                                endpoint.key.len(),
                                rules[node_idx].id(),
                                node.key.len()
                            ),
                        ));
                    }
                    deps[i].insert(node_idx);
                }
            }

            for dep in rule.depends_on() {
                let Some(&j) = index_by_id.get(dep.as_str()) else {
                    return Err(MigrateError::invalid(
                        rule.id(),
                        format!("depends_on names unknown rule {dep}"),
                    ));
                };
                deps[i].insert(j);
            }
        }

        let order = topological_order(rules, &deps)?;

        let mut position = vec![0usize; rules.len()];
        for (pos, &idx) in order.iter().enumerate() {
            position[idx] = pos;
        }

        let mut planned: Vec<PlannedRule> = Vec::with_capacity(rules.len());
        for &idx in &order {
            let depends_on: Vec<usize> = {
                let mut d: Vec<usize> = deps[idx].iter().map(|&j| position[j]).collect();
                d.sort_unstable();
                d
            };
            let stage = depends_on
                .iter()
                .map(|&p| planned[p].stage + 1)
                .max()
                .unwrap_or(0);
            planned.push(PlannedRule {
                rule: rules[idx].clone(),
                depends_on,
                stage,
            });
        }

        let fingerprint = fingerprint(&planned)?;
        let plan = MigrationPlan {
            fingerprint,
            rules: planned,
        };

        tracing::info!(
            rules = plan.len(),
            stages = plan.stage_count(),
            fingerprint = %plan.fingerprint,
            "Migration plan built"
        );
        Ok(plan)
    }

    /// Derive a starting mapping configuration from a descriptor.
    ///
    /// Entity and lookup tables become node rules; foreign keys of entity
    /// tables and whole junction tables become relationship rules. The result
    /// is meant for review, not blind execution.
    pub fn suggest_rules(&self, descriptor: &SchemaDescriptor) -> MappingConfig {
        let mut rules = Vec::new();
        let mut labels: BTreeMap<&str, (String, Vec<String>)> = BTreeMap::new();
        let mut used_labels = BTreeSet::new();

        for table in &descriptor.tables {
            if !matches!(table.kind, TableKind::Entity | TableKind::Lookup) {
                continue;
            }
            let Some(key) = suggested_key(table) else {
                tracing::debug!(table = %table.name, "No usable key, no node rule suggested");
                continue;
            };

            let mut label = singular_pascal(&table.name);
            if used_labels.contains(&label) {
                label = pascal(&table.name);
            }
            if !used_labels.insert(label.clone()) {
                tracing::warn!(table = %table.name, label = %label, "Label collision, no node rule suggested");
                continue;
            }

            rules.push(MappingRule::Node(NodeRule {
                name: None,
                label: label.clone(),
                source: RuleSource::Table(table.name.clone()),
                key: key.clone(),
                properties: payload_properties(table, &key),
                depends_on: vec![],
            }));
            labels.insert(&table.name, (label, key));
        }

        let mut used_ids: BTreeSet<String> = rules.iter().map(|r| r.id().to_string()).collect();
        let mut push_rel = |mut rel: RelationshipRule, fallback_name: String| {
            if !used_ids.insert(rel.rel_type.clone()) {
                if !used_ids.insert(fallback_name.clone()) {
                    return;
                }
                rel.name = Some(fallback_name);
            }
            rules.push(MappingRule::Relationship(rel));
        };

        for table in &descriptor.tables {
            match table.kind {
                TableKind::Entity => {
                    let Some((label, key)) = labels.get(table.name.as_str()) else {
                        continue;
                    };
                    for fk in &table.foreign_keys {
                        let Some((target_label, target_key)) =
                            labels.get(fk.referenced_table.as_str())
                        else {
                            continue;
                        };
                        if &fk.referenced_columns != target_key {
                            tracing::debug!(
                                table = %table.name,
                                referenced = %fk.referenced_table,
                                "Foreign key does not target the node key, skipped"
                            );
                            continue;
                        }
                        let column = fk.columns.first().map(String::as_str).unwrap_or_default();
                        push_rel(
                            RelationshipRule {
                                name: None,
                                rel_type: relationship_type(column, target_label),
                                source: RuleSource::Table(table.name.clone()),
                                start: EndpointRef {
                                    label: label.clone(),
                                    key: key.clone(),
                                },
                                end: EndpointRef {
                                    label: target_label.clone(),
                                    key: fk.columns.clone(),
                                },
                                properties: vec![],
                                directed: true,
                                depends_on: vec![],
                            },
                            format!("{}_{}", table.name, fk.columns.join("_")),
                        );
                    }
                }
                TableKind::Junction => {
                    let [a, b] = table.foreign_keys.as_slice() else {
                        continue;
                    };
                    let (Some((a_label, a_key)), Some((b_label, b_key))) = (
                        labels.get(a.referenced_table.as_str()),
                        labels.get(b.referenced_table.as_str()),
                    ) else {
                        continue;
                    };
                    if &a.referenced_columns != a_key || &b.referenced_columns != b_key {
                        continue;
                    }
                    let link_columns: Vec<String> =
                        a.columns.iter().chain(&b.columns).cloned().collect();
                    push_rel(
                        RelationshipRule {
                            name: None,
                            rel_type: upper_snake(&pascal(&table.name)),
                            source: RuleSource::Table(table.name.clone()),
                            start: EndpointRef {
                                label: a_label.clone(),
                                key: a.columns.clone(),
                            },
                            end: EndpointRef {
                                label: b_label.clone(),
                                key: b.columns.clone(),
                            },
                            properties: payload_properties(table, &link_columns),
                            directed: true,
                            depends_on: vec![],
                        },
                        table.name.clone(),
                    );
                }
                TableKind::Lookup | TableKind::System => {}
            }
        }

        tracing::info!(rules = rules.len(), "Mapping rules suggested");
        MappingConfig { rules }
    }
}

// ── Validation ────────────────────────────────────────────────────

fn validate_rule(descriptor: &SchemaDescriptor, rule: &MappingRule) -> Result<()> {
    let id = rule.id();
    let what = if rule.is_node() { "label" } else { "relationship type" };
    check_identifier(id, what, rule.target_name())?;
    for p in rule.properties() {
        check_identifier(id, "property name", &p.name)?;
    }

    if let MappingRule::Node(node) = rule {
        if node.key.is_empty() {
            return Err(MigrateError::invalid(id, "node key must name at least one column"));
        }
        for column in &node.key {
            check_identifier(id, "key column", column)?;
        }
    }

    match rule.source() {
        RuleSource::Table(table) => {
            require_columns(descriptor, id, table, rule.referenced_columns())?;
        }
        RuleSource::Query(sql) => {
            // Query columns are only known once rows arrive.
            if sql.trim().is_empty() {
                return Err(MigrateError::invalid(id, "query source is empty"));
            }
        }
        RuleSource::Aggregate(agg) => {
            if agg.metrics.is_empty() {
                return Err(MigrateError::invalid(id, "aggregate source defines no metrics"));
            }
            let cw = &agg.crosswalk;
            require_columns(
                descriptor,
                id,
                &cw.table,
                [cw.group.as_str(), cw.member.as_str(), cw.weight.as_str()],
            )?;
            let value_columns = std::iter::once(agg.values.member.as_str())
                .chain(agg.metrics.iter().map(|m| m.column.as_str()));
            require_columns(descriptor, id, &agg.values.table, value_columns)?;

            let produced = agg.output_columns();
            for column in rule.referenced_columns() {
                if !produced.iter().any(|c| c == column) {
                    return Err(MigrateError::invalid(
                        id,
                        format!(
                            "column {column} is not produced by the aggregate (available: {})",
                            produced.join(", ")
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn require_columns<'a>(
    descriptor: &SchemaDescriptor,
    rule: &str,
    table: &str,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let Some(desc) = descriptor.table(table) else {
        let detail = match descriptor.omitted.iter().find(|o| o.name == table) {
            Some(omitted) => format!(
                "source table {table} was omitted from the descriptor ({})",
                omitted.reason
            ),
            None => format!("source table {table} does not exist"),
        };
        return Err(MigrateError::invalid(rule, detail));
    };
    for column in columns {
        if !desc.has_column(column) {
            return Err(MigrateError::invalid(
                rule,
                format!("column {column} does not exist in table {table}"),
            ));
        }
    }
    Ok(())
}

fn endpoint_rule(
    rule: &str,
    endpoint: &EndpointRef,
    node_by_label: &BTreeMap<&str, usize>,
) -> Result<usize> {
    node_by_label
        .get(endpoint.label.as_str())
        .copied()
        .ok_or_else(|| {
            MigrateError::invalid(
                rule,
                format!("endpoint label {} is not produced by any node rule", endpoint.label),
            )
        })
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(rule: &str, what: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(MigrateError::invalid(rule, format!("{what} {name:?} is not a valid identifier")))
    }
}

// ── Ordering ──────────────────────────────────────────────────────

/// Kahn's algorithm; ties resolve in configuration order.
fn topological_order(rules: &[MappingRule], deps: &[BTreeSet<usize>]) -> Result<Vec<usize>> {
    let n = rules.len();
    let mut remaining: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, d) in deps.iter().enumerate() {
        for &j in d {
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &k in &dependents[i] {
            remaining[k] -= 1;
            if remaining[k] == 0 {
                ready.insert(k);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    // Every unordered rule still waits on another unordered rule, so walking
    // those edges must revisit a rule.
    let Some(start) = (0..n).find(|&i| remaining[i] > 0) else {
        return Ok(order);
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = deps[current].iter().find(|&&j| remaining[j] > 0) else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| rules[i].id().to_string())
                .collect();
            cycle.push(rules[next].id().to_string());
            return Err(MigrateError::CyclicMapping { cycle });
        }
        path.push(next);
        current = next;
    }
    Err(MigrateError::CyclicMapping {
        cycle: path.iter().map(|&i| rules[i].id().to_string()).collect(),
    })
}

fn fingerprint(rules: &[PlannedRule]) -> Result<String> {
    let ordered: Vec<&MappingRule> = rules.iter().map(|r| &r.rule).collect();
    let bytes = serde_json::to_vec(&ordered).map_err(RelgraphError::from)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

// ── Suggestion helpers ────────────────────────────────────────────

fn suggested_key(table: &TableDescriptor) -> Option<Vec<String>> {
    let key = if table.primary_key.is_empty() {
        let column = table
            .columns
            .iter()
            .find(|c| c.name == "id")
            .or_else(|| table.columns.iter().find(|c| c.name.ends_with("_id")))?;
        vec![column.name.clone()]
    } else {
        table.primary_key.clone()
    };
    key.iter().all(|k| is_identifier(k)).then_some(key)
}

fn payload_properties(table: &TableDescriptor, exclude: &[String]) -> Vec<PropertySpec> {
    table
        .columns
        .iter()
        .filter(|c| !exclude.contains(&c.name))
        .filter(|c| !matches!(c.semantic_type, SemanticType::Geometry | SemanticType::Binary))
        .map(|c| PropertySpec {
            column: c.name.clone(),
            name: sanitize_identifier(&c.name),
            kind: None,
        })
        .collect()
}

fn sanitize_identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if !out.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        out.insert(0, '_');
    }
    out
}

fn words(name: &str) -> Vec<String> {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies").filter(|s| !s.is_empty()) {
        return format!("{stem}y");
    }
    for suffix in ["sses", "xes", "ches", "shes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.len() > 1
        && word.ends_with('s')
        && !["ss", "us", "is"].iter().any(|s| word.ends_with(s))
    {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

fn join_pascal(parts: Vec<String>) -> String {
    if parts.is_empty() {
        return "Node".to_string();
    }
    let joined: String = parts.iter().map(|w| capitalize(w)).collect();
    if joined.starts_with(|c: char| c.is_ascii_digit()) {
        format!("T{joined}")
    } else {
        joined
    }
}

fn pascal(table: &str) -> String {
    join_pascal(words(table))
}

/// `housing_projects` → `HousingProject`
fn singular_pascal(table: &str) -> String {
    let mut parts = words(table);
    if let Some(last) = parts.last_mut() {
        *last = singularize(last);
    }
    join_pascal(parts)
}

/// `HousingProject` → `HOUSING_PROJECT`
fn upper_snake(pascal: &str) -> String {
    let mut out = String::with_capacity(pascal.len() + 4);
    for (i, c) in pascal.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

fn relationship_type(fk_column: &str, target_label: &str) -> String {
    let lower = fk_column.to_lowercase();
    let base = lower.strip_suffix("_id").unwrap_or(&lower);
    match base {
        "zip" | "zipcode" | "zip_code" | "postcode" => "LOCATED_IN".to_string(),
        "owner" => "OWNED_BY".to_string(),
        "parent" => "CHILD_OF".to_string(),
        "manager" => "MANAGED_BY".to_string(),
        _ => format!("HAS_{}", upper_snake(target_label)),
    }
}
