//! Post-migration comparison of source and target.
//!
//! Read-only on both sides. Counts come from exact distinct-key queries on
//! the source, never the analyzer's estimates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;

use relgraph_core::{AuditReport, AuditSeverity, MappingRule, RuleAudit, RuleKind};
use relgraph_graph::GraphStore;
use relgraph_source::SourceStore;

use crate::config::AuditConfig;
use crate::error::{MigrateError, Result};
use crate::mapper::{MigrationPlan, PlannedRule};
use crate::rows::RuleRows;

/// Compares what each rule should have produced with what the graph holds.
pub struct IntegrityAuditor {
    source: Arc<dyn SourceStore>,
    graph: Arc<dyn GraphStore>,
    config: AuditConfig,
}

/// Keys on one side of a comparison, plus the authoritative count.
/// Rendered keys with multiplicity: values of different types can render
/// alike (`1` and `"1"`) yet be distinct entities on both sides.
struct KeySet {
    count: u64,
    keys: BTreeMap<String, u64>,
}

impl IntegrityAuditor {
    pub fn new(
        source: Arc<dyn SourceStore>,
        graph: Arc<dyn GraphStore>,
        config: AuditConfig,
    ) -> Self {
        Self {
            source,
            graph,
            config,
        }
    }

    pub async fn audit(&self, plan: &MigrationPlan) -> Result<AuditReport> {
        self.source
            .ping()
            .await
            .map_err(|e| MigrateError::Connection(format!("source: {e}")))?;
        self.graph
            .ping()
            .await
            .map_err(|e| MigrateError::Connection(format!("graph: {e}")))?;

        let mut rules = Vec::with_capacity(plan.len());
        for planned in &plan.rules {
            let audit = self.audit_rule(plan, planned).await?;
            if audit.severity == AuditSeverity::Ok {
                tracing::debug!(rule = %audit.rule, count = audit.source_count, "Rule audit clean");
            } else {
                tracing::warn!(
                    rule = %audit.rule,
                    source_count = audit.source_count,
                    target_count = audit.target_count,
                    delta = audit.delta,
                    missing = audit.missing_total,
                    extra = audit.extra_in_target,
                    severity = ?audit.severity,
                    "Rule audit found discrepancies"
                );
            }
            rules.push(audit);
        }

        let report = AuditReport {
            generated_at: Utc::now(),
            rules,
        };
        tracing::info!(
            rules = report.rules.len(),
            discrepancies = report.discrepancies().count(),
            worst = ?report.worst_severity(),
            "Audit complete"
        );
        Ok(report)
    }

    async fn audit_rule(&self, plan: &MigrationPlan, planned: &PlannedRule) -> Result<RuleAudit> {
        let rows = RuleRows::open(&planned.rule, &self.source).await?;
        let (kind, source, target) = match &planned.rule {
            MappingRule::Node(node) => {
                let source = KeySet {
                    count: rows.count_distinct(self.source.as_ref(), &node.key).await?,
                    keys: tally(
                        rows.distinct_keys(self.source.as_ref(), &node.key)
                            .await?
                            .into_iter()
                            .map(|parts| parts.join("|")),
                    ),
                };
                let target = KeySet {
                    count: self.graph.count_nodes(&node.label).await?,
                    keys: tally(self.graph.node_keys(&node.label, &node.key).await?),
                };
                (RuleKind::Node, source, target)
            }
            MappingRule::Relationship(rel) => {
                let endpoint_key = |label: &str| -> Result<Vec<String>> {
                    plan.node_rule_for_label(label)
                        .map(|n| n.key.clone())
                        .ok_or_else(|| {
                            MigrateError::invalid(
                                planned.id(),
                                format!("endpoint label {label} is not produced by any node rule"),
                            )
                        })
                };
                let start_key = endpoint_key(&rel.start.label)?;
                let end_key = endpoint_key(&rel.end.label)?;
                let fold = !rel.directed && rel.start.label == rel.end.label;

                let columns: Vec<String> =
                    rel.start.key.iter().chain(&rel.end.key).cloned().collect();
                let split = rel.start.key.len();
                let source_pairs: BTreeSet<String> = rows
                    .distinct_keys(self.source.as_ref(), &columns)
                    .await?
                    .into_iter()
                    .map(|parts| pair_key(parts[..split].join("|"), parts[split..].join("|"), fold))
                    .collect();

                let target_pairs: BTreeSet<String> = self
                    .graph
                    .relationship_keys(
                        &rel.rel_type,
                        (&rel.start.label, &start_key),
                        (&rel.end.label, &end_key),
                        rel.directed,
                    )
                    .await?
                    .into_iter()
                    .map(|(a, b)| pair_key(a, b, fold))
                    .collect();
                let target_count = self
                    .graph
                    .count_relationships(
                        &rel.rel_type,
                        &rel.start.label,
                        &rel.end.label,
                        rel.directed,
                    )
                    .await?;

                (
                    RuleKind::Relationship,
                    KeySet {
                        count: source_pairs.len() as u64,
                        keys: tally(source_pairs),
                    },
                    KeySet {
                        count: target_count,
                        keys: tally(target_pairs),
                    },
                )
            }
        };

        let missing = shortfall(&source.keys, &target.keys);
        let missing_total = missing.iter().map(|(_, n)| n).sum::<u64>();
        let extra_in_target = shortfall(&target.keys, &source.keys)
            .iter()
            .map(|(_, n)| n)
            .sum::<u64>();
        let delta = source.count as i64 - target.count as i64;

        let mut severity = AuditSeverity::from_counts(source.count, delta);
        if severity == AuditSeverity::Ok && (missing_total > 0 || extra_in_target > 0) {
            severity = AuditSeverity::Warn;
        }

        Ok(RuleAudit {
            rule: planned.id().to_string(),
            kind,
            target: planned.rule.target_name().to_string(),
            source_count: source.count,
            target_count: target.count,
            delta,
            missing_total,
            missing_sample: missing
                .into_iter()
                .take(self.config.sample_size)
                .map(|(key, _)| key.clone())
                .collect(),
            extra_in_target,
            severity,
        })
    }
}

fn tally(keys: impl IntoIterator<Item = String>) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for key in keys {
        *out.entry(key).or_insert(0) += 1;
    }
    out
}

/// Keys `have` holds more often than `other`, with the shortfall, in key order.
fn shortfall<'a>(
    have: &'a BTreeMap<String, u64>,
    other: &BTreeMap<String, u64>,
) -> Vec<(&'a String, u64)> {
    have.iter()
        .filter_map(|(key, &n)| {
            let m = other.get(key).copied().unwrap_or(0);
            (n > m).then_some((key, n - m))
        })
        .collect()
}

/// `start -> end`, ordered when the relationship is undirected between one label.
fn pair_key(start: String, end: String, fold: bool) -> String {
    if fold && end < start {
        format!("{end} -> {start}")
    } else {
        format!("{start} -> {end}")
    }
}
