//! Area-weighted aggregation over many-to-many crosswalks.
//!
//! A group (e.g. a ZIP code) overlaps several members (e.g. census tracts),
//! each with a weight in (0, 1]. The derived value for a group is
//!
//! ```text
//!     Σ v·w / Σ w    over members with a non-null value
//! ```
//!
//! Null members are excluded from both sums. A group with no non-null
//! member gets a null value, never zero.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use relgraph_core::{
    AggregateRecord, AggregateSource, CellValue, CrosswalkEntry, CrosswalkSpec, MetricScale,
    MetricSpec, SourceRow, ValueSpec,
};
use relgraph_source::{RowQuery, SourceError, SourceStore};

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Invalid weight {weight} for member {member} of group {group}: must be in (0, 1]")]
    InvalidWeight {
        group: String,
        member: String,
        weight: f64,
    },

    #[error("Crosswalk member {member} (group {group}) has no value and is not allowed to be missing")]
    UnknownMember { group: String, member: String },

    #[error("Metric {metric} value {value} for member {member} is not a fraction in [0, 1]")]
    RateOutOfRange {
        metric: String,
        member: String,
        value: f64,
    },

    #[error("Metric {metric} value {value:?} for member {member} is not numeric")]
    NonNumericValue {
        metric: String,
        member: String,
        value: String,
    },

    #[error("Aggregation source error: {0}")]
    Source(#[from] SourceError),
}

pub type Result<T> = std::result::Result<T, AggregateError>;

// ── Capabilities ──────────────────────────────────────────────────

/// Supplies crosswalk entries (group, member, weight).
#[async_trait]
pub trait WeightSource: Send + Sync {
    async fn entries(&self) -> Result<Vec<CrosswalkEntry>>;
}

/// Supplies raw member values for one metric.
#[async_trait]
pub trait ValueSource: Send + Sync {
    async fn values(&self, metric: &MetricSpec) -> Result<BTreeMap<String, Option<f64>>>;
}

#[async_trait]
impl WeightSource for Vec<CrosswalkEntry> {
    async fn entries(&self) -> Result<Vec<CrosswalkEntry>> {
        Ok(self.clone())
    }
}

/// In-memory values: metric name → member → value.
#[derive(Debug, Clone, Default)]
pub struct MemoryValues {
    by_metric: BTreeMap<String, BTreeMap<String, Option<f64>>>,
}

impl MemoryValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: &str, member: &str, value: Option<f64>) -> Self {
        self.by_metric
            .entry(metric.to_string())
            .or_default()
            .insert(member.to_string(), value);
        self
    }
}

#[async_trait]
impl ValueSource for MemoryValues {
    async fn values(&self, metric: &MetricSpec) -> Result<BTreeMap<String, Option<f64>>> {
        Ok(self.by_metric.get(&metric.name).cloned().unwrap_or_default())
    }
}

const PAGE_SIZE: usize = 5_000;

/// Read every row of a table through the source, page by page.
async fn read_table(
    source: &dyn SourceStore,
    table: &str,
    order_by: &[String],
) -> Result<Vec<SourceRow>> {
    let query = RowQuery::table(table, order_by);
    let mut rows = Vec::new();
    loop {
        let page = source.fetch_rows(&query, rows.len() as u64, PAGE_SIZE).await?;
        let done = page.len() < PAGE_SIZE;
        rows.extend(page);
        if done {
            return Ok(rows);
        }
    }
}

fn key_text(cell: Option<&CellValue>) -> Option<String> {
    match cell {
        None | Some(CellValue::Null) => None,
        Some(v) => Some(v.render()),
    }
}

/// Crosswalk entries read from a table.
pub struct TableWeights {
    source: Arc<dyn SourceStore>,
    spec: CrosswalkSpec,
}

impl TableWeights {
    pub fn new(source: Arc<dyn SourceStore>, spec: CrosswalkSpec) -> Self {
        Self { source, spec }
    }
}

#[async_trait]
impl WeightSource for TableWeights {
    async fn entries(&self) -> Result<Vec<CrosswalkEntry>> {
        let order = vec![self.spec.group.clone(), self.spec.member.clone()];
        let rows = read_table(self.source.as_ref(), &self.spec.table, &order).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let (Some(group), Some(member)) = (
                key_text(row.get(&self.spec.group)),
                key_text(row.get(&self.spec.member)),
            ) else {
                tracing::debug!(
                    table = %self.spec.table,
                    offset = row.offset,
                    "Crosswalk row without group or member ignored"
                );
                continue;
            };
            // Unreadable weights become NaN and fail validation like any bad weight.
            let weight = row
                .get(&self.spec.weight)
                .and_then(CellValue::as_f64)
                .unwrap_or(f64::NAN);
            entries.push(CrosswalkEntry {
                group,
                member,
                weight,
            });
        }
        Ok(entries)
    }
}

/// Member values read from a table.
pub struct TableValues {
    source: Arc<dyn SourceStore>,
    spec: ValueSpec,
}

impl TableValues {
    pub fn new(source: Arc<dyn SourceStore>, spec: ValueSpec) -> Self {
        Self { source, spec }
    }
}

#[async_trait]
impl ValueSource for TableValues {
    async fn values(&self, metric: &MetricSpec) -> Result<BTreeMap<String, Option<f64>>> {
        let order = vec![self.spec.member.clone()];
        let rows = read_table(self.source.as_ref(), &self.spec.table, &order).await?;
        let mut values = BTreeMap::new();
        for row in rows {
            let Some(member) = key_text(row.get(&self.spec.member)) else {
                continue;
            };
            let value = match row.get(&metric.column).cloned().map(CellValue::normalized) {
                None | Some(CellValue::Null) => None,
                Some(cell) => match cell.as_f64() {
                    Some(v) => Some(v),
                    None => {
                        return Err(AggregateError::NonNumericValue {
                            metric: metric.name.clone(),
                            member,
                            value: cell.render(),
                        })
                    }
                },
            };
            values.insert(member, value);
        }
        Ok(values)
    }
}

// ── Aggregation ───────────────────────────────────────────────────

/// Pure weighted aggregation.
#[derive(Debug, Clone, Default)]
pub struct WeightedAggregator {
    allowed_missing: BTreeSet<String>,
}

impl WeightedAggregator {
    pub fn new(allowed_missing: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed_missing: allowed_missing.into_iter().collect(),
        }
    }

    /// Aggregate one metric for every group named in `entries`.
    ///
    /// Fails without a partial result on any invalid weight, unknown member
    /// or out-of-range fraction.
    pub fn aggregate(
        &self,
        metric: &MetricSpec,
        entries: &[CrosswalkEntry],
        values: &BTreeMap<String, Option<f64>>,
    ) -> Result<BTreeMap<String, AggregateRecord>> {
        for e in entries {
            if !(e.weight > 0.0 && e.weight <= 1.0) {
                return Err(AggregateError::InvalidWeight {
                    group: e.group.clone(),
                    member: e.member.clone(),
                    weight: e.weight,
                });
            }
            if !values.contains_key(&e.member) && !self.allowed_missing.contains(&e.member) {
                return Err(AggregateError::UnknownMember {
                    group: e.group.clone(),
                    member: e.member.clone(),
                });
            }
        }

        // Only members the crosswalk references are range-checked.
        if metric.scale == MetricScale::Fraction {
            for e in entries {
                let value = values.get(&e.member).copied().flatten();
                if let Some(v) = value.filter(|v| v.is_finite()) {
                    if !(0.0..=1.0).contains(&v) {
                        return Err(AggregateError::RateOutOfRange {
                            metric: metric.name.clone(),
                            member: e.member.clone(),
                            value: v,
                        });
                    }
                }
            }
        }

        // (Σ v·w, Σ w, contributors) per group, over non-null members only.
        let mut sums: BTreeMap<&str, (f64, f64, u32)> = BTreeMap::new();
        for e in entries {
            let acc = sums.entry(e.group.as_str()).or_insert((0.0, 0.0, 0));
            let value = values
                .get(&e.member)
                .copied()
                .flatten()
                .filter(|v| v.is_finite());
            if let Some(v) = value {
                acc.0 += v * e.weight;
                acc.1 += e.weight;
                acc.2 += 1;
            }
        }

        Ok(sums
            .into_iter()
            .map(|(group, (weighted, weight, contributors))| {
                let value = (contributors > 0).then(|| weighted / weight);
                (
                    group.to_string(),
                    AggregateRecord {
                        group: group.to_string(),
                        metric: metric.name.clone(),
                        value,
                        contributors,
                    },
                )
            })
            .collect())
    }

    /// Compute every metric of an aggregate source and shape the result as
    /// rows: the group column, each metric, and `<metric>_contributors`.
    pub async fn aggregate_rows(
        &self,
        source: &AggregateSource,
        weights: &dyn WeightSource,
        values: &dyn ValueSource,
    ) -> Result<Vec<SourceRow>> {
        let entries = weights.entries().await?;
        let mut by_group: BTreeMap<String, SourceRow> = BTreeMap::new();

        for metric in &source.metrics {
            let member_values = values.values(metric).await?;
            let records = self.aggregate(metric, &entries, &member_values)?;
            for (group, record) in records {
                let row = by_group
                    .entry(group.clone())
                    .or_insert_with(|| SourceRow::new(0).with(&source.crosswalk.group, group));
                row.cells
                    .insert(metric.name.clone(), CellValue::from(record.value));
                row.cells.insert(
                    AggregateSource::contributors_column(&metric.name),
                    CellValue::Integer(i64::from(record.contributors)),
                );
            }
        }

        let rows: Vec<SourceRow> = by_group
            .into_values()
            .enumerate()
            .map(|(i, mut row)| {
                row.offset = i as u64;
                row
            })
            .collect();
        tracing::debug!(
            crosswalk = %source.crosswalk.table,
            groups = rows.len(),
            metrics = source.metrics.len(),
            "Aggregate rows computed"
        );
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(scale: MetricScale) -> MetricSpec {
        MetricSpec {
            name: "rent_burden".into(),
            column: "burden".into(),
            scale,
        }
    }

    fn values(pairs: &[(&str, Option<f64>)]) -> BTreeMap<String, Option<f64>> {
        pairs.iter().map(|(m, v)| (m.to_string(), *v)).collect()
    }

    #[test]
    fn test_weighted_null_law() {
        let entries = vec![
            CrosswalkEntry::new("10001", "t1", 0.6),
            CrosswalkEntry::new("10001", "t2", 0.4),
        ];
        let out = WeightedAggregator::default()
            .aggregate(
                &metric(MetricScale::Absolute),
                &entries,
                &values(&[("t1", Some(100.0)), ("t2", None)]),
            )
            .unwrap();
        let record = &out["10001"];
        assert!((record.value.unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(record.contributors, 1);
    }

    #[test]
    fn test_zero_qualifying_law() {
        let entries = vec![
            CrosswalkEntry::new("10451", "t3", 0.5),
            CrosswalkEntry::new("10451", "t4", 1.0),
        ];
        let out = WeightedAggregator::default()
            .aggregate(
                &metric(MetricScale::Absolute),
                &entries,
                &values(&[("t3", None), ("t4", None)]),
            )
            .unwrap();
        assert_eq!(out["10451"].value, None);
        assert_eq!(out["10451"].contributors, 0);
    }

    #[test]
    fn test_weighted_average() {
        let entries = vec![
            CrosswalkEntry::new("g", "a", 0.25),
            CrosswalkEntry::new("g", "b", 0.75),
        ];
        let out = WeightedAggregator::default()
            .aggregate(
                &metric(MetricScale::Absolute),
                &entries,
                &values(&[("a", Some(40.0)), ("b", Some(80.0))]),
            )
            .unwrap();
        assert!((out["g"].value.unwrap() - 70.0).abs() < 1e-9);
        assert_eq!(out["g"].contributors, 2);
    }

    #[test]
    fn test_invalid_weights() {
        for w in [0.0, -0.2, 1.5, f64::NAN] {
            let entries = vec![CrosswalkEntry::new("g", "a", w)];
            let err = WeightedAggregator::default()
                .aggregate(
                    &metric(MetricScale::Absolute),
                    &entries,
                    &values(&[("a", Some(1.0))]),
                )
                .unwrap_err();
            assert!(matches!(err, AggregateError::InvalidWeight { .. }));
        }
    }

    #[test]
    fn test_unknown_member_unless_allowed() {
        let entries = vec![
            CrosswalkEntry::new("g", "a", 1.0),
            CrosswalkEntry::new("g", "ghost", 1.0),
        ];
        let vals = values(&[("a", Some(10.0))]);

        let err = WeightedAggregator::default()
            .aggregate(&metric(MetricScale::Absolute), &entries, &vals)
            .unwrap_err();
        assert!(matches!(err, AggregateError::UnknownMember { .. }));

        let out = WeightedAggregator::new(vec!["ghost".to_string()])
            .aggregate(&metric(MetricScale::Absolute), &entries, &vals)
            .unwrap();
        assert_eq!(out["g"].value, Some(10.0));
        assert_eq!(out["g"].contributors, 1);
    }

    #[test]
    fn test_percentages_are_rejected_for_fraction_metrics() {
        let entries = vec![CrosswalkEntry::new("g", "a", 1.0)];
        let err = WeightedAggregator::default()
            .aggregate(
                &metric(MetricScale::Fraction),
                &entries,
                &values(&[("a", Some(45.0))]),
            )
            .unwrap_err();
        assert!(matches!(err, AggregateError::RateOutOfRange { .. }));
    }

    #[test]
    fn test_unreferenced_out_of_range_member_is_ignored() {
        let entries = vec![CrosswalkEntry::new("g", "a", 1.0)];
        let out = WeightedAggregator::default()
            .aggregate(
                &metric(MetricScale::Fraction),
                &entries,
                &values(&[("a", Some(0.4)), ("stray", Some(45.0))]),
            )
            .unwrap();
        assert!((out["g"].value.unwrap() - 0.4).abs() < 1e-12);
        assert_eq!(out["g"].contributors, 1);
    }

    #[test]
    fn test_overlapping_weights_need_not_sum_to_one() {
        let entries = vec![
            CrosswalkEntry::new("g1", "a", 0.7),
            CrosswalkEntry::new("g2", "a", 0.7),
        ];
        let out = WeightedAggregator::default()
            .aggregate(
                &metric(MetricScale::Fraction),
                &entries,
                &values(&[("a", Some(0.3))]),
            )
            .unwrap();
        assert!((out["g1"].value.unwrap() - 0.3).abs() < 1e-12);
        assert!((out["g2"].value.unwrap() - 0.3).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_aggregate_rows_shape() {
        let source = zip_source();
        let weights = vec![
            CrosswalkEntry::new("10001", "t1", 0.6),
            CrosswalkEntry::new("10001", "t2", 0.4),
            CrosswalkEntry::new("10451", "t2", 1.0),
        ];
        let vals = MemoryValues::new()
            .with("rent_burden", "t1", Some(0.5))
            .with("rent_burden", "t2", None);
        let rows = WeightedAggregator::default()
            .aggregate_rows(&source, &weights, &vals)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("zip_code"), Some(&CellValue::Text("10001".into())));
        assert_eq!(rows[0].get("rent_burden"), Some(&CellValue::Float(0.5)));
        assert_eq!(
            rows[0].get("rent_burden_contributors"),
            Some(&CellValue::Integer(1))
        );
        assert_eq!(rows[1].offset, 1);
        assert_eq!(rows[1].get("rent_burden"), Some(&CellValue::Null));
        assert_eq!(
            rows[1].get("rent_burden_contributors"),
            Some(&CellValue::Integer(0))
        );
    }

    fn zip_source() -> AggregateSource {
        AggregateSource {
            crosswalk: CrosswalkSpec {
                table: "zip_tract".into(),
                group: "zip_code".into(),
                member: "tract_id".into(),
                weight: "overlap".into(),
            },
            values: ValueSpec {
                table: "tract_rent".into(),
                member: "tract_id".into(),
            },
            metrics: vec![metric(MetricScale::Fraction)],
            allowed_missing: vec![],
        }
    }
}
