//! Structured migration and audit reports.
//!
//! Every field is a named scalar or a sequence of named records so the
//! reports can be consumed programmatically without parsing free text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Migration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Node,
    Relationship,
}

/// Lifecycle of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Open,
    /// Every row applied.
    Committed,
    /// At least one row skipped; applied rows (if any) are committed.
    PartiallyCommitted,
    /// Transaction infrastructure failed or the run was cancelled mid-batch.
    /// Nothing from this batch is retained.
    Aborted,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// Terminal (or not yet terminal) state of a rule within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Pending,
    Running,
    /// Every batch reached Committed or PartiallyCommitted.
    Completed,
    /// A batch hit an infrastructure failure.
    Aborted,
    /// Deadline passed or the operator cancelled the run.
    Cancelled,
    /// A rule this one depends on did not complete.
    Blocked,
}

impl RuleState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// A row that was not written, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRow {
    pub rule: String,
    /// Row offset within the rule's source ordering.
    pub offset: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub rule: String,
    pub start_offset: u64,
    pub rows: u64,
    pub applied: u64,
    pub skipped: u64,
    pub state: BatchState,
    /// Monotonic run-wide ticks taken when the batch opened and closed.
    pub opened_tick: u64,
    pub closed_tick: u64,
}

impl BatchReport {
    /// A batch whose rows are read and whose transaction is about to open.
    pub fn open(rule: &str, start_offset: u64, rows: u64, opened_tick: u64) -> Self {
        Self {
            rule: rule.to_string(),
            start_offset,
            rows,
            applied: 0,
            skipped: 0,
            state: BatchState::Open,
            opened_tick,
            closed_tick: opened_tick,
        }
    }

    /// Move an open batch to its outcome. A closed batch never reopens or
    /// changes outcome.
    pub fn close(&mut self, state: BatchState, applied: u64, skipped: u64, closed_tick: u64) {
        if self.state.is_terminal() || !state.is_terminal() {
            return;
        }
        self.state = state;
        self.applied = applied;
        self.skipped = skipped;
        self.closed_tick = closed_tick;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleReport {
    pub rule: String,
    pub kind: RuleKind,
    /// Label or relationship type written.
    pub target: String,
    pub stage: usize,
    pub state: RuleState,
    pub start_offset: u64,
    /// First offset not yet covered by a terminal batch.
    pub next_offset: u64,
    pub rows_read: u64,
    pub applied: u64,
    pub skipped: u64,
    pub batches_committed: u64,
    pub batches_partial: u64,
    pub batches_aborted: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RuleReport {
    pub fn new(rule: &str, kind: RuleKind, target: &str, stage: usize) -> Self {
        Self {
            rule: rule.to_string(),
            kind,
            target: target.to_string(),
            stage,
            state: RuleState::Pending,
            start_offset: 0,
            next_offset: 0,
            rows_read: 0,
            applied: 0,
            skipped: 0,
            batches_committed: 0,
            batches_partial: 0,
            batches_aborted: 0,
            error: None,
        }
    }

    /// Fold a finished batch into the rule totals. Open batches are ignored.
    pub fn record_batch(&mut self, batch: &BatchReport) {
        if !batch.state.is_terminal() {
            return;
        }
        self.rows_read += batch.rows;
        self.applied += batch.applied;
        self.skipped += batch.skipped;
        match batch.state {
            BatchState::Committed => self.batches_committed += 1,
            BatchState::PartiallyCommitted => self.batches_partial += 1,
            BatchState::Aborted => self.batches_aborted += 1,
            BatchState::Open => {}
        }
        if batch.state != BatchState::Aborted {
            self.next_offset = batch.start_offset + batch.rows;
        }
    }
}

/// Result of one executor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub plan_fingerprint: String,
    pub dry_run: bool,
    pub batch_size: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rules: Vec<RuleReport>,
    pub batches: Vec<BatchReport>,
    /// Capped sample of skipped rows; `skipped_rows_dropped` counts the rest.
    pub skipped_rows: Vec<SkippedRow>,
    pub skipped_rows_dropped: u64,
}

impl MigrationReport {
    pub fn rule(&self, id: &str) -> Option<&RuleReport> {
        self.rules.iter().find(|r| r.rule == id)
    }

    pub fn batches_for<'a>(&'a self, rule: &'a str) -> impl Iterator<Item = &'a BatchReport> + 'a {
        self.batches.iter().filter(move |b| b.rule == rule)
    }

    pub fn total_applied(&self) -> u64 {
        self.rules.iter().map(|r| r.applied).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.rules.iter().map(|r| r.skipped).sum()
    }

    /// True when every rule completed. Skipped rows do not make a run unsuccessful.
    pub fn succeeded(&self) -> bool {
        self.rules.iter().all(|r| r.state == RuleState::Completed)
    }

    /// True when the run succeeded with nothing to diagnose.
    pub fn is_clean(&self) -> bool {
        self.succeeded() && self.total_skipped() == 0
    }
}

// ── Audit ─────────────────────────────────────────────────────────

/// Share of the source count tolerated before a delta counts as an error.
pub const WARN_DELTA_RATIO: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Ok,
    Warn,
    Error,
}

impl AuditSeverity {
    pub fn from_counts(source_count: u64, delta: i64) -> Self {
        if delta == 0 {
            return Self::Ok;
        }
        let allowed = source_count as f64 * WARN_DELTA_RATIO;
        if (delta.unsigned_abs() as f64) <= allowed {
            Self::Warn
        } else {
            Self::Error
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAudit {
    pub rule: String,
    pub kind: RuleKind,
    pub target: String,
    /// Exact count of distinct non-null source keys.
    pub source_count: u64,
    pub target_count: u64,
    /// `source_count - target_count`.
    pub delta: i64,
    /// Source keys with no target counterpart.
    pub missing_total: u64,
    /// Sorted, at most the configured sample size.
    pub missing_sample: Vec<String>,
    /// Target keys with no source counterpart.
    pub extra_in_target: u64,
    pub severity: AuditSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub rules: Vec<RuleAudit>,
}

impl AuditReport {
    pub fn rule(&self, id: &str) -> Option<&RuleAudit> {
        self.rules.iter().find(|r| r.rule == id)
    }

    pub fn worst_severity(&self) -> AuditSeverity {
        self.rules
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or(AuditSeverity::Ok)
    }

    /// Rules whose counts or key sets disagree.
    pub fn discrepancies(&self) -> impl Iterator<Item = &RuleAudit> {
        self.rules.iter().filter(|r| r.severity != AuditSeverity::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(start: u64, rows: u64, skipped: u64, state: BatchState) -> BatchReport {
        BatchReport {
            rule: "N".into(),
            start_offset: start,
            rows,
            applied: rows - skipped,
            skipped,
            state,
            opened_tick: 0,
            closed_tick: 1,
        }
    }

    #[test]
    fn test_rule_report_accumulates_batches() {
        let mut report = RuleReport::new("N", RuleKind::Node, "N", 0);
        report.record_batch(&batch(0, 10, 0, BatchState::Committed));
        report.record_batch(&batch(10, 10, 1, BatchState::PartiallyCommitted));
        assert_eq!(report.applied, 19);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.next_offset, 20);
        assert_eq!(report.batches_partial, 1);
    }

    #[test]
    fn test_aborted_batch_does_not_advance_offset() {
        let mut report = RuleReport::new("N", RuleKind::Node, "N", 0);
        report.record_batch(&batch(0, 10, 0, BatchState::Committed));
        report.record_batch(&batch(10, 10, 0, BatchState::Aborted));
        assert_eq!(report.next_offset, 10);
        assert_eq!(report.batches_aborted, 1);
    }

    #[test]
    fn test_batch_lifecycle_open_then_closed_once() {
        let mut b = BatchReport::open("N", 20, 5, 7);
        assert_eq!(b.state, BatchState::Open);
        assert!(!b.state.is_terminal());

        let mut report = RuleReport::new("N", RuleKind::Node, "N", 0);
        report.record_batch(&b);
        assert_eq!(report.rows_read, 0);
        assert_eq!(report.next_offset, 0);

        b.close(BatchState::PartiallyCommitted, 4, 1, 9);
        b.close(BatchState::Aborted, 0, 0, 11);
        assert_eq!(b.state, BatchState::PartiallyCommitted);
        assert_eq!((b.applied, b.skipped), (4, 1));
        assert_eq!((b.opened_tick, b.closed_tick), (7, 9));

        report.record_batch(&b);
        assert_eq!(report.next_offset, 25);
    }

    #[test]
    fn test_severity_thresholds() {
        assert_eq!(AuditSeverity::from_counts(1000, 0), AuditSeverity::Ok);
        assert_eq!(AuditSeverity::from_counts(1000, 2), AuditSeverity::Warn);
        assert_eq!(AuditSeverity::from_counts(1000, 50), AuditSeverity::Warn);
        assert_eq!(AuditSeverity::from_counts(1000, 51), AuditSeverity::Error);
        assert_eq!(AuditSeverity::from_counts(0, -3), AuditSeverity::Error);
    }
}
