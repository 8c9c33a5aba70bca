//! Plan execution: dependency-ordered, batched, fault-isolated, resumable.
//!
//! Each rule runs as its own task once every rule it depends on has
//! completed; a semaphore bounds how many rules write at once. Within a
//! rule a producer task prefetches pages while the current batch commits.
//!
//! A batch is one graph transaction. A row that fails to convert is skipped
//! before the transaction opens. A row the store rejects rolls the
//! transaction back and the surviving rows are replayed; merges are
//! idempotent, so the replay leaves exactly the surviving rows applied.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use relgraph_checkpoint::{Checkpoint, CheckpointStore};
use relgraph_core::{
    BatchReport, BatchState, MappingRule, MigrationReport, RuleKind, RuleReport, RuleState,
    SkippedRow, SourceRow,
};
use relgraph_graph::{GraphError, GraphStore, GraphTxn, WriteError, WriteOp};
use relgraph_source::{SourceError, SourceStore};

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::mapper::MigrationPlan;
use crate::rows::{RowConverter, RowError, RuleRows};

/// Where each rule starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Every rule starts at this row offset.
    Offset(u64),
    /// Each rule starts at its checkpoint for the plan, or at zero.
    Checkpoint,
}

/// Operator abort, observed at batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs a [`MigrationPlan`] against a graph store.
pub struct MigrationExecutor {
    source: Arc<dyn SourceStore>,
    graph: Arc<dyn GraphStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: MigrationConfig,
    cancel: CancelHandle,
    dry_run: bool,
}

impl MigrationExecutor {
    pub fn new(
        source: Arc<dyn SourceStore>,
        graph: Arc<dyn GraphStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            source,
            graph,
            checkpoints,
            config,
            cancel: CancelHandle::default(),
            dry_run: false,
        }
    }

    /// Mark reports as dry runs. The caller supplies the throwaway stores.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Execute every rule of the plan.
    ///
    /// Fails outright only when `batch_size` is zero, either store is
    /// unreachable before the first rule starts, or checkpoints cannot be
    /// read. Everything after that is recorded in the report.
    pub async fn run(
        &self,
        plan: &MigrationPlan,
        batch_size: usize,
        resume: Option<ResumeFrom>,
    ) -> Result<MigrationReport> {
        if batch_size == 0 {
            return Err(MigrateError::InvalidBatchSize);
        }
        self.source
            .ping()
            .await
            .map_err(|e| MigrateError::Connection(format!("source: {e}")))?;
        self.graph
            .ping()
            .await
            .map_err(|e| MigrateError::Connection(format!("graph: {e}")))?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut reports = Vec::with_capacity(plan.len());
        let mut jobs = Vec::with_capacity(plan.len());
        for planned in &plan.rules {
            let id = planned.id();
            let (start_offset, start_batches) = match resume {
                None => (0, 0),
                Some(ResumeFrom::Offset(n)) => (n, 0),
                Some(ResumeFrom::Checkpoint) => self
                    .checkpoints
                    .load(&plan.fingerprint, id)?
                    .map_or((0, 0), |cp| (cp.next_offset, cp.batches_done)),
            };
            let kind = if planned.rule.is_node() {
                RuleKind::Node
            } else {
                RuleKind::Relationship
            };
            let mut report = RuleReport::new(id, kind, planned.rule.target_name(), planned.stage);
            report.start_offset = start_offset;
            report.next_offset = start_offset;
            reports.push(report);
            jobs.push(Some(RuleJob {
                rule: planned.rule.clone(),
                converter: RowConverter::for_rule(&planned.rule, plan)?,
                start_batches,
            }));
        }

        let ctx = Arc::new(RunContext {
            source: self.source.clone(),
            graph: self.graph.clone(),
            checkpoints: self.checkpoints.clone(),
            fingerprint: plan.fingerprint.clone(),
            batch_size,
            prefetch: self.config.prefetch_batches.max(1),
            create_constraints: self.config.create_constraints,
            row_timeout: self.config.row_timeout_ms.map(Duration::from_millis),
            deadline: self
                .config
                .deadline_secs
                .map(|s| Instant::now() + Duration::from_secs(s)),
            cancel: self.cancel.clone(),
            ticks: AtomicU64::new(0),
            max_skipped: self.config.max_skipped_samples,
        });
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_rules.max(1)));

        tracing::info!(
            run_id = %run_id,
            rules = plan.len(),
            batch_size,
            dry_run = self.dry_run,
            resume = ?resume,
            "Migration run started"
        );

        let mut tasks: JoinSet<RuleOutcome> = JoinSet::new();
        let mut batches = Vec::new();
        let mut skipped_by_rule: Vec<(Vec<SkippedRow>, u64)> = vec![(Vec::new(), 0); plan.len()];

        loop {
            // Settle every rule whose dependencies have all finished.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for i in 0..plan.len() {
                    if reports[i].state != RuleState::Pending {
                        continue;
                    }
                    let deps = &plan.rules[i].depends_on;
                    if let Some(&failed) = deps.iter().find(|&&d| {
                        matches!(
                            reports[d].state,
                            RuleState::Aborted | RuleState::Cancelled | RuleState::Blocked
                        )
                    }) {
                        reports[i].state = RuleState::Blocked;
                        reports[i].error =
                            Some(format!("dependency {} did not complete", reports[failed].rule));
                        tracing::warn!(
                            rule = %reports[i].rule,
                            dependency = %reports[failed].rule,
                            "Rule blocked"
                        );
                        progressed = true;
                        continue;
                    }
                    if !deps.iter().all(|&d| reports[d].state == RuleState::Completed) {
                        continue;
                    }
                    if let Some(reason) = ctx.stop_reason() {
                        reports[i].state = RuleState::Cancelled;
                        reports[i].error = Some(reason.to_string());
                        progressed = true;
                        continue;
                    }
                    let Some(job) = jobs[i].take() else {
                        continue;
                    };
                    reports[i].state = RuleState::Running;
                    tasks.spawn(run_rule(
                        ctx.clone(),
                        semaphore.clone(),
                        i,
                        job,
                        reports[i].clone(),
                    ));
                }
            }

            match tasks.join_next().await {
                None => break,
                Some(Ok(outcome)) => {
                    let i = outcome.index;
                    reports[i] = outcome.report;
                    batches.extend(outcome.batches);
                    skipped_by_rule[i] = (outcome.skipped, outcome.skipped_dropped);
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Rule task failed");
                }
            }
        }

        for report in &mut reports {
            match report.state {
                RuleState::Running => {
                    report.state = RuleState::Aborted;
                    report.error.get_or_insert_with(|| "rule task failed".to_string());
                }
                RuleState::Pending => {
                    report.state = RuleState::Blocked;
                    report
                        .error
                        .get_or_insert_with(|| "dependencies did not complete".to_string());
                }
                _ => {}
            }
        }

        let mut skipped_rows = Vec::new();
        let mut skipped_rows_dropped = 0;
        for (rows, dropped) in skipped_by_rule {
            skipped_rows_dropped += dropped;
            for row in rows {
                if skipped_rows.len() < ctx.max_skipped {
                    skipped_rows.push(row);
                } else {
                    skipped_rows_dropped += 1;
                }
            }
        }
        batches.sort_by_key(|b: &BatchReport| b.opened_tick);

        let report = MigrationReport {
            run_id,
            plan_fingerprint: plan.fingerprint.clone(),
            dry_run: self.dry_run,
            batch_size,
            started_at,
            finished_at: Utc::now(),
            rules: reports,
            batches,
            skipped_rows,
            skipped_rows_dropped,
        };

        tracing::info!(
            run_id = %run_id,
            succeeded = report.succeeded(),
            applied = report.total_applied(),
            skipped = report.total_skipped(),
            "Migration run finished"
        );
        Ok(report)
    }
}

// ── Run Internals ─────────────────────────────────────────────────

struct RunContext {
    source: Arc<dyn SourceStore>,
    graph: Arc<dyn GraphStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    fingerprint: String,
    batch_size: usize,
    prefetch: usize,
    create_constraints: bool,
    row_timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: CancelHandle,
    ticks: AtomicU64,
    max_skipped: usize,
}

impl RunContext {
    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst)
    }

    fn stop_reason(&self) -> Option<&'static str> {
        if self.cancel.is_cancelled() {
            Some("cancelled by operator")
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some("deadline exceeded")
        } else {
            None
        }
    }

    /// One row-scoped write, bounded by the row timeout.
    async fn apply(
        &self,
        txn: &mut dyn GraphTxn,
        op: &WriteOp,
    ) -> std::result::Result<(), ApplyFailure> {
        let result = match self.row_timeout {
            Some(limit) => match tokio::time::timeout(limit, txn.apply(op)).await {
                Ok(r) => r,
                Err(_) => {
                    let ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    return Err(ApplyFailure::Row(RowError::Timeout(ms).to_string()));
                }
            },
            None => txn.apply(op).await,
        };
        result.map_err(|e| match e {
            WriteError::Row(msg) => ApplyFailure::Row(RowError::Write(msg).to_string()),
            WriteError::Infrastructure(e) => ApplyFailure::Infrastructure(e),
        })
    }

    fn save_checkpoint(&self, rule: &str, next_offset: u64, batches_done: u64) {
        let cp = Checkpoint::new(&self.fingerprint, rule, next_offset, batches_done);
        if let Err(e) = self.checkpoints.save(&cp) {
            tracing::warn!(rule, next_offset, error = %e, "Checkpoint not saved");
        }
    }
}

enum ApplyFailure {
    Row(String),
    Infrastructure(GraphError),
}

enum BatchFailure {
    Cancelled(&'static str),
    Infrastructure(GraphError),
}

struct RuleJob {
    rule: MappingRule,
    converter: RowConverter,
    start_batches: u64,
}

struct RuleOutcome {
    index: usize,
    report: RuleReport,
    batches: Vec<BatchReport>,
    skipped: Vec<SkippedRow>,
    skipped_dropped: u64,
}

impl RuleOutcome {
    fn finish(mut self, state: RuleState, error: Option<String>) -> Self {
        self.report.state = state;
        self.report.error = error;
        match state {
            RuleState::Completed => tracing::info!(
                rule = %self.report.rule,
                applied = self.report.applied,
                skipped = self.report.skipped,
                batches = self.batches.len(),
                "Rule completed"
            ),
            _ => tracing::warn!(
                rule = %self.report.rule,
                state = ?state,
                error = self.report.error.as_deref().unwrap_or_default(),
                next_offset = self.report.next_offset,
                "Rule stopped"
            ),
        }
        self
    }
}

async fn run_rule(
    ctx: Arc<RunContext>,
    semaphore: Arc<Semaphore>,
    index: usize,
    job: RuleJob,
    report: RuleReport,
) -> RuleOutcome {
    let _permit = semaphore.acquire_owned().await.ok();

    let rule_id = report.rule.clone();
    let start_offset = report.start_offset;
    let mut outcome = RuleOutcome {
        index,
        report,
        batches: Vec::new(),
        skipped: Vec::new(),
        skipped_dropped: 0,
    };
    tracing::info!(
        rule = %rule_id,
        source = %job.rule.source().describe(),
        start_offset,
        "Rule started"
    );

    if let Some(reason) = ctx.stop_reason() {
        return outcome.finish(RuleState::Cancelled, Some(reason.to_string()));
    }

    match &job.rule {
        MappingRule::Node(node) if ctx.create_constraints => {
            if let Err(e) = ctx.graph.ensure_node_key(&node.label, &node.key).await {
                return outcome.finish(
                    RuleState::Aborted,
                    Some(format!("key constraint for {} failed: {e}", node.label)),
                );
            }
        }
        _ => {}
    }

    let rows = match RuleRows::open(&job.rule, &ctx.source).await {
        Ok(rows) => rows,
        Err(e) => return outcome.finish(RuleState::Aborted, Some(e.to_string())),
    };

    let (tx, mut rx) = mpsc::channel(ctx.prefetch);
    let producer = tokio::spawn(produce_pages(
        ctx.source.clone(),
        rows,
        start_offset,
        ctx.batch_size,
        tx,
    ));

    let mut batches_done = job.start_batches;
    let mut final_state = (RuleState::Completed, None);
    while let Some(page) = rx.recv().await {
        if let Some(reason) = ctx.stop_reason() {
            final_state = (RuleState::Cancelled, Some(reason.to_string()));
            break;
        }
        let (offset, rows) = match page {
            Ok(page) => page,
            Err(e) => {
                final_state = (
                    RuleState::Aborted,
                    Some(format!(
                        "source read failed at offset {}: {e}",
                        outcome.report.next_offset
                    )),
                );
                break;
            }
        };

        let batch = execute_batch(&ctx, &rule_id, &job.converter, offset, rows).await;
        outcome.report.record_batch(&batch.report);
        for (row_offset, reason) in batch.skipped {
            if outcome.skipped.len() < ctx.max_skipped {
                outcome.skipped.push(SkippedRow {
                    rule: rule_id.clone(),
                    offset: row_offset,
                    reason,
                });
            } else {
                outcome.skipped_dropped += 1;
            }
        }
        let state = batch.report.state;
        outcome.batches.push(batch.report);

        match batch.failure {
            None => {
                batches_done += 1;
                ctx.save_checkpoint(&rule_id, outcome.report.next_offset, batches_done);
            }
            Some(BatchFailure::Cancelled(reason)) => {
                final_state = (RuleState::Cancelled, Some(reason.to_string()));
                break;
            }
            Some(BatchFailure::Infrastructure(e)) => {
                tracing::error!(rule = %rule_id, offset, state = ?state, error = %e, "Batch aborted");
                final_state = (
                    RuleState::Aborted,
                    Some(format!("batch at offset {offset} aborted: {e}")),
                );
                break;
            }
        }
    }
    producer.abort();

    outcome.finish(final_state.0, final_state.1)
}

type Page = std::result::Result<(u64, Vec<SourceRow>), SourceError>;

/// Fetch pages ahead of the writer; the channel bound is the prefetch depth.
async fn produce_pages(
    source: Arc<dyn SourceStore>,
    rows: RuleRows,
    start_offset: u64,
    batch_size: usize,
    tx: mpsc::Sender<Page>,
) {
    let mut offset = start_offset;
    loop {
        match rows.fetch(source.as_ref(), offset, batch_size).await {
            Ok(page) if page.is_empty() => return,
            Ok(page) => {
                let n = page.len();
                if tx.send(Ok((offset, page))).await.is_err() || n < batch_size {
                    return;
                }
                offset += n as u64;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

struct BatchRun {
    report: BatchReport,
    skipped: Vec<(u64, String)>,
    failure: Option<BatchFailure>,
}

async fn execute_batch(
    ctx: &RunContext,
    rule: &str,
    converter: &RowConverter,
    start_offset: u64,
    rows: Vec<SourceRow>,
) -> BatchRun {
    let row_count = rows.len() as u64;
    let mut report = BatchReport::open(rule, start_offset, row_count, ctx.tick());
    tracing::debug!(rule, start_offset, rows = row_count, state = ?report.state, "Batch opened");

    let mut skipped = Vec::new();
    let mut pending = Vec::with_capacity(rows.len());
    for row in &rows {
        match converter.convert(row) {
            Ok(op) => pending.push((row.offset, op)),
            Err(e) => skipped.push((row.offset, e.to_string())),
        }
    }

    let result = commit_rows(ctx, &mut pending, &mut skipped).await;

    let (state, applied, failure) = match result {
        Ok(()) if skipped.is_empty() => (BatchState::Committed, pending.len() as u64, None),
        Ok(()) => (BatchState::PartiallyCommitted, pending.len() as u64, None),
        Err(failure) => {
            // Nothing from an aborted batch is kept; its rows are retried next run.
            skipped.clear();
            (BatchState::Aborted, 0, Some(failure))
        }
    };
    skipped.sort_by_key(|(offset, _)| *offset);

    for (offset, reason) in &skipped {
        tracing::warn!(rule, offset, reason = %reason, "Row skipped");
    }
    tracing::debug!(
        rule,
        start_offset,
        rows = row_count,
        applied,
        skipped = skipped.len(),
        state = ?state,
        "Batch closed"
    );

    report.close(state, applied, skipped.len() as u64, ctx.tick());
    BatchRun {
        report,
        skipped,
        failure,
    }
}

/// Write `pending` in one transaction, dropping rows the store rejects.
///
/// On return `pending` holds exactly the committed rows.
async fn commit_rows(
    ctx: &RunContext,
    pending: &mut Vec<(u64, WriteOp)>,
    skipped: &mut Vec<(u64, String)>,
) -> std::result::Result<(), BatchFailure> {
    loop {
        if pending.is_empty() {
            return Ok(());
        }
        let mut txn = ctx.graph.begin().await.map_err(BatchFailure::Infrastructure)?;

        let mut rejected = None;
        for (i, (offset, op)) in pending.iter().enumerate() {
            match ctx.apply(txn.as_mut(), op).await {
                Ok(()) => {}
                Err(ApplyFailure::Row(reason)) => {
                    rejected = Some((i, *offset, reason));
                    break;
                }
                Err(ApplyFailure::Infrastructure(e)) => {
                    rollback_quietly(txn).await;
                    return Err(BatchFailure::Infrastructure(e));
                }
            }
        }

        if let Some((i, offset, reason)) = rejected {
            // A timed-out write can leave the transaction unable to roll back.
            // It is discarded either way; the replay opens a fresh one and a
            // dead connection surfaces there.
            if let Err(e) = txn.rollback().await {
                tracing::warn!(offset, error = %e, "Rollback after rejected row failed");
            }
            pending.remove(i);
            skipped.push((offset, reason));
            continue;
        }

        if let Some(reason) = ctx.stop_reason() {
            rollback_quietly(txn).await;
            return Err(BatchFailure::Cancelled(reason));
        }
        return txn.commit().await.map_err(BatchFailure::Infrastructure);
    }
}

async fn rollback_quietly(txn: Box<dyn GraphTxn>) {
    if let Err(e) = txn.rollback().await {
        tracing::debug!(error = %e, "Rollback failed");
    }
}
