//! Cross-component scenarios: SQLite source, in-memory graph target.

mod common;

use std::sync::Arc;
use std::time::Duration;

use relgraph_checkpoint::{CheckpointStore, MemoryCheckpointStore};
use relgraph_core::{AuditSeverity, BatchState, CellValue, RuleState};
use relgraph_graph::{GraphStore, MemoryGraph};
use relgraph_migrate::{AuditConfig, IntegrityAuditor, MigrationConfig, ResumeFrom};

use common::{executor, items_sql, linked_sql, plan, source, ITEMS, LINKED};

fn no_constraints() -> MigrationConfig {
    MigrationConfig {
        create_constraints: false,
        ..MigrationConfig::default()
    }
}

#[tokio::test]
async fn test_nullable_property_and_rerun_without_duplicates() {
    let src = source(
        "CREATE TABLE x (id INTEGER PRIMARY KEY, val INTEGER);
         INSERT INTO x VALUES (1, 5), (2, NULL);",
    );
    let yaml = r#"
rules:
  - kind: node
    label: N
    source: { table: x }
    key: [id]
    properties: [val]
"#;
    let plan = plan(&src, yaml).await;
    let graph = MemoryGraph::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    for _ in 0..2 {
        let report = executor(&src, &graph, &checkpoints, MigrationConfig::default())
            .run(&plan, 10, None)
            .await
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(graph.rendered_keys("N"), vec!["1", "2"]);
    }

    let one = graph.node("N", "1").unwrap();
    assert_eq!(one.properties.get("val"), Some(&CellValue::Integer(5)));
    let two = graph.node("N", "2").unwrap();
    assert_eq!(two.properties.get("val"), None);
}

#[tokio::test]
async fn test_second_run_leaves_graph_unchanged() {
    let src = source(&linked_sql());
    let plan = plan(&src, LINKED).await;
    let graph = MemoryGraph::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let first = executor(&src, &graph, &checkpoints, MigrationConfig::default())
        .run(&plan, 3, None)
        .await
        .unwrap();
    assert!(first.is_clean());
    let authors = graph.rendered_keys("Author");
    let books = graph.rendered_keys("Book");
    let wrote = graph.relationship_count("WROTE");
    assert_eq!(authors.len(), 5);
    assert_eq!(books.len(), 7);
    assert_eq!(wrote, 8);

    let second = executor(&src, &graph, &checkpoints, MigrationConfig::default())
        .run(&plan, 3, None)
        .await
        .unwrap();
    assert!(second.is_clean());
    assert_eq!(graph.rendered_keys("Author"), authors);
    assert_eq!(graph.rendered_keys("Book"), books);
    assert_eq!(graph.relationship_count("WROTE"), wrote);
}

#[tokio::test]
async fn test_null_key_row_is_skipped_and_batch_commits() {
    let mut sql = "CREATE TABLE codes (n INTEGER, code TEXT);".to_string();
    for i in 1..=10 {
        if i == 7 {
            sql.push_str("INSERT INTO codes VALUES (7, NULL);");
        } else {
            sql.push_str(&format!("INSERT INTO codes VALUES ({i}, 'c{i}');"));
        }
    }
    let src = source(&sql);
    let yaml = r#"
rules:
  - kind: node
    label: Code
    source: { table: codes }
    key: [code]
    properties: [n]
"#;
    let plan = plan(&src, yaml).await;
    let graph = MemoryGraph::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let report = executor(&src, &graph, &checkpoints, MigrationConfig::default())
        .run(&plan, 10, None)
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.batches.len(), 1);
    let batch = &report.batches[0];
    assert_eq!(batch.rows, 10);
    assert_eq!(batch.applied, 9);
    assert_eq!(batch.skipped, 1);
    assert_eq!(batch.state, BatchState::PartiallyCommitted);
    assert_eq!(report.skipped_rows.len(), 1);
    assert_eq!(report.skipped_rows[0].reason, "null value in key column code");
    assert_eq!(graph.node_count("Code"), 9);
}

#[tokio::test]
async fn test_relationship_batches_follow_endpoint_batches() {
    let src = source(&linked_sql());
    let plan = plan(&src, LINKED).await;
    let graph = MemoryGraph::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let report = executor(&src, &graph, &checkpoints, MigrationConfig::default())
        .run(&plan, 2, None)
        .await
        .unwrap();
    assert!(report.is_clean());

    let endpoints_closed = report
        .batches_for("Author")
        .chain(report.batches_for("Book"))
        .map(|b| b.closed_tick)
        .max()
        .unwrap();
    let first_link = report
        .batches_for("WROTE")
        .map(|b| b.opened_tick)
        .min()
        .unwrap();
    assert!(endpoints_closed < first_link);
    assert_eq!(report.batches_for("WROTE").count(), 4);
    assert_eq!(report.rule("WROTE").unwrap().stage, 1);
}

#[tokio::test]
async fn test_failed_dependency_blocks_relationships() {
    let src = source(&linked_sql());
    let plan = plan(&src, LINKED).await;
    let graph = MemoryGraph::new();
    graph.fail_after_commits(0);
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let report = executor(&src, &graph, &checkpoints, no_constraints())
        .run(&plan, 10, None)
        .await
        .unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.rule("Author").unwrap().state, RuleState::Aborted);
    assert_eq!(report.rule("Book").unwrap().state, RuleState::Aborted);
    let wrote = report.rule("WROTE").unwrap();
    assert_eq!(wrote.state, RuleState::Blocked);
    assert!(wrote.error.as_deref().unwrap().contains("did not complete"));
    assert_eq!(report.batches_for("WROTE").count(), 0);
    assert_eq!(graph.relationship_count("WROTE"), 0);
}

#[tokio::test]
async fn test_resume_continues_from_last_committed_batch() {
    let src = source(&items_sql(10));
    let plan = plan(&src, ITEMS).await;
    let graph = MemoryGraph::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    graph.fail_after_commits(2);
    let first = executor(&src, &graph, &checkpoints, MigrationConfig::default())
        .run(&plan, 3, None)
        .await
        .unwrap();
    let item = first.rule("Item").unwrap();
    assert_eq!(item.state, RuleState::Aborted);
    assert_eq!(item.batches_committed, 2);
    assert_eq!(item.batches_aborted, 1);
    assert_eq!(item.next_offset, 6);
    assert_eq!(graph.node_count("Item"), 6);

    let cp = checkpoints.load(&plan.fingerprint, "Item").unwrap().unwrap();
    assert_eq!(cp.next_offset, 6);
    assert_eq!(cp.batches_done, 2);

    graph.set_outage(false);
    let second = executor(&src, &graph, &checkpoints, MigrationConfig::default())
        .run(&plan, 3, Some(ResumeFrom::Checkpoint))
        .await
        .unwrap();
    assert!(second.is_clean());
    let item = second.rule("Item").unwrap();
    assert_eq!(item.start_offset, 6);
    assert_eq!(item.rows_read, 4);
    let sizes: Vec<u64> = second.batches.iter().map(|b| b.rows).collect();
    assert_eq!(sizes, vec![3, 1]);
    assert_eq!(graph.node_count("Item"), 10);
}

#[tokio::test]
async fn test_cancel_rolls_back_in_flight_batch() {
    let src = source(&items_sql(6));
    let plan = plan(&src, ITEMS).await;
    let graph = MemoryGraph::new();
    graph.delay_key("3", Duration::from_millis(300));
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let exec = executor(&src, &graph, &checkpoints, MigrationConfig::default());
    let cancel = exec.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let report = exec.run(&plan, 2, None).await.unwrap();

    let item = report.rule("Item").unwrap();
    assert_eq!(item.state, RuleState::Cancelled);
    assert_eq!(item.next_offset, 2);
    let states: Vec<BatchState> = report.batches.iter().map(|b| b.state).collect();
    assert_eq!(states, vec![BatchState::Committed, BatchState::Aborted]);
    assert_eq!(graph.rendered_keys("Item"), vec!["1", "2"]);

    let cp = checkpoints.load(&plan.fingerprint, "Item").unwrap().unwrap();
    assert_eq!(cp.next_offset, 2);
}

#[tokio::test]
async fn test_expired_deadline_starts_nothing() {
    let src = source(&linked_sql());
    let plan = plan(&src, LINKED).await;
    let graph = MemoryGraph::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let config = MigrationConfig {
        deadline_secs: Some(0),
        ..MigrationConfig::default()
    };

    let report = executor(&src, &graph, &checkpoints, config)
        .run(&plan, 10, None)
        .await
        .unwrap();

    assert_eq!(report.rule("Author").unwrap().state, RuleState::Cancelled);
    assert_eq!(report.rule("Book").unwrap().state, RuleState::Cancelled);
    assert_eq!(report.rule("WROTE").unwrap().state, RuleState::Blocked);
    assert!(report.batches.is_empty());
    assert_eq!(graph.node_count("Author"), 0);
}

#[tokio::test]
async fn test_slow_row_times_out_and_is_skipped() {
    let src = source(&items_sql(3));
    let plan = plan(&src, ITEMS).await;
    let graph = MemoryGraph::new();
    graph.delay_key("2", Duration::from_millis(200));
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let config = MigrationConfig {
        row_timeout_ms: Some(50),
        ..MigrationConfig::default()
    };

    let report = executor(&src, &graph, &checkpoints, config)
        .run(&plan, 10, None)
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.batches[0].state, BatchState::PartiallyCommitted);
    assert_eq!(report.skipped_rows[0].offset, 1);
    assert_eq!(report.skipped_rows[0].reason, "write timed out after 50 ms");
    assert_eq!(graph.rendered_keys("Item"), vec!["1", "3"]);
}

#[tokio::test]
async fn test_audit_reports_missing_nodes() {
    let src = source(&items_sql(1000));
    let plan = plan(&src, ITEMS).await;
    let graph = MemoryGraph::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let report = executor(&src, &graph, &checkpoints, MigrationConfig::default())
        .run(&plan, 250, None)
        .await
        .unwrap();
    assert!(report.is_clean());

    let clean = IntegrityAuditor::new(src.clone(), Arc::new(graph.clone()), AuditConfig::default())
        .audit(&plan)
        .await
        .unwrap();
    assert_eq!(clean.worst_severity(), AuditSeverity::Ok);

    assert!(graph.delete_node("Item", "17"));
    assert!(graph.delete_node("Item", "500"));

    let auditor = IntegrityAuditor::new(
        src.clone(),
        Arc::new(graph.clone()),
        AuditConfig { sample_size: 1 },
    );
    let audit = auditor.audit(&plan).await.unwrap();
    let item = audit.rule("Item").unwrap();
    assert_eq!(item.source_count, 1000);
    assert_eq!(item.target_count, 998);
    assert_eq!(item.delta, 2);
    assert_eq!(item.missing_total, 2);
    assert_eq!(item.missing_sample, vec!["17"]);
    assert_eq!(item.severity, AuditSeverity::Warn);
}

#[tokio::test]
async fn test_audit_relationship_pairs() {
    let src = source(&linked_sql());
    let plan = plan(&src, LINKED).await;
    let graph = MemoryGraph::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    executor(&src, &graph, &checkpoints, MigrationConfig::default())
        .run(&plan, 10, None)
        .await
        .unwrap();

    // Deleting author 1 drops its two WROTE relationships with it.
    graph.delete_node("Author", "1");
    let graph: Arc<dyn GraphStore> = Arc::new(graph);
    let audit = IntegrityAuditor::new(src, graph, AuditConfig::default())
        .audit(&plan)
        .await
        .unwrap();

    let wrote = audit.rule("WROTE").unwrap();
    assert_eq!(wrote.source_count, 8);
    assert_eq!(wrote.target_count, 6);
    assert_eq!(wrote.missing_sample, vec!["1 -> 2", "1 -> 5"]);
    assert_eq!(wrote.severity, AuditSeverity::Error);
    assert_eq!(audit.discrepancies().count(), 2);
}

#[tokio::test]
async fn test_aggregate_rule_loads_weighted_values() {
    let src = source(
        "CREATE TABLE zip_tract (zip_code TEXT, tract_id TEXT, overlap REAL);
         INSERT INTO zip_tract VALUES ('10001', 'A', 0.6), ('10001', 'B', 0.4), ('10002', 'C', 1.0);
         CREATE TABLE tract_rent (tract_id TEXT PRIMARY KEY, burden_rate REAL);
         INSERT INTO tract_rent VALUES ('A', 0.5), ('B', NULL), ('C', NULL);",
    );
    let yaml = r#"
rules:
  - kind: node
    label: ZipArea
    source:
      aggregate:
        crosswalk: { table: zip_tract, group: zip_code, member: tract_id, weight: overlap }
        values: { table: tract_rent, member: tract_id }
        metrics:
          - { name: rent_burden, column: burden_rate, scale: fraction }
    key: [zip_code]
    properties: [rent_burden, rent_burden_contributors]
"#;
    let plan = plan(&src, yaml).await;
    let graph = MemoryGraph::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let report = executor(&src, &graph, &checkpoints, MigrationConfig::default())
        .run(&plan, 10, None)
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(graph.rendered_keys("ZipArea"), vec!["10001", "10002"]);

    let full = graph.node("ZipArea", "10001").unwrap();
    match full.properties.get("rent_burden") {
        Some(CellValue::Float(v)) => assert!((v - 0.5).abs() < 1e-9),
        other => panic!("unexpected rent_burden {other:?}"),
    }
    assert_eq!(
        full.properties.get("rent_burden_contributors"),
        Some(&CellValue::Integer(1))
    );

    let empty = graph.node("ZipArea", "10002").unwrap();
    assert_eq!(empty.properties.get("rent_burden"), None);
    assert_eq!(
        empty.properties.get("rent_burden_contributors"),
        Some(&CellValue::Integer(0))
    );

    let audit = IntegrityAuditor::new(src, Arc::new(graph), AuditConfig::default())
        .audit(&plan)
        .await
        .unwrap();
    assert_eq!(audit.rule("ZipArea").unwrap().delta, 0);
}
