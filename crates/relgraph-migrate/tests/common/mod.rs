//! Shared fixtures: an in-memory SQLite source and a plan built from it.

#![allow(dead_code)]

use std::sync::Arc;

use relgraph_checkpoint::{CheckpointStore, MemoryCheckpointStore};
use relgraph_core::MappingConfig;
use relgraph_graph::MemoryGraph;
use relgraph_migrate::{
    AnalyzerConfig, GraphMapper, MigrationConfig, MigrationExecutor, MigrationPlan, SchemaAnalyzer,
};
use relgraph_source::{SourceStore, SqliteSource};

pub fn source(sql: &str) -> Arc<dyn SourceStore> {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    conn.execute_batch(sql).unwrap();
    Arc::new(SqliteSource::from_connection(conn))
}

/// Analyze the source and build a plan for `yaml` against it.
pub async fn plan(source: &Arc<dyn SourceStore>, yaml: &str) -> MigrationPlan {
    let descriptor = SchemaAnalyzer::new(source.clone(), AnalyzerConfig::default())
        .analyze()
        .await
        .unwrap();
    GraphMapper::new()
        .build_plan(&descriptor, &MappingConfig::from_yaml(yaml).unwrap())
        .unwrap()
}

pub fn executor(
    source: &Arc<dyn SourceStore>,
    graph: &MemoryGraph,
    checkpoints: &Arc<MemoryCheckpointStore>,
    config: MigrationConfig,
) -> MigrationExecutor {
    let checkpoints: Arc<dyn CheckpointStore> = checkpoints.clone();
    MigrationExecutor::new(source.clone(), Arc::new(graph.clone()), checkpoints, config)
}

/// `items(id INTEGER PRIMARY KEY, val INTEGER)` holding ids 1..=n.
pub fn items_sql(n: i64) -> String {
    let mut sql = "CREATE TABLE items (id INTEGER PRIMARY KEY, val INTEGER);".to_string();
    for i in 1..=n {
        sql.push_str(&format!("INSERT INTO items VALUES ({i}, {});", i * 10));
    }
    sql
}

pub const ITEMS: &str = r#"
rules:
  - kind: node
    label: Item
    source: { table: items }
    key: [id]
    properties: [val]
"#;

/// Two node tables and a link table between them.
pub fn linked_sql() -> String {
    let mut sql = String::from(
        "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT);
         CREATE TABLE wrote (author_id INTEGER, book_id INTEGER, role TEXT);",
    );
    for i in 1..=5 {
        sql.push_str(&format!("INSERT INTO authors VALUES ({i}, 'author {i}');"));
    }
    for i in 1..=7 {
        sql.push_str(&format!("INSERT INTO books VALUES ({i}, 'book {i}');"));
        sql.push_str(&format!(
            "INSERT INTO wrote VALUES ({}, {i}, 'primary');",
            (i % 5) + 1
        ));
    }
    sql.push_str("INSERT INTO wrote VALUES (1, 2, 'editor');");
    sql
}

pub const LINKED: &str = r#"
rules:
  - kind: relationship
    type: WROTE
    source: { table: wrote }
    start: { label: Author, key: [author_id] }
    end: { label: Book, key: [book_id] }
    properties: [role]
  - kind: node
    label: Author
    source: { table: authors }
    key: [id]
    properties: [name]
  - kind: node
    label: Book
    source: { table: books }
    key: [id]
    properties: [title]
"#;
