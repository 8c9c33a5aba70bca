//! SQLite implementation of [`SourceStore`].
//!
//! rusqlite is synchronous; every call runs on the blocking pool against a
//! single mutex-guarded connection opened read-only.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;

use relgraph_core::{
    CellValue, ColumnDescriptor, ForeignKeyDescriptor, SemanticType, SourceRow, TableDescriptor,
    TableKind,
};

use crate::error::{Result, SourceError};
use crate::{RowQuery, SourceStore};

/// `[source]` settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the database file.
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "./source.db".to_string()
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
        }
    }
}

/// Read-only SQLite source.
///
/// Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct SqliteSource {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSource {
    /// Open the database file read-only.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        if !Path::new(&config.path).exists() {
            return Err(SourceError::Connection(format!(
                "database file {} does not exist",
                config.path
            )));
        }
        let conn = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SourceError::Connection(e.to_string()))?;
        tracing::info!(path = %config.path, "Opened SQLite source");
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection (in-memory databases in tests).
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| SourceError::Connection("source connection mutex poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| SourceError::Connection(format!("source worker failed: {e}")))?
    }
}

// ── SQL Construction ──────────────────────────────────────────────

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The relation to select from, as a FROM-clause fragment.
fn relation(query: &RowQuery) -> String {
    match query {
        RowQuery::Table { name, .. } => quote_ident(name),
        RowQuery::Sql { sql, .. } => {
            format!("({}) AS src", sql.trim().trim_end_matches(';'))
        }
    }
}

/// ORDER BY terms giving `query` a total order, so consecutive pages are
/// disjoint and an offset means the same row on every run.
///
/// Tables order by `order_by` then `rowid`, or the primary key on
/// `WITHOUT ROWID` tables. Queries order by `order_by` then every other
/// selected column; rows equal in every column are interchangeable.
fn page_order(conn: &Connection, query: &RowQuery) -> Result<Vec<String>> {
    match query {
        RowQuery::Table { name, order_by } => {
            let mut terms: Vec<String> = order_by.iter().map(|c| quote_ident(c)).collect();
            if has_rowid(conn, name) {
                terms.push("rowid".to_string());
            } else {
                for column in primary_key(conn, name)? {
                    if !order_by.contains(&column) {
                        terms.push(quote_ident(&column));
                    }
                }
            }
            Ok(terms)
        }
        RowQuery::Sql { sql, order_by } => {
            let stmt = conn
                .prepare(sql.trim().trim_end_matches(';'))
                .map_err(|e| SourceError::InvalidQuery(e.to_string()))?;
            let mut columns: Vec<String> = order_by.clone();
            for name in stmt.column_names() {
                if !columns.iter().any(|c| c == name) {
                    columns.push(name.to_string());
                }
            }
            Ok(columns.iter().map(|c| quote_ident(c)).collect())
        }
    }
}

fn has_rowid(conn: &Connection, table: &str) -> bool {
    conn.prepare(&format!("SELECT rowid FROM {} LIMIT 0", quote_ident(table)))
        .is_ok()
}

fn paged_select(query: &RowQuery, order: &[String]) -> String {
    let order = if order.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order.join(", "))
    };
    format!("SELECT * FROM {}{order} LIMIT ?1 OFFSET ?2", relation(query))
}

fn non_null_filter(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{} IS NOT NULL", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn distinct_select(query: &RowQuery, columns: &[String]) -> String {
    format!(
        "SELECT DISTINCT {cols} FROM {rel} WHERE {filter}",
        cols = column_list(columns),
        rel = relation(query),
        filter = non_null_filter(columns),
    )
}

fn cell_from(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Integer(i),
        ValueRef::Real(f) => CellValue::Float(f).normalized(),
        ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => CellValue::Bytes(b.to_vec()),
    }
}

/// Refuse statements that could write; the source is never mutated.
fn ensure_read_only(conn: &Connection, query: &RowQuery) -> Result<()> {
    if let RowQuery::Sql { sql, .. } = query {
        let stmt = conn
            .prepare(sql.trim().trim_end_matches(';'))
            .map_err(|e| SourceError::InvalidQuery(e.to_string()))?;
        if !stmt.readonly() {
            return Err(SourceError::InvalidQuery(
                "rule source query must be a read-only SELECT".to_string(),
            ));
        }
    }
    Ok(())
}

// ── Catalog Reads ─────────────────────────────────────────────────

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| SourceError::from_sqlite(table, e))
}

/// Primary-key columns in key order.
fn primary_key(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")
        .map_err(|e| SourceError::from_sqlite(table, e))?;
    let names = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))
        .map_err(|e| SourceError::from_sqlite(table, e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| SourceError::from_sqlite(table, e))?;
    Ok(names)
}

fn describe(conn: &Connection, table: &str) -> Result<TableDescriptor> {
    if !table_exists(conn, table)? {
        return Err(SourceError::TableNotFound(table.to_string()));
    }

    let mut stmt = conn
        .prepare(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
        )
        .map_err(|e| SourceError::from_sqlite(table, e))?;
    let columns = stmt
        .query_map(params![table], |row| {
            let name: String = row.get(0)?;
            let declared: String = row.get::<_, Option<String>>(1)?.unwrap_or_default();
            let not_null: i64 = row.get(2)?;
            let pk: i64 = row.get(3)?;
            Ok(ColumnDescriptor {
                name,
                semantic_type: SemanticType::from_declared(&declared),
                declared_type: declared,
                nullable: not_null == 0 && pk == 0,
            })
        })
        .map_err(|e| SourceError::from_sqlite(table, e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| SourceError::from_sqlite(table, e))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )
        .map_err(|e| SourceError::from_sqlite(table, e))?;
    let fk_rows = stmt
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })
        .map_err(|e| SourceError::from_sqlite(table, e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| SourceError::from_sqlite(table, e))?;

    let mut grouped: BTreeMap<i64, (String, Vec<String>, Vec<Option<String>>)> = BTreeMap::new();
    for (id, parent, from, to) in fk_rows {
        let entry = grouped
            .entry(id)
            .or_insert_with(|| (parent, Vec::new(), Vec::new()));
        entry.1.push(from);
        entry.2.push(to);
    }

    let mut foreign_keys = Vec::with_capacity(grouped.len());
    for (_, (parent, local, targets)) in grouped {
        // `REFERENCES parent` without a column list targets the parent's primary key.
        let referenced_columns = if targets.iter().all(Option::is_some) {
            targets.into_iter().flatten().collect()
        } else {
            primary_key(conn, &parent)?
        };
        foreign_keys.push(ForeignKeyDescriptor {
            columns: local,
            referenced_table: parent,
            referenced_columns,
        });
    }

    Ok(TableDescriptor {
        name: table.to_string(),
        columns,
        primary_key: primary_key(conn, table)?,
        foreign_keys,
        approximate_rows: None,
        kind: TableKind::default(),
    })
}

/// Row estimate from `ANALYZE` statistics, falling back to the rowid high-water mark.
fn estimate(conn: &Connection, table: &str) -> Result<Option<u64>> {
    let has_stats = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE name = 'sqlite_stat1'",
            [],
            |_| Ok(()),
        )
        .optional()
        .map_err(|e| SourceError::from_sqlite(table, e))?
        .is_some();

    if has_stats {
        let stat: Option<String> = conn
            .query_row(
                "SELECT stat FROM sqlite_stat1 WHERE tbl = ?1 LIMIT 1",
                params![table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SourceError::from_sqlite(table, e))?;
        if let Some(n) = stat
            .as_deref()
            .and_then(|s| s.split_whitespace().next())
            .and_then(|n| n.parse::<u64>().ok())
        {
            return Ok(Some(n));
        }
    }

    let sql = format!("SELECT MAX(rowid) FROM {}", quote_ident(table));
    match conn.query_row(&sql, [], |row| row.get::<_, Option<i64>>(0)) {
        Ok(max) => Ok(Some(max.unwrap_or(0).max(0) as u64)),
        Err(e) => {
            let err = SourceError::from_sqlite(table, e);
            if err.is_permission_denied() {
                return Err(err);
            }
            tracing::debug!(table, error = %err, "No cheap row estimate available");
            Ok(None)
        }
    }
}

#[async_trait]
impl SourceStore for SqliteSource {
    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| SourceError::Connection(e.to_string()))
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                     ORDER BY name",
                )
                .map_err(|e| SourceError::from_sqlite("sqlite_master", e))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| SourceError::from_sqlite("sqlite_master", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| SourceError::from_sqlite("sqlite_master", e))?;
            Ok(names)
        })
        .await
    }

    async fn describe_table(&self, table: &str) -> Result<TableDescriptor> {
        let table = table.to_string();
        self.with_conn(move |conn| describe(conn, &table)).await
    }

    async fn estimate_row_count(&self, table: &str) -> Result<Option<u64>> {
        let table = table.to_string();
        self.with_conn(move |conn| estimate(conn, &table)).await
    }

    async fn fetch_rows(
        &self,
        query: &RowQuery,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            ensure_read_only(conn, &query)?;
            let object = query.describe();
            let sql = paged_select(&query, &page_order(conn, &query)?);
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| SourceError::from_sqlite(&object, e))?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

            let mut rows = stmt
                .query(params![limit as i64, offset as i64])
                .map_err(|e| SourceError::from_sqlite(&object, e))?;
            let mut out = Vec::with_capacity(limit);
            let mut position = offset;
            while let Some(row) = rows.next().map_err(|e| SourceError::from_sqlite(&object, e))? {
                let mut source_row = SourceRow::new(position);
                for (i, name) in names.iter().enumerate() {
                    let value = row
                        .get_ref(i)
                        .map_err(|e| SourceError::from_sqlite(&object, e))?;
                    source_row.cells.insert(name.clone(), cell_from(value));
                }
                out.push(source_row);
                position += 1;
            }
            Ok(out)
        })
        .await
    }

    async fn count_distinct(&self, query: &RowQuery, columns: &[String]) -> Result<u64> {
        let query = query.clone();
        let columns = columns.to_vec();
        self.with_conn(move |conn| {
            ensure_read_only(conn, &query)?;
            let sql = format!(
                "SELECT COUNT(*) FROM ({})",
                distinct_select(&query, &columns)
            );
            let n: i64 = conn
                .query_row(&sql, [], |row| row.get(0))
                .map_err(|e| SourceError::from_sqlite(&query.describe(), e))?;
            Ok(n.max(0) as u64)
        })
        .await
    }

    async fn distinct_keys(
        &self,
        query: &RowQuery,
        columns: &[String],
    ) -> Result<Vec<Vec<CellValue>>> {
        let query = query.clone();
        let columns = columns.to_vec();
        self.with_conn(move |conn| {
            ensure_read_only(conn, &query)?;
            let object = query.describe();
            let sql = format!(
                "{} ORDER BY {}",
                distinct_select(&query, &columns),
                column_list(&columns)
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| SourceError::from_sqlite(&object, e))?;
            let mut rows = stmt
                .query([])
                .map_err(|e| SourceError::from_sqlite(&object, e))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(|e| SourceError::from_sqlite(&object, e))? {
                let mut tuple = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    let value = row
                        .get_ref(i)
                        .map_err(|e| SourceError::from_sqlite(&object, e))?;
                    tuple.push(cell_from(value));
                }
                out.push(tuple);
            }
            Ok(out)
        })
        .await
    }
}
