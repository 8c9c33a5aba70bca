//! relgraph-source: read-only access to the relational source.
//!
//! The migration engine never talks to a database driver directly. It asks a
//! [`SourceStore`] for catalog metadata, cheap row-count estimates, paged rows
//! for a rule source, and exact distinct-key counts for auditing.

pub mod error;
pub mod sqlite;

use async_trait::async_trait;

use relgraph_core::{CellValue, SourceRow, TableDescriptor};

pub use error::{Result, SourceError};
pub use sqlite::{SqliteConfig, SqliteSource};

/// A row stream definition: what to read and in which stable order.
#[derive(Debug, Clone, PartialEq)]
pub enum RowQuery {
    /// Every row of a table.
    Table { name: String, order_by: Vec<String> },
    /// A read-only SELECT, paged in `order_by` order with the remaining
    /// selected columns as tiebreakers.
    Sql { sql: String, order_by: Vec<String> },
}

impl RowQuery {
    pub fn table(name: &str, order_by: &[String]) -> Self {
        Self::Table {
            name: name.to_string(),
            order_by: order_by.to_vec(),
        }
    }

    pub fn sql(sql: &str, order_by: &[String]) -> Self {
        Self::Sql {
            sql: sql.to_string(),
            order_by: order_by.to_vec(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Table { name, .. } => name.clone(),
            Self::Sql { .. } => "query".to_string(),
        }
    }
}

/// Read-only relational source.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;

    /// User tables, sorted by name.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Columns, primary key and foreign keys of one table.
    ///
    /// `approximate_rows` is left unset; see [`SourceStore::estimate_row_count`].
    async fn describe_table(&self, table: &str) -> Result<TableDescriptor>;

    /// A cheap size estimate. `None` when the source cannot estimate without scanning.
    async fn estimate_row_count(&self, table: &str) -> Result<Option<u64>>;

    /// Up to `limit` rows starting at `offset` in the query's stable order.
    async fn fetch_rows(&self, query: &RowQuery, offset: u64, limit: usize)
        -> Result<Vec<SourceRow>>;

    /// Exact count of distinct tuples over `columns`, ignoring tuples with a null.
    async fn count_distinct(&self, query: &RowQuery, columns: &[String]) -> Result<u64>;

    /// The distinct non-null tuples over `columns`, sorted.
    async fn distinct_keys(
        &self,
        query: &RowQuery,
        columns: &[String],
    ) -> Result<Vec<Vec<CellValue>>>;
}
