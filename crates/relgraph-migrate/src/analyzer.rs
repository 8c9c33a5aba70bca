//! Schema introspection: source catalog to portable descriptor.

use std::sync::Arc;

use relgraph_core::{OmittedTable, SchemaDescriptor, TableKind};
use relgraph_source::{SourceError, SourceStore};

use crate::config::AnalyzerConfig;
use crate::error::{MigrateError, Result};

/// Produces a [`SchemaDescriptor`] from whatever [`SourceStore`] it is given.
pub struct SchemaAnalyzer {
    source: Arc<dyn SourceStore>,
    config: AnalyzerConfig,
}

impl SchemaAnalyzer {
    pub fn new(source: Arc<dyn SourceStore>, config: AnalyzerConfig) -> Self {
        Self { source, config }
    }

    /// Read the catalog and size estimates of every table.
    ///
    /// An unreachable source fails the whole analysis. A table whose catalog
    /// entry cannot be read is recorded as omitted and analysis continues.
    pub async fn analyze(&self) -> Result<SchemaDescriptor> {
        self.source
            .ping()
            .await
            .map_err(|e| MigrateError::Connection(format!("source: {e}")))?;

        let tables = self.source.list_tables().await.map_err(|e| match e {
            SourceError::Connection(msg) => MigrateError::Connection(format!("source: {msg}")),
            other => other.into(),
        })?;
        tracing::info!(table_count = tables.len(), "Schema analysis started");

        let mut descriptor = SchemaDescriptor::default();
        for name in tables {
            if self.config.exclude_tables.contains(&name) {
                tracing::debug!(table = %name, "Table excluded by configuration");
                continue;
            }

            let mut table = match self.source.describe_table(&name).await {
                Ok(t) => t,
                Err(e) => {
                    omit(&mut descriptor, &name, e)?;
                    continue;
                }
            };

            table.approximate_rows = match self.source.estimate_row_count(&name).await {
                Ok(n) => n,
                Err(e @ SourceError::PermissionDenied { .. }) => {
                    omit(&mut descriptor, &name, e)?;
                    continue;
                }
                Err(e) => {
                    tracing::debug!(table = %name, error = %e, "Row estimate unavailable");
                    None
                }
            };
            table.kind = table.classify();

            tracing::debug!(
                table = %table.name,
                columns = table.columns.len(),
                foreign_keys = table.foreign_keys.len(),
                approximate_rows = ?table.approximate_rows,
                kind = ?table.kind,
                "Table analyzed"
            );
            descriptor.tables.push(table);
        }

        tracing::info!(
            tables = descriptor.tables.len(),
            omitted = descriptor.omitted.len(),
            system = descriptor
                .tables
                .iter()
                .filter(|t| t.kind == TableKind::System)
                .count(),
            "Schema analysis complete"
        );
        Ok(descriptor)
    }
}

/// Record a per-table failure, or escalate it when it is not table-local.
fn omit(descriptor: &mut SchemaDescriptor, table: &str, err: SourceError) -> Result<()> {
    let reason = match err {
        SourceError::PermissionDenied { detail, .. } => format!("permission denied: {detail}"),
        SourceError::TableNotFound(_) => "table disappeared during analysis".to_string(),
        SourceError::Connection(msg) => {
            return Err(MigrateError::Connection(format!("source: {msg}")))
        }
        other => return Err(other.into()),
    };
    tracing::warn!(table, reason = %reason, "Table omitted from descriptor");
    descriptor.omitted.push(OmittedTable {
        name: table.to_string(),
        reason,
    });
    Ok(())
}
