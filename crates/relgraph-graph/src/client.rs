//! Neo4j connection pool and error classification for graph writes.

use neo4rs::{ConfigBuilder, Graph, Query};
use serde::Deserialize;

/// Errors from graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("Invalid graph identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Unexpected result shape: {0}")]
    Decode(String),

    #[error("Graph transaction failed: {0}")]
    Transaction(String),
}

/// Outcome of a failed write, split by blast radius.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The row itself is bad (missing endpoint, constraint violation, bad
    /// value). Only that row is lost.
    #[error("{0}")]
    Row(String),

    /// The transaction or connection failed. The whole batch is lost.
    #[error(transparent)]
    Infrastructure(#[from] GraphError),
}

impl WriteError {
    /// Classify a driver error: server-side client errors (constraint
    /// violations, type errors) are row-level, everything else is not.
    pub fn classify(err: neo4rs::Error) -> Self {
        let text = err.to_string();
        if text.contains("Neo.ClientError") {
            Self::Row(text)
        } else {
            Self::Infrastructure(GraphError::Query(err))
        }
    }

    pub fn is_row(&self) -> bool {
        matches!(self, Self::Row(_))
    }
}

/// `[neo4j]` settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
}

fn default_uri() -> String {
    "bolt://localhost:7687".to_string()
}

fn default_user() -> String {
    "neo4j".to_string()
}

fn default_password() -> String {
    "relgraph-dev".to_string()
}

fn default_max_connections() -> u32 {
    16
}

fn default_fetch_size() -> usize {
    500
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            user: default_user(),
            password: default_password(),
            max_connections: default_max_connections(),
            fetch_size: default_fetch_size(),
        }
    }
}

/// Pooled Neo4j connection shared by every rule task. Cheap to clone.
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    /// Open the connection pool.
    pub async fn connect(config: &GraphConfig) -> Result<Self, GraphError> {
        let neo_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .max_connections(config.max_connections as usize)
            .fetch_size(config.fetch_size)
            .build()
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo_config)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        tracing::info!(uri = %config.uri, "Connected to Neo4j");
        Ok(Self { graph })
    }

    /// Execute a write-only query outside any explicit transaction.
    pub async fn run(&self, query: Query) -> Result<(), GraphError> {
        self.graph.run(query).await?;
        Ok(())
    }

    /// Collect every row of a read query.
    pub async fn query_rows(&self, query: Query) -> Result<Vec<neo4rs::Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// First row of a read query, if any.
    pub async fn query_one(&self, query: Query) -> Result<Option<neo4rs::Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        Ok(stream.next().await?)
    }

    /// Open an explicit transaction; batch writes go through one.
    pub async fn start_txn(&self) -> Result<neo4rs::Txn, GraphError> {
        self.graph
            .start_txn()
            .await
            .map_err(|e| GraphError::Transaction(e.to_string()))
    }
}

/// Backtick-quote a label, type or property name.
///
/// Identifiers are validated at plan time; this rejects anything that slipped
/// through rather than escaping it.
pub(crate) fn ident(name: &str) -> Result<String, GraphError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(format!("`{name}`"))
    } else {
        Err(GraphError::InvalidIdentifier(name.to_string()))
    }
}
