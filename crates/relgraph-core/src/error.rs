use thiserror::Error;

/// Top-level error type for shared relgraph plumbing.
#[derive(Error, Debug)]
pub enum RelgraphError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Mapping file error: {0}")]
    MappingFile(#[from] serde_yaml::Error),

    #[error("Malformed descriptor artifact at line {line}: {detail}")]
    Descriptor { line: usize, detail: String },
}
