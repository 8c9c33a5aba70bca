use thiserror::Error;

/// Errors from the relational source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source connection error: {0}")]
    Connection(String),

    #[error("Permission denied on {object}: {detail}")]
    PermissionDenied { object: String, detail: String },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Source query rejected: {0}")]
    InvalidQuery(String),

    #[error("Source query error: {0}")]
    Query(String),
}

impl SourceError {
    /// Classify a driver error raised while touching `object`.
    pub fn from_sqlite(object: &str, err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied => {
                    Self::PermissionDenied {
                        object: object.to_string(),
                        detail: err.to_string(),
                    }
                }
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure => Self::Connection(err.to_string()),
                _ => Self::Query(format!("{object}: {err}")),
            },
            _ => Self::Query(format!("{object}: {err}")),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;
