use datafusion::arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use datafusion::parquet::errors::ParquetError;
use thiserror::Error;

/// Engine error types
///
/// Configuration errors (secrets, cursors, missing primary keys) are fatal to a
/// single execution only; callers record them as failed runs and carry on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Secrets error: {0}")]
    Secrets(String),

    #[error("Cursor error: {0}")]
    Cursor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Table {schema_name}.{table_name} has no primary key columns")]
    MissingPrimaryKey {
        schema_name: String,
        table_name: String,
    },

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("Object storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Query error: {0}")]
    Query(#[from] DataFusionError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(format!("{:#}", err))
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_primary_key_message() {
        let err = EngineError::MissingPrimaryKey {
            schema_name: "crm".to_string(),
            table_name: "users".to_string(),
        };
        assert_eq!(err.to_string(), "Table crm.users has no primary key columns");
    }
}
