use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::{ColumnSchema, ColumnsSchema, DerivedTable, JobEvent, TableKey, WriteEvent};
use crate::services::broker::MessageBroker;
use crate::services::datafusion::column_type_for;
use crate::services::job::{Job, JobKind, JobSettings};
use crate::services::lock::InMemoryLock;
use crate::services::query_engine::QueryEngine;
use crate::services::writer::parquet::{UPDATED_AT_COLUMN, WRITE_SEQ_COLUMN};
use crate::validation::SqlValidator;

/// A table defined by a query over other tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTransform {
    pub schema_name: String,
    pub table_name: String,
    pub query: String,
    pub primary_keys: Vec<String>,
}

impl SqlTransform {
    pub fn new(
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        query: impl Into<String>,
        primary_keys: &[&str],
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            query: query.into(),
            primary_keys: primary_keys.iter().map(|pk| pk.to_string()).collect(),
        }
    }

    pub fn key(&self) -> TableKey {
        TableKey::new(self.schema_name.clone(), self.table_name.clone())
    }
}

/// Re-materializes a [`SqlTransform`] when triggered
///
/// Triggers are a forced run or an update of a table it subscribes to. With
/// no explicit subscriptions every table except its own output triggers it.
pub struct TransformerExecutor {
    transform: SqlTransform,
    settings: JobSettings,
    query_engine: Arc<QueryEngine>,
    broker: MessageBroker,
    lock: InMemoryLock,
}

impl TransformerExecutor {
    pub fn new(
        mut transform: SqlTransform,
        settings: JobSettings,
        query_engine: Arc<QueryEngine>,
        broker: MessageBroker,
    ) -> Result<Self> {
        transform.query = SqlValidator::validate_single_query(&transform.query)?;
        if transform.primary_keys.is_empty() {
            return Err(EngineError::MissingPrimaryKey {
                schema_name: transform.schema_name,
                table_name: transform.table_name,
            });
        }
        Ok(Self {
            transform,
            settings,
            query_engine,
            broker,
            lock: InMemoryLock::new(),
        })
    }

    pub fn output_key(&self) -> TableKey {
        self.transform.key()
    }

    pub fn is_triggered_by(&self, key: &TableKey) -> bool {
        if *key == self.output_key() {
            return false;
        }
        self.settings.subscriptions.is_empty() || self.settings.subscriptions.contains(key)
    }

    /// Run the query and shape the result as a derived table
    pub async fn build(&self) -> Result<DerivedTable> {
        let key = self.output_key();
        let result = self.query_engine.query_batches(&self.transform.query).await?;

        let mut column_schema = ColumnsSchema::new();
        for field in result.schema.fields() {
            let name = field.name();
            if name == UPDATED_AT_COLUMN || name == WRITE_SEQ_COLUMN {
                continue;
            }
            let is_primary_key = self.transform.primary_keys.iter().any(|pk| pk == name);
            column_schema.insert(
                name.clone(),
                ColumnSchema::new(column_type_for(field.data_type()), is_primary_key),
            );
        }

        for pk in &self.transform.primary_keys {
            if !column_schema.contains_key(pk) {
                return Err(EngineError::Schema(format!(
                    "Primary key {} is not a column of the query for {}",
                    pk, key
                )));
            }
        }

        debug!("Transformer {} produced {} rows", self.settings.unique_id, result.row_count);
        Ok(DerivedTable {
            key,
            column_schema,
            schema: result.schema,
            batches: result.batches,
        })
    }

    /// Build the table and hand it to the writer
    pub async fn run(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let derived = self.build().await?;
        info!(
            "Transformer {} publishing {} ({} columns)",
            self.settings.unique_id,
            derived.key,
            derived.column_schema.len()
        );
        self.broker.publish_write(WriteEvent::SqlTable(derived)).await?;
        Ok(())
    }
}

#[async_trait]
impl Job for TransformerExecutor {
    fn settings(&self) -> &JobSettings {
        &self.settings
    }

    fn kind(&self) -> JobKind {
        JobKind::Transformer
    }

    async fn execute(&self, event: JobEvent) -> Result<()> {
        match event {
            JobEvent::Run { force: true } => self.run().await,
            // Transformers have no cadence of their own
            JobEvent::Run { force: false } => Ok(()),
            JobEvent::TableUpdated(key) if self.is_triggered_by(&key) => self.run().await,
            JobEvent::TableUpdated(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnType, PrimitiveType};
    use crate::services::datafusion::SessionConfig;
    use crate::storage::{LocalBackend, SqliteCatalog};
    use std::time::Duration;
    use tempfile::tempdir;

    async fn query_engine(root: &std::path::Path) -> Arc<QueryEngine> {
        let catalog = Arc::new(SqliteCatalog::new(root.join("local.db")).await.unwrap());
        let backend = Arc::new(LocalBackend::new(root.join("data")));
        QueryEngine::new(catalog, backend, &SessionConfig::default(), Duration::from_secs(30))
    }

    fn transformer(engine: Arc<QueryEngine>, query: &str, settings: JobSettings) -> Result<TransformerExecutor> {
        TransformerExecutor::new(
            SqlTransform::new("analytics", "numbers", query, &["id"]),
            settings,
            engine,
            MessageBroker::new(16),
        )
    }

    #[tokio::test]
    async fn test_build_infers_schema_from_result() {
        let dir = tempdir().unwrap();
        let engine = query_engine(dir.path()).await;
        let executor = transformer(
            engine,
            "SELECT CAST(1 AS BIGINT) AS id, 'a' AS label, 2.5 AS score;",
            JobSettings::new("numbers"),
        )
        .unwrap();

        let derived = executor.build().await.unwrap();
        assert_eq!(derived.key, TableKey::new("analytics", "numbers"));
        assert_eq!(
            derived.column_schema["id"],
            ColumnSchema::new(ColumnType::Primitive(PrimitiveType::Bigint), true)
        );
        assert_eq!(
            derived.column_schema["label"].column_type,
            ColumnType::Primitive(PrimitiveType::Varchar)
        );
        assert_eq!(
            derived.column_schema["score"].column_type,
            ColumnType::Primitive(PrimitiveType::Double)
        );
    }

    #[tokio::test]
    async fn test_missing_primary_key_column() {
        let dir = tempdir().unwrap();
        let engine = query_engine(dir.path()).await;
        let executor = transformer(engine, "SELECT 1 AS other", JobSettings::new("numbers")).unwrap();

        let err = executor.build().await.unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));
    }

    #[tokio::test]
    async fn test_rejects_invalid_definitions() {
        let dir = tempdir().unwrap();
        let engine = query_engine(dir.path()).await;

        let err = transformer(engine.clone(), "DELETE FROM crm.users", JobSettings::new("numbers"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::InvalidSql(_)));

        let err = TransformerExecutor::new(
            SqlTransform::new("analytics", "numbers", "SELECT 1 AS id", &[]),
            JobSettings::new("numbers"),
            engine,
            MessageBroker::new(16),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::MissingPrimaryKey { .. }));
    }

    #[tokio::test]
    async fn test_trigger_rules() {
        let dir = tempdir().unwrap();
        let engine = query_engine(dir.path()).await;

        let coarse = transformer(engine.clone(), "SELECT 1 AS id", JobSettings::new("numbers")).unwrap();
        assert!(coarse.is_triggered_by(&TableKey::new("crm", "users")));
        assert!(!coarse.is_triggered_by(&TableKey::new("analytics", "numbers")));

        let explicit = transformer(
            engine,
            "SELECT 1 AS id",
            JobSettings::new("numbers").subscribe(TableKey::new("crm", "users")),
        )
        .unwrap();
        assert!(explicit.is_triggered_by(&TableKey::new("crm", "users")));
        assert!(!explicit.is_triggered_by(&TableKey::new("crm", "orders")));
    }

    #[tokio::test]
    async fn test_run_publishes_derived_table() {
        let dir = tempdir().unwrap();
        let engine = query_engine(dir.path()).await;
        let broker = MessageBroker::new(16);
        let mut writes = broker.take_write_queue().unwrap();
        let executor = TransformerExecutor::new(
            SqlTransform::new("analytics", "numbers", "SELECT 1 AS id", &["id"]),
            JobSettings::new("numbers"),
            engine,
            broker,
        )
        .unwrap();

        executor
            .execute(JobEvent::TableUpdated(TableKey::new("crm", "users")))
            .await
            .unwrap();

        let event = writes.recv().await.unwrap();
        let WriteEvent::SqlTable(derived) = &event else {
            panic!("expected a derived table");
        };
        assert_eq!(derived.key, TableKey::new("analytics", "numbers"));
        assert_eq!(derived.batches.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
    }
}
