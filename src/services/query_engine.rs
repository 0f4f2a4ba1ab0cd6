use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{EngineError, Result};
use crate::models::{CatalogEntry, QueryResult, TableKey};
use crate::services::broker::{spawn_subscriber, MessageBroker};
use crate::services::datafusion::{
    create_session, DataFusionCatalogManager, DataFusionQueryExecutor, DataFusionResultConverter,
    QueryExecutionResult, SessionConfig,
};
use crate::storage::{CatalogStore, DataBackend};

/// Read side of the engine
///
/// Every catalog entry is exposed as a `<schema>.<table>` view over its files.
/// Views are re-registered one table at a time as updates are published.
pub struct QueryEngine {
    catalog: Arc<dyn CatalogStore>,
    backend: Arc<dyn DataBackend>,
    registrar: DataFusionCatalogManager,
    executor: DataFusionQueryExecutor,
    // Registration of a table is deregister + register + view; not reentrant
    registration: Mutex<()>,
}

impl QueryEngine {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        backend: Arc<dyn DataBackend>,
        session_config: &SessionConfig,
        query_timeout: Duration,
    ) -> Arc<Self> {
        let ctx = create_session(session_config);
        Arc::new(Self {
            catalog,
            backend,
            registrar: DataFusionCatalogManager::new(ctx.clone()),
            executor: DataFusionQueryExecutor::new(ctx, query_timeout),
            registration: Mutex::new(()),
        })
    }

    /// Register every table in the catalog; returns how many succeeded
    ///
    /// A table that fails to register is logged and left out.
    pub async fn initialize(&self) -> Result<usize> {
        let tables = self.catalog.get_tables(None).await?;
        let mut registered = 0;
        for entry in &tables {
            match self.register(entry).await {
                Ok(()) => registered += 1,
                Err(e) => error!("Failed to register table {}: {}", entry.key(), e),
            }
        }
        info!("Query engine initialized with {}/{} tables", registered, tables.len());
        Ok(registered)
    }

    /// Re-register tables as the writer publishes them
    ///
    /// `on_registered` runs after each registration attempt, so anything it
    /// triggers queries the refreshed view.
    pub fn start<F>(self: &Arc<Self>, broker: &MessageBroker, on_registered: F) -> JoinHandle<()>
    where
        F: Fn(TableKey) + Send + Sync + 'static,
    {
        let engine = self.clone();
        let on_registered = Arc::new(on_registered);
        spawn_subscriber("query engine", broker.subscribe_table_updates(), move |event| {
            let engine = engine.clone();
            let on_registered = on_registered.clone();
            async move {
                if let Err(e) = engine.refresh_table(&event.key).await {
                    error!("Failed to register table {}: {}", event.key, e);
                }
                on_registered(event.key);
            }
        })
    }

    /// Register the current catalog entry of one table
    pub async fn refresh_table(&self, key: &TableKey) -> Result<()> {
        let entry = self
            .catalog
            .get_table(&key.schema_name, &key.table_name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("table {}", key)))?;
        self.register(&entry).await
    }

    async fn register(&self, entry: &CatalogEntry) -> Result<()> {
        let local_dir = self.backend.local_dir(entry).await?;
        let _guard = self.registration.lock().await;
        self.registrar.register_table(entry, &local_dir).await?;
        debug!("Registered {} from {}", entry.key(), entry.location);
        Ok(())
    }

    /// Run a query and keep the Arrow result
    pub async fn query_batches(&self, sql: &str) -> Result<QueryExecutionResult> {
        self.executor.execute_query(sql).await.map_err(query_error)
    }

    /// Run a query and convert the result to JSON rows
    pub async fn query_sql(&self, sql: &str) -> Result<QueryResult> {
        let result = self.query_batches(sql).await?;
        debug!("Query returned {} rows in {}ms", result.row_count, result.execution_time_ms);
        DataFusionResultConverter::convert_to_query_result(result.schema, result.batches)
            .map_err(query_error)
    }
}

fn query_error(err: anyhow::Error) -> EngineError {
    match err.downcast::<datafusion::error::DataFusionError>() {
        Ok(e) => EngineError::Query(e),
        Err(other) => EngineError::Internal(format!("{:#}", other)),
    }
}
