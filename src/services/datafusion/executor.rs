// DataFusion QueryExecutor
//
// Plans and runs SQL against the shared session with a timeout.

use datafusion::prelude::*;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use std::time::{Duration, Instant};
use anyhow::{Result, Context, anyhow};
use tokio::time::timeout;

/// Query execution result containing record batches
pub struct QueryExecutionResult {
    /// Schema of the result set, known even when no rows come back
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub row_count: usize,
    pub execution_time_ms: u128,
}

impl QueryExecutionResult {
    pub fn from_batches(schema: SchemaRef, batches: Vec<RecordBatch>, execution_time_ms: u128) -> Self {
        let row_count = batches.iter().map(|batch| batch.num_rows()).sum();

        Self {
            schema,
            batches,
            row_count,
            execution_time_ms,
        }
    }
}

/// Executes DataFusion queries with timeout and error handling
#[derive(Clone)]
pub struct DataFusionQueryExecutor {
    ctx: SessionContext,
    default_timeout: Duration,
}

impl DataFusionQueryExecutor {
    pub fn new(ctx: SessionContext, default_timeout: Duration) -> Self {
        Self {
            ctx,
            default_timeout,
        }
    }

    /// Execute a SQL query with the default timeout
    pub async fn execute_query(&self, sql: &str) -> Result<QueryExecutionResult> {
        self.execute_query_with_timeout(sql, self.default_timeout).await
    }

    /// Execute a SQL query, failing once `timeout_duration` elapses
    pub async fn execute_query_with_timeout(
        &self,
        sql: &str,
        timeout_duration: Duration,
    ) -> Result<QueryExecutionResult> {
        let start_time = Instant::now();

        let (schema, batches) = timeout(timeout_duration, async {
            let df = self.ctx.sql(sql).await.context("Failed to plan SQL query")?;
            let schema = df.schema().inner().clone();
            let batches = df.collect().await.context("Failed to execute query plan")?;
            Ok::<_, anyhow::Error>((schema, batches))
        })
        .await
        .map_err(|_| anyhow!("Query execution timeout after {:?}", timeout_duration))??;

        Ok(QueryExecutionResult::from_batches(
            schema,
            batches,
            start_time.elapsed().as_millis(),
        ))
    }

}
