// DataFusion session setup
//
// One SessionContext backs the whole query engine; table views are registered
// into it as the catalog changes.

use datafusion::prelude::*;

/// Configuration for DataFusion sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Batch size for query execution
    pub batch_size: usize,
    /// Number of partitions for parallel execution
    pub target_partitions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            target_partitions: num_cpus::get(),
        }
    }
}

/// Create the SessionContext used by the query engine
///
/// The information schema is enabled so `SHOW TABLES` and
/// `information_schema.columns` work against registered views.
pub fn create_session(config: &SessionConfig) -> SessionContext {
    let session_config = ::datafusion::execution::context::SessionConfig::new()
        .with_batch_size(config.batch_size)
        .with_target_partitions(config.target_partitions)
        .with_information_schema(true);

    SessionContext::new_with_config(session_config)
}
