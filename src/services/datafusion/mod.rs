// DataFusion query layer
//
// Session setup, registration of catalog tables as deduplicating views,
// query execution and conversion of Arrow results to JSON.

pub mod session;
pub mod catalog;
pub mod executor;
pub mod converter;

pub use session::{create_session, SessionConfig};
pub use catalog::DataFusionCatalogManager;
pub use executor::{DataFusionQueryExecutor, QueryExecutionResult};
pub use converter::{column_type_for, DataFusionResultConverter};
