pub mod broker;
pub mod coalesce;
pub mod datafusion; // Query engine internals: session, views, result conversion
pub mod engine;
pub mod inference;
pub mod job;
pub mod loader;
pub mod lock;
pub mod query_engine;
pub mod schema_merge;
pub mod secrets;
pub mod transformer;
pub mod writer; // Batch writer with debounced per-table commits

pub use broker::*;
pub use engine::*;
pub use job::*;
pub use loader::*;
pub use lock::*;
pub use query_engine::*;
pub use secrets::*;
pub use transformer::*;
pub use writer::{BatchWriter, WriterConfig};
