pub mod api;
pub mod config;
pub mod error;
pub mod loaders;
pub mod models;
pub mod services;
pub mod storage;
pub mod validation;

pub use error::{EngineError, Result};
pub use models::*;
pub use services::*;
pub use validation::*;
