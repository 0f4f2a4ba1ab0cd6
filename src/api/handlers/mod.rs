pub mod load;
pub mod query;

use std::sync::Arc;

use crate::services::Engine;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub api_token: Option<String>,
}
