use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::models::{JobEvent, TableKey};

/// Cadence of a loader that does not set one
pub const DEFAULT_CADENCE: Duration = Duration::from_secs(15 * 60);

/// Plain scheduling data shared by every job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub unique_id: String,
    /// Minimum time between successful scheduled runs
    pub cadence: Duration,
    /// Pause between pages of one run
    pub rate_limit: Option<Duration>,
    /// Tables whose updates trigger the job; empty means every table
    pub subscriptions: Vec<TableKey>,
}

impl JobSettings {
    pub fn new(unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            cadence: DEFAULT_CADENCE,
            rate_limit: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Duration) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn subscribe(mut self, key: TableKey) -> Self {
        self.subscriptions.push(key);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Loader,
    Transformer,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Loader => "loader",
            JobKind::Transformer => "transformer",
        }
    }
}

/// Anything the engine schedules: loaders and transformers
#[async_trait]
pub trait Job: Send + Sync {
    fn settings(&self) -> &JobSettings;

    fn kind(&self) -> JobKind;

    fn unique_id(&self) -> &str {
        &self.settings().unique_id
    }

    /// React to one event; the dispatcher logs returned errors
    async fn execute(&self, event: JobEvent) -> Result<()>;
}
