use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

/// A run about to be appended to the run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    pub unique_id: String,
    pub status: RunStatus,
    pub message: Option<String>,
}

impl NewRun {
    pub fn success(unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            status: RunStatus::Success,
            message: None,
        }
    }

    pub fn error(unique_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            status: RunStatus::Error,
            message: Some(message.into()),
        }
    }
}

/// A run as read back from the run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub unique_id: String,
    pub status: RunStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}
