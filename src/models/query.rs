use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// Result of an ad-hoc SQL query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<JsonValue>>,
    pub row_count: usize,
}

impl QueryResult {
    /// Rows as JSON objects keyed by column name
    pub fn to_objects(&self) -> Vec<serde_json::Map<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, value)| (column.name.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub loader_id: String,
}

/// Response envelope of the query endpoint
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryResponse {
    Success {
        data: Vec<serde_json::Map<String, JsonValue>>,
        columns: Vec<ColumnInfo>,
    },
    Error {
        message: String,
    },
}

impl From<QueryResult> for QueryResponse {
    fn from(result: QueryResult) -> Self {
        QueryResponse::Success {
            data: result.to_objects(),
            columns: result.columns,
        }
    }
}
