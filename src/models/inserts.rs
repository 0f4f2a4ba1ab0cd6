use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::catalog::ColumnsSchema;
use super::value::{FieldValue, RawRecord};

/// A group of records a loader returned for one logical table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertBatch {
    pub primary_keys: Vec<String>,
    pub records: Vec<RawRecord>,
}

impl InsertBatch {
    pub fn new(primary_keys: Vec<String>, records: Vec<RawRecord>) -> Self {
        Self {
            primary_keys,
            records,
        }
    }

    /// Build a batch from JSON objects; non-object values are skipped
    pub fn from_json(primary_keys: &[&str], records: Vec<JsonValue>) -> Self {
        Self {
            primary_keys: primary_keys.iter().map(|pk| pk.to_string()).collect(),
            records: records
                .into_iter()
                .filter_map(FieldValue::record_from_json)
                .collect(),
        }
    }
}

/// Record groups keyed by logical table name
pub type Inserts = BTreeMap<String, InsertBatch>;

/// A cleaned, rectangular batch with its inferred column schema
#[derive(Debug, Clone, PartialEq)]
pub struct CleanBatch {
    pub schema_name: String,
    pub records: Vec<RawRecord>,
    pub column_schema: ColumnsSchema,
}

/// Cleaned batches keyed by table name
pub type LoaderInserts = BTreeMap<String, CleanBatch>;
