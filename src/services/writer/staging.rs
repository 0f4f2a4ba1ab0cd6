use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{ColumnsSchema, FieldValue, RawRecord, TableKey};
use crate::services::schema_merge::SchemaChange;

/// One row version waiting to be materialized
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub values: RawRecord,
    pub updated_at: DateTime<Utc>,
    pub write_seq: u64,
}

/// In-memory table of rows accepted since the last materialization
///
/// Rows are unique by primary key; a later upsert of the same key replaces the
/// earlier row in place.
#[derive(Debug, Clone)]
pub struct StagingTable {
    pub key: TableKey,
    pub column_schema: ColumnsSchema,
    primary_keys: Vec<String>,
    rows: Vec<StagedRow>,
    index: HashMap<String, usize>,
}

impl StagingTable {
    /// Create the table; primary keys are fixed from here on
    pub fn create(key: TableKey, column_schema: ColumnsSchema) -> Self {
        let primary_keys = crate::models::primary_keys(&column_schema);
        Self {
            key,
            column_schema,
            primary_keys,
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn apply(&mut self, changes: &[SchemaChange]) {
        for change in changes {
            match change {
                SchemaChange::AddColumn { name, column } => {
                    self.column_schema.insert(name.clone(), column.clone());
                }
            }
        }
    }

    fn row_key(&self, record: &RawRecord) -> String {
        self.primary_keys
            .iter()
            .map(|pk| record.get(pk).unwrap_or(&FieldValue::Null).key_repr())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }

    /// Insert or replace rows by primary key; returns the number of new keys
    pub fn upsert(&mut self, records: Vec<RawRecord>, updated_at: DateTime<Utc>, seq: &AtomicU64) -> usize {
        let mut inserted = 0;
        for values in records {
            let row = StagedRow {
                updated_at,
                write_seq: seq.fetch_add(1, Ordering::SeqCst),
                values,
            };
            let row_key = self.row_key(&row.values);
            match self.index.get(&row_key) {
                Some(&position) => self.rows[position] = row,
                None => {
                    self.index.insert(row_key, self.rows.len());
                    self.rows.push(row);
                    inserted += 1;
                }
            }
        }
        inserted
    }

    pub fn rows(&self) -> &[StagedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
