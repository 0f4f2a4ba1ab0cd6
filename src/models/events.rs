use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;

use super::catalog::{ColumnsSchema, TableKey};
use super::inserts::LoaderInserts;

/// Full contents of a SQL-derived table, replacing whatever was there
#[derive(Debug, Clone)]
pub struct DerivedTable {
    pub key: TableKey,
    pub column_schema: ColumnsSchema,
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

/// Work for the batch writer
#[derive(Debug, Clone)]
pub enum WriteEvent {
    Records(LoaderInserts),
    SqlTable(DerivedTable),
}

/// A table's catalog entry now points at newer data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableUpdatedEvent {
    pub key: TableKey,
}

/// Input to a job's `execute`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Run { force: bool },
    TableUpdated(TableKey),
}
