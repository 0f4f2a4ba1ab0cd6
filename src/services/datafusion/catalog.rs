// DataFusion CatalogManager
//
// Registers catalog tables in the session. Every table gets two objects:
//
// ```text
// _swamp_files.<schema>__<table>   parquet listing over every file of the table
// <schema>.<table>                 view keeping the latest version of each row
// ```

use datafusion::prelude::*;
use datafusion::sql::TableReference;
use std::path::Path;
use anyhow::{Context, Result};

use crate::models::{primary_keys, CatalogEntry, ColumnsSchema};
use crate::services::writer::parquet::{table_schema, UPDATED_AT_COLUMN, WRITE_SEQ_COLUMN};
use crate::validation::sql_validator::{quote_ident, sanitize_name};

/// Schema holding the raw file listings behind each view
pub const FILES_SCHEMA: &str = "_swamp_files";

const ROW_NUMBER_COLUMN: &str = "_swamp_row";

/// Manages table registration for DataFusion
pub struct DataFusionCatalogManager {
    ctx: SessionContext,
}

impl DataFusionCatalogManager {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// Register (or re-register) a catalog entry whose files live in `local_dir`
    ///
    /// Re-registering replaces both the listing and the view, which picks up
    /// new columns and a moved location without touching other tables.
    pub async fn register_table(&self, entry: &CatalogEntry, local_dir: &Path) -> Result<()> {
        let schema_name = sanitize_name(&entry.schema_name);
        let table_name = sanitize_name(&entry.table_name);

        self.create_schema(FILES_SCHEMA).await?;
        self.create_schema(&schema_name).await?;

        let files_ref = TableReference::partial(FILES_SCHEMA, files_table_name(&schema_name, &table_name));
        self.ctx
            .deregister_table(files_ref.clone())
            .context("Failed to deregister previous file listing")?;

        let arrow_schema = table_schema(&entry.column_schema);
        let table_path = directory_url(local_dir)?;
        self.ctx
            .register_parquet(
                files_ref,
                &table_path,
                ParquetReadOptions::default().schema(arrow_schema.as_ref()),
            )
            .await
            .with_context(|| format!("Failed to register files for {}", entry.key()))?;

        let view = view_sql(&schema_name, &table_name, &entry.column_schema);
        self.ctx
            .sql(&view)
            .await
            .with_context(|| format!("Failed to create view for {}", entry.key()))?
            .collect()
            .await?;

        Ok(())
    }

    async fn create_schema(&self, schema_name: &str) -> Result<()> {
        self.ctx
            .sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema_name)))
            .await?
            .collect()
            .await?;
        Ok(())
    }
}

pub fn files_table_name(schema_name: &str, table_name: &str) -> String {
    format!("{}__{}", schema_name, table_name)
}

/// Local directories are registered as `file://` URLs ending in `/`
fn directory_url(dir: &Path) -> Result<String> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let absolute = std::fs::canonicalize(dir)?;
    let mut path = absolute.to_string_lossy().into_owned();
    if !path.ends_with('/') {
        path.push('/');
    }
    Ok(path)
}

/// Deduplicating view over a table's file listing
pub fn view_sql(schema_name: &str, table_name: &str, column_schema: &ColumnsSchema) -> String {
    let mut columns: Vec<String> = column_schema.keys().map(|c| quote_ident(c)).collect();
    columns.push(quote_ident(UPDATED_AT_COLUMN));
    let projection = columns.join(", ");

    let files = format!(
        "{}.{}",
        quote_ident(FILES_SCHEMA),
        quote_ident(&files_table_name(schema_name, table_name))
    );
    let view = format!("{}.{}", quote_ident(schema_name), quote_ident(table_name));

    let keys = primary_keys(column_schema);
    if keys.is_empty() {
        return format!("CREATE OR REPLACE VIEW {} AS SELECT {} FROM {}", view, projection, files);
    }

    let partition = keys.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", ");
    format!(
        "CREATE OR REPLACE VIEW {view} AS SELECT {projection} FROM (\
         SELECT *, ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {updated} DESC, {seq} DESC) AS {row} \
         FROM {files}) AS versions WHERE {row} = 1",
        updated = quote_ident(UPDATED_AT_COLUMN),
        seq = quote_ident(WRITE_SEQ_COLUMN),
        row = quote_ident(ROW_NUMBER_COLUMN),
    )
}
