use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{
    CatalogEntry, ColumnsSchema, FileDataType, FileLocation, NewRun, RunRecord, RunStatus,
};

const CATALOG_TABLE_NAME: &str = "catalog_table";
const CURSOR_TABLE_NAME: &str = "loader_cursor";
const RUN_TABLE_NAME: &str = "loader_run";

/// Durable registry of tables, loader cursors and run history
///
/// The catalog is the single source of truth for where a table's current data
/// lives; everything else holds at most a cached copy.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Upsert, unique on (schema, table)
    async fn add_table(&self, entry: &CatalogEntry) -> Result<()>;

    async fn get_table(&self, schema_name: &str, table_name: &str) -> Result<Option<CatalogEntry>>;

    /// All tables, or only those of one schema
    async fn get_tables(&self, schema_name: Option<&str>) -> Result<Vec<CatalogEntry>>;

    async fn add_cursor(&self, unique_id: &str, cursor: &JsonValue) -> Result<()>;

    async fn get_cursor(&self, unique_id: &str) -> Result<Option<JsonValue>>;

    /// Append to the run log
    async fn add_run(&self, run: &NewRun) -> Result<()>;

    /// Most recent run by creation time
    async fn get_latest_run(&self, unique_id: &str) -> Result<Option<RunRecord>>;
}

/// SQLite catalog store
/// Uses tokio::Mutex for async-friendly locking of the single connection
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteCatalog {
    /// Open (or create) a catalog database file
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            &format!(
                r#"
                CREATE TABLE IF NOT EXISTS {CATALOG_TABLE_NAME} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    schema_name TEXT NOT NULL,
                    data_type TEXT NOT NULL,
                    location TEXT NOT NULL,
                    column_schema TEXT NOT NULL,
                    file_location TEXT NOT NULL CHECK(file_location IN ('local', 's3')),
                    UNIQUE (schema_name, table_name)
                )
                "#
            ),
            [],
        )?;

        conn.execute(
            &format!(
                r#"
                CREATE TABLE IF NOT EXISTS {CURSOR_TABLE_NAME} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT NOT NULL,
                    unique_id TEXT NOT NULL UNIQUE,
                    cursor TEXT NOT NULL
                )
                "#
            ),
            [],
        )?;

        conn.execute(
            &format!(
                r#"
                CREATE TABLE IF NOT EXISTS {RUN_TABLE_NAME} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT NOT NULL,
                    unique_id TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN ('success', 'error')),
                    message TEXT
                )
                "#
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_loader_run_unique_id ON {RUN_TABLE_NAME}(unique_id, created_at DESC)"
            ),
            [],
        )?;

        Ok(())
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of the database file, read while no statement is running
    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        let _db_conn = self.conn.lock().await;
        Ok(tokio::fs::read(&self.path).await?)
    }

    /// Append a run with an explicit creation time
    pub async fn insert_run(&self, run: &NewRun, created_at: DateTime<Utc>) -> Result<()> {
        let db_conn = self.conn.lock().await;
        db_conn.execute(
            &format!(
                "INSERT INTO {RUN_TABLE_NAME} (created_at, unique_id, status, message) VALUES (?1, ?2, ?3, ?4)"
            ),
            rusqlite::params![
                format_timestamp(created_at),
                run.unique_id,
                run.status.as_str(),
                run.message,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn add_table(&self, entry: &CatalogEntry) -> Result<()> {
        let column_schema = serde_json::to_string(&entry.column_schema)?;
        let db_conn = self.conn.lock().await;
        db_conn.execute(
            &format!(
                r#"
                INSERT INTO {CATALOG_TABLE_NAME}
                (created_at, table_name, schema_name, data_type, location, column_schema, file_location)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (schema_name, table_name) DO UPDATE SET
                    data_type = excluded.data_type,
                    location = excluded.location,
                    column_schema = excluded.column_schema,
                    file_location = excluded.file_location
                "#
            ),
            rusqlite::params![
                format_timestamp(Utc::now()),
                entry.table_name,
                entry.schema_name,
                entry.data_type.as_str(),
                entry.location,
                column_schema,
                entry.file_location.as_str(),
            ],
        )?;
        Ok(())
    }

    async fn get_table(&self, schema_name: &str, table_name: &str) -> Result<Option<CatalogEntry>> {
        let db_conn = self.conn.lock().await;
        let mut stmt = db_conn.prepare(&format!(
            "SELECT schema_name, table_name, location, data_type, file_location, column_schema FROM {CATALOG_TABLE_NAME} WHERE schema_name = ?1 AND table_name = ?2"
        ))?;

        let entry = stmt
            .query_row(rusqlite::params![schema_name, table_name], row_to_entry)
            .optional()?;
        Ok(entry)
    }

    async fn get_tables(&self, schema_name: Option<&str>) -> Result<Vec<CatalogEntry>> {
        let db_conn = self.conn.lock().await;
        let mut entries = Vec::new();

        match schema_name {
            Some(schema_name) => {
                let mut stmt = db_conn.prepare(&format!(
                    "SELECT schema_name, table_name, location, data_type, file_location, column_schema FROM {CATALOG_TABLE_NAME} WHERE schema_name = ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map(rusqlite::params![schema_name], row_to_entry)?;
                for row in rows {
                    entries.push(row?);
                }
            }
            None => {
                let mut stmt = db_conn.prepare(&format!(
                    "SELECT schema_name, table_name, location, data_type, file_location, column_schema FROM {CATALOG_TABLE_NAME} ORDER BY id"
                ))?;
                let rows = stmt.query_map([], row_to_entry)?;
                for row in rows {
                    entries.push(row?);
                }
            }
        }

        Ok(entries)
    }

    async fn add_cursor(&self, unique_id: &str, cursor: &JsonValue) -> Result<()> {
        let cursor = serde_json::to_string(cursor)?;
        let db_conn = self.conn.lock().await;
        db_conn.execute(
            &format!(
                r#"
                INSERT INTO {CURSOR_TABLE_NAME} (created_at, unique_id, cursor)
                VALUES (?1, ?2, ?3)
                ON CONFLICT (unique_id) DO UPDATE SET
                    created_at = excluded.created_at,
                    cursor = excluded.cursor
                "#
            ),
            rusqlite::params![format_timestamp(Utc::now()), unique_id, cursor],
        )?;
        Ok(())
    }

    async fn get_cursor(&self, unique_id: &str) -> Result<Option<JsonValue>> {
        let db_conn = self.conn.lock().await;
        let raw: Option<String> = db_conn
            .query_row(
                &format!("SELECT cursor FROM {CURSOR_TABLE_NAME} WHERE unique_id = ?1"),
                rusqlite::params![unique_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn add_run(&self, run: &NewRun) -> Result<()> {
        self.insert_run(run, Utc::now()).await
    }

    async fn get_latest_run(&self, unique_id: &str) -> Result<Option<RunRecord>> {
        let db_conn = self.conn.lock().await;
        let mut stmt = db_conn.prepare(&format!(
            "SELECT unique_id, status, message, created_at FROM {RUN_TABLE_NAME} WHERE unique_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1"
        ))?;

        let run = stmt
            .query_row(rusqlite::params![unique_id], |row| {
                let status: String = row.get(1)?;
                Ok(RunRecord {
                    unique_id: row.get(0)?,
                    status: RunStatus::from_str(&status)
                        .ok_or_else(|| conversion_error(1, format!("unknown run status {status}")))?,
                    message: row.get(2)?,
                    created_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
                })
            })
            .optional()?;
        Ok(run)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let data_type: String = row.get(3)?;
    let file_location: String = row.get(4)?;
    let column_schema: String = row.get(5)?;
    let column_schema: ColumnsSchema = serde_json::from_str(&column_schema)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(CatalogEntry {
        schema_name: row.get(0)?,
        table_name: row.get(1)?,
        location: row.get(2)?,
        data_type: FileDataType::from_str(&data_type)
            .ok_or_else(|| conversion_error(3, format!("unknown data type {data_type}")))?,
        file_location: FileLocation::from_str(&file_location)
            .ok_or_else(|| conversion_error(4, format!("unknown file location {file_location}")))?,
        column_schema,
    })
}

// Fixed-width UTC text so lexical order matches time order
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}
