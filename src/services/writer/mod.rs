pub mod parquet;
pub mod staging;

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::models::{CatalogEntry, CleanBatch, ColumnsSchema, DerivedTable, RawRecord, TableKey, WriteEvent};
use crate::services::broker::MessageBroker;
use crate::services::coalesce::CoalescingQueue;
use crate::services::lock::InMemoryLock;
use crate::services::schema_merge::{ensure_primary_key, merge_schemas, SchemaChange};
use crate::storage::backend::{table_dir, unique_name, StagedFile};
use crate::storage::{CatalogStore, DataBackend};

use self::parquet::{conform_batch, encode_rows, table_schema, write_parquet};
use self::staging::{StagedRow, StagingTable};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Quiet period after the last write to a table before it is materialized
    pub debounce: Duration,
    /// How often pending tables are checked against their deadlines
    pub flush_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2000),
            flush_interval: Duration::from_millis(250),
        }
    }
}

/// Turns write events into committed columnar files
///
/// Loader records are upserted into a per-table staging table and materialized
/// once the table has been quiet for the debounce window. SQL-derived tables
/// bypass staging and replace their table wholesale.
pub struct BatchWriter {
    catalog: Arc<dyn CatalogStore>,
    backend: Arc<dyn DataBackend>,
    broker: MessageBroker,
    pending: Mutex<CoalescingQueue<TableKey, StagingTable>>,
    write_lock: InMemoryLock,
    write_seq: AtomicU64,
    intake_stopped: Notify,
    config: WriterConfig,
}

impl BatchWriter {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        backend: Arc<dyn DataBackend>,
        broker: MessageBroker,
        config: WriterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            backend,
            broker,
            pending: Mutex::new(CoalescingQueue::new(config.debounce)),
            write_lock: InMemoryLock::new(),
            write_seq: AtomicU64::new(0),
            intake_stopped: Notify::new(),
            config,
        })
    }

    /// Consume the write queue and start the flush ticker
    ///
    /// Returns the intake task and the ticker. The intake task ends after
    /// `stop_intake`, once every queued event has been handled.
    pub fn start(self: &Arc<Self>) -> Result<(JoinHandle<()>, JoinHandle<()>)> {
        let mut queue = self
            .broker
            .take_write_queue()
            .ok_or_else(|| EngineError::Internal("Write queue already has a consumer".to_string()))?;

        let writer = self.clone();
        let intake = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = queue.recv() => match event {
                        Some(event) => writer.handle_event(&event).await,
                        None => break,
                    },
                    _ = writer.intake_stopped.notified() => {
                        queue.close();
                        let mut drained = 0;
                        while let Some(event) = queue.recv().await {
                            writer.handle_event(&event).await;
                            drained += 1;
                        }
                        debug!("Write queue closed after draining {} events", drained);
                        break;
                    }
                }
            }
        });

        let writer = self.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(writer.config.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                writer.flush_due().await;
            }
        });

        Ok((intake, ticker))
    }

    /// Refuse new write events and let the intake task handle the queued ones
    pub fn stop_intake(&self) {
        self.intake_stopped.notify_one();
    }

    pub async fn handle_event(&self, event: &WriteEvent) {
        match event {
            WriteEvent::Records(inserts) => {
                for (table_name, batch) in inserts {
                    let key = TableKey::new(batch.schema_name.clone(), table_name.clone());
                    if let Err(e) = self.stage(&key, batch.clone()).await {
                        error!("Failed to write table {}: {}", key, e);
                    }
                }
            }
            WriteEvent::SqlTable(derived) => {
                if let Err(e) = self.write_derived(derived).await {
                    error!("Failed to write derived table {}: {}", derived.key, e);
                }
            }
        }
    }

    /// Merge one cleaned batch into the table's pending staging table
    pub async fn stage(&self, key: &TableKey, batch: CleanBatch) -> Result<()> {
        if batch.records.is_empty() {
            debug!("Skipping {}: no records", key);
            return Ok(());
        }

        let mut pending = self.pending.lock().await;

        let existing = match pending.get(key) {
            Some(staging) => Some(staging.column_schema.clone()),
            None => self
                .catalog
                .get_table(&key.schema_name, &key.table_name)
                .await?
                .map(|entry| entry.column_schema),
        };

        let (base_schema, changes) = match existing {
            None => {
                ensure_primary_key(key, &batch.column_schema)?;
                (batch.column_schema, Vec::new())
            }
            Some(existing) => {
                let merge = merge_schemas(key, &existing, &batch.column_schema)?;
                (existing, merge.changes)
            }
        };

        let mut merged = base_schema.clone();
        for change in &changes {
            let SchemaChange::AddColumn { name, column } = change;
            merged.insert(name.clone(), column.clone());
        }

        // Rejected before staging so only this batch fails
        let updated_at = Utc::now();
        check_encodable(&merged, &batch.records, updated_at)?;

        for change in &changes {
            let SchemaChange::AddColumn { name, column } = change;
            info!("Adding column {} {} to {}", name, column.column_type.sql_name(), key);
        }

        let records = batch.records;
        let seq = &self.write_seq;
        let mut inserted = 0;
        pending.upsert_with(key.clone(), Instant::now(), |previous| {
            let mut staging = previous.unwrap_or_else(|| StagingTable::create(key.clone(), base_schema));
            staging.apply(&changes);
            inserted = staging.upsert(records, updated_at, seq);
            staging
        });
        debug!("Staged {} new rows for {}", inserted, key);

        Ok(())
    }

    /// Materialize every table whose debounce window has elapsed
    pub async fn flush_due(&self) {
        let due = self.pending.lock().await.take_due(Instant::now());
        for (key, staging) in due {
            if let Err(e) = self.materialize(staging).await {
                error!("Failed to materialize {}: {}", key, e);
            }
        }
    }

    /// Materialize every pending table regardless of deadline
    pub async fn flush_all(&self) -> Result<()> {
        let pending = self.pending.lock().await.take_all();
        let mut first_error = None;
        for (key, staging) in pending {
            if let Err(e) = self.materialize(staging).await {
                error!("Failed to materialize {}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn pending_tables(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn materialize(&self, staging: StagingTable) -> Result<CatalogEntry> {
        let _guard = self.write_lock.lock().await;

        let batch = encode_rows(&staging.column_schema, staging.rows())?;
        let file_name = format!("{}.parquet", unique_name());
        let staged_path = self.backend.staging_dir().join(&file_name);

        let schema = batch.schema();
        let path = staged_path.clone();
        let rows = tokio::task::spawn_blocking(move || write_parquet(&path, schema, &[batch])).await??;

        let mut entry = self
            .backend
            .commit(StagedFile {
                key: staging.key.clone(),
                path: staged_path,
                column_schema: staging.column_schema,
                target_dir: table_dir(&staging.key),
                file_name: file_name.clone(),
            })
            .await?;

        // A concurrent flush of the same table may have committed columns this
        // staging table never saw; committed column types always win
        if let Some(current) = self
            .catalog
            .get_table(&staging.key.schema_name, &staging.key.table_name)
            .await?
        {
            entry.column_schema = keep_committed_types(current.column_schema, entry.column_schema);
        }
        self.catalog.add_table(&entry).await?;
        info!("Wrote {} rows to {} ({})", rows, staging.key, file_name);

        self.broker.publish_table_updated(staging.key);
        Ok(entry)
    }

    /// Replace a table with the full result of a query
    ///
    /// The new data goes into a fresh snapshot directory; readers switch to it
    /// when the catalog entry is updated, so a failed write leaves the previous
    /// snapshot in place.
    pub async fn write_derived(&self, derived: &DerivedTable) -> Result<CatalogEntry> {
        ensure_primary_key(&derived.key, &derived.column_schema)?;
        let _guard = self.write_lock.lock().await;

        let key = &derived.key;
        let previous = self.catalog.get_table(&key.schema_name, &key.table_name).await?;

        let total_rows: usize = derived.batches.iter().map(|b| b.num_rows()).sum();
        let updated_at = Utc::now();
        let mut next_seq = self.write_seq.fetch_add(total_rows as u64, Ordering::SeqCst);
        let mut batches = Vec::with_capacity(derived.batches.len());
        for batch in &derived.batches {
            batches.push(conform_batch(batch, &derived.column_schema, updated_at, next_seq)?);
            next_seq += batch.num_rows() as u64;
        }

        let target_dir = format!("{}/{}", table_dir(key), unique_name());
        let file_name = format!("{}.parquet", unique_name());
        let staged_path = self.backend.staging_dir().join(&file_name);

        let schema = table_schema(&derived.column_schema);
        let path = staged_path.clone();
        let rows = tokio::task::spawn_blocking(move || write_parquet(&path, schema, &batches)).await??;

        let entry = self
            .backend
            .commit(StagedFile {
                key: key.clone(),
                path: staged_path,
                column_schema: derived.column_schema.clone(),
                target_dir,
                file_name,
            })
            .await?;
        self.catalog.add_table(&entry).await?;
        info!("Replaced {} with {} rows", key, rows);
        self.broker.publish_table_updated(key.clone());

        if let Some(previous) = previous.and_then(|p| previous_snapshot(&p.location, key)) {
            if let Err(e) = self.backend.remove_dir(&previous).await {
                warn!("Failed to remove previous snapshot {} of {}: {}", previous, key, e);
            }
        }

        Ok(entry)
    }
}

/// Encode `records` against `column_schema` without keeping the result
fn check_encodable(column_schema: &ColumnsSchema, records: &[RawRecord], updated_at: chrono::DateTime<Utc>) -> Result<()> {
    let rows: Vec<StagedRow> = records
        .iter()
        .map(|values| StagedRow {
            values: values.clone(),
            updated_at,
            write_seq: 0,
        })
        .collect();
    encode_rows(column_schema, &rows).map(|_| ())
}

/// Committed columns keep their types; columns only `staged` knows are added
fn keep_committed_types(committed: ColumnsSchema, staged: ColumnsSchema) -> ColumnsSchema {
    let mut merged = committed;
    for (name, column) in staged {
        merged.entry(name).or_insert(column);
    }
    merged
}

/// Relative snapshot directory a derived table's location points at, if any
fn previous_snapshot(location: &str, key: &TableKey) -> Option<String> {
    let location = location.trim_end_matches('/');
    let (parent, snapshot) = location.rsplit_once('/')?;
    let table = table_dir(key);
    if parent.ends_with(&table) && !snapshot.is_empty() {
        Some(format!("{}/{}", table, snapshot))
    } else {
        None
    }
}
