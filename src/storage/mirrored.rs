use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::sqlite::{CatalogStore, SqliteCatalog};
use crate::error::Result;
use crate::models::{CatalogEntry, NewRun, RunRecord};
use crate::services::lock::InMemoryLock;

/// Catalog whose SQLite file is mirrored to object storage
///
/// The local file is hydrated from the bucket on first access when it does not
/// exist yet. If that download fails for any reason other than the object
/// being absent, an empty catalog is created and a warning is logged: any
/// catalog state that only existed remotely is then lost for this process.
pub struct MirroredCatalog {
    store: Arc<dyn ObjectStore>,
    key: ObjectPath,
    local_path: PathBuf,
    catalog: OnceLock<Arc<SqliteCatalog>>,
    init_lock: InMemoryLock,
    upload_tx: mpsc::UnboundedSender<()>,
    upload_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    debounce: Duration,
}

impl MirroredCatalog {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        key: impl AsRef<str>,
        local_path: impl Into<PathBuf>,
        debounce: Duration,
    ) -> Arc<Self> {
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            key: ObjectPath::from(key.as_ref()),
            local_path: local_path.into(),
            catalog: OnceLock::new(),
            init_lock: InMemoryLock::new(),
            upload_tx,
            upload_rx: std::sync::Mutex::new(Some(upload_rx)),
            debounce,
        })
    }

    /// The local catalog, hydrating it on first use
    async fn catalog(self: &Arc<Self>) -> Result<Arc<SqliteCatalog>> {
        if let Some(catalog) = self.catalog.get() {
            return Ok(catalog.clone());
        }

        let _guard = self.init_lock.lock().await;
        if let Some(catalog) = self.catalog.get() {
            return Ok(catalog.clone());
        }

        if !tokio::fs::try_exists(&self.local_path).await? {
            self.hydrate().await?;
        }
        let catalog = Arc::new(SqliteCatalog::new(&self.local_path).await?);
        let catalog = self.catalog.get_or_init(|| catalog).clone();
        self.spawn_uploader();
        Ok(catalog)
    }

    async fn hydrate(&self) -> Result<()> {
        match self.store.get(&self.key).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                if let Some(parent) = self.local_path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                tokio::fs::write(&self.local_path, &bytes).await?;
                info!("Hydrated catalog from {} ({} bytes)", self.key, bytes.len());
            }
            Err(object_store::Error::NotFound { .. }) => {
                info!("No remote catalog at {}, starting empty", self.key);
            }
            Err(e) => {
                warn!(
                    "Failed to download catalog from {}, starting with an empty catalog: {}",
                    self.key, e
                );
            }
        }
        Ok(())
    }

    fn spawn_uploader(self: &Arc<Self>) {
        let rx = match self.upload_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut rx) = rx else {
            return;
        };

        let mirror = Arc::downgrade(self);
        let debounce = self.debounce;
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Wait for the burst of mutations to go quiet
                let mut closed = false;
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => {
                            closed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }

                let Some(mirror) = mirror.upgrade() else {
                    return;
                };
                if let Err(e) = mirror.upload().await {
                    error!("Failed to upload catalog to {}: {}", mirror.key, e);
                }
                if closed {
                    return;
                }
            }
        });
    }

    /// Upload the current catalog file immediately
    pub async fn upload(&self) -> Result<()> {
        let Some(catalog) = self.catalog.get() else {
            return Ok(());
        };
        let bytes = catalog.snapshot().await?;
        let size = bytes.len();
        self.store.put(&self.key, PutPayload::from(bytes)).await?;
        debug!("Uploaded catalog to {} ({} bytes)", self.key, size);
        Ok(())
    }

    fn schedule_upload(&self) {
        let _ = self.upload_tx.send(());
    }
}

/// Shared handle implementing [`CatalogStore`]
#[derive(Clone)]
pub struct MirroredCatalogHandle(pub Arc<MirroredCatalog>);

#[async_trait]
impl CatalogStore for MirroredCatalogHandle {
    async fn add_table(&self, entry: &CatalogEntry) -> Result<()> {
        self.0.catalog().await?.add_table(entry).await?;
        self.0.schedule_upload();
        Ok(())
    }

    async fn get_table(&self, schema_name: &str, table_name: &str) -> Result<Option<CatalogEntry>> {
        self.0.catalog().await?.get_table(schema_name, table_name).await
    }

    async fn get_tables(&self, schema_name: Option<&str>) -> Result<Vec<CatalogEntry>> {
        self.0.catalog().await?.get_tables(schema_name).await
    }

    async fn add_cursor(&self, unique_id: &str, cursor: &JsonValue) -> Result<()> {
        self.0.catalog().await?.add_cursor(unique_id, cursor).await?;
        self.0.schedule_upload();
        Ok(())
    }

    async fn get_cursor(&self, unique_id: &str) -> Result<Option<JsonValue>> {
        self.0.catalog().await?.get_cursor(unique_id).await
    }

    async fn add_run(&self, run: &NewRun) -> Result<()> {
        self.0.catalog().await?.add_run(run).await?;
        self.0.schedule_upload();
        Ok(())
    }

    async fn get_latest_run(&self, unique_id: &str) -> Result<Option<RunRecord>> {
        self.0.catalog().await?.get_latest_run(unique_id).await
    }
}
