use object_store::ObjectStore;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::models::{JobEvent, QueryResult};
use crate::services::broker::MessageBroker;
use crate::services::datafusion::SessionConfig;
use crate::services::job::{Job, JobKind, JobSettings};
use crate::services::loader::{Loader, LoaderExecutor};
use crate::services::query_engine::QueryEngine;
use crate::services::secrets::SecretStore;
use crate::services::transformer::{SqlTransform, TransformerExecutor};
use crate::services::writer::{BatchWriter, WriterConfig};
use crate::storage::{
    CatalogStore, DataBackend, LocalBackend, MirroredCatalog, MirroredCatalogHandle,
    ObjectStoreBackend, SqliteCatalog,
};

/// Where table files and the catalog live
pub enum StorageConfig {
    /// Files under `data_root`, catalog in a local SQLite file
    Local {
        data_root: PathBuf,
        catalog_path: PathBuf,
    },
    /// Files in a bucket, catalog mirrored to `catalog_key` in the same bucket
    ObjectStore {
        store: Arc<dyn ObjectStore>,
        bucket: String,
        cache_root: PathBuf,
        catalog_path: PathBuf,
        catalog_key: String,
        catalog_upload_debounce: Duration,
    },
}

/// Shared services handed to job constructors
pub struct EngineContext {
    pub catalog: Arc<dyn CatalogStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub broker: MessageBroker,
    pub query_engine: Arc<QueryEngine>,
}

type LoaderFactory = Box<dyn FnOnce(&EngineContext) -> Arc<dyn Job> + Send>;

/// A job to register at startup
pub enum JobDefinition {
    Loader(LoaderFactory),
    Transformer {
        transform: SqlTransform,
        settings: JobSettings,
    },
}

impl JobDefinition {
    pub fn loader<L: Loader>(loader: L, settings: JobSettings) -> Self {
        JobDefinition::Loader(Box::new(move |ctx: &EngineContext| {
            Arc::new(LoaderExecutor::new(
                loader,
                settings,
                ctx.catalog.clone(),
                ctx.secrets.clone(),
                ctx.broker.clone(),
            )) as Arc<dyn Job>
        }))
    }

    pub fn transformer(transform: SqlTransform, settings: JobSettings) -> Self {
        JobDefinition::Transformer { transform, settings }
    }

    fn build(self, ctx: &EngineContext) -> Result<Arc<dyn Job>> {
        match self {
            JobDefinition::Loader(factory) => Ok(factory(ctx)),
            JobDefinition::Transformer { transform, settings } => Ok(Arc::new(TransformerExecutor::new(
                transform,
                settings,
                ctx.query_engine.clone(),
                ctx.broker.clone(),
            )?)),
        }
    }
}

/// Everything [`Engine::start`] needs
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub secrets: Arc<dyn SecretStore>,
    pub jobs: Vec<JobDefinition>,
    pub writer: WriterConfig,
    pub session: SessionConfig,
    pub query_timeout: Duration,
    /// How often loaders check their cadence
    pub tick_interval: Duration,
    pub broker_capacity: usize,
}

impl EngineConfig {
    pub fn new(storage: StorageConfig, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            storage,
            secrets,
            jobs: Vec::new(),
            writer: WriterConfig::default(),
            session: SessionConfig::default(),
            query_timeout: Duration::from_secs(300),
            tick_interval: Duration::from_secs(1),
            broker_capacity: 1024,
        }
    }
}

/// A running engine: catalog, writer, query engine and scheduled jobs
pub struct Engine {
    catalog: Arc<dyn CatalogStore>,
    mirror: Option<Arc<MirroredCatalog>>,
    broker: MessageBroker,
    writer: Arc<BatchWriter>,
    query_engine: Arc<QueryEngine>,
    jobs: Arc<Vec<Arc<dyn Job>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    write_intake: StdMutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Assemble every component and start background tasks
    ///
    /// Fails on malformed job definitions (duplicate ids, invalid transformer
    /// SQL) and when the catalog cannot be opened.
    pub async fn start(config: EngineConfig) -> Result<Arc<Self>> {
        let (catalog, backend, mirror) = open_storage(config.storage).await?;
        let broker = MessageBroker::new(config.broker_capacity);

        let writer = BatchWriter::new(catalog.clone(), backend.clone(), broker.clone(), config.writer);
        let query_engine = QueryEngine::new(catalog.clone(), backend, &config.session, config.query_timeout);

        let ctx = EngineContext {
            catalog: catalog.clone(),
            secrets: config.secrets,
            broker: broker.clone(),
            query_engine: query_engine.clone(),
        };
        let mut jobs = Vec::with_capacity(config.jobs.len());
        let mut seen = HashSet::new();
        for definition in config.jobs {
            let job = definition.build(&ctx)?;
            if !seen.insert(job.unique_id().to_string()) {
                return Err(EngineError::Config(format!("Duplicate job id {}", job.unique_id())));
            }
            info!("Registered {} {}", job.kind().as_str(), job.unique_id());
            jobs.push(job);
        }
        let jobs = Arc::new(jobs);

        let (write_intake, ticker) = writer.start()?;
        let mut tasks = vec![ticker];
        let dispatch_jobs = jobs.clone();
        tasks.push(query_engine.start(&broker, move |key| {
            for job in dispatch_jobs.iter() {
                spawn_execution(job.clone(), JobEvent::TableUpdated(key.clone()));
            }
        }));
        if let Err(e) = query_engine.initialize().await {
            for task in &tasks {
                task.abort();
            }
            write_intake.abort();
            return Err(e);
        }
        tasks.push(spawn_scheduler(jobs.clone(), config.tick_interval));

        Ok(Arc::new(Self {
            catalog,
            mirror,
            broker,
            writer,
            query_engine,
            jobs,
            tasks: StdMutex::new(tasks),
            write_intake: StdMutex::new(Some(write_intake)),
        }))
    }

    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.query_engine.query_sql(sql).await
    }

    pub fn job(&self, unique_id: &str) -> Option<Arc<dyn Job>> {
        self.jobs.iter().find(|job| job.unique_id() == unique_id).cloned()
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.unique_id().to_string()).collect()
    }

    /// Force a run in the background; the outcome is only logged
    pub fn run_job(&self, unique_id: &str) -> Result<()> {
        let job = self.find_job(unique_id)?;
        spawn_execution(job, JobEvent::Run { force: true });
        Ok(())
    }

    /// Force a run and wait for it
    pub async fn run_job_now(&self, unique_id: &str) -> Result<()> {
        self.find_job(unique_id)?.execute(JobEvent::Run { force: true }).await
    }

    fn find_job(&self, unique_id: &str) -> Result<Arc<dyn Job>> {
        self.job(unique_id).ok_or_else(|| {
            error!("Job {} not found", unique_id);
            EngineError::NotFound(format!("job {}", unique_id))
        })
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    pub fn writer(&self) -> &Arc<BatchWriter> {
        &self.writer
    }

    pub fn query_engine(&self) -> &Arc<QueryEngine> {
        &self.query_engine
    }

    /// Stop background tasks, drain queued write events, materialize pending
    /// writes, upload the catalog
    pub async fn shutdown(&self) -> Result<()> {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }

        let write_intake = match self.write_intake.lock() {
            Ok(mut intake) => intake.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(write_intake) = write_intake {
            self.writer.stop_intake();
            write_intake.await?;
        }

        self.writer.flush_all().await?;
        if let Some(mirror) = &self.mirror {
            mirror.upload().await?;
        }
        info!("Engine stopped");
        Ok(())
    }
}

async fn open_storage(
    storage: StorageConfig,
) -> Result<(Arc<dyn CatalogStore>, Arc<dyn DataBackend>, Option<Arc<MirroredCatalog>>)> {
    match storage {
        StorageConfig::Local {
            data_root,
            catalog_path,
        } => {
            info!("Using local storage at {}", data_root.display());
            let catalog = Arc::new(SqliteCatalog::new(&catalog_path).await?);
            Ok((catalog, Arc::new(LocalBackend::new(data_root)), None))
        }
        StorageConfig::ObjectStore {
            store,
            bucket,
            cache_root,
            catalog_path,
            catalog_key,
            catalog_upload_debounce,
        } => {
            info!("Using bucket {} with catalog {}", bucket, catalog_key);
            let mirror = MirroredCatalog::new(store.clone(), &catalog_key, catalog_path, catalog_upload_debounce);
            let catalog = Arc::new(MirroredCatalogHandle(mirror.clone()));
            let backend = Arc::new(ObjectStoreBackend::new(store, bucket, cache_root));
            Ok((catalog, backend, Some(mirror)))
        }
    }
}

fn spawn_execution(job: Arc<dyn Job>, event: JobEvent) {
    tokio::spawn(async move {
        if let Err(e) = job.execute(event).await {
            error!("{} {} failed: {}", job.kind().as_str(), job.unique_id(), e);
        }
    });
}

/// Offer every loader a scheduled run on each tick
fn spawn_scheduler(jobs: Arc<Vec<Arc<dyn Job>>>, tick_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if jobs.iter().all(|job| job.kind() != JobKind::Loader) {
            debug!("No loaders to schedule");
            return;
        }
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for job in jobs.iter().filter(|job| job.kind() == JobKind::Loader) {
                spawn_execution(job.clone(), JobEvent::Run { force: false });
            }
        }
    })
}

impl Drop for Engine {
    fn drop(&mut self) {
        let tasks = match self.tasks.get_mut() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !tasks.is_empty() {
            warn!("Engine dropped without shutdown; pending writes are lost");
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        let write_intake = match self.write_intake.get_mut() {
            Ok(intake) => intake.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(write_intake) = write_intake {
            write_intake.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use crate::services::secrets::EnvVarSecretStore;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn local_config(root: &std::path::Path) -> EngineConfig {
        EngineConfig::new(
            StorageConfig::Local {
                data_root: root.join("data"),
                catalog_path: root.join("local.db"),
            },
            Arc::new(EnvVarSecretStore::with_vars("SWAMP", HashMap::new())),
        )
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let dir = tempdir().unwrap();
        let engine = Engine::start(local_config(dir.path())).await.unwrap();

        assert!(matches!(engine.run_job("missing"), Err(EngineError::NotFound(_))));
        assert!(matches!(
            engine.run_job_now("missing").await,
            Err(EngineError::NotFound(_))
        ));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_job_ids_are_rejected() {
        let dir = tempdir().unwrap();
        let mut config = local_config(dir.path());
        for _ in 0..2 {
            config.jobs.push(JobDefinition::transformer(
                SqlTransform::new("analytics", "t", "SELECT 1 AS id", &["id"]),
                JobSettings::new("same"),
            ));
        }

        let err = Engine::start(config).await.err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_forced_transformer_run_materializes() {
        let dir = tempdir().unwrap();
        let mut config = local_config(dir.path());
        config.writer.flush_interval = Duration::from_millis(10);
        config.jobs.push(JobDefinition::transformer(
            SqlTransform::new("analytics", "constants", "SELECT CAST(1 AS BIGINT) AS id, 'x' AS v", &["id"]),
            JobSettings::new("constants"),
        ));
        let engine = Engine::start(config).await.unwrap();
        let mut updates = engine.broker().subscribe_table_updates();

        engine.run_job_now("constants").await.unwrap();
        let event = updates.recv().await.unwrap();
        assert_eq!(event.key.table_name, "constants");

        let entry = engine.catalog().get_table("analytics", "constants").await.unwrap();
        assert!(entry.is_some());
        // Transformers leave no run record
        assert!(engine.catalog().get_latest_run("constants").await.unwrap().is_none());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_uploads_mirrored_catalog() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let config = EngineConfig::new(
            StorageConfig::ObjectStore {
                store: store.clone(),
                bucket: "lake".to_string(),
                cache_root: dir.path().join("cache"),
                catalog_path: dir.path().join("local.db"),
                catalog_key: "local.db".to_string(),
                catalog_upload_debounce: Duration::from_secs(60),
            },
            Arc::new(EnvVarSecretStore::with_vars("SWAMP", HashMap::new())),
        );
        let engine = Engine::start(config).await.unwrap();
        engine
            .catalog()
            .add_run(&crate::models::NewRun::success("crm"))
            .await
            .unwrap();

        engine.shutdown().await.unwrap();

        let uploaded = store
            .get(&object_store::path::Path::from("local.db"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert!(!uploaded.is_empty());
        let run = engine.catalog().get_latest_run("crm").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
    }
}
