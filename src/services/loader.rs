use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::models::{Inserts, JobEvent, NewRun, RunRecord, RunStatus, WriteEvent};
use crate::services::broker::MessageBroker;
use crate::services::inference::clean_inserts;
use crate::services::job::{Job, JobKind, JobSettings};
use crate::services::lock::InMemoryLock;
use crate::services::secrets::{SecretSchema, SecretStore};
use crate::storage::CatalogStore;

/// One page of a loader run
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderResponse<C> {
    Success {
        cursor: C,
        inserts: Inserts,
        has_more: bool,
    },
    Error {
        message: String,
    },
}

/// A pluggable source of paginated records
///
/// `load` is called with the resolved secrets and the cursor of the previous
/// page (or the persisted cursor on the first page of a run). An `Err` is
/// treated like an `Error` response.
#[async_trait]
pub trait Loader: Send + Sync + 'static {
    type Secrets: DeserializeOwned + Send + Sync;
    type Cursor: Serialize + DeserializeOwned + Send + Sync;

    /// Secrets to resolve before each run; `None` when the loader needs none
    fn secret_schema(&self) -> Option<SecretSchema> {
        None
    }

    async fn load(
        &self,
        secrets: Option<&Self::Secrets>,
        cursor: Option<Self::Cursor>,
    ) -> anyhow::Result<LoaderResponse<Self::Cursor>>;
}

/// True when a scheduled tick should start a run
///
/// A loader with no runs is always due. After a success it waits out the
/// cadence; after a failure it is due again on the next tick.
pub fn is_due(latest: Option<&RunRecord>, now: DateTime<Utc>, cadence: Duration) -> bool {
    match latest {
        None => true,
        Some(run) if run.status == RunStatus::Success => now
            .signed_duration_since(run.created_at)
            .to_std()
            .map(|elapsed| elapsed >= cadence)
            .unwrap_or(false),
        Some(_) => true,
    }
}

/// Runs one loader: cadence gating, the page loop, cursor and run bookkeeping
pub struct LoaderExecutor<L: Loader> {
    loader: L,
    settings: JobSettings,
    catalog: Arc<dyn CatalogStore>,
    secrets: Arc<dyn SecretStore>,
    broker: MessageBroker,
    lock: InMemoryLock,
}

impl<L: Loader> LoaderExecutor<L> {
    pub fn new(
        loader: L,
        settings: JobSettings,
        catalog: Arc<dyn CatalogStore>,
        secrets: Arc<dyn SecretStore>,
        broker: MessageBroker,
    ) -> Self {
        Self {
            loader,
            settings,
            catalog,
            secrets,
            broker,
            lock: InMemoryLock::new(),
        }
    }

    /// Run if not already running and, unless forced, if the cadence allows
    ///
    /// Returns whether a run happened. A call while another run holds the lock
    /// returns immediately.
    pub async fn maybe_run(&self, force: bool) -> Result<bool> {
        let unique_id = self.unique_id();
        let Some(_guard) = self.lock.try_lock() else {
            debug!("Loader {} is already running", unique_id);
            return Ok(false);
        };

        if !force {
            let latest = self.catalog.get_latest_run(unique_id).await?;
            if !is_due(latest.as_ref(), Utc::now(), self.settings.cadence) {
                return Ok(false);
            }
        }

        let run = match self.execute_loader().await {
            Ok(run) => run,
            Err(e) => {
                error!("Error running loader {}: {}", unique_id, e);
                NewRun::error(unique_id, e.to_string())
            }
        };
        self.catalog.add_run(&run).await?;
        Ok(true)
    }

    fn resolve_secrets(&self) -> Result<Option<L::Secrets>> {
        let Some(schema) = self.loader.secret_schema() else {
            return Ok(None);
        };
        let unique_id = self.unique_id();
        let secrets = self.secrets.get(unique_id, &schema).map_err(|e| {
            error!("Error getting secrets for {}: {}", unique_id, e);
            e
        })?;
        serde_json::from_value(JsonValue::Object(secrets))
            .map(Some)
            .map_err(|e| EngineError::Secrets(format!("Invalid secrets for {}: {}", unique_id, e)))
    }

    async fn load_cursor(&self) -> Result<(Option<L::Cursor>, Option<JsonValue>)> {
        let unique_id = self.unique_id();
        let Some(raw) = self.catalog.get_cursor(unique_id).await? else {
            return Ok((None, None));
        };
        match serde_json::from_value(raw.clone()) {
            Ok(cursor) => Ok((Some(cursor), Some(raw))),
            Err(e) => {
                error!("Cursor {} of {} did not match its schema: {}", raw, unique_id, e);
                Err(EngineError::Cursor(format!(
                    "Cursor {} did not match schema: {}",
                    raw, e
                )))
            }
        }
    }

    async fn execute_loader(&self) -> Result<NewRun> {
        let unique_id = self.unique_id();
        let secrets = self.resolve_secrets()?;
        let (mut cursor, raw_cursor) = self.load_cursor().await?;
        info!(
            "Running loader {} with cursor {}",
            unique_id,
            raw_cursor.unwrap_or(JsonValue::Null)
        );

        let mut pages = 0;
        loop {
            let response = self
                .loader
                .load(secrets.as_ref(), cursor.take())
                .await
                .map_err(|e| EngineError::Loader(format!("{:#}", e)))?;

            let (next, inserts, has_more) = match response {
                LoaderResponse::Error { message } => {
                    warn!("Loader {} returned an error: {}", unique_id, message);
                    return Ok(NewRun::error(unique_id, message));
                }
                LoaderResponse::Success {
                    cursor,
                    inserts,
                    has_more,
                } => (cursor, inserts, has_more),
            };

            let cleaned = clean_inserts(inserts, unique_id);
            let counts = cleaned
                .iter()
                .map(|(table, batch)| format!("{}={}", table, batch.records.len()))
                .collect::<Vec<_>>()
                .join(", ");
            self.broker.publish_write(WriteEvent::Records(cleaned)).await?;
            pages += 1;
            info!("Loader {} published page {} ({})", unique_id, pages, counts);

            // Persisted before the next fetch so a crash only replays pages
            let raw = serde_json::to_value(&next)?;
            self.catalog.add_cursor(unique_id, &raw).await?;

            if !has_more {
                info!("Loader {} sync complete after {} pages", unique_id, pages);
                return Ok(NewRun::success(unique_id));
            }
            if let Some(rate_limit) = self.settings.rate_limit {
                tokio::time::sleep(rate_limit).await;
            }
            cursor = Some(next);
        }
    }
}

#[async_trait]
impl<L: Loader> Job for LoaderExecutor<L> {
    fn settings(&self) -> &JobSettings {
        &self.settings
    }

    fn kind(&self) -> JobKind {
        JobKind::Loader
    }

    async fn execute(&self, event: JobEvent) -> Result<()> {
        match event {
            JobEvent::Run { force } => {
                self.maybe_run(force).await?;
                Ok(())
            }
            JobEvent::TableUpdated(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InsertBatch;
    use crate::services::secrets::EnvVarSecretStore;
    use crate::storage::SqliteCatalog;
    use chrono::Duration as ChronoDuration;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PageCursor {
        page: u64,
    }

    #[derive(Debug, Deserialize)]
    struct ApiSecrets {
        #[serde(rename = "apiKey")]
        api_key: String,
    }

    /// Replays canned responses and records what it was called with
    struct ScriptedLoader {
        responses: StdMutex<Vec<LoaderResponse<PageCursor>>>,
        seen: StdMutex<Vec<Option<PageCursor>>>,
        needs_secrets: bool,
    }

    impl ScriptedLoader {
        fn new(mut responses: Vec<LoaderResponse<PageCursor>>) -> Self {
            responses.reverse();
            Self {
                responses: StdMutex::new(responses),
                seen: StdMutex::new(Vec::new()),
                needs_secrets: false,
            }
        }
    }

    #[async_trait]
    impl Loader for ScriptedLoader {
        type Secrets = ApiSecrets;
        type Cursor = PageCursor;

        fn secret_schema(&self) -> Option<SecretSchema> {
            self.needs_secrets.then(|| SecretSchema::new().string("apiKey"))
        }

        async fn load(
            &self,
            secrets: Option<&ApiSecrets>,
            cursor: Option<PageCursor>,
        ) -> anyhow::Result<LoaderResponse<PageCursor>> {
            if self.needs_secrets {
                anyhow::ensure!(secrets.map(|s| !s.api_key.is_empty()).unwrap_or(false));
            }
            self.seen.lock().unwrap().push(cursor);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no more responses"))
        }
    }

    fn page(next: u64, id: i64, has_more: bool) -> LoaderResponse<PageCursor> {
        let mut inserts = Inserts::new();
        inserts.insert(
            "users".to_string(),
            InsertBatch::from_json(&["id"], vec![json!({"id": id, "name": "x"})]),
        );
        LoaderResponse::Success {
            cursor: PageCursor { page: next },
            inserts,
            has_more,
        }
    }

    async fn executor<L: Loader>(
        loader: L,
        catalog: Arc<SqliteCatalog>,
        vars: HashMap<String, String>,
        broker: MessageBroker,
    ) -> LoaderExecutor<L> {
        LoaderExecutor::new(
            loader,
            JobSettings::new("crm"),
            catalog,
            Arc::new(EnvVarSecretStore::with_vars("SWAMP", vars)),
            broker,
        )
    }

    #[tokio::test]
    async fn test_pages_until_done() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        let broker = MessageBroker::new(16);
        let mut writes = broker.take_write_queue().unwrap();
        let loader = ScriptedLoader::new(vec![page(2, 1, true), page(3, 2, false)]);
        let executor = executor(loader, catalog.clone(), HashMap::new(), broker).await;

        assert!(executor.maybe_run(false).await.unwrap());

        assert_eq!(
            *executor.loader.seen.lock().unwrap(),
            vec![None, Some(PageCursor { page: 2 })]
        );
        assert_eq!(catalog.get_cursor("crm").await.unwrap(), Some(json!({"page": 3})));
        let run = catalog.get_latest_run("crm").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);

        for _ in 0..2 {
            let event = writes.recv().await.unwrap();
            let WriteEvent::Records(inserts) = &event else {
                panic!("expected records");
            };
            assert_eq!(inserts["users"].schema_name, "crm");
        }
    }

    #[tokio::test]
    async fn test_slow_writer_receives_every_page() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        let broker = MessageBroker::new(2);
        let mut writes = broker.take_write_queue().unwrap();
        let pages = (1..=20).map(|i| page(i + 1, i as i64, i < 20)).collect();
        let executor = executor(ScriptedLoader::new(pages), catalog.clone(), HashMap::new(), broker).await;

        let consumer = tokio::spawn(async move {
            let mut ids = Vec::new();
            while ids.len() < 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let Some(WriteEvent::Records(inserts)) = writes.recv().await else {
                    panic!("expected records");
                };
                ids.push(inserts["users"].records[0]["id"].clone());
            }
            ids
        });

        assert!(executor.maybe_run(true).await.unwrap());
        assert_eq!(consumer.await.unwrap().len(), 20);
        assert_eq!(catalog.get_cursor("crm").await.unwrap(), Some(json!({"page": 21})));
    }

    #[tokio::test]
    async fn test_closed_write_queue_keeps_cursor() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        let broker = MessageBroker::new(4);
        broker.take_write_queue().unwrap().close();
        let loader = ScriptedLoader::new(vec![page(2, 1, false)]);
        let executor = executor(loader, catalog.clone(), HashMap::new(), broker).await;

        assert!(executor.maybe_run(true).await.unwrap());

        assert_eq!(catalog.get_cursor("crm").await.unwrap(), None);
        let run = catalog.get_latest_run("crm").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_resumes_from_persisted_cursor() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        catalog.add_cursor("crm", &json!({"page": 7})).await.unwrap();
        let loader = ScriptedLoader::new(vec![page(8, 1, false)]);
        let executor = executor(loader, catalog, HashMap::new(), MessageBroker::new(16)).await;

        executor.maybe_run(true).await.unwrap();
        assert_eq!(*executor.loader.seen.lock().unwrap(), vec![Some(PageCursor { page: 7 })]);
    }

    #[tokio::test]
    async fn test_error_response_records_failed_run() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        let loader = ScriptedLoader::new(vec![LoaderResponse::Error {
            message: "rate limited".to_string(),
        }]);
        let executor = executor(loader, catalog.clone(), HashMap::new(), MessageBroker::new(16)).await;

        assert!(executor.maybe_run(false).await.unwrap());

        let run = catalog.get_latest_run("crm").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.message.as_deref(), Some("rate limited"));
        assert_eq!(catalog.get_cursor("crm").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_secret_skips_loader() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        let mut loader = ScriptedLoader::new(vec![page(2, 1, false)]);
        loader.needs_secrets = true;
        let executor = executor(loader, catalog.clone(), HashMap::new(), MessageBroker::new(16)).await;

        assert!(executor.maybe_run(false).await.unwrap());

        assert!(executor.loader.seen.lock().unwrap().is_empty());
        let run = catalog.get_latest_run("crm").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.message.unwrap().contains("SWAMP_CRM_APIKEY"));
    }

    #[tokio::test]
    async fn test_secrets_are_passed_to_loader() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        let mut loader = ScriptedLoader::new(vec![page(2, 1, false)]);
        loader.needs_secrets = true;
        let vars = HashMap::from([("SWAMP_CRM_APIKEY".to_string(), "k".to_string())]);
        let executor = executor(loader, catalog.clone(), vars, MessageBroker::new(16)).await;

        executor.maybe_run(false).await.unwrap();

        let run = catalog.get_latest_run("crm").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_cursor_drift_is_fatal() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        catalog.add_cursor("crm", &json!({"offset": "abc"})).await.unwrap();
        let loader = ScriptedLoader::new(vec![page(2, 1, false)]);
        let executor = executor(loader, catalog.clone(), HashMap::new(), MessageBroker::new(16)).await;

        executor.maybe_run(false).await.unwrap();

        assert!(executor.loader.seen.lock().unwrap().is_empty());
        let run = catalog.get_latest_run("crm").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        // The drifted cursor is kept for inspection
        assert_eq!(catalog.get_cursor("crm").await.unwrap(), Some(json!({"offset": "abc"})));
    }

    #[tokio::test]
    async fn test_cadence_skips_recent_success() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        catalog.add_run(&NewRun::success("crm")).await.unwrap();
        let loader = ScriptedLoader::new(vec![page(2, 1, false)]);
        let executor = executor(loader, catalog, HashMap::new(), MessageBroker::new(16)).await;

        assert!(!executor.maybe_run(false).await.unwrap());
        assert!(executor.maybe_run(true).await.unwrap());
    }

    #[test]
    fn test_is_due() {
        let cadence = Duration::from_secs(60);
        let now = Utc::now();
        let run = |status, secs_ago| RunRecord {
            unique_id: "crm".to_string(),
            status,
            message: None,
            created_at: now - ChronoDuration::seconds(secs_ago),
        };

        assert!(is_due(None, now, cadence));
        assert!(!is_due(Some(&run(RunStatus::Success, 30)), now, cadence));
        assert!(is_due(Some(&run(RunStatus::Success, 120)), now, cadence));
        assert!(is_due(Some(&run(RunStatus::Error, 1)), now, cadence));
    }

    /// Blocks inside `load` until released
    struct BlockingLoader {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Loader for BlockingLoader {
        type Secrets = ();
        type Cursor = PageCursor;

        async fn load(
            &self,
            _secrets: Option<&()>,
            _cursor: Option<PageCursor>,
        ) -> anyhow::Result<LoaderResponse<PageCursor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(LoaderResponse::Success {
                cursor: PageCursor { page: 1 },
                inserts: Inserts::new(),
                has_more: false,
            })
        }
    }

    #[tokio::test]
    async fn test_one_run_in_flight() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::new(dir.path().join("local.db")).await.unwrap());
        let loader = BlockingLoader {
            calls: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        };
        let executor = Arc::new(executor(loader, catalog, HashMap::new(), MessageBroker::new(16)).await);

        let running = tokio::spawn({
            let executor = executor.clone();
            async move { executor.maybe_run(true).await }
        });
        executor.loader.entered.notified().await;

        // A second trigger while the first is in flight is a no-op
        assert!(!executor.maybe_run(true).await.unwrap());

        executor.loader.release.notify_one();
        assert!(running.await.unwrap().unwrap());
        assert_eq!(executor.loader.calls.load(Ordering::SeqCst), 1);
    }
}
