use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

use swamp::services::secrets::{EnvVarSecretStore, SecretSchema};
use swamp::storage::CatalogStore;
use swamp::{
    Engine, EngineConfig, InsertBatch, Inserts, JobDefinition, JobSettings, Loader, LoaderResponse,
    QueryResult, RunStatus, SqlTransform, StorageConfig, TableKey, WriterConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PageCursor {
    page: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSecrets {
    #[allow(dead_code)]
    api_key: String,
}

/// Replays canned pages, one per call
struct PagedLoader {
    pages: Mutex<Vec<LoaderResponse<PageCursor>>>,
    needs_secrets: bool,
}

impl PagedLoader {
    fn new(mut pages: Vec<LoaderResponse<PageCursor>>) -> Self {
        pages.reverse();
        Self {
            pages: Mutex::new(pages),
            needs_secrets: false,
        }
    }
}

#[async_trait]
impl Loader for PagedLoader {
    type Secrets = ApiSecrets;
    type Cursor = PageCursor;

    fn secret_schema(&self) -> Option<SecretSchema> {
        self.needs_secrets.then(|| SecretSchema::new().string("apiKey"))
    }

    async fn load(
        &self,
        _secrets: Option<&ApiSecrets>,
        _cursor: Option<PageCursor>,
    ) -> anyhow::Result<LoaderResponse<PageCursor>> {
        self.pages
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no more pages"))
    }
}

fn page(next: u64, records: Vec<JsonValue>, has_more: bool) -> LoaderResponse<PageCursor> {
    let mut inserts = Inserts::new();
    inserts.insert("users".to_string(), InsertBatch::from_json(&["id"], records));
    LoaderResponse::Success {
        cursor: PageCursor { page: next },
        inserts,
        has_more,
    }
}

fn engine_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(
        StorageConfig::Local {
            data_root: root.join("data"),
            catalog_path: root.join("local.db"),
        },
        Arc::new(EnvVarSecretStore::with_vars("SWAMP", HashMap::new())),
    );
    config.writer = WriterConfig {
        debounce: Duration::from_millis(100),
        flush_interval: Duration::from_millis(20),
    };
    config.tick_interval = Duration::from_millis(50);
    config
}

/// Poll `check` until it yields a value or five seconds pass
async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..250 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

async fn query_rows(engine: &Engine, sql: &str, expected: usize) -> QueryResult {
    eventually(move || async move {
        engine
            .query(sql)
            .await
            .ok()
            .filter(|result| result.row_count == expected)
    })
    .await
}

fn parquet_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "parquet"))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn two_pages_land_in_one_table() {
    let dir = tempdir().unwrap();
    let mut config = engine_config(dir.path());
    config.jobs.push(JobDefinition::loader(
        PagedLoader::new(vec![
            page(2, vec![json!({"id": 1, "name": "Ada"})], true),
            page(3, vec![json!({"id": 2, "name": "Grace"})], false),
        ]),
        JobSettings::new("crm"),
    ));
    let engine = Engine::start(config).await.unwrap();

    let result = query_rows(&engine, "SELECT id, name FROM crm.users ORDER BY id", 2).await;
    let rows = result.to_objects();
    assert_eq!(rows[0]["id"].as_f64(), Some(1.0));
    assert_eq!(rows[0]["name"], "Ada");
    assert_eq!(rows[1]["name"], "Grace");

    let run = engine.catalog().get_latest_run("crm").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(
        engine.catalog().get_cursor("crm").await.unwrap(),
        Some(json!({"page": 3}))
    );
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_key_in_one_batch_keeps_last() {
    let dir = tempdir().unwrap();
    let mut config = engine_config(dir.path());
    config.jobs.push(JobDefinition::loader(
        PagedLoader::new(vec![page(
            1,
            vec![
                json!({"id": 1, "name": "first"}),
                json!({"id": 1, "name": "second"}),
            ],
            false,
        )]),
        JobSettings::new("crm"),
    ));
    let engine = Engine::start(config).await.unwrap();

    let result = query_rows(&engine, "SELECT name FROM crm.users", 1).await;
    assert_eq!(result.rows[0][0], "second");
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_secret_records_failed_run() {
    let dir = tempdir().unwrap();
    let mut config = engine_config(dir.path());
    let mut loader = PagedLoader::new(vec![page(1, vec![json!({"id": 1})], false)]);
    loader.needs_secrets = true;
    config.jobs.push(JobDefinition::loader(loader, JobSettings::new("crm")));
    let engine = Engine::start(config).await.unwrap();

    let catalog = engine.catalog().clone();
    let run = eventually(move || {
        let catalog = catalog.clone();
        async move { catalog.get_latest_run("crm").await.ok().flatten() }
    })
    .await;
    assert_eq!(run.status, RunStatus::Error);
    assert!(run.message.is_some());
    assert_eq!(engine.catalog().get_cursor("crm").await.unwrap(), None);
    assert!(engine.catalog().get_table("crm", "users").await.unwrap().is_none());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn rapid_pages_commit_one_file() {
    let dir = tempdir().unwrap();
    let mut config = engine_config(dir.path());
    config.writer.debounce = Duration::from_millis(300);
    let pages = (1..=5)
        .map(|i| page(i + 1, vec![json!({"id": i, "name": format!("user {}", i)})], i < 5))
        .collect();
    config
        .jobs
        .push(JobDefinition::loader(PagedLoader::new(pages), JobSettings::new("crm")));
    let engine = Engine::start(config).await.unwrap();

    query_rows(&engine, "SELECT id FROM crm.users", 5).await;
    let entry = engine.catalog().get_table("crm", "users").await.unwrap().unwrap();
    assert_eq!(parquet_files(Path::new(&entry.location)), 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn transformers_chain_on_table_updates() {
    let dir = tempdir().unwrap();
    let mut config = engine_config(dir.path());
    config.jobs.push(JobDefinition::loader(
        PagedLoader::new(vec![page(
            1,
            vec![
                json!({"id": 1, "name": "Ada", "active": true}),
                json!({"id": 2, "name": "Grace", "active": true}),
                json!({"id": 3, "name": "Linus", "active": false}),
            ],
            false,
        )]),
        JobSettings::new("crm"),
    ));
    config.jobs.push(JobDefinition::transformer(
        SqlTransform::new(
            "analytics",
            "active_users",
            "SELECT id, name FROM crm.users WHERE active",
            &["id"],
        ),
        JobSettings::new("active_users").subscribe(TableKey::new("crm", "users")),
    ));
    config.jobs.push(JobDefinition::transformer(
        SqlTransform::new(
            "analytics",
            "active_count",
            "SELECT 'all' AS bucket, COUNT(*) AS total FROM analytics.active_users",
            &["bucket"],
        ),
        JobSettings::new("active_count").subscribe(TableKey::new("analytics", "active_users")),
    ));
    let engine = Engine::start(config).await.unwrap();

    let handle: &Engine = &engine;
    let result = eventually(move || async move {
        handle
            .query("SELECT total FROM analytics.active_count")
            .await
            .ok()
            .filter(|result| result.rows.first().and_then(|row| row[0].as_i64()) == Some(2))
    })
    .await;
    assert_eq!(result.row_count, 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_serves_committed_tables() {
    let dir = tempdir().unwrap();
    let mut config = engine_config(dir.path());
    config.jobs.push(JobDefinition::loader(
        PagedLoader::new(vec![page(1, vec![json!({"id": 7, "name": "Ada"})], false)]),
        JobSettings::new("crm"),
    ));
    let engine = Engine::start(config).await.unwrap();
    query_rows(&engine, "SELECT id FROM crm.users", 1).await;
    engine.shutdown().await.unwrap();
    drop(engine);

    let engine = Engine::start(engine_config(dir.path())).await.unwrap();
    let result = engine.query("SELECT name FROM crm.users").await.unwrap();
    assert_eq!(result.rows, vec![vec![json!("Ada")]]);
    engine.shutdown().await.unwrap();
}
