use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::loaders::{HttpJsonLoader, HttpSourceConfig};
use crate::services::engine::{EngineConfig, JobDefinition, StorageConfig};
use crate::services::secrets::{EnvVarSecretStore, SecretStore, YamlFileSecretStore};
use crate::services::WriterConfig;
use crate::storage::S3Credentials;

/// Secret id holding bucket credentials when `s3.*` is not configured
const S3_SECRET_ID: &str = "s3";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub storage: StorageSettings,
    pub writer: WriterSettings,
    pub scheduler: SchedulerSettings,
    pub secrets: SecretsSettings,
    #[serde(default)]
    pub s3: S3Settings,
    pub broker: BrokerSettings,
    pub query: QuerySettings,
    #[serde(default)]
    pub http_sources: Vec<HttpSourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// `local` or `s3`
    pub backend: String,
    pub data_root: PathBuf,
    pub catalog_path: PathBuf,
    pub catalog_key: String,
    pub catalog_upload_debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterSettings {
    pub debounce_ms: u64,
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    pub tick_ms: u64,
    pub default_cadence_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsSettings {
    /// `env` or `yaml`
    pub source: String,
    pub env_prefix: String,
    pub yaml_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Settings {
    pub key_id: Option<String>,
    pub secret: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
}

impl S3Settings {
    /// Credentials when every required key is set
    pub fn credentials(&self) -> Option<S3Credentials> {
        Some(S3Credentials {
            key_id: self.key_id.clone()?,
            secret: self.secret.clone()?,
            region: self.region.clone()?,
            bucket: self.bucket.clone()?,
            endpoint: self.endpoint.clone(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuerySettings {
    pub timeout_secs: u64,
}

/// Environment variables that override file and default values
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("SWAMP_API_TOKEN", "api.token"),
    ("SWAMP_STORAGE", "storage.backend"),
    ("SWAMP_DATA_ROOT", "storage.data_root"),
    ("SWAMP_SECRETS_SOURCE", "secrets.source"),
    ("SWAMP_S3_KEY_ID", "s3.key_id"),
    ("SWAMP_S3_SECRET", "s3.secret"),
    ("SWAMP_S3_REGION", "s3.region"),
    ("SWAMP_S3_BUCKET", "s3.bucket"),
    ("SWAMP_S3_ENDPOINT", "s3.endpoint"),
];

impl Config {
    /// Defaults, then `swamp.{yaml,toml,json}` if present, then environment
    pub fn from_env() -> std::result::Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let overrides = ENV_OVERRIDES
            .iter()
            .filter_map(|(var, key)| env::var(var).ok().map(|value| (*key, value)))
            .collect::<Vec<_>>();

        Self::load(config::File::with_name("swamp").required(false), &overrides)
    }

    pub fn load<S>(file: S, overrides: &[(&str, String)]) -> std::result::Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 9001)?
            .set_default("storage.backend", "local")?
            .set_default("storage.data_root", "data")?
            .set_default("storage.catalog_path", "local.db")?
            .set_default("storage.catalog_key", "local.db")?
            .set_default("storage.catalog_upload_debounce_ms", 2000)?
            .set_default("writer.debounce_ms", 2000)?
            .set_default("writer.flush_interval_ms", 250)?
            .set_default("scheduler.tick_ms", 1000)?
            .set_default("scheduler.default_cadence_secs", 900)?
            .set_default("secrets.source", "env")?
            .set_default("secrets.env_prefix", "SWAMP")?
            .set_default("secrets.yaml_path", "secrets.yaml")?
            .set_default("broker.capacity", 1024)?
            .set_default("query.timeout_secs", 300)?
            .add_source(file);

        for (key, value) in overrides {
            builder = builder.set_override(*key, value.as_str())?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn secret_store(&self) -> Result<Arc<dyn SecretStore>> {
        match self.secrets.source.as_str() {
            "env" => Ok(Arc::new(EnvVarSecretStore::new(self.secrets.env_prefix.clone()))),
            "yaml" => Ok(Arc::new(YamlFileSecretStore::new(self.secrets.yaml_path.clone()))),
            other => Err(EngineError::Config(format!("Unknown secrets source '{}'", other))),
        }
    }

    fn storage_config(&self, secrets: &dyn SecretStore) -> Result<StorageConfig> {
        let storage = &self.storage;
        match storage.backend.as_str() {
            "local" => Ok(StorageConfig::Local {
                data_root: storage.data_root.clone(),
                catalog_path: storage.catalog_path.clone(),
            }),
            "s3" => {
                let credentials = match self.s3.credentials() {
                    Some(credentials) => credentials,
                    None => secrets.s3_credentials(S3_SECRET_ID)?,
                };
                Ok(StorageConfig::ObjectStore {
                    store: credentials.build_store()?,
                    bucket: credentials.bucket,
                    cache_root: storage.data_root.clone(),
                    catalog_path: storage.catalog_path.clone(),
                    catalog_key: storage.catalog_key.clone(),
                    catalog_upload_debounce: Duration::from_millis(storage.catalog_upload_debounce_ms),
                })
            }
            other => Err(EngineError::Config(format!("Unknown storage backend '{}'", other))),
        }
    }

    /// Engine configuration with the declared HTTP sources as loaders
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let secrets = self.secret_store()?;
        let storage = self.storage_config(secrets.as_ref())?;

        let mut engine_config = EngineConfig::new(storage, secrets);
        engine_config.writer = WriterConfig {
            debounce: Duration::from_millis(self.writer.debounce_ms),
            flush_interval: Duration::from_millis(self.writer.flush_interval_ms),
        };
        engine_config.query_timeout = Duration::from_secs(self.query.timeout_secs);
        engine_config.tick_interval = Duration::from_millis(self.scheduler.tick_ms);
        engine_config.broker_capacity = self.broker.capacity;

        let default_cadence = Duration::from_secs(self.scheduler.default_cadence_secs);
        for source in &self.http_sources {
            let settings = source.job_settings(default_cadence);
            engine_config
                .jobs
                .push(JobDefinition::loader(HttpJsonLoader::new(source.clone()), settings));
        }
        Ok(engine_config)
    }
}
