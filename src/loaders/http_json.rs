use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::models::{InsertBatch, Inserts};
use crate::services::job::JobSettings;
use crate::services::loader::{Loader, LoaderResponse};
use crate::services::secrets::SecretSchema;

/// A paginated JSON endpoint declared in the config file
///
/// ```yaml
/// http_sources:
///   - unique_id: placeholder
///     url: https://jsonplaceholder.typicode.com/posts
///     table: posts
///     primary_keys: [id]
///     page_param: _page
///     page_size_param: _limit
///     page_size: 50
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpSourceConfig {
    pub unique_id: String,
    pub url: String,
    pub table: String,
    pub primary_keys: Vec<String>,
    /// Dotted path to the record array; the body itself when unset
    #[serde(default)]
    pub records_path: Option<String>,
    #[serde(default)]
    pub page_param: Option<String>,
    #[serde(default)]
    pub page_size_param: Option<String>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub cadence_secs: Option<u64>,
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    /// Send `Authorization: Bearer <token>` with the `token` secret
    #[serde(default)]
    pub bearer_auth: bool,
}

impl HttpSourceConfig {
    pub fn job_settings(&self, default_cadence: Duration) -> JobSettings {
        let mut settings = JobSettings::new(self.unique_id.clone())
            .with_cadence(self.cadence_secs.map(Duration::from_secs).unwrap_or(default_cadence));
        if let Some(ms) = self.rate_limit_ms {
            settings = settings.with_rate_limit(Duration::from_millis(ms));
        }
        settings
    }

    fn is_paginated(&self) -> bool {
        self.page_param.is_some() && self.page_size.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub page: u64,
}

#[derive(Debug, Deserialize)]
pub struct HttpSecrets {
    pub token: String,
}

/// Loader fetching one page of records per call
pub struct HttpJsonLoader {
    config: HttpSourceConfig,
    http_client: HttpClient,
}

impl HttpJsonLoader {
    pub fn new(config: HttpSourceConfig) -> Self {
        Self {
            config,
            http_client: HttpClient::new(),
        }
    }

    pub fn page_url(&self, page: u64) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.config.url)?;
        if let Some(page_param) = &self.config.page_param {
            url.query_pairs_mut().append_pair(page_param, &page.to_string());
        }
        if let (Some(size_param), Some(size)) = (&self.config.page_size_param, self.config.page_size) {
            url.query_pairs_mut().append_pair(size_param, &size.to_string());
        }
        Ok(url)
    }
}

/// Records at a dotted path of a response body
pub fn extract_records(body: JsonValue, path: Option<&str>) -> Option<Vec<JsonValue>> {
    let mut current = body;
    if let Some(path) = path.filter(|p| !p.is_empty()) {
        for segment in path.split('.') {
            current = match current {
                JsonValue::Object(mut map) => map.remove(segment)?,
                _ => return None,
            };
        }
    }
    match current {
        JsonValue::Array(records) => Some(records),
        _ => None,
    }
}

#[async_trait]
impl Loader for HttpJsonLoader {
    type Secrets = HttpSecrets;
    type Cursor = PageCursor;

    fn secret_schema(&self) -> Option<SecretSchema> {
        self.config.bearer_auth.then(|| SecretSchema::new().string("token"))
    }

    async fn load(
        &self,
        secrets: Option<&HttpSecrets>,
        cursor: Option<PageCursor>,
    ) -> anyhow::Result<LoaderResponse<PageCursor>> {
        let page = cursor.map(|c| c.page).unwrap_or(1);
        let url = self.page_url(page)?;
        debug!("Fetching {}", url);

        let mut request = self.http_client.get(url.clone());
        if let Some(secrets) = secrets {
            request = request.header("Authorization", format!("Bearer {}", secrets.token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Ok(LoaderResponse::Error {
                message: format!("GET {} returned {}: {}", url, status, error_text),
            });
        }

        let body: JsonValue = response.json().await?;
        let Some(records) = extract_records(body, self.config.records_path.as_deref()) else {
            return Ok(LoaderResponse::Error {
                message: format!("GET {} did not return a record array", url),
            });
        };

        // A short page is the last one; the next run re-reads it for new records
        let has_more = self.config.is_paginated()
            && self.config.page_size.is_some_and(|size| records.len() as u64 >= size);
        let next = if has_more { page + 1 } else { page };

        let primary_keys: Vec<&str> = self.config.primary_keys.iter().map(String::as_str).collect();
        let mut inserts = Inserts::new();
        inserts.insert(self.config.table.clone(), InsertBatch::from_json(&primary_keys, records));

        Ok(LoaderResponse::Success {
            cursor: PageCursor { page: next },
            inserts,
            has_more,
        })
    }
}
