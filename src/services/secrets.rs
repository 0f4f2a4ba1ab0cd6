use serde_json::{Map, Number, Value as JsonValue};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::storage::S3Credentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    String,
    Number,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretField {
    pub name: String,
    pub kind: SecretKind,
    pub required: bool,
}

/// Declared shape of the secrets a source needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretSchema {
    pub fields: Vec<SecretField>,
}

impl SecretSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string(mut self, name: &str) -> Self {
        self.fields.push(SecretField {
            name: name.to_string(),
            kind: SecretKind::String,
            required: true,
        });
        self
    }

    pub fn number(mut self, name: &str) -> Self {
        self.fields.push(SecretField {
            name: name.to_string(),
            kind: SecretKind::Number,
            required: true,
        });
        self
    }

    pub fn optional_string(mut self, name: &str) -> Self {
        self.fields.push(SecretField {
            name: name.to_string(),
            kind: SecretKind::String,
            required: false,
        });
        self
    }

    /// Schema of the bucket credentials stored under one unique id
    pub fn s3() -> Self {
        Self::new()
            .string("key_id")
            .string("secret")
            .string("region")
            .string("bucket")
            .optional_string("endpoint")
    }
}

/// Supplies typed secrets per source
///
/// Missing required fields are reported as `EngineError::Secrets`, never as a
/// panic.
pub trait SecretStore: Send + Sync {
    fn get(&self, unique_id: &str, schema: &SecretSchema) -> Result<Map<String, JsonValue>>;

    /// Bucket credentials stored under `key` (conventionally `s3`)
    fn s3_credentials(&self, key: &str) -> Result<S3Credentials> {
        let secrets = self.get(key, &SecretSchema::s3())?;
        serde_json::from_value(JsonValue::Object(secrets))
            .map_err(|e| EngineError::Secrets(format!("Error getting S3 credentials: {}", e)))
    }
}

/// Reads `<PREFIX>_<UNIQUE_ID>_<KEY>` environment variables
pub struct EnvVarSecretStore {
    prefix: String,
    vars: Option<HashMap<String, String>>,
}

impl EnvVarSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            vars: None,
        }
    }

    /// Resolve against a fixed set of variables instead of the process environment
    pub fn with_vars(prefix: impl Into<String>, vars: HashMap<String, String>) -> Self {
        Self {
            prefix: prefix.into(),
            vars: Some(vars),
        }
    }

    pub fn var_name(&self, unique_id: &str, key: &str) -> String {
        format!(
            "{}_{}_{}",
            self.prefix,
            env_segment(unique_id),
            env_segment(key)
        )
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match &self.vars {
            Some(vars) => vars.get(name).cloned(),
            None => std::env::var(name).ok(),
        }
        .filter(|value| !value.is_empty())
    }
}

fn env_segment(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

impl SecretStore for EnvVarSecretStore {
    fn get(&self, unique_id: &str, schema: &SecretSchema) -> Result<Map<String, JsonValue>> {
        let mut secrets = Map::new();
        for field in &schema.fields {
            let name = self.var_name(unique_id, &field.name);
            match self.lookup(&name) {
                Some(raw) => {
                    let value = match field.kind {
                        SecretKind::String => JsonValue::String(raw),
                        SecretKind::Number => JsonValue::Number(parse_number(&raw).ok_or_else(|| {
                            EngineError::Secrets(format!(
                                "Connector {} environment variable {} is not a number",
                                unique_id, name
                            ))
                        })?),
                    };
                    secrets.insert(field.name.clone(), value);
                }
                None if field.required => {
                    warn!("Connector {} missing environment variable {}", unique_id, name);
                    return Err(EngineError::Secrets(format!(
                        "Connector {} missing environment variable {}",
                        unique_id, name
                    )));
                }
                None => {}
            }
        }
        Ok(secrets)
    }
}

fn parse_number(raw: &str) -> Option<Number> {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Number::from(i));
    }
    raw.parse::<f64>().ok().and_then(Number::from_f64)
}

/// Secrets from a YAML file keyed by unique id at the top level
///
/// A missing or unreadable file behaves like an empty one.
pub struct YamlFileSecretStore {
    path: PathBuf,
}

impl YamlFileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> serde_yaml::Mapping {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return serde_yaml::Mapping::new();
        };
        match serde_yaml::from_str::<serde_yaml::Value>(&contents) {
            Ok(serde_yaml::Value::Mapping(mapping)) => mapping,
            Ok(_) => serde_yaml::Mapping::new(),
            Err(e) => {
                warn!("Failed to parse secrets file {}: {}", self.path.display(), e);
                serde_yaml::Mapping::new()
            }
        }
    }
}

impl SecretStore for YamlFileSecretStore {
    fn get(&self, unique_id: &str, schema: &SecretSchema) -> Result<Map<String, JsonValue>> {
        let data = self.load();
        let section = data.get(unique_id).and_then(|v| v.as_mapping());

        let mut secrets = Map::new();
        for field in &schema.fields {
            let value = section.and_then(|s| s.get(field.name.as_str()));
            let parsed = match (field.kind, value) {
                (_, None) | (_, Some(serde_yaml::Value::Null)) => None,
                (SecretKind::String, Some(serde_yaml::Value::String(s))) => {
                    Some(JsonValue::String(s.clone()))
                }
                (SecretKind::Number, Some(serde_yaml::Value::Number(n))) => {
                    let number = if let Some(i) = n.as_i64() {
                        Some(Number::from(i))
                    } else {
                        n.as_f64().and_then(Number::from_f64)
                    };
                    number.map(JsonValue::Number)
                }
                (kind, Some(other)) => {
                    return Err(EngineError::Secrets(format!(
                        "Error parsing secrets: {}.{} expected {:?}, got {:?}",
                        unique_id, field.name, kind, other
                    )));
                }
            };

            match parsed {
                Some(value) => {
                    secrets.insert(field.name.clone(), value);
                }
                None if field.required => {
                    warn!("Secrets for {} are missing {}", unique_id, field.name);
                    return Err(EngineError::Secrets(format!(
                        "Error parsing secrets: {}.{} is required",
                        unique_id, field.name
                    )));
                }
                None => {}
            }
        }
        Ok(secrets)
    }
}
