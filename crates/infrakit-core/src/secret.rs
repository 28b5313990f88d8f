//! Secret references and storage.
//!
//! Secrets are referenced by name in app definitions and never embedded in
//! synthesized templates: templates carry a dynamic reference that the
//! provider resolves at deploy time. Pipeline actions that need a secret
//! locally (e.g. a source token) resolve it through a [`SecretStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, Result};

/// A reference to a secret by id, optionally to one JSON field of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub secret_id: String,
    pub json_field: Option<String>,
}

impl SecretRef {
    pub fn new(secret_id: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            json_field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.json_field = Some(field.into());
        self
    }

    /// Dynamic reference resolved by the provider at deploy time.
    pub fn dynamic_reference(&self) -> String {
        format!(
            "{{{{resolve:secretsmanager:{}:SecretString:{}}}}}",
            self.secret_id,
            self.json_field.as_deref().unwrap_or("")
        )
    }
}

/// A secret value (can be a single string or key-value pairs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecretValue {
    /// A single secret string.
    String(String),
    /// A map of key-value pairs.
    Map(HashMap<String, String>),
}

impl SecretValue {
    /// Parse a raw secret string: JSON objects become maps.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw) {
            Ok(object) => SecretValue::Map(
                object
                    .into_iter()
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        (k, value)
                    })
                    .collect(),
            ),
            Err(_) => SecretValue::String(raw.to_string()),
        }
    }

    /// Get a specific key from a map secret.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            SecretValue::String(s) if key.is_empty() => Some(s),
            SecretValue::Map(m) => m.get(key).map(|s| s.as_str()),
            _ => None,
        }
    }
}

/// Trait for secret storage backends.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Get a secret by id.
    async fn get(&self, secret_id: &str) -> Result<SecretValue>;

    /// Get a specific key from a secret.
    async fn get_key(&self, secret_id: &str, key: &str) -> Result<String> {
        let value = self.get(secret_id).await?;
        value
            .get(key)
            .map(String::from)
            .ok_or_else(|| Error::Secret(format!("secret '{}' has no field '{}'", secret_id, key)))
    }

    /// Resolve a reference to its plaintext value.
    async fn resolve(&self, reference: &SecretRef) -> Result<String> {
        match &reference.json_field {
            Some(field) => self.get_key(&reference.secret_id, field).await,
            None => match self.get(&reference.secret_id).await? {
                SecretValue::String(s) => Ok(s),
                SecretValue::Map(_) => Err(Error::Secret(format!(
                    "secret '{}' is a map; a json field is required",
                    reference.secret_id
                ))),
            },
        }
    }
}

/// Reads secrets from environment variables.
///
/// Secret `asset-test` is read from `INFRAKIT_SECRET_ASSET_TEST`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub const DEFAULT_PREFIX: &'static str = "INFRAKIT_SECRET_";

    pub fn new() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, secret_id: &str) -> String {
        let suffix: String = secret_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, secret_id: &str) -> Result<SecretValue> {
        let var = self.variable_name(secret_id);
        std::env::var(&var)
            .map(|raw| SecretValue::parse(&raw))
            .map_err(|_| Error::Secret(format!("secret '{}' not set (expected ${})", secret_id, var)))
    }
}

/// In-memory secret store.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, SecretValue>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, secret_id: impl Into<String>, value: SecretValue) -> Self {
        self.secrets.insert(secret_id.into(), value);
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get(&self, secret_id: &str) -> Result<SecretValue> {
        self.secrets
            .get(secret_id)
            .cloned()
            .ok_or_else(|| Error::Secret(format!("secret '{}' not found", secret_id)))
    }
}
