use crate::error::ProviderError;
use anyhow::{Result, anyhow};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Provider {
    Local,
    GCP,
    Unknown(String),
}

impl Serialize for Provider {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Provider::Local => serializer.serialize_str("local"),
            Provider::GCP => serializer.serialize_str("gcp"),
            Provider::Unknown(other) => serializer.serialize_str(other.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Provider {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        let normalized = value.to_ascii_lowercase();
        let provider = match normalized.as_str() {
            "local" => Provider::Local,
            "gcp" => Provider::GCP,
            _ => Provider::Unknown(value),
        };
        Ok(provider)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RegistryConfigDef")]
pub struct RegistryConfig {
    pub path: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RegistryConfigDef {
    Path(String),
    Detailed { path: String },
}

impl From<RegistryConfigDef> for RegistryConfig {
    fn from(value: RegistryConfigDef) -> Self {
        match value {
            RegistryConfigDef::Path(path) | RegistryConfigDef::Detailed { path } => {
                RegistryConfig { path }
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnlineStoreConfig {
    #[default]
    InMemory,
    Sqlite {
        path: String,
    },
}

/// Offline tables the local engine can evaluate plans against,
/// keyed by the `table_ref` used in feature view sources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OfflineStoreConfig {
    Local {
        #[serde(default)]
        tables: BTreeMap<String, String>,
    },
}

impl Default for OfflineStoreConfig {
    fn default() -> Self {
        OfflineStoreConfig::Local {
            tables: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OnlineWriteConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

/// Largest number of records committed in one transaction.
pub const MAX_BATCH_SIZE: usize = 50;

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_workers() -> usize {
    10
}

fn default_max_attempts() -> usize {
    3
}

impl Default for OnlineWriteConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl OnlineWriteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.workers == 0 || self.max_attempts == 0 {
            return Err(ProviderError::configuration(format!(
                "online_write values must be positive, got batch_size={}, workers={}, max_attempts={}",
                self.batch_size, self.workers, self.max_attempts
            ))
            .into());
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(ProviderError::configuration(format!(
                "online_write.batch_size must be at most {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum EntityKeySerializationVersion {
    V1,
    V2,
    #[default]
    V3,
}

impl From<EntityKeySerializationVersion> for u64 {
    fn from(value: EntityKeySerializationVersion) -> Self {
        match value {
            EntityKeySerializationVersion::V1 => 1,
            EntityKeySerializationVersion::V2 => 2,
            EntityKeySerializationVersion::V3 => 3,
        }
    }
}

impl TryFrom<u64> for EntityKeySerializationVersion {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EntityKeySerializationVersion::V1),
            2 => Ok(EntityKeySerializationVersion::V2),
            3 => Ok(EntityKeySerializationVersion::V3),
            _ => Err(format!(
                "unsupported entity_key_serialization_version {}",
                value
            )),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoConfig {
    pub project: String,
    pub project_description: Option<String>,
    pub provider: Option<Provider>,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub online_store: OnlineStoreConfig,
    #[serde(default)]
    pub offline_store: OfflineStoreConfig,
    #[serde(default)]
    pub entity_key_serialization_version: EntityKeySerializationVersion,
    #[serde(default)]
    pub online_write: OnlineWriteConfig,
}

impl RepoConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Err(anyhow!("Empty configuration file"));
        }
        let config: RepoConfig = serde_saphyr::from_str(yaml).map_err(|err| anyhow!(err))?;
        config.online_write.validate()?;
        Ok(config)
    }
}
