//! Feature view and entity definitions loaded from a YAML registry file.

use crate::config::RegistryConfig;
use crate::error::ProviderError;
use crate::feast::types::EntityKey;
use crate::model::{DataSource, Entity, EntityIdValue, FeatureView, Field};
use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RegistryDef {
    #[serde(default)]
    entities: Vec<Entity>,
    #[serde(default)]
    feature_views: Vec<FeatureViewDef>,
}

#[derive(Debug, Deserialize)]
struct FeatureViewDef {
    name: String,
    /// Entity names, resolved to their join keys.
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    ttl_seconds: Option<i64>,
    features: Vec<Field>,
    batch_source: DataSource,
}

#[derive(Debug, Clone)]
pub struct FileRegistry {
    entities: HashMap<String, Entity>,
    feature_views: Vec<FeatureView>,
}

impl FileRegistry {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let def: RegistryDef = serde_saphyr::from_str(yaml).map_err(|err| anyhow!(err))?;
        let entities: HashMap<String, Entity> = def
            .entities
            .into_iter()
            .map(|entity| (entity.name.clone(), entity))
            .collect();
        let feature_views = def
            .feature_views
            .into_iter()
            .map(|fv| -> std::result::Result<FeatureView, ProviderError> {
                let join_keys = fv
                    .entities
                    .iter()
                    .map(|name| {
                        entities
                            .get(name)
                            .map(|entity| entity.join_key.clone())
                            .ok_or_else(|| {
                                ProviderError::configuration(format!(
                                    "Feature view '{}' references unknown entity '{}'",
                                    fv.name, name
                                ))
                            })
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if let DataSource::BigQuery(source) = &fv.batch_source {
                    let mut targets = HashSet::new();
                    for feature in source.field_mapping.values() {
                        if !targets.insert(feature.as_str()) {
                            return Err(ProviderError::configuration(format!(
                                "Feature view '{}' maps more than one source column to '{}'",
                                fv.name, feature
                            )));
                        }
                    }
                }
                let ttl = match fv.ttl_seconds {
                    None | Some(0) => None,
                    Some(seconds) if seconds > 0 => {
                        Some(Duration::try_seconds(seconds).ok_or_else(|| {
                            ProviderError::configuration(format!(
                                "Feature view '{}' has out of range ttl_seconds {}",
                                fv.name, seconds
                            ))
                        })?)
                    }
                    Some(seconds) => {
                        return Err(ProviderError::configuration(format!(
                            "Feature view '{}' has negative ttl_seconds {}",
                            fv.name, seconds
                        )));
                    }
                };
                Ok(FeatureView {
                    name: fv.name,
                    entities: join_keys,
                    features: fv.features,
                    ttl,
                    batch_source: fv.batch_source,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            entities,
            feature_views,
        })
    }

    pub fn from_path(path: &str) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry file {}", path))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn feature_views(&self) -> &[FeatureView] {
        &self.feature_views
    }

    pub fn get_feature_view(&self, name: &str) -> Result<&FeatureView> {
        self.feature_views
            .iter()
            .find(|fv| fv.name == name)
            .ok_or_else(|| ProviderError::feature_view_not_found(name).into())
    }

    pub fn entity_by_join_key(&self, join_key: &str) -> Option<&Entity> {
        self.entities.values().find(|e| e.join_key == join_key)
    }

    /// Builds the entity key of `view` from a JSON object holding one value
    /// per join key, typed as declared by the entity.
    pub fn entity_key(
        &self,
        view: &FeatureView,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<EntityKey> {
        let mut key = EntityKey {
            join_keys: Vec::with_capacity(view.entities.len()),
            entity_values: Vec::with_capacity(view.entities.len()),
        };
        for join_key in &view.entities {
            let entity = self
                .entity_by_join_key(join_key)
                .ok_or_else(|| anyhow!("No entity with join key '{}'", join_key))?;
            let raw = values
                .get(join_key)
                .ok_or_else(|| anyhow!("Missing entity value '{}'", join_key))?;
            let id: EntityIdValue = serde_json::from_value(raw.clone())
                .with_context(|| format!("Invalid entity value for '{}'", join_key))?;
            key.join_keys.push(join_key.clone());
            key.entity_values.push(id.to_proto_value(entity.value_type)?);
        }
        Ok(key)
    }
}

pub fn get_registry(conf: &RegistryConfig, cwd: Option<&str>) -> Result<FileRegistry> {
    let mut path_buf = PathBuf::new();
    path_buf.push(cwd.unwrap_or(""));
    path_buf.push(conf.path.as_str());
    let path = path_buf
        .to_str()
        .ok_or_else(|| anyhow!("Registry path is not valid UTF-8"))?;
    debug!("Loading registry from {}", path);
    FileRegistry::from_path(path)
}
