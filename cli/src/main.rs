use crate::cli_options::{CliCommand, CliOptions, EntityInput};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::Parser;
use feast_provider_core::config::{Provider, RepoConfig};
use feast_provider_core::model::{DataSource, FeatureView, ValueWrapper, WriteRecord, value_from_json};
use feast_provider_core::offline_store::LocalOfflineEngine;
use feast_provider_core::online_write::ProgressCallback;
use feast_provider_core::provider::{DatastoreProvider, EntityDataset};
use feast_provider_core::registry::FileRegistry;
use feast_provider_core::table::parse_timestamp;
use serde_json::{Map, Value as Json, json};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli_options;

const FEATURE_REPO_DIR_ENV_VAR_NAME: &str = "FEATURE_REPO_DIR_ENV_VAR";
const FEAST_FS_YAML_FILE_PATH_ENV_VAR: &str = "FEAST_FS_YAML_FILE_PATH";
const DEFAULT_FEATURE_STORE_FILE_NAME: &str = "feature_store.yaml";
const EVENT_TIMESTAMP_FIELD: &str = "event_timestamp";
const CREATED_TIMESTAMP_FIELD: &str = "created_timestamp";

#[tokio::main]
async fn main() -> Result<()> {
    let cli_opts = CliOptions::parse();
    let CliOptions {
        chdir,
        log_level,
        feature_store_yaml,
        command,
    } = cli_opts;

    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::from(log_level).into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cwd =
        if let Some(path) = chdir.or_else(|| std::env::var(FEATURE_REPO_DIR_ENV_VAR_NAME).ok()) {
            PathBuf::from(path)
        } else {
            std::env::current_dir()?
        };
    let cwd_str = cwd
        .to_str()
        .ok_or_else(|| anyhow!("Feature repository path contains invalid UTF-8"))?;

    let feature_store_yaml = feature_store_yaml
        .or(std::env::var(FEAST_FS_YAML_FILE_PATH_ENV_VAR).ok())
        .unwrap_or(DEFAULT_FEATURE_STORE_FILE_NAME.to_string());
    let config_path = cwd.join(&feature_store_yaml);
    let yaml_str = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    let repo_config = RepoConfig::from_yaml_str(&yaml_str)?;
    if let Some(Provider::Unknown(other)) = &repo_config.provider {
        return Err(anyhow!(
            "Unsupported provider: {}, available providers: [local, gcp]",
            other
        ));
    }

    let registry =
        feast_provider_core::registry::get_registry(&repo_config.registry, Some(cwd_str))?;
    let store =
        feast_provider_core::onlinestore::get_datastore(&repo_config.online_store, Some(cwd_str))
            .await?;
    let engine = LocalOfflineEngine::from_config(
        &repo_config.offline_store,
        Some(cwd_str),
        registry.feature_views(),
    )?;
    let provider = DatastoreProvider::new(repo_config, store, Arc::new(engine))?;

    match command {
        CliCommand::Plan { features, entities } => {
            let dataset = entity_dataset(&cwd, entities)?;
            let refs: Vec<&str> = features.iter().map(String::as_str).collect();
            let job = provider
                .get_historical_features(registry.feature_views(), &refs, dataset)
                .await?;
            println!("{}", job.to_sql());
        }
        CliCommand::MaterializeLocal {
            features,
            entity_file,
        } => {
            let dataset = EntityDataset::from_path(&cwd.join(entity_file))?;
            let refs: Vec<&str> = features.iter().map(String::as_str).collect();
            let job = provider
                .get_historical_features(registry.feature_views(), &refs, dataset)
                .await?;
            let table = job.to_table().await?;
            tracing::info!("Retrieved {} rows", table.len());
            println!("{}", serde_json::to_string_pretty(&table.to_json_records())?);
        }
        CliCommand::PullLatest {
            view,
            start,
            end,
            sql,
        } => {
            let view = registry.get_feature_view(&view)?;
            let feature_columns = source_feature_columns(view);
            let job = provider.pull_latest_from_table_or_query(
                &view.batch_source,
                &view.entities,
                &feature_columns,
                parse_timestamp(&start)?,
                parse_timestamp(&end)?,
            )?;
            if sql {
                println!("{}", job.to_sql());
            } else {
                let table = job.to_table().await?;
                println!("{}", serde_json::to_string_pretty(&table.to_json_records())?);
            }
        }
        CliCommand::Write { view, file } => {
            let view = registry.get_feature_view(&view)?;
            let json = read_json_array(&cwd.join(file))?;
            let records = json
                .iter()
                .map(|row| write_record(&registry, view, row))
                .collect::<Result<Vec<_>>>()?;
            let written = Arc::new(AtomicUsize::new(0));
            let progress_counter = written.clone();
            let progress: ProgressCallback = Arc::new(move |rows: usize| {
                progress_counter.fetch_add(rows, Ordering::Relaxed);
            });
            provider
                .online_write_batch(view, records, Some(progress))
                .await?;
            println!("{}", json!({ "written": written.load(Ordering::Relaxed) }));
        }
        CliCommand::Read { view, keys } => {
            let view = registry.get_feature_view(&view)?;
            let json = read_json_array(&cwd.join(keys))?;
            let entity_keys = json
                .iter()
                .map(|row| {
                    let obj = row
                        .as_object()
                        .ok_or_else(|| anyhow!("Entity key must be a JSON object: {}", row))?;
                    registry.entity_key(view, obj)
                })
                .collect::<Result<Vec<_>>>()?;
            let results = provider.online_read(view, &entity_keys).await?;
            let output: Vec<Json> = results
                .into_iter()
                .map(|(event_ts, values)| {
                    let values = values.map(|values| {
                        values
                            .into_iter()
                            .map(|(name, value)| (name, ValueWrapper(value)))
                            .collect::<BTreeMap<_, _>>()
                    });
                    json!({
                        "event_timestamp": event_ts.map(|ts| ts.to_rfc3339()),
                        "values": values,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

fn entity_dataset(cwd: &Path, input: EntityInput) -> Result<EntityDataset> {
    match (input.entity_query, input.entity_file) {
        (Some(sql), _) => Ok(EntityDataset::Query(sql)),
        (None, Some(file)) => EntityDataset::from_path(&cwd.join(file)),
        (None, None) => Err(anyhow!("Either --entity-query or --entity-file is required")),
    }
}

/// Source column of every feature of `view`, following the field mapping.
fn source_feature_columns(view: &FeatureView) -> Vec<String> {
    view.features
        .iter()
        .map(|field| match &view.batch_source {
            DataSource::BigQuery(source) => source.source_column(&field.name).to_string(),
            _ => field.name.clone(),
        })
        .collect()
}

fn read_json_array(path: &Path) -> Result<Vec<Json>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match serde_json::from_str(&text)? {
        Json::Array(rows) => Ok(rows),
        _ => Err(anyhow!("{} must hold a JSON array", path.display())),
    }
}

fn json_timestamp(row: &Map<String, Json>, field: &str) -> Result<Option<DateTime<Utc>>> {
    match row.get(field) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) => parse_timestamp(s).map(Some),
        Some(Json::Number(n)) => {
            let seconds = n
                .as_i64()
                .ok_or_else(|| anyhow!("Invalid {}: {}", field, n))?;
            DateTime::from_timestamp(seconds, 0)
                .map(Some)
                .ok_or_else(|| anyhow!("Invalid {}: {}", field, n))
        }
        Some(other) => Err(anyhow!("Invalid {}: {}", field, other)),
    }
}

fn write_record(registry: &FileRegistry, view: &FeatureView, row: &Json) -> Result<WriteRecord> {
    let obj = row
        .as_object()
        .ok_or_else(|| anyhow!("Record must be a JSON object: {}", row))?;
    let entity_key = registry.entity_key(view, obj)?;
    let mut values = HashMap::with_capacity(view.features.len());
    for field in &view.features {
        if let Some(json) = obj.get(&field.name) {
            values.insert(field.name.clone(), value_from_json(json, field.value_type)?);
        }
    }
    let event_ts = json_timestamp(obj, EVENT_TIMESTAMP_FIELD)?
        .ok_or_else(|| anyhow!("Record is missing {}", EVENT_TIMESTAMP_FIELD))?;
    let created_ts = json_timestamp(obj, CREATED_TIMESTAMP_FIELD)?;
    Ok(WriteRecord::new(entity_key, values, event_ts, created_ts))
}
