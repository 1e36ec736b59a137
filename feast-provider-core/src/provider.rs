use crate::config::{EntityKeySerializationVersion, RepoConfig};
use crate::error::ProviderError;
use crate::feast::types::EntityKey;
use crate::model::{DataSource, FeatureView, OnlineReadResult, WriteRecord};
use crate::offline_store::OfflineEngine;
use crate::online_read::OnlineReader;
use crate::online_write::{OnlineWriter, ProgressCallback};
use crate::onlinestore::Datastore;
use crate::query_context::get_feature_view_query_context;
use crate::query_plan::{ENTITY_TIMESTAMP_COLUMN, EntitySource, build_latest_plan, build_point_in_time_plan};
use crate::retrieval_job::{OfflineQuery, RetrievalJob};
use crate::table::Table;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Entity rows of a historical retrieval.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityDataset {
    /// SQL producing the entity rows in the warehouse.
    Query(String),
    /// Inline rows, uploaded before the join runs.
    Table(Table),
}

impl EntityDataset {
    /// `.json` files hold inline rows, `.sql` files a query.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        match extension {
            "json" => {
                let json = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read entity file {}", path.display()))?;
                Ok(EntityDataset::Table(Table::from_json_records(
                    &json,
                    &[ENTITY_TIMESTAMP_COLUMN],
                )?))
            }
            "sql" => {
                let sql = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read entity file {}", path.display()))?;
                Ok(EntityDataset::Query(sql.trim().trim_end_matches(';').to_string()))
            }
            _ => Err(ProviderError::configuration(format!(
                "Entity dataset {} must be a .json table or a .sql query",
                path.display()
            ))
            .into()),
        }
    }
}

/// Online and offline operations of one feature repository, bound to
/// explicit store and engine handles.
pub struct DatastoreProvider {
    config: RepoConfig,
    store: Arc<dyn Datastore>,
    engine: Arc<dyn OfflineEngine>,
}

impl DatastoreProvider {
    pub fn new(
        config: RepoConfig,
        store: Arc<dyn Datastore>,
        engine: Arc<dyn OfflineEngine>,
    ) -> Result<Self> {
        config.online_write.validate()?;
        if config.entity_key_serialization_version != EntityKeySerializationVersion::V3 {
            return Err(ProviderError::configuration(format!(
                "entity_key_serialization_version {} is not supported, use 3",
                u64::from(config.entity_key_serialization_version)
            ))
            .into());
        }
        Ok(Self {
            config,
            store,
            engine,
        })
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub async fn online_write_batch(
        &self,
        table: &FeatureView,
        data: Vec<WriteRecord>,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let writer = OnlineWriter::new(
            self.store.clone(),
            self.config.project.as_str(),
            self.config.entity_key_serialization_version,
            self.config.online_write.clone(),
        )?;
        let rows = data.len();
        writer.write_batch(&table.name, data, progress).await?;
        info!("Wrote {} rows into online table {}", rows, table.name);
        Ok(())
    }

    pub async fn online_read(
        &self,
        table: &FeatureView,
        entity_keys: &[EntityKey],
    ) -> Result<Vec<OnlineReadResult>> {
        OnlineReader::new(
            self.store.clone(),
            self.config.project.as_str(),
            self.config.entity_key_serialization_version,
            self.config.online_write.workers,
        )
        .read(&table.name, entity_keys)
        .await
    }

    /// Builds the point-in-time join of `feature_refs` onto the entity rows.
    /// Everything is validated before the engine is contacted; an inline
    /// table is uploaded and its event timestamps bound the source window.
    pub async fn get_historical_features(
        &self,
        feature_views: &[FeatureView],
        feature_refs: &[&str],
        entity_dataset: EntityDataset,
    ) -> Result<RetrievalJob> {
        let contexts = get_feature_view_query_context(feature_refs, feature_views)?;
        let (entity_source, min_timestamp, max_timestamp) = match entity_dataset {
            EntityDataset::Query(sql) => {
                let (min, max) = default_window(Utc::now());
                (EntitySource::Query(sql), min, max)
            }
            EntityDataset::Table(table) => {
                let (min, max) = table
                    .timestamp_range(ENTITY_TIMESTAMP_COLUMN)?
                    .unwrap_or_else(|| default_window(Utc::now()));
                let table_ref = self
                    .engine
                    .upload_entity_table(&self.config.project, &table)
                    .await?;
                (EntitySource::Table(table_ref), min, max)
            }
        };
        debug!(
            "Planning point-in-time join of {} views between {} and {}",
            contexts.len(),
            min_timestamp,
            max_timestamp
        );
        let plan = build_point_in_time_plan(&contexts, min_timestamp, max_timestamp, entity_source)?;
        Ok(RetrievalJob::new(
            self.engine.clone(),
            OfflineQuery::point_in_time(plan),
        ))
    }

    /// Latest row per entity of `data_source` with an event timestamp in
    /// `[start_date, end_date]`.
    pub fn pull_latest_from_table_or_query(
        &self,
        data_source: &DataSource,
        join_keys: &[String],
        feature_names: &[String],
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<RetrievalJob> {
        let DataSource::BigQuery(source) = data_source else {
            return Err(ProviderError::configuration(format!(
                "Cannot pull from a {} source, only big_query is supported",
                data_source.kind()
            ))
            .into());
        };
        let plan = build_latest_plan(source, join_keys, feature_names, start_date, end_date)?;
        Ok(RetrievalJob::new(
            self.engine.clone(),
            OfflineQuery::latest(plan),
        ))
    }
}

/// Window used when the entity timestamps are unknown.
fn default_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (now - Duration::days(365), now + Duration::days(1))
}
