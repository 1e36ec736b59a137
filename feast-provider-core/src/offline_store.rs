//! Analytical engine seam and its in-process implementation.

pub mod evaluate;

use crate::config::OfflineStoreConfig;
use crate::model::{DataSource, FeatureView};
use crate::query_plan::{EntitySource, SourceRelation};
use crate::retrieval_job::{OfflinePlan, OfflineQuery};
use crate::table::Table;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap as HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait OfflineEngine: Send + Sync + 'static {
    async fn execute(&self, query: &OfflineQuery) -> Result<Table>;

    /// Stores an entity table and returns a reference usable as
    /// [`EntitySource::Table`].
    async fn upload_entity_table(&self, project: &str, table: &Table) -> Result<String>;
}

/// Evaluates plans over a catalog of in-memory tables keyed by table ref.
/// Sources defined by SQL text cannot be evaluated.
#[derive(Default)]
pub struct LocalOfflineEngine {
    tables: RwLock<HashMap<String, Arc<Table>>>,
    uploads: AtomicU64,
}

impl LocalOfflineEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table_ref: impl Into<String>, table: Table) -> Self {
        self.tables.get_mut().insert(table_ref.into(), Arc::new(table));
        self
    }

    pub async fn register_table(&self, table_ref: impl Into<String>, table: Table) {
        self.tables
            .write()
            .await
            .insert(table_ref.into(), Arc::new(table));
    }

    /// Loads every table of the offline store config from JSON files. The
    /// timestamp columns of a table are those its feature views declare.
    pub fn from_config(
        config: &OfflineStoreConfig,
        cwd: Option<&str>,
        feature_views: &[FeatureView],
    ) -> Result<Self> {
        let OfflineStoreConfig::Local { tables } = config;
        let mut engine = LocalOfflineEngine::new();
        for (table_ref, path) in tables {
            let timestamp_columns: Vec<&str> = feature_views
                .iter()
                .filter_map(|fv| match &fv.batch_source {
                    DataSource::BigQuery(source)
                        if source.table_ref.as_deref() == Some(table_ref.as_str()) =>
                    {
                        Some(source)
                    }
                    _ => None,
                })
                .flat_map(|source| {
                    std::iter::once(source.event_timestamp_column.as_str())
                        .chain(source.created_timestamp_column.as_deref())
                })
                .collect();
            let mut path_buf = PathBuf::new();
            path_buf.push(cwd.unwrap_or(""));
            path_buf.push(path);
            let json = fs::read_to_string(&path_buf)
                .with_context(|| format!("Failed to read offline table {}", path_buf.display()))?;
            let table = Table::from_json_records(&json, &timestamp_columns)
                .with_context(|| format!("Failed to parse offline table {}", table_ref))?;
            debug!("Loaded offline table {} with {} rows", table_ref, table.len());
            engine = engine.with_table(table_ref.clone(), table);
        }
        Ok(engine)
    }

    async fn lookup(&self, table_ref: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .await
            .get(table_ref)
            .cloned()
            .ok_or_else(|| anyhow!("Table '{}' not found in the local offline store", table_ref))
    }

    async fn source_table(&self, relation: &SourceRelation) -> Result<Arc<Table>> {
        match relation {
            SourceRelation::Table(table_ref) => self.lookup(table_ref).await,
            SourceRelation::Query(_) => Err(anyhow!(
                "Local offline store cannot run sources defined by a query"
            )),
        }
    }
}

#[async_trait]
impl OfflineEngine for LocalOfflineEngine {
    async fn execute(&self, query: &OfflineQuery) -> Result<Table> {
        match &query.plan {
            OfflinePlan::PointInTime(plan) => {
                let entity = match &plan.entity_source {
                    EntitySource::Table(table_ref) => self.lookup(table_ref).await?,
                    EntitySource::Query(_) => {
                        return Err(anyhow!(
                            "Local offline store cannot run entity queries, upload an entity table instead"
                        ));
                    }
                };
                let mut sources = Vec::with_capacity(plan.views.len());
                for view in &plan.views {
                    sources.push(self.source_table(&view.source).await?);
                }
                let source_refs: Vec<&Table> = sources.iter().map(|t| t.as_ref()).collect();
                evaluate::point_in_time(plan, &entity, &source_refs)
            }
            OfflinePlan::Latest(plan) => {
                let source = self.source_table(&plan.source).await?;
                evaluate::latest(plan, &source)
            }
        }
    }

    async fn upload_entity_table(&self, project: &str, table: &Table) -> Result<String> {
        let seq = self.uploads.fetch_add(1, Ordering::SeqCst);
        let table_ref = format!(
            "feast_{}.entity_df_{}_{}",
            project,
            Utc::now().timestamp(),
            seq
        );
        info!("Uploading {} entity rows into {}", table.len(), table_ref);
        self.register_table(table_ref.clone(), table.clone()).await;
        Ok(table_ref)
    }
}
