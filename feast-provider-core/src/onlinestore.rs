//! Transactional key-value store holding online feature rows.

pub mod memory;
pub mod sqlite_onlinestore;

use crate::config::OnlineStoreConfig;
use crate::model::StoredRow;
use crate::onlinestore::memory::InMemoryDatastore;
use crate::onlinestore::sqlite_onlinestore::{ConnectionOptions, SqliteDatastore};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Address of a row: `Project -> Table -> Row`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub project: String,
    pub table: String,
    pub row_id: String,
}

impl RowKey {
    pub fn new(
        project: impl Into<String>,
        table: impl Into<String>,
        row_id: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            table: table.into(),
            row_id: row_id.into(),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.table, self.row_id)
    }
}

#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Opens a transactional scope. Nothing done through it is visible to
    /// other readers until [`DatastoreTransaction::commit`] succeeds.
    async fn begin(&self) -> Result<Box<dyn DatastoreTransaction>>;

    /// Point read outside of any transaction.
    async fn get(&self, key: &RowKey) -> Result<Option<StoredRow>>;
}

/// A write conflict may surface from any method, not only from `commit`.
/// It is reported as [`crate::error::ProviderError::WriteConflict`].
#[async_trait]
pub trait DatastoreTransaction: Send {
    /// Reads a row, observing puts made earlier in this transaction.
    async fn get(&mut self, key: &RowKey) -> Result<Option<StoredRow>>;

    async fn put(&mut self, key: RowKey, row: StoredRow) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

pub async fn get_datastore(
    online_store_config: &OnlineStoreConfig,
    cwd: Option<&str>,
) -> Result<Arc<dyn Datastore>> {
    match online_store_config {
        OnlineStoreConfig::InMemory => {
            debug!("Create in-memory online store");
            Ok(Arc::new(InMemoryDatastore::new()))
        }
        OnlineStoreConfig::Sqlite { path } => {
            debug!("Create SQLite online store with path: {}", path);
            let full_path = cwd
                .map(|prefix| format!("{}/{}", prefix, path))
                .unwrap_or_else(|| path.to_string());
            SqliteDatastore::from_options(&full_path, ConnectionOptions::default())
                .await
                .map(|sqlite| Arc::new(sqlite) as Arc<dyn Datastore>)
        }
    }
}
