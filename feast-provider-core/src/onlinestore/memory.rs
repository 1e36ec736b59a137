use crate::error::ProviderError;
use crate::model::StoredRow;
use crate::onlinestore::{Datastore, DatastoreTransaction, RowKey};
use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    rows: HashMap<RowKey, Versioned>,
    clock: u64,
}

#[derive(Debug, Clone)]
struct Versioned {
    version: u64,
    row: StoredRow,
}

/// Process-local datastore with optimistic concurrency.
///
/// A transaction remembers the version of every row it read or wrote and
/// commit fails with a write conflict when any of them moved meanwhile.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatastore {
    state: Arc<RwLock<State>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn begin(&self) -> Result<Box<dyn DatastoreTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            state: self.state.clone(),
            observed: HashMap::default(),
            writes: HashMap::default(),
        }))
    }

    async fn get(&self, key: &RowKey) -> Result<Option<StoredRow>> {
        Ok(self
            .state
            .read()
            .await
            .rows
            .get(key)
            .map(|versioned| versioned.row.clone()))
    }
}

struct InMemoryTransaction {
    state: Arc<RwLock<State>>,
    // `None` records that the row did not exist when first touched.
    observed: HashMap<RowKey, Option<u64>>,
    writes: HashMap<RowKey, StoredRow>,
}

impl InMemoryTransaction {
    async fn observe(&mut self, key: &RowKey) -> Option<StoredRow> {
        let state = self.state.read().await;
        let current = state.rows.get(key);
        self.observed
            .entry(key.clone())
            .or_insert_with(|| current.map(|v| v.version));
        current.map(|v| v.row.clone())
    }
}

#[async_trait]
impl DatastoreTransaction for InMemoryTransaction {
    async fn get(&mut self, key: &RowKey) -> Result<Option<StoredRow>> {
        if let Some(row) = self.writes.get(key) {
            return Ok(Some(row.clone()));
        }
        Ok(self.observe(key).await)
    }

    async fn put(&mut self, key: RowKey, row: StoredRow) -> Result<()> {
        if !self.observed.contains_key(&key) {
            self.observe(&key).await;
        }
        self.writes.insert(key, row);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self {
            state,
            observed,
            writes,
        } = *self;
        let mut state = state.write().await;
        for (key, seen) in &observed {
            let now = state.rows.get(key).map(|v| v.version);
            if now != *seen {
                return Err(ProviderError::write_conflict(key.table.clone()).into());
            }
        }
        for (key, row) in writes {
            state.clock += 1;
            let version = state.clock;
            state.rows.insert(key, Versioned { version, row });
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
