//! Minibatched, conflict-retrying online writes.
//!
//! A batch is cut into minibatches which a fixed pool of workers drains.
//! Each minibatch is one read-modify-write transaction: every record is
//! compared against the stored row under its lookup id and only written when
//! it is not stale. Replaying an older (or equally old but less
//! authoritative) record is therefore a no-op.

use crate::config::{EntityKeySerializationVersion, OnlineWriteConfig};
use crate::error::{ProviderError, is_write_conflict};
use crate::key_serialization::compute_entity_id;
use crate::model::{StoredRow, WriteRecord};
use crate::onlinestore::{Datastore, DatastoreTransaction, RowKey};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::iter::FusedIterator;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Called with the number of rows that were written.
pub type ProgressCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Lazy, single pass chunking of a record stream. Every chunk holds
/// `batch_size` records except possibly the last one.
#[derive(Debug)]
pub struct Minibatches<I> {
    inner: I,
    batch_size: usize,
}

impl<I: Iterator> Iterator for Minibatches<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<I::Item> = self.inner.by_ref().take(self.batch_size).collect();
        if batch.is_empty() { None } else { Some(batch) }
    }
}

impl<I: FusedIterator> FusedIterator for Minibatches<I> {}

impl<I: Iterator> Minibatches<I> {
    pub fn new(inner: I, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(ProviderError::configuration("Minibatch size must be positive").into());
        }
        Ok(Self { inner, batch_size })
    }
}

pub fn to_minibatches<T: IntoIterator>(data: T, batch_size: usize) -> Result<Minibatches<T::IntoIter>> {
    Minibatches::new(data.into_iter(), batch_size)
}

/// True when the incoming record must not replace `existing`: the stored row
/// is newer, or equally new and created later.
pub fn is_stale(
    existing: &StoredRow,
    event_ts: DateTime<Utc>,
    created_ts: Option<DateTime<Utc>>,
) -> bool {
    if existing.event_ts > event_ts {
        return true;
    }
    existing.event_ts == event_ts
        && matches!(
            (existing.created_ts, created_ts),
            (Some(existing_created), Some(incoming_created)) if existing_created > incoming_created
        )
}

pub struct OnlineWriter {
    store: Arc<dyn Datastore>,
    project: String,
    key_version: EntityKeySerializationVersion,
    config: OnlineWriteConfig,
}

struct MinibatchWriter {
    store: Arc<dyn Datastore>,
    project: String,
    table: String,
    key_version: EntityKeySerializationVersion,
    max_attempts: usize,
    progress: Option<ProgressCallback>,
}

impl OnlineWriter {
    pub fn new(
        store: Arc<dyn Datastore>,
        project: impl Into<String>,
        key_version: EntityKeySerializationVersion,
        config: OnlineWriteConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            project: project.into(),
            key_version,
            config,
        })
    }

    /// Writes `data` into `table`.
    ///
    /// Minibatches succeed or fail independently: when one exhausts its
    /// attempts the others are still applied and kept, and the error of the
    /// lowest failing minibatch is returned.
    pub async fn write_batch(
        &self,
        table: &str,
        data: Vec<WriteRecord>,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let batch_count = data.len().div_ceil(self.config.batch_size);
        let worker_count = self.config.workers.min(batch_count);
        debug!(
            "Writing {} rows to {} in {} minibatches with {} workers",
            data.len(),
            table,
            batch_count,
            worker_count
        );

        let queue = Arc::new(Mutex::new(
            to_minibatches(data, self.config.batch_size)?.enumerate(),
        ));
        let writer = Arc::new(MinibatchWriter {
            store: self.store.clone(),
            project: self.project.clone(),
            table: table.to_owned(),
            key_version: self.key_version,
            max_attempts: self.config.max_attempts,
            progress,
        });

        let mut join_set: JoinSet<Vec<(usize, anyhow::Error)>> = JoinSet::new();
        for _ in 0..worker_count {
            let queue = queue.clone();
            let writer = writer.clone();
            join_set.spawn(async move {
                let mut failures = vec![];
                loop {
                    let next = queue.lock().await.next();
                    let Some((index, minibatch)) = next else {
                        break;
                    };
                    if let Err(err) = writer.write_minibatch(index, &minibatch).await {
                        failures.push((index, err));
                    }
                }
                failures
            });
        }

        let mut failures = vec![];
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(worker_failures) => failures.extend(worker_failures),
                Err(e) => return Err(anyhow!("Error joining online write task: {:?}", e)),
            }
        }
        failures.sort_by_key(|(index, _)| *index);
        for (index, err) in failures.iter().skip(1) {
            warn!("Minibatch {} of table {} also failed: {:#}", index, table, err);
        }
        match failures.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

impl MinibatchWriter {
    async fn write_minibatch(&self, index: usize, minibatch: &[WriteRecord]) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_write(minibatch).await {
                Ok(written) => {
                    if let Some(progress) = &self.progress {
                        for _ in 0..written {
                            progress(1);
                        }
                    }
                    return Ok(());
                }
                Err(err) if is_write_conflict(&err) => {
                    if attempt >= self.max_attempts {
                        warn!(
                            "Minibatch {} of table {} gave up after {} conflicting attempts: {:#}",
                            index, self.table, attempt, err
                        );
                        return Err(ProviderError::WriteFailure {
                            table: self.table.clone(),
                            minibatch: index,
                            attempts: attempt,
                        }
                        .into());
                    }
                    debug!(
                        "Write conflict on minibatch {} of table {}, attempt {}/{}",
                        index, self.table, attempt, self.max_attempts
                    );
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "Failed to write minibatch {} of table {}",
                        index, self.table
                    )));
                }
            }
        }
    }

    /// One transactional attempt. Returns the number of rows written.
    async fn try_write(&self, minibatch: &[WriteRecord]) -> Result<usize> {
        let mut tx = self.store.begin().await?;
        match self.apply(tx.as_mut(), minibatch).await {
            Ok(written) => {
                tx.commit().await?;
                Ok(written)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        "Failed to roll back minibatch on table {}: {:#}",
                        self.table, rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn DatastoreTransaction,
        minibatch: &[WriteRecord],
    ) -> Result<usize> {
        let mut written = 0;
        for record in minibatch {
            let row_id = compute_entity_id(&record.entity_key, self.key_version)?;
            let key = RowKey::new(self.project.as_str(), self.table.as_str(), row_id);
            // Reading through the transaction also sees rows put earlier in
            // this same minibatch.
            if let Some(existing) = tx.get(&key).await?
                && is_stale(&existing, record.event_ts, record.created_ts)
            {
                continue;
            }
            tx.put(key, StoredRow::from_record(record)).await?;
            written += 1;
        }
        Ok(written)
    }
}
