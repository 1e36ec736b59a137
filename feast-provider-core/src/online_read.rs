use crate::config::EntityKeySerializationVersion;
use crate::feast::types::EntityKey;
use crate::key_serialization::compute_entity_id;
use crate::model::OnlineReadResult;
use crate::onlinestore::{Datastore, RowKey};
use anyhow::{Result, anyhow};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

/// Point reads of online rows by entity key.
pub struct OnlineReader {
    store: Arc<dyn Datastore>,
    project: String,
    key_version: EntityKeySerializationVersion,
    concurrency: usize,
}

impl OnlineReader {
    pub fn new(
        store: Arc<dyn Datastore>,
        project: impl Into<String>,
        key_version: EntityKeySerializationVersion,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            project: project.into(),
            key_version,
            concurrency: concurrency.max(1),
        }
    }

    /// Returns one `(event_ts, values)` pair per key, in input order.
    /// Keys without a stored row map to `(None, None)`.
    pub async fn read(
        &self,
        table: &str,
        entity_keys: &[EntityKey],
    ) -> Result<Vec<OnlineReadResult>> {
        let row_keys = entity_keys
            .iter()
            .map(|key| {
                compute_entity_id(key, self.key_version)
                    .map(|row_id| RowKey::new(self.project.as_str(), table, row_id))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Reading {} rows from {}", row_keys.len(), table);

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();
        for (index, row_key) in row_keys.into_iter().enumerate() {
            let store = self.store.clone();
            let permits = permits.clone();
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                let row = store.get(&row_key).await?;
                let result: OnlineReadResult = match row {
                    Some(row) => (Some(row.event_ts), Some(row.decode_values()?)),
                    None => (None, None),
                };
                Ok::<_, anyhow::Error>((index, result))
            });
        }

        let mut results: Vec<OnlineReadResult> = vec![(None, None); entity_keys.len()];
        while let Some(res) = join_set.join_next().await {
            let (index, result) =
                res.map_err(|e| anyhow!("Error joining online read task: {:?}", e))??;
            results[index] = result;
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OnlineWriteConfig;
    use crate::feast::types::Value;
    use crate::feast::types::value::Val;
    use crate::model::WriteRecord;
    use crate::online_write::OnlineWriter;
    use crate::onlinestore::memory::InMemoryDatastore;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn customer_key(id: &str) -> EntityKey {
        EntityKey {
            join_keys: vec!["customer_id".to_string()],
            entity_values: vec![Value {
                val: Some(Val::StringVal(id.to_string())),
            }],
        }
    }

    fn age(years: i64) -> HashMap<String, Value> {
        HashMap::from([(
            "age".to_string(),
            Value {
                val: Some(Val::Int64Val(years)),
            },
        )])
    }

    #[tokio::test]
    async fn read_preserves_order_and_reports_missing() -> Result<()> {
        let store: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let writer = OnlineWriter::new(
            store.clone(),
            "retail",
            EntityKeySerializationVersion::V3,
            OnlineWriteConfig::default(),
        )?;
        let event_ts = Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap();
        let records = ["c1", "c2", "c3"]
            .iter()
            .zip([31, 42, 57])
            .map(|(id, years)| WriteRecord::new(customer_key(id), age(years), event_ts, None))
            .collect();
        writer.write_batch("customer_profile", records, None).await?;

        let reader = OnlineReader::new(store, "retail", EntityKeySerializationVersion::V3, 2);
        let keys: Vec<EntityKey> = ["c3", "missing", "c1", "c2", "c3"]
            .into_iter()
            .map(customer_key)
            .collect();
        let results = reader.read("customer_profile", &keys).await?;

        assert_eq!(results.len(), keys.len());
        assert_eq!(results[0], (Some(event_ts), Some(age(57))));
        assert_eq!(results[1], (None, None));
        assert_eq!(results[2], (Some(event_ts), Some(age(31))));
        assert_eq!(results[3], (Some(event_ts), Some(age(42))));
        assert_eq!(results[4], results[0]);
        Ok(())
    }

    #[tokio::test]
    async fn read_from_other_table_misses() -> Result<()> {
        let store: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let writer = OnlineWriter::new(
            store.clone(),
            "retail",
            EntityKeySerializationVersion::V3,
            OnlineWriteConfig::default(),
        )?;
        let event_ts = Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap();
        writer
            .write_batch(
                "customer_profile",
                vec![WriteRecord::new(customer_key("c1"), age(30), event_ts, None)],
                None,
            )
            .await?;
        let reader = OnlineReader::new(store, "retail", EntityKeySerializationVersion::V3, 10);
        let results = reader.read("driver_stats", &[customer_key("c1")]).await?;
        assert_eq!(results, vec![(None, None)]);
        assert!(reader.read("customer_profile", &[]).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_key_fails_before_reading() {
        let store: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let reader = OnlineReader::new(store, "retail", EntityKeySerializationVersion::V3, 10);
        let key = EntityKey {
            join_keys: vec!["customer_id".to_string(), "region".to_string()],
            entity_values: vec![Value {
                val: Some(Val::StringVal("c1".to_string())),
            }],
        };
        assert!(reader.read("customer_profile", &[key]).await.is_err());
    }
}
