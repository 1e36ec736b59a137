use crate::error::ProviderError;
use crate::model::StoredRow;
use crate::onlinestore::{Datastore, DatastoreTransaction, RowKey};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Pool, Row, Sqlite, Transaction};
use std::str::FromStr;
use tracing::debug;

const CREATE_ROWS_TABLE: &str = "CREATE TABLE IF NOT EXISTS feast_online_rows (\
     project TEXT NOT NULL, \
     table_name TEXT NOT NULL, \
     row_id TEXT NOT NULL, \
     entity_key BLOB NOT NULL, \
     feature_values BLOB NOT NULL, \
     event_ts TIMESTAMP NOT NULL, \
     created_ts TIMESTAMP, \
     PRIMARY KEY (project, table_name, row_id))";

const SELECT_ROW: &str = "SELECT entity_key, feature_values, event_ts, created_ts \
     FROM feast_online_rows WHERE project = ? AND table_name = ? AND row_id = ?";

const UPSERT_ROW: &str = "INSERT INTO feast_online_rows \
     (project, table_name, row_id, entity_key, feature_values, event_ts, created_ts) \
     VALUES (?, ?, ?, ?, ?, ?, ?) \
     ON CONFLICT (project, table_name, row_id) DO UPDATE SET \
     entity_key = excluded.entity_key, \
     feature_values = excluded.feature_values, \
     event_ts = excluded.event_ts, \
     created_ts = excluded.created_ts";

pub struct ConnectionOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub busy_timeout: Duration,
    pub test_before_acquire: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::seconds(5),
            idle_timeout: Duration::seconds(600),
            busy_timeout: Duration::seconds(5),
            test_before_acquire: true,
        }
    }
}

#[derive(Debug)]
pub struct SqliteStoreRow {
    pub entity_key: Vec<u8>,
    pub feature_values: Vec<u8>,
    pub event_ts: DateTime<Utc>,
    pub created_ts: Option<DateTime<Utc>>,
}

impl SqliteStoreRow {
    fn try_into_stored_row(self, key: &RowKey) -> Result<StoredRow> {
        let Self {
            entity_key,
            feature_values,
            event_ts,
            created_ts,
        } = self;
        let values = StoredRow::values_from_blob(&feature_values)
            .with_context(|| format!("Failed to decode feature values of row {}", key))?;
        Ok(StoredRow {
            key: entity_key,
            values,
            event_ts,
            created_ts,
        })
    }
}

impl FromRow<'_, SqliteRow> for SqliteStoreRow {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let entity_key: Vec<u8> = row.try_get("entity_key")?;
        let feature_values: Vec<u8> = row.try_get("feature_values")?;
        let event_ts: DateTime<Utc> = row.try_get("event_ts")?;
        let created_ts: Option<DateTime<Utc>> = row.try_get("created_ts")?;
        Ok(Self {
            entity_key,
            feature_values,
            event_ts,
            created_ts,
        })
    }
}

/// SQLite lock contention (`SQLITE_BUSY`, `SQLITE_LOCKED` and their extended
/// codes) is the SQLite flavour of a transactional write conflict.
fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    }
}

fn map_sqlx_error(err: sqlx::Error, key: &RowKey) -> anyhow::Error {
    if is_lock_contention(&err) {
        return ProviderError::write_conflict(key.table.clone()).into();
    }
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ProviderError::store_unavailable(err.to_string()).into()
        }
        other => anyhow::Error::new(other).context(format!("SQLite error on row {}", key)),
    }
}

pub struct SqliteDatastore {
    connection_pool: Pool<Sqlite>,
}

impl SqliteDatastore {
    pub async fn from_options(path: &str, connection_options: ConnectionOptions) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .busy_timeout(
                connection_options
                    .busy_timeout
                    .to_std()
                    .unwrap_or_else(|_| std::time::Duration::from_secs(0)),
            );
        let pool = SqlitePoolOptions::new()
            .max_connections(connection_options.max_connections)
            .min_connections(connection_options.min_connections)
            .acquire_timeout(
                connection_options
                    .acquire_timeout
                    .to_std()
                    .unwrap_or_else(|_| std::time::Duration::from_secs(0)),
            )
            .idle_timeout(
                connection_options
                    .idle_timeout
                    .to_std()
                    .unwrap_or_else(|_| std::time::Duration::from_secs(0)),
            )
            .test_before_acquire(connection_options.test_before_acquire)
            .connect_with(connect_options)
            .await
            .map_err(|e| ProviderError::store_unavailable(e.to_string()))?;
        sqlx::query(CREATE_ROWS_TABLE)
            .execute(&pool)
            .await
            .context("Failed to create online rows table")?;
        debug!("SQLite online store ready at {}", path);
        Ok(Self {
            connection_pool: pool,
        })
    }
}

#[async_trait]
impl Datastore for SqliteDatastore {
    async fn begin(&self) -> Result<Box<dyn DatastoreTransaction>> {
        // Writers take the write lock at BEGIN and wait on the busy timeout.
        let tx = self
            .connection_pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| {
                if is_lock_contention(&e) {
                    ProviderError::write_conflict("feast_online_rows").into()
                } else {
                    anyhow::Error::from(ProviderError::store_unavailable(e.to_string()))
                }
            })?;
        Ok(Box::new(SqliteTransaction {
            tx,
            last_table: String::new(),
        }))
    }

    async fn get(&self, key: &RowKey) -> Result<Option<StoredRow>> {
        let row: Option<SqliteStoreRow> = sqlx::query_as(SELECT_ROW)
            .bind(&key.project)
            .bind(&key.table)
            .bind(&key.row_id)
            .fetch_optional(&self.connection_pool)
            .await
            .map_err(|e| map_sqlx_error(e, key))?;
        row.map(|r| r.try_into_stored_row(key)).transpose()
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    last_table: String,
}

#[async_trait]
impl DatastoreTransaction for SqliteTransaction {
    async fn get(&mut self, key: &RowKey) -> Result<Option<StoredRow>> {
        self.last_table.clone_from(&key.table);
        let row: Option<SqliteStoreRow> = sqlx::query_as(SELECT_ROW)
            .bind(&key.project)
            .bind(&key.table)
            .bind(&key.row_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(e, key))?;
        row.map(|r| r.try_into_stored_row(key)).transpose()
    }

    async fn put(&mut self, key: RowKey, row: StoredRow) -> Result<()> {
        self.last_table.clone_from(&key.table);
        sqlx::query(UPSERT_ROW)
            .bind(&key.project)
            .bind(&key.table)
            .bind(&key.row_id)
            .bind(&row.key)
            .bind(row.encode_values_blob())
            .bind(row.event_ts)
            .bind(row.created_ts)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(e, &key))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { tx, last_table } = *self;
        tx.commit().await.map_err(|e| {
            if is_lock_contention(&e) {
                ProviderError::write_conflict(last_table).into()
            } else {
                anyhow::Error::new(e).context("Failed to commit SQLite transaction")
            }
        })
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self { tx, .. } = *self;
        tx.rollback()
            .await
            .context("Failed to roll back SQLite transaction")
    }
}
