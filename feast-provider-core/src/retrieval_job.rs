use crate::offline_store::OfflineEngine;
use crate::query_plan::{LatestPlan, PointInTimePlan, render_bigquery, render_latest_bigquery};
use crate::table::Table;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum OfflinePlan {
    PointInTime(PointInTimePlan),
    Latest(LatestPlan),
}

/// A plan together with the SQL it renders to.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineQuery {
    pub plan: OfflinePlan,
    pub sql: String,
}

impl OfflineQuery {
    pub fn point_in_time(plan: PointInTimePlan) -> Self {
        let sql = render_bigquery(&plan);
        Self {
            plan: OfflinePlan::PointInTime(plan),
            sql,
        }
    }

    pub fn latest(plan: LatestPlan) -> Self {
        let sql = render_latest_bigquery(&plan);
        Self {
            plan: OfflinePlan::Latest(plan),
            sql,
        }
    }
}

/// Deferred offline query. Nothing runs until [`RetrievalJob::to_table`] is
/// awaited, and every call runs the query again.
pub struct RetrievalJob {
    engine: Arc<dyn OfflineEngine>,
    query: OfflineQuery,
}

impl std::fmt::Debug for RetrievalJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalJob")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

impl RetrievalJob {
    pub fn new(engine: Arc<dyn OfflineEngine>, query: OfflineQuery) -> Self {
        Self { engine, query }
    }

    pub fn query(&self) -> &OfflineQuery {
        &self.query
    }

    pub fn to_sql(&self) -> &str {
        &self.query.sql
    }

    pub async fn to_table(&self) -> Result<Table> {
        debug!("Executing offline query on engine");
        self.engine.execute(&self.query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_plan::{SourceRelation, TimeWindow};
    use crate::table::Cell;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        executions: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl OfflineEngine for CountingEngine {
        async fn execute(&self, _query: &OfflineQuery) -> Result<Table> {
            let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(anyhow!("quota exceeded"));
            }
            Table::new(vec!["n".to_string()], vec![vec![Cell::Int(n as i64)]])
        }

        async fn upload_entity_table(&self, _project: &str, _table: &Table) -> Result<String> {
            Err(anyhow!("not supported"))
        }
    }

    fn latest_query() -> OfflineQuery {
        OfflineQuery::latest(LatestPlan {
            source: SourceRelation::Table("feast.driver_stats".to_string()),
            join_keys: vec!["driver_id".to_string()],
            feature_columns: vec!["conv_rate".to_string()],
            event_timestamp_column: "event_ts".to_string(),
            created_timestamp_column: None,
            window: TimeWindow::new(
                Utc.timestamp_opt(0, 0).unwrap(),
                Utc.timestamp_opt(10, 0).unwrap(),
            )
            .unwrap(),
        })
    }

    #[tokio::test]
    async fn job_is_lazy_and_not_cached() -> Result<()> {
        let engine = Arc::new(CountingEngine::default());
        let job = RetrievalJob::new(engine.clone(), latest_query());
        assert_eq!(engine.executions.load(Ordering::SeqCst), 0);
        assert!(job.to_sql().contains("_feast_row = 1"));

        assert_eq!(job.to_table().await?.rows, vec![vec![Cell::Int(1)]]);
        assert_eq!(job.to_table().await?.rows, vec![vec![Cell::Int(2)]]);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_job_never_runs() {
        let engine = Arc::new(CountingEngine::default());
        drop(RetrievalJob::new(engine.clone(), latest_query()));
        assert_eq!(engine.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn engine_errors_propagate() {
        let engine = Arc::new(CountingEngine {
            fail: true,
            ..CountingEngine::default()
        });
        let job = RetrievalJob::new(engine, latest_query());
        let err = job.to_table().await.unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
    }
}
