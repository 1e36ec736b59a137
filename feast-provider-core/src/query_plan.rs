//! Point-in-time join plans.
//!
//! A plan is plain data describing each stage of the join. It is rendered to
//! SQL by [`render`] and evaluated in-process by the local offline engine;
//! both read the same stage definitions.

pub mod render;

use crate::error::ProviderError;
use crate::model::BigQuerySource;
use crate::query_context::{FeatureViewQueryContext, is_valid_identifier};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

pub use render::{render_bigquery, render_latest_bigquery};

/// Entity dataset column holding the query timestamps.
pub const ENTITY_TIMESTAMP_COLUMN: &str = "event_timestamp";
/// Surrogate key numbering the entity rows.
pub const ROW_NUMBER_COLUMN: &str = "row_number";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(ProviderError::configuration(format!(
                "Time window start {} is after end {}",
                start, end
            ))
            .into());
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// Where the entity rows come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitySource {
    /// SQL text producing the entity rows.
    Query(String),
    /// Table previously uploaded to the engine.
    Table(String),
}

impl EntitySource {
    pub fn table_subquery(&self) -> String {
        match self {
            EntitySource::Query(sql) => format!("({})", sql),
            EntitySource::Table(table_ref) => format!("`{}`", table_ref),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRelation {
    Table(String),
    Query(String),
}

impl SourceRelation {
    fn from_parts(table_ref: Option<&String>, query: Option<&String>) -> Result<Self> {
        match (table_ref, query) {
            (Some(table_ref), _) => Ok(SourceRelation::Table(table_ref.clone())),
            (None, Some(query)) => Ok(SourceRelation::Query(query.clone())),
            (None, None) => Err(ProviderError::configuration(
                "Batch source needs either table_ref or query",
            )
            .into()),
        }
    }

    pub fn table_subquery(&self) -> String {
        match self {
            SourceRelation::Table(table_ref) => format!("`{}`", table_ref),
            SourceRelation::Query(query) => format!("({})", query),
        }
    }
}

/// Source rows taking part in the join: `event_ts <= max` and, with a TTL,
/// `event_ts >= min - ttl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFilter {
    pub max_timestamp: DateTime<Utc>,
    pub min_timestamp: Option<DateTime<Utc>>,
}

impl SourceFilter {
    pub fn accepts(&self, event_ts: DateTime<Utc>) -> bool {
        event_ts <= self.max_timestamp && self.min_timestamp.is_none_or(|min| event_ts >= min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    EventTimestamp,
    IsEntityTable,
    CreatedTimestamp,
}

/// Stage 2. Rows are partitioned by the entity columns and ordered by
/// `order_by`, all descending; each row takes the first non-null feature
/// timestamp and created timestamp from itself onwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillWindow {
    pub partition_by: Vec<String>,
    pub order_by: Vec<SortKey>,
}

/// Stage 3. A feature value survives only when its row is not in the future
/// and, with a TTL, not older than the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityFilter {
    pub ttl_seconds: i64,
}

impl ValidityFilter {
    pub fn keeps(&self, event_ts: DateTime<Utc>, feature_ts: Option<DateTime<Utc>>) -> bool {
        let Some(feature_ts) = feature_ts else {
            return false;
        };
        event_ts >= feature_ts
            && ttl_lower_bound(event_ts, self.ttl_seconds).is_none_or(|bound| bound < feature_ts)
    }
}

/// `ts - ttl`, or `None` when there is no TTL or the bound falls outside the
/// representable time range.
fn ttl_lower_bound(ts: DateTime<Utc>, ttl_seconds: i64) -> Option<DateTime<Utc>> {
    if ttl_seconds <= 0 {
        return None;
    }
    Duration::try_seconds(ttl_seconds).and_then(|ttl| ts.checked_sub_signed(ttl))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureProjection {
    pub source_column: String,
    pub output_column: String,
}

/// The join of one feature view onto the entity rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewJoin {
    pub name: String,
    pub source: SourceRelation,
    pub entity_columns: Vec<String>,
    pub event_timestamp_column: String,
    pub created_timestamp_column: Option<String>,
    /// Stage 1.
    pub source_filter: SourceFilter,
    pub backfill: BackfillWindow,
    pub validity: ValidityFilter,
    pub features: Vec<FeatureProjection>,
}

impl ViewJoin {
    pub fn feature_timestamp_column(&self) -> String {
        format!("{}_feature_timestamp", self.name)
    }

    /// Columns the source is joined back on after the backfill.
    pub fn join_back_columns(&self) -> Vec<String> {
        let mut columns = vec![self.feature_timestamp_column()];
        if self.created_timestamp_column.is_some() {
            columns.push("created_timestamp".to_string());
        }
        columns.extend(self.entity_columns.iter().cloned());
        columns
    }

    fn from_context(context: &FeatureViewQueryContext, window: TimeWindow) -> Result<Self> {
        let ttl_seconds = context.ttl.max(0);
        let min_timestamp = ttl_lower_bound(window.start, ttl_seconds);
        Ok(Self {
            name: context.name.clone(),
            source: SourceRelation::from_parts(context.table_ref.as_ref(), context.query.as_ref())?,
            entity_columns: context.entities.clone(),
            event_timestamp_column: context.event_timestamp_column.clone(),
            created_timestamp_column: context.created_timestamp_column.clone(),
            source_filter: SourceFilter {
                max_timestamp: window.end,
                min_timestamp,
            },
            backfill: BackfillWindow {
                partition_by: context.entities.clone(),
                order_by: vec![
                    SortKey::EventTimestamp,
                    SortKey::IsEntityTable,
                    SortKey::CreatedTimestamp,
                ],
            },
            validity: ValidityFilter { ttl_seconds },
            features: context
                .features
                .iter()
                .map(|feature| FeatureProjection {
                    source_column: context.source_column(feature).to_string(),
                    output_column: context.output_column(feature),
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointInTimePlan {
    pub entity_source: EntitySource,
    pub window: TimeWindow,
    /// Stages 1 to 4 for each view, in request order.
    pub views: Vec<ViewJoin>,
}

impl PointInTimePlan {
    /// Feature columns appended to the entity columns in the final result.
    pub fn feature_columns(&self) -> Vec<String> {
        self.views
            .iter()
            .flat_map(|view| view.features.iter().map(|f| f.output_column.clone()))
            .collect()
    }
}

pub fn build_point_in_time_plan(
    contexts: &[FeatureViewQueryContext],
    min_timestamp: DateTime<Utc>,
    max_timestamp: DateTime<Utc>,
    entity_source: EntitySource,
) -> Result<PointInTimePlan> {
    let window = TimeWindow::new(min_timestamp, max_timestamp)?;
    let views = contexts
        .iter()
        .map(|context| ViewJoin::from_context(context, window))
        .collect::<Result<Vec<_>>>()?;
    Ok(PointInTimePlan {
        entity_source,
        window,
        views,
    })
}

/// Latest row per entity within a time window.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestPlan {
    pub source: SourceRelation,
    pub join_keys: Vec<String>,
    pub feature_columns: Vec<String>,
    pub event_timestamp_column: String,
    pub created_timestamp_column: Option<String>,
    pub window: TimeWindow,
}

impl LatestPlan {
    /// Entities, then features, then timestamps.
    pub fn output_columns(&self) -> Vec<String> {
        self.join_keys
            .iter()
            .chain(self.feature_columns.iter())
            .chain(std::iter::once(&self.event_timestamp_column))
            .chain(self.created_timestamp_column.iter())
            .cloned()
            .collect()
    }
}

pub fn build_latest_plan(
    source: &BigQuerySource,
    join_keys: &[String],
    feature_columns: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<LatestPlan> {
    let plan = LatestPlan {
        source: SourceRelation::from_parts(source.table_ref.as_ref(), source.query.as_ref())?,
        join_keys: join_keys.to_vec(),
        feature_columns: feature_columns.to_vec(),
        event_timestamp_column: source.event_timestamp_column.clone(),
        created_timestamp_column: source.created_timestamp_column.clone(),
        window: TimeWindow::new(start, end)?,
    };
    if let Some(bad) = plan
        .output_columns()
        .into_iter()
        .find(|column| !is_valid_identifier(column))
    {
        return Err(ProviderError::configuration(format!(
            "'{}' is not a valid SQL identifier",
            bad
        ))
        .into());
    }
    Ok(plan)
}
