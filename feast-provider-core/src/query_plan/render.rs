//! BigQuery standard SQL for plans.

use crate::query_plan::{
    ENTITY_TIMESTAMP_COLUMN, LatestPlan, PointInTimePlan, ROW_NUMBER_COLUMN, SortKey, ViewJoin,
};
use chrono::{DateTime, Utc};
use std::fmt::Write;

fn sql_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string()
}

fn source_where(view: &ViewJoin) -> String {
    let mut clause = format!(
        "{} <= '{}'",
        view.event_timestamp_column,
        sql_timestamp(&view.source_filter.max_timestamp)
    );
    if let Some(min) = &view.source_filter.min_timestamp {
        // min already has the TTL subtracted.
        let _ = write!(
            clause,
            "\nAND {} >= TIMESTAMP '{}'",
            view.event_timestamp_column,
            sql_timestamp(min)
        );
    }
    clause
}

fn sort_key_sql(key: SortKey) -> &'static str {
    match key {
        SortKey::EventTimestamp => "event_timestamp DESC",
        SortKey::IsEntityTable => "is_entity_table DESC",
        SortKey::CreatedTimestamp => "created_timestamp DESC",
    }
}

fn render_view(out: &mut String, view: &ViewJoin) {
    let name = &view.name;
    let entities = view.entity_columns.join(", ");
    let feature_ts = view.feature_timestamp_column();
    let created_select = view
        .created_timestamp_column
        .as_deref()
        .unwrap_or("NULL");
    let filter = source_where(view);
    let source = view.source.table_subquery();

    // 1. entity rows followed by source rows
    let _ = write!(
        out,
        "{name}__union_features AS (
SELECT
  {ROW_NUMBER_COLUMN},
  {ENTITY_TIMESTAMP_COLUMN} AS event_timestamp,
  CAST(NULL AS TIMESTAMP) AS {feature_ts},
  CAST(NULL AS TIMESTAMP) AS created_timestamp,
  {entities},
  true AS is_entity_table
FROM entity_dataframe
UNION ALL
SELECT
  NULL AS {ROW_NUMBER_COLUMN},
  {event_ts} AS event_timestamp,
  {event_ts} AS {feature_ts},
  {created_select} AS created_timestamp,
  {entities},
  false AS is_entity_table
FROM {source} WHERE {filter}
),
",
        event_ts = view.event_timestamp_column,
    );

    // 2 and 3. backfill, join back, validity
    let validity = if view.validity.ttl_seconds == 0 {
        format!("event_timestamp >= {feature_ts}")
    } else {
        format!(
            "event_timestamp >= {feature_ts} AND TIMESTAMP_SUB(event_timestamp, INTERVAL {} SECOND) < {feature_ts}",
            view.validity.ttl_seconds
        )
    };
    let guarded_features = view
        .features
        .iter()
        .map(|f| format!("  IF({validity}, {col}, NULL) AS {col}", col = f.output_column))
        .collect::<Vec<_>>()
        .join(",\n");
    let order_by = view
        .backfill
        .order_by
        .iter()
        .map(|key| sort_key_sql(*key))
        .collect::<Vec<_>>()
        .join(", ");
    let partition_by = view.backfill.partition_by.join(", ");
    let mut join_back_select = vec![format!("  {} AS {feature_ts}", view.event_timestamp_column)];
    if let Some(created) = &view.created_timestamp_column {
        join_back_select.push(format!("  {created} AS created_timestamp"));
    }
    join_back_select.push(format!("  {entities}"));
    join_back_select.extend(
        view.features
            .iter()
            .map(|f| format!("  {} AS {}", f.source_column, f.output_column)),
    );
    let join_back_select = join_back_select.join(",\n");
    let using = view.join_back_columns().join(", ");
    let _ = write!(
        out,
        "{name}__joined AS (
SELECT
  {ROW_NUMBER_COLUMN},
  event_timestamp,
  {entities},
{guarded_features}
FROM (
SELECT
  {ROW_NUMBER_COLUMN},
  event_timestamp,
  {entities},
  FIRST_VALUE(created_timestamp IGNORE NULLS) OVER w AS created_timestamp,
  FIRST_VALUE({feature_ts} IGNORE NULLS) OVER w AS {feature_ts},
  is_entity_table
FROM {name}__union_features
WINDOW w AS (PARTITION BY {partition_by} ORDER BY {order_by} ROWS BETWEEN CURRENT ROW AND UNBOUNDED FOLLOWING)
)
LEFT JOIN (
SELECT
{join_back_select}
FROM {source} WHERE {filter}
) USING ({using})
WHERE is_entity_table
),
"
    );

    // 4. one row per entity row
    let _ = write!(
        out,
        "{name}__deduped AS (
SELECT k.*
FROM (
  SELECT ARRAY_AGG(row LIMIT 1)[OFFSET(0)] k
  FROM {name}__joined row
  GROUP BY {ROW_NUMBER_COLUMN}
))"
    );
}

/// Renders the point-in-time join as one BigQuery query.
pub fn render_bigquery(plan: &PointInTimePlan) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "WITH entity_dataframe AS (
SELECT ROW_NUMBER() OVER() AS {ROW_NUMBER_COLUMN}, edf.* FROM {} AS edf
)",
        plan.entity_source.table_subquery()
    );
    for view in &plan.views {
        out.push_str(",\n");
        render_view(&mut out, view);
    }
    let _ = write!(
        out,
        "
SELECT edf.{ENTITY_TIMESTAMP_COLUMN} AS {ENTITY_TIMESTAMP_COLUMN}, * EXCEPT ({ROW_NUMBER_COLUMN}, {ENTITY_TIMESTAMP_COLUMN}) FROM entity_dataframe edf"
    );
    for view in &plan.views {
        let columns = view
            .features
            .iter()
            .map(|f| f.output_column.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(
            out,
            "
LEFT JOIN (
  SELECT {ROW_NUMBER_COLUMN}, {columns} FROM {}__deduped
) USING ({ROW_NUMBER_COLUMN})",
            view.name
        );
    }
    let _ = write!(out, "\nORDER BY {ENTITY_TIMESTAMP_COLUMN}\n");
    out
}

/// Renders the latest-row-per-entity query.
pub fn render_latest_bigquery(plan: &LatestPlan) -> String {
    let fields = plan.output_columns().join(", ");
    let partition_by = if plan.join_keys.is_empty() {
        String::new()
    } else {
        format!("PARTITION BY {} ", plan.join_keys.join(", "))
    };
    let order_by = std::iter::once(&plan.event_timestamp_column)
        .chain(plan.created_timestamp_column.iter())
        .map(|column| format!("{} DESC", column))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {fields}
FROM (
  SELECT {fields},
  ROW_NUMBER() OVER({partition_by}ORDER BY {order_by}) AS _feast_row
  FROM {source}
  WHERE {event_ts} BETWEEN TIMESTAMP('{start}') AND TIMESTAMP('{end}')
)
WHERE _feast_row = 1
",
        source = plan.source.table_subquery(),
        event_ts = plan.event_timestamp_column,
        start = sql_timestamp(&plan.window.start),
        end = sql_timestamp(&plan.window.end),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BigQuerySource;
    use crate::query_plan::tests::context;
    use crate::query_plan::{EntitySource, build_latest_plan, build_point_in_time_plan};
    use anyhow::Result;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn renders_every_stage() -> Result<()> {
        let plan = build_point_in_time_plan(
            &[context(20)],
            ts(1_618_000_000),
            ts(1_618_100_000),
            EntitySource::Table("proj.feast_p.entity_df_1".to_string()),
        )?;
        let sql = render_bigquery(&plan);
        assert!(sql.starts_with("WITH entity_dataframe AS ("));
        assert!(sql.contains("FROM `proj.feast_p.entity_df_1` AS edf"));
        assert!(sql.contains("driver_stats__union_features AS ("));
        assert!(sql.contains("driver_stats__joined AS ("));
        assert!(sql.contains("driver_stats__deduped AS ("));
        assert!(sql.contains("FROM `feast.driver_stats` WHERE event_ts <= '2021-04-11 00:13:20.000000+00:00'"));
        assert!(sql.contains("AND event_ts >= TIMESTAMP '2021-04-09 20:26:20.000000+00:00'"));
        assert!(sql.contains(
            "WINDOW w AS (PARTITION BY driver_id ORDER BY event_timestamp DESC, is_entity_table DESC, created_timestamp DESC ROWS BETWEEN CURRENT ROW AND UNBOUNDED FOLLOWING)"
        ));
        assert!(sql.contains("TIMESTAMP_SUB(event_timestamp, INTERVAL 20 SECOND) < driver_stats_feature_timestamp"));
        assert!(sql.contains("trip_count AS driver_stats__trips"));
        assert!(sql.contains("USING (driver_stats_feature_timestamp, created_timestamp, driver_id)"));
        assert!(sql.contains("SELECT row_number, driver_stats__conv_rate, driver_stats__trips FROM driver_stats__deduped"));
        assert!(sql.trim_end().ends_with("ORDER BY event_timestamp"));
        Ok(())
    }

    #[test]
    fn zero_ttl_drops_ttl_predicates() -> Result<()> {
        let mut ctx = context(0);
        ctx.created_timestamp_column = None;
        let plan = build_point_in_time_plan(
            &[ctx],
            ts(0),
            ts(100),
            EntitySource::Query("SELECT 1 AS driver_id, CURRENT_TIMESTAMP() AS event_timestamp".to_string()),
        )?;
        let sql = render_bigquery(&plan);
        assert!(sql.contains("FROM (SELECT 1 AS driver_id, CURRENT_TIMESTAMP() AS event_timestamp) AS edf"));
        assert!(!sql.contains("TIMESTAMP_SUB"));
        assert!(!sql.contains(">= TIMESTAMP '"));
        assert!(sql.contains("NULL AS created_timestamp"));
        assert!(sql.contains("USING (driver_stats_feature_timestamp, driver_id)"));
        Ok(())
    }

    #[test]
    fn renders_latest_query() -> Result<()> {
        let source = BigQuerySource {
            table_ref: Some("feast.driver_stats".to_string()),
            query: None,
            event_timestamp_column: "event_ts".to_string(),
            created_timestamp_column: Some("created".to_string()),
            field_mapping: HashMap::new(),
        };
        let plan = build_latest_plan(
            &source,
            &["driver_id".to_string()],
            &["conv_rate".to_string()],
            ts(0),
            ts(60),
        )?;
        let sql = render_latest_bigquery(&plan);
        assert!(sql.contains("SELECT driver_id, conv_rate, event_ts, created\n"));
        assert!(sql.contains("ROW_NUMBER() OVER(PARTITION BY driver_id ORDER BY event_ts DESC, created DESC) AS _feast_row"));
        assert!(sql.contains("FROM `feast.driver_stats`"));
        assert!(sql.contains(
            "WHERE event_ts BETWEEN TIMESTAMP('1970-01-01 00:00:00.000000+00:00') AND TIMESTAMP('1970-01-01 00:01:00.000000+00:00')"
        ));

        let no_entities = build_latest_plan(&source, &[], &["conv_rate".to_string()], ts(0), ts(60))?;
        assert!(render_latest_bigquery(&no_entities).contains("ROW_NUMBER() OVER(ORDER BY event_ts DESC, created DESC)"));
        Ok(())
    }
}
