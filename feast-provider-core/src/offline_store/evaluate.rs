//! In-process evaluation of plans with the semantics of the rendered SQL.

use crate::query_plan::{
    ENTITY_TIMESTAMP_COLUMN, LatestPlan, PointInTimePlan, SortKey, ViewJoin,
};
use crate::table::{Cell, Table};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;
use std::cmp::Ordering;

fn timestamp_cell(cell: &Cell, column: &str) -> Result<Option<DateTime<Utc>>> {
    match cell {
        Cell::Null => Ok(None),
        Cell::Timestamp(ts) => Ok(Some(*ts)),
        other => Err(anyhow!(
            "Column '{}' must hold timestamps, found {:?}",
            column,
            other
        )),
    }
}

/// `DESC` ordering with NULLs last.
fn desc_nulls_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug)]
struct UnionRow {
    /// Entity row index, only set on entity rows.
    row_number: Option<usize>,
    event_ts: Option<DateTime<Utc>>,
    feature_ts: Option<DateTime<Utc>>,
    created_ts: Option<DateTime<Utc>>,
    entities: Vec<Cell>,
}

impl UnionRow {
    fn is_entity_table(&self) -> bool {
        self.row_number.is_some()
    }

    fn compare(&self, other: &UnionRow, order_by: &[SortKey]) -> Ordering {
        for key in order_by {
            let ord = match key {
                SortKey::EventTimestamp => desc_nulls_last(&self.event_ts, &other.event_ts),
                SortKey::IsEntityTable => other.is_entity_table().cmp(&self.is_entity_table()),
                SortKey::CreatedTimestamp => desc_nulls_last(&self.created_ts, &other.created_ts),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Source rows of one view that pass the source filter, with the columns
/// the join needs.
struct FilteredSource {
    event_ts: Vec<DateTime<Utc>>,
    created_ts: Vec<Option<DateTime<Utc>>>,
    entities: Vec<Vec<Cell>>,
    features: Vec<Vec<Cell>>,
}

impl FilteredSource {
    fn load(view: &ViewJoin, source: &Table) -> Result<Self> {
        let event_idx = source.require_column(&view.event_timestamp_column)?;
        let created_idx = view
            .created_timestamp_column
            .as_deref()
            .map(|column| source.require_column(column))
            .transpose()?;
        let entity_idx = view
            .entity_columns
            .iter()
            .map(|column| source.require_column(column))
            .collect::<Result<Vec<_>>>()?;
        let feature_idx = view
            .features
            .iter()
            .map(|f| source.require_column(&f.source_column))
            .collect::<Result<Vec<_>>>()?;

        let mut filtered = FilteredSource {
            event_ts: vec![],
            created_ts: vec![],
            entities: vec![],
            features: vec![],
        };
        for row in &source.rows {
            // NULL event timestamps fail the WHERE clause.
            let Some(event_ts) = timestamp_cell(&row[event_idx], &view.event_timestamp_column)?
            else {
                continue;
            };
            if !view.source_filter.accepts(event_ts) {
                continue;
            }
            let created_ts = match (created_idx, &view.created_timestamp_column) {
                (Some(idx), Some(column)) => timestamp_cell(&row[idx], column)?,
                _ => None,
            };
            filtered.event_ts.push(event_ts);
            filtered.created_ts.push(created_ts);
            filtered
                .entities
                .push(entity_idx.iter().map(|idx| row[*idx].clone()).collect());
            filtered
                .features
                .push(feature_idx.iter().map(|idx| row[*idx].clone()).collect());
        }
        Ok(filtered)
    }

    fn len(&self) -> usize {
        self.event_ts.len()
    }
}

/// Feature cells of one view, one row per entity row.
fn join_view(
    view: &ViewJoin,
    entity: &Table,
    entity_ts: &[Option<DateTime<Utc>>],
    source: &Table,
) -> Result<Vec<Vec<Cell>>> {
    let source = FilteredSource::load(view, source)?;
    let entity_idx = view
        .entity_columns
        .iter()
        .map(|column| entity.require_column(column))
        .collect::<Result<Vec<_>>>()?;

    // 1. union
    let mut union: Vec<UnionRow> = Vec::with_capacity(entity.len() + source.len());
    for (row_number, row) in entity.rows.iter().enumerate() {
        union.push(UnionRow {
            row_number: Some(row_number),
            event_ts: entity_ts[row_number],
            feature_ts: None,
            created_ts: None,
            entities: entity_idx.iter().map(|idx| row[*idx].clone()).collect(),
        });
    }
    for i in 0..source.len() {
        union.push(UnionRow {
            row_number: None,
            event_ts: Some(source.event_ts[i]),
            feature_ts: Some(source.event_ts[i]),
            created_ts: source.created_ts[i],
            entities: source.entities[i].clone(),
        });
    }

    // 2. backfill within each entity partition; PARTITION BY groups NULLs together
    let mut partitions: HashMap<&[Cell], Vec<usize>> = HashMap::default();
    for (idx, row) in union.iter().enumerate() {
        partitions.entry(row.entities.as_slice()).or_default().push(idx);
    }
    let mut backfilled: Vec<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> =
        vec![(None, None); union.len()];
    for members in partitions.values_mut() {
        members.sort_by(|a, b| union[*a].compare(&union[*b], &view.backfill.order_by));
        let mut feature_ts = None;
        let mut created_ts = None;
        for idx in members.iter().rev() {
            feature_ts = union[*idx].feature_ts.or(feature_ts);
            created_ts = union[*idx].created_ts.or(created_ts);
            backfilled[*idx] = (feature_ts, created_ts);
        }
    }

    // Join back on (feature ts, created ts, entities). NULL never matches,
    // and the first match wins when the join fans out.
    type JoinKey<'a> = (DateTime<Utc>, Option<DateTime<Utc>>, &'a [Cell]);
    let mut join_index: HashMap<JoinKey<'_>, usize> = HashMap::default();
    for i in 0..source.len() {
        if source.entities[i].iter().any(Cell::is_null) {
            continue;
        }
        let created = if view.created_timestamp_column.is_some() {
            match source.created_ts[i] {
                Some(created) => Some(created),
                None => continue,
            }
        } else {
            None
        };
        join_index
            .entry((source.event_ts[i], created, source.entities[i].as_slice()))
            .or_insert(i);
    }

    // 3 and 4. validity on entity rows, one row per entity row
    let mut features = vec![vec![Cell::Null; view.features.len()]; entity.len()];
    for (idx, row) in union.iter().enumerate() {
        let Some(row_number) = row.row_number else {
            continue;
        };
        let (feature_ts, created_ts) = backfilled[idx];
        let Some(ts) = feature_ts else {
            continue;
        };
        let created = match (&view.created_timestamp_column, created_ts) {
            (Some(_), None) => continue,
            (Some(_), Some(created)) => Some(created),
            (None, _) => None,
        };
        if row.entities.iter().any(Cell::is_null) {
            continue;
        }
        let Some(source_idx) = join_index.get(&(ts, created, row.entities.as_slice())) else {
            continue;
        };
        let Some(event_ts) = row.event_ts else {
            continue;
        };
        if view.validity.keeps(event_ts, feature_ts) {
            features[row_number] = source.features[*source_idx].clone();
        }
    }
    Ok(features)
}

/// Evaluates a point-in-time plan. `sources` holds one table per view.
pub fn point_in_time(plan: &PointInTimePlan, entity: &Table, sources: &[&Table]) -> Result<Table> {
    if sources.len() != plan.views.len() {
        return Err(anyhow!(
            "Expected {} source tables, got {}",
            plan.views.len(),
            sources.len()
        ));
    }
    let ts_idx = entity.require_column(ENTITY_TIMESTAMP_COLUMN)?;
    let entity_ts = entity
        .rows
        .iter()
        .map(|row| timestamp_cell(&row[ts_idx], ENTITY_TIMESTAMP_COLUMN))
        .collect::<Result<Vec<_>>>()?;

    let per_view = plan
        .views
        .iter()
        .zip(sources)
        .map(|(view, source)| join_view(view, entity, &entity_ts, source))
        .collect::<Result<Vec<_>>>()?;

    let other_columns: Vec<usize> = (0..entity.columns.len()).filter(|idx| *idx != ts_idx).collect();
    let mut columns = vec![ENTITY_TIMESTAMP_COLUMN.to_string()];
    columns.extend(other_columns.iter().map(|idx| entity.columns[*idx].clone()));
    columns.extend(plan.feature_columns());

    let mut order: Vec<usize> = (0..entity.len()).collect();
    // ORDER BY event_timestamp ASC puts NULLs first
    order.sort_by_key(|row_number| entity_ts[*row_number]);
    let rows = order
        .into_iter()
        .map(|row_number| {
            let entity_row = &entity.rows[row_number];
            let mut out = Vec::with_capacity(columns.len());
            out.push(entity_row[ts_idx].clone());
            out.extend(other_columns.iter().map(|idx| entity_row[*idx].clone()));
            for view_features in &per_view {
                out.extend(view_features[row_number].iter().cloned());
            }
            out
        })
        .collect();
    Table::new(columns, rows)
}

/// Evaluates a latest-row-per-entity plan.
pub fn latest(plan: &LatestPlan, source: &Table) -> Result<Table> {
    let columns = plan.output_columns();
    let column_idx = columns
        .iter()
        .map(|column| source.require_column(column))
        .collect::<Result<Vec<_>>>()?;
    let event_idx = source.require_column(&plan.event_timestamp_column)?;
    let created_idx = plan
        .created_timestamp_column
        .as_deref()
        .map(|column| source.require_column(column))
        .transpose()?;
    let key_idx = plan
        .join_keys
        .iter()
        .map(|column| source.require_column(column))
        .collect::<Result<Vec<_>>>()?;

    // partition key -> (event ts, created ts, row)
    let mut winners: Vec<(DateTime<Utc>, Option<DateTime<Utc>>, usize)> = vec![];
    let mut partition_of: HashMap<Vec<Cell>, usize> = HashMap::default();
    for (row_idx, row) in source.rows.iter().enumerate() {
        let Some(event_ts) = timestamp_cell(&row[event_idx], &plan.event_timestamp_column)? else {
            continue;
        };
        if !plan.window.contains(event_ts) {
            continue;
        }
        let created_ts = match (created_idx, &plan.created_timestamp_column) {
            (Some(idx), Some(column)) => timestamp_cell(&row[idx], column)?,
            _ => None,
        };
        let key: Vec<Cell> = key_idx.iter().map(|idx| row[*idx].clone()).collect();
        match partition_of.get(&key) {
            None => {
                partition_of.insert(key, winners.len());
                winners.push((event_ts, created_ts, row_idx));
            }
            Some(partition) => {
                let (best_event, best_created, _) = &winners[*partition];
                let ord = desc_nulls_last(&Some(event_ts), &Some(*best_event))
                    .then_with(|| desc_nulls_last(&created_ts, best_created));
                if ord == Ordering::Less {
                    winners[*partition] = (event_ts, created_ts, row_idx);
                }
            }
        }
    }

    let rows = winners
        .into_iter()
        .map(|(_, _, row_idx)| {
            column_idx
                .iter()
                .map(|idx| source.rows[row_idx][*idx].clone())
                .collect()
        })
        .collect();
    Table::new(columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_context::FeatureViewQueryContext;
    use crate::query_plan::{EntitySource, SourceRelation, TimeWindow, build_point_in_time_plan};
    use chrono::TimeZone;
    use std::collections::HashMap as StdHashMap;

    fn ts(seconds: i64) -> Cell {
        Cell::Timestamp(Utc.timestamp_opt(seconds, 0).unwrap())
    }

    fn utc(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn context(ttl: i64, created: Option<&str>) -> FeatureViewQueryContext {
        FeatureViewQueryContext {
            name: "fv".to_string(),
            ttl,
            entities: vec!["e".to_string()],
            features: vec!["f".to_string()],
            table_ref: Some("src".to_string()),
            query: None,
            event_timestamp_column: "event_ts".to_string(),
            created_timestamp_column: created.map(str::to_string),
            field_mapping: StdHashMap::new(),
        }
    }

    fn entity_table(rows: &[(i64, i64)]) -> Table {
        Table::new(
            vec!["e".to_string(), "event_timestamp".to_string()],
            rows.iter().map(|(e, t)| vec![Cell::Int(*e), ts(*t)]).collect(),
        )
        .unwrap()
    }

    fn source_table(rows: &[(i64, i64, Option<i64>, i64)]) -> Table {
        Table::new(
            vec![
                "e".to_string(),
                "event_ts".to_string(),
                "created".to_string(),
                "f".to_string(),
            ],
            rows.iter()
                .map(|(e, t, c, f)| {
                    vec![
                        Cell::Int(*e),
                        ts(*t),
                        c.map(ts).unwrap_or(Cell::Null),
                        Cell::Int(*f),
                    ]
                })
                .collect(),
        )
        .unwrap()
    }

    fn run(
        ttl: i64,
        created: Option<&str>,
        entity: &Table,
        source: &Table,
        window: (i64, i64),
    ) -> Result<Vec<Cell>> {
        let plan = build_point_in_time_plan(
            &[context(ttl, created)],
            utc(window.0),
            utc(window.1),
            EntitySource::Table("entities".to_string()),
        )?;
        let result = point_in_time(&plan, entity, &[source])?;
        let idx = result.require_column("fv__f")?;
        Ok(result.rows.iter().map(|row| row[idx].clone()).collect())
    }

    #[test]
    fn freshest_value_at_or_before_each_timestamp() -> Result<()> {
        let entity = entity_table(&[(1, 100), (1, 200)]);
        let source = source_table(&[(1, 90, None, 5), (1, 150, None, 7)]);
        assert_eq!(
            run(0, None, &entity, &source, (100, 200))?,
            vec![Cell::Int(5), Cell::Int(7)]
        );
        assert_eq!(
            run(20, None, &entity, &source, (100, 200))?,
            vec![Cell::Int(5), Cell::Null]
        );
        Ok(())
    }

    #[test]
    fn future_rows_never_leak() -> Result<()> {
        let entity = entity_table(&[(1, 100)]);
        let source = source_table(&[(1, 101, None, 9)]);
        assert_eq!(run(0, None, &entity, &source, (100, 200))?, vec![Cell::Null]);
        let same_instant = source_table(&[(1, 100, None, 9)]);
        assert_eq!(
            run(0, None, &entity, &same_instant, (100, 200))?,
            vec![Cell::Int(9)]
        );
        Ok(())
    }

    #[test]
    fn later_created_wins_on_equal_event_time() -> Result<()> {
        let entity = entity_table(&[(1, 100)]);
        let source = source_table(&[(1, 50, Some(60), 1), (1, 50, Some(70), 2), (1, 50, Some(65), 3)]);
        assert_eq!(
            run(0, Some("created"), &entity, &source, (100, 100))?,
            vec![Cell::Int(2)]
        );
        Ok(())
    }

    #[test]
    fn entities_do_not_mix_and_order_follows_event_time() -> Result<()> {
        let entity = entity_table(&[(2, 300), (1, 100), (3, 200)]);
        let source = source_table(&[(1, 90, None, 10), (2, 250, None, 20), (2, 310, None, 21)]);
        let plan = build_point_in_time_plan(
            &[context(0, None)],
            utc(100),
            utc(300),
            EntitySource::Table("entities".to_string()),
        )?;
        let result = point_in_time(&plan, &entity, &[&source])?;
        assert_eq!(result.columns, vec!["event_timestamp", "e", "fv__f"]);
        assert_eq!(
            result.rows,
            vec![
                vec![ts(100), Cell::Int(1), Cell::Int(10)],
                vec![ts(200), Cell::Int(3), Cell::Null],
                vec![ts(300), Cell::Int(2), Cell::Int(20)],
            ]
        );
        Ok(())
    }

    #[test]
    fn rows_outside_the_source_window_are_ignored() -> Result<()> {
        // max = 150 excludes the row at 160, min - ttl = 80 excludes the one at 70
        let entity = entity_table(&[(1, 100), (1, 170)]);
        let source = source_table(&[(1, 70, None, 1), (1, 160, None, 2)]);
        assert_eq!(
            run(20, None, &entity, &source, (100, 150))?,
            vec![Cell::Null, Cell::Null]
        );
        Ok(())
    }

    #[test]
    fn duplicate_source_rows_yield_one_row() -> Result<()> {
        let entity = entity_table(&[(1, 100)]);
        let source = source_table(&[(1, 50, Some(60), 4), (1, 50, Some(60), 5)]);
        assert_eq!(
            run(0, Some("created"), &entity, &source, (100, 100))?,
            vec![Cell::Int(4)]
        );
        Ok(())
    }

    #[test]
    fn missing_entity_column_is_an_error() {
        let entity = Table::new(
            vec!["event_timestamp".to_string()],
            vec![vec![ts(1)]],
        )
        .unwrap();
        let source = source_table(&[]);
        assert!(run(0, None, &entity, &source, (0, 10)).is_err());
    }

    #[test]
    fn latest_row_per_entity() -> Result<()> {
        let source = source_table(&[
            (1, 10, Some(11), 100),
            (1, 30, Some(31), 300),
            (2, 20, Some(21), 200),
            (1, 30, Some(35), 301),
            (2, 99, Some(99), 999),
        ]);
        let plan = LatestPlan {
            source: SourceRelation::Table("src".to_string()),
            join_keys: vec!["e".to_string()],
            feature_columns: vec!["f".to_string()],
            event_timestamp_column: "event_ts".to_string(),
            created_timestamp_column: Some("created".to_string()),
            window: TimeWindow::new(utc(0), utc(50))?,
        };
        let result = latest(&plan, &source)?;
        assert_eq!(result.columns, vec!["e", "f", "event_ts", "created"]);
        assert_eq!(
            result.rows,
            vec![
                vec![Cell::Int(1), Cell::Int(301), ts(30), ts(35)],
                vec![Cell::Int(2), Cell::Int(200), ts(20), ts(21)],
            ]
        );
        Ok(())
    }
}
