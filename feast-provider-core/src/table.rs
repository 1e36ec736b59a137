//! Small row-oriented tables exchanged with the offline engine.

use crate::error::ProviderError;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    fn from_json(json: &serde_json::Value) -> Result<Cell> {
        use serde_json::Value as Json;
        Ok(match json {
            Json::Null => Cell::Null,
            Json::Bool(b) => Cell::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Cell::Int(i),
                None => Cell::Float(
                    n.as_f64()
                        .ok_or_else(|| anyhow!("Unsupported number {}", n))?,
                ),
            },
            Json::String(s) => Cell::String(s.clone()),
            other => return Err(anyhow!("Unsupported JSON cell {}", other)),
        })
    }

    /// Accepts RFC 3339 strings, naive `YYYY-MM-DD HH:MM:SS` strings (taken
    /// as UTC) and integer epoch seconds.
    fn timestamp_from_json(json: &serde_json::Value) -> Result<Cell> {
        use serde_json::Value as Json;
        match json {
            Json::Null => Ok(Cell::Null),
            Json::Number(n) => {
                let seconds = n
                    .as_i64()
                    .ok_or_else(|| anyhow!("{} is not an epoch second", n))?;
                DateTime::from_timestamp(seconds, 0)
                    .map(Cell::Timestamp)
                    .ok_or_else(|| anyhow!("{} is out of timestamp range", seconds))
            }
            Json::String(s) => parse_timestamp(s).map(Cell::Timestamp),
            other => Err(anyhow!("{} is not a timestamp", other)),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Cell::Null => Json::Null,
            Cell::Bool(b) => Json::Bool(*b),
            Cell::Int(i) => Json::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Cell::String(s) => Json::String(s.clone()),
            Cell::Bytes(b) => Json::from(b.clone()),
            Cell::Timestamp(ts) => Json::String(ts.to_rfc3339()),
        }
    }
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .with_context(|| format!("Invalid timestamp '{}'", s))
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cell::Null, Cell::Null) => true,
            (Cell::Bool(a), Cell::Bool(b)) => a == b,
            (Cell::Int(a), Cell::Int(b)) => a == b,
            (Cell::Float(a), Cell::Float(b)) => a.to_bits() == b.to_bits(),
            (Cell::String(a), Cell::String(b)) => a == b,
            (Cell::Bytes(a), Cell::Bytes(b)) => a == b,
            (Cell::Timestamp(a), Cell::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Cell {}

impl Hash for Cell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Cell::Null => 0u8.hash(state),
            Cell::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Cell::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Cell::Float(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            Cell::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Cell::Bytes(b) => {
                5u8.hash(state);
                b.hash(state);
            }
            Cell::Timestamp(ts) => {
                6u8.hash(state);
                ts.hash(state);
            }
        }
    }
}

impl Serialize for Cell {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self> {
        if let Some(bad) = rows.iter().position(|row| row.len() != columns.len()) {
            return Err(anyhow!(
                "Row {} has {} cells but the table has {} columns",
                bad,
                rows[bad].len(),
                columns.len()
            ));
        }
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| anyhow!("Column '{}' not found in [{}]", name, self.columns.join(", ")))
    }

    pub fn value(&self, row: usize, name: &str) -> Option<&Cell> {
        self.column_index(name)
            .and_then(|idx| self.rows.get(row).map(|r| &r[idx]))
    }

    /// Smallest and largest timestamp of `column`, ignoring NULLs. Any other
    /// kind of cell is a configuration error.
    pub fn timestamp_range(&self, column: &str) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let idx = self.column_index(column).ok_or_else(|| {
            ProviderError::configuration(format!("Entity table has no '{}' column", column))
        })?;
        let mut range: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        for row in &self.rows {
            let ts = match &row[idx] {
                Cell::Null => continue,
                Cell::Timestamp(ts) => *ts,
                other => {
                    return Err(ProviderError::configuration(format!(
                        "Column '{}' must hold timestamps, found {:?}",
                        column, other
                    ))
                    .into());
                }
            };
            range = Some(match range {
                None => (ts, ts),
                Some((min, max)) => (min.min(ts), max.max(ts)),
            });
        }
        Ok(range)
    }

    /// Parses a JSON array of objects. Columns are the union of all keys in
    /// sorted order; keys missing from a record become NULL.
    pub fn from_json_records(json: &str, timestamp_columns: &[&str]) -> Result<Self> {
        let records: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_str(json).context("Expected a JSON array of objects")?;
        let columns: Vec<String> = records
            .iter()
            .flat_map(|record| record.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|column| {
                        let json = record.get(column).unwrap_or(&serde_json::Value::Null);
                        let cell = if timestamp_columns.contains(&column.as_str()) {
                            Cell::timestamp_from_json(json)
                        } else {
                            Cell::from_json(json)
                        };
                        cell.with_context(|| format!("Bad value in column '{}'", column))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Table::new(columns, rows)
    }

    pub fn to_json_records(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.rows
                .iter()
                .map(|row| {
                    serde_json::Value::Object(
                        self.columns
                            .iter()
                            .cloned()
                            .zip(row.iter().map(Cell::to_json))
                            .collect(),
                    )
                })
                .collect(),
        )
    }
}
