use crate::error::ProviderError;
use crate::feast::types::value::Val;
use crate::feast::types::value_type::Enum as ValueTypeEnum;
use crate::feast::types::{EntityKey, FeatureValues, Value};
use anyhow::{Context, Error, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use prost::Message;
use serde::ser::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Formatter;

/// One row submitted to the online writer.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub entity_key: EntityKey,
    pub values: HashMap<String, Value>,
    pub event_ts: DateTime<Utc>,
    pub created_ts: Option<DateTime<Utc>>,
}

impl WriteRecord {
    pub fn new(
        entity_key: EntityKey,
        values: HashMap<String, Value>,
        event_ts: DateTime<Utc>,
        created_ts: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            entity_key,
            values,
            event_ts,
            created_ts,
        }
    }
}

/// Row persisted under `Project -> Table -> Row(lookup id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Protobuf encoded `EntityKey`.
    pub key: Vec<u8>,
    /// Feature name to protobuf encoded `Value`.
    pub values: HashMap<String, Vec<u8>>,
    pub event_ts: DateTime<Utc>,
    pub created_ts: Option<DateTime<Utc>>,
}

impl StoredRow {
    pub fn from_record(record: &WriteRecord) -> Self {
        Self {
            key: record.entity_key.encode_to_vec(),
            values: record
                .values
                .iter()
                .map(|(name, value)| (name.clone(), value.encode_to_vec()))
                .collect(),
            event_ts: record.event_ts,
            created_ts: record.created_ts,
        }
    }

    pub fn decode_values(&self) -> Result<HashMap<String, Value>> {
        self.values
            .iter()
            .map(|(name, bytes)| {
                Value::decode(bytes.as_slice())
                    .map(|value| (name.clone(), value))
                    .with_context(|| format!("Failed to decode value for feature {}", name))
            })
            .collect()
    }

    /// Feature values as one protobuf blob, for stores with a single value column.
    pub fn encode_values_blob(&self) -> Vec<u8> {
        FeatureValues {
            values: self.values.clone(),
        }
        .encode_to_vec()
    }

    pub fn values_from_blob(blob: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
        Ok(FeatureValues::decode(blob)
            .context("Failed to decode stored feature values")?
            .values)
    }
}

pub type OnlineReadResult = (Option<DateTime<Utc>>, Option<HashMap<String, Value>>);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Feature {
    pub feature_view_name: String,
    pub feature_name: String,
}

impl Feature {
    pub fn new(feature_view_name: impl Into<String>, feature_name: impl Into<String>) -> Self {
        Self {
            feature_view_name: feature_view_name.into(),
            feature_name: feature_name.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}__{}", self.feature_view_name, self.feature_name)
    }
}

impl TryFrom<&str> for Feature {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((fv_name, f_name)) if !fv_name.is_empty() && !f_name.is_empty() => {
                Ok(Self::new(fv_name, f_name))
            }
            _ => Err(ProviderError::configuration(format!(
                "Feature reference '{}' must have the form <feature_view>:<feature>",
                s
            ))
            .into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Entity {
    pub name: String,
    pub join_key: String,
    #[serde(deserialize_with = "deserialize_value_type")]
    pub value_type: ValueTypeEnum,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(deserialize_with = "deserialize_value_type")]
    pub value_type: ValueTypeEnum,
}

impl Field {
    pub fn new(name: impl Into<String>, value_type: ValueTypeEnum) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

fn deserialize_value_type<'de, D>(deserializer: D) -> Result<ValueTypeEnum, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    ValueTypeEnum::from_str_name(&name.to_ascii_uppercase())
        .ok_or_else(|| serde::de::Error::custom(format!("Invalid value type: {}", name)))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BigQuerySource {
    #[serde(default)]
    pub table_ref: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    pub event_timestamp_column: String,
    #[serde(default)]
    pub created_timestamp_column: Option<String>,
    /// Source column name to feature name.
    #[serde(default)]
    pub field_mapping: HashMap<String, String>,
}

impl BigQuerySource {
    /// Column of the source that holds `feature`.
    pub fn source_column<'a>(&'a self, feature: &'a str) -> &'a str {
        mapped_source_column(&self.field_mapping, feature)
    }
}

/// Reverse lookup through a source column to feature name mapping. Mapping
/// targets are unique once a registry is loaded.
pub fn mapped_source_column<'a>(
    field_mapping: &'a HashMap<String, String>,
    feature: &'a str,
) -> &'a str {
    field_mapping
        .iter()
        .find(|(_, mapped)| mapped.as_str() == feature)
        .map(|(column, _)| column.as_str())
        .unwrap_or(feature)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileSource {
    pub path: String,
    pub event_timestamp_column: String,
    #[serde(default)]
    pub created_timestamp_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSource {
    BigQuery(BigQuerySource),
    File(FileSource),
}

impl DataSource {
    pub fn kind(&self) -> &'static str {
        match self {
            DataSource::BigQuery(_) => "big_query",
            DataSource::File(_) => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureView {
    pub name: String,
    pub entities: Vec<String>,
    pub features: Vec<Field>,
    /// `None` means the view never expires.
    pub ttl: Option<Duration>,
    pub batch_source: DataSource,
}

impl FeatureView {
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.map(|ttl| ttl.num_seconds().max(0)).unwrap_or(0)
    }

    pub fn feature(&self, name: &str) -> Option<&Field> {
        self.features.iter().find(|f| f.name == name)
    }
}

/// Entity value as it appears in JSON input.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EntityIdValue {
    String(String),
    Int(i64),
}

impl EntityIdValue {
    pub fn to_proto_value(&self, output_type: ValueTypeEnum) -> Result<Value> {
        match self {
            EntityIdValue::String(s) => Ok(Value {
                val: Some(Val::StringVal(s.clone())),
            }),
            EntityIdValue::Int(i) => match output_type {
                ValueTypeEnum::Int32 => Ok(Value {
                    val: Some(Val::Int32Val(i32::try_from(*i).with_context(|| {
                        format!("Entity value {} does not fit in int32", i)
                    })?)),
                }),
                ValueTypeEnum::Int64 => Ok(Value {
                    val: Some(Val::Int64Val(*i)),
                }),
                ValueTypeEnum::String => Ok(Value {
                    val: Some(Val::StringVal(i.to_string())),
                }),
                _ => Err(anyhow!("Unsupported type conversion for number type")),
            },
        }
    }
}

/// Builds a feature `Value` of the declared type from a JSON value.
pub fn value_from_json(json: &serde_json::Value, value_type: ValueTypeEnum) -> Result<Value> {
    use serde_json::Value as Json;
    let val = match (json, value_type) {
        (Json::Null, _) => None,
        (Json::Number(n), ValueTypeEnum::Int32) => Some(Val::Int32Val(
            n.as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| anyhow!("{} is not an int32", n))?,
        )),
        (Json::Number(n), ValueTypeEnum::Int64) => Some(Val::Int64Val(
            n.as_i64().ok_or_else(|| anyhow!("{} is not an int64", n))?,
        )),
        (Json::Number(n), ValueTypeEnum::UnixTimestamp) => Some(Val::UnixTimestampVal(
            n.as_i64()
                .ok_or_else(|| anyhow!("{} is not a unix timestamp", n))?,
        )),
        (Json::Number(n), ValueTypeEnum::Double) => Some(Val::DoubleVal(
            n.as_f64().ok_or_else(|| anyhow!("{} is not a double", n))?,
        )),
        (Json::Number(n), ValueTypeEnum::Float) => Some(Val::FloatVal(
            n.as_f64().ok_or_else(|| anyhow!("{} is not a float", n))? as f32,
        )),
        (Json::String(s), ValueTypeEnum::String) => Some(Val::StringVal(s.clone())),
        (Json::String(s), ValueTypeEnum::Bytes) => Some(Val::BytesVal(s.as_bytes().to_vec())),
        (Json::Bool(b), ValueTypeEnum::Bool) => Some(Val::BoolVal(*b)),
        (other, value_type) => {
            return Err(anyhow!(
                "Cannot convert {} to value type {:?}",
                other,
                value_type
            ));
        }
    };
    Ok(Value { val })
}

#[derive(PartialEq, Clone)]
pub struct ValueWrapper(pub Value);

impl Serialize for ValueWrapper {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match &self.0.val {
            None => serializer.serialize_none(),
            Some(v) => match v {
                Val::Int32Val(i) => serializer.serialize_i32(*i),
                Val::Int64Val(i) => serializer.serialize_i64(*i),
                Val::FloatVal(f) => serializer.serialize_f32(*f),
                Val::DoubleVal(d) => serializer.serialize_f64(*d),
                Val::StringVal(s) => serializer.serialize_str(s),
                Val::BytesVal(b) => serializer.serialize_bytes(b),
                Val::BoolVal(b) => serializer.serialize_bool(*b),
                Val::UnixTimestampVal(ts) => serializer.serialize_i64(*ts),
                Val::NullVal(_) => serializer.serialize_none(),
                Val::StringListVal(l) => l.val.serialize(serializer),
                Val::Int32ListVal(l) => l.val.serialize(serializer),
                Val::Int64ListVal(l) => l.val.serialize(serializer),
                Val::DoubleListVal(l) => l.val.serialize(serializer),
                Val::FloatListVal(l) => l.val.serialize(serializer),
                Val::BoolListVal(l) => l.val.serialize(serializer),
                other => Err(S::Error::custom(format!(
                    "unsupported value variant: {:?}",
                    other
                ))),
            },
        }
    }
}

impl fmt::Debug for ValueWrapper {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
