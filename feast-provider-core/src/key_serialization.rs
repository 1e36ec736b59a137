//! Canonical entity key encoding and the lookup id derived from it.
//!
//! The lookup id is only a storage address and is never decoded. Reads do
//! not check for id collisions; the raw key bytes are stored next to every row.

use crate::config::EntityKeySerializationVersion;
use crate::error::ProviderError;
use crate::feast::types::value::Val;
use crate::feast::types::value_type::Enum;
use crate::feast::types::{EntityKey, Value};
use anyhow::{Result, anyhow};
use std::fmt::Write;

fn serialize_value(value: &Value) -> Result<Vec<u8>> {
    let val = value
        .val
        .as_ref()
        .ok_or_else(|| anyhow!("Entity key value is empty"))?;
    match val {
        Val::Int32Val(v) => {
            let mut bytes = Vec::with_capacity(12);
            bytes.extend((Enum::Int32 as u32).to_le_bytes());
            bytes.extend(4u32.to_le_bytes());
            bytes.extend(v.to_le_bytes());
            Ok(bytes)
        }
        Val::Int64Val(v) => {
            let mut bytes = Vec::with_capacity(16);
            bytes.extend((Enum::Int64 as u32).to_le_bytes());
            bytes.extend(8u32.to_le_bytes());
            bytes.extend(v.to_le_bytes());
            Ok(bytes)
        }
        Val::StringVal(v) => {
            let mut bytes = Vec::with_capacity(8 + v.len());
            bytes.extend((Enum::String as u32).to_le_bytes());
            bytes.extend((v.len() as u32).to_le_bytes());
            bytes.extend(v.as_bytes());
            Ok(bytes)
        }
        Val::BytesVal(v) => {
            let mut bytes = Vec::with_capacity(8 + v.len());
            bytes.extend((Enum::Bytes as u32).to_le_bytes());
            bytes.extend((v.len() as u32).to_le_bytes());
            bytes.extend(v);
            Ok(bytes)
        }
        other => Err(anyhow!(
            "Unsupported entity key value type: {:?}",
            other
        )),
    }
}

/// Serializes an entity key into its canonical byte form.
///
/// Join keys are sorted by name, so the output does not depend on the order
/// in which the caller listed them.
pub fn serialize_key(
    entity_key: &EntityKey,
    serializer_version: EntityKeySerializationVersion,
) -> Result<Vec<u8>> {
    if serializer_version != EntityKeySerializationVersion::V3 {
        return Err(ProviderError::configuration(format!(
            "Unsupported entity key serialization version {}",
            u64::from(serializer_version)
        ))
        .into());
    }
    if entity_key.join_keys.len() != entity_key.entity_values.len() {
        return Err(anyhow!(
            "Entity key has {} join keys but {} values",
            entity_key.join_keys.len(),
            entity_key.entity_values.len()
        ));
    }
    let mut pairs: Vec<(&str, &Value)> = entity_key
        .join_keys
        .iter()
        .map(|s| s.as_str())
        .zip(entity_key.entity_values.iter())
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    if pairs.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(anyhow!("Entity key contains duplicate join keys"));
    }

    let mut bytes: Vec<u8> = vec![];
    bytes.extend((pairs.len() as u32).to_le_bytes());
    for (key, _) in &pairs {
        bytes.extend((Enum::String as u32).to_le_bytes());
        bytes.extend((key.len() as u32).to_le_bytes());
        bytes.extend(key.bytes());
    }
    for (_, value) in &pairs {
        bytes.extend(serialize_value(value)?);
    }
    Ok(bytes)
}

/// Fixed width (32 hex chars) lookup id: murmur3 x64/128 with seed 0 over the
/// serialized key, low 64 bits first, each half little-endian.
pub fn compute_entity_id(
    entity_key: &EntityKey,
    serializer_version: EntityKeySerializationVersion,
) -> Result<String> {
    let serialized = serialize_key(entity_key, serializer_version)?;
    let hash = murmur3::murmur3_x64_128(&mut std::io::Cursor::new(&serialized), 0)?;
    Ok(to_hex(&hash.to_le_bytes()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
            let _ = write!(out, "{:02x}", b);
            out
        })
}
