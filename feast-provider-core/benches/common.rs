#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use feast_provider_core::config::OfflineStoreConfig;
use feast_provider_core::feast::types::value::Val;
use feast_provider_core::feast::types::{EntityKey, Value};
use feast_provider_core::model::WriteRecord;
use feast_provider_core::offline_store::LocalOfflineEngine;
use feast_provider_core::registry::FileRegistry;
use feast_provider_core::table::{Cell, Table};

pub fn manifest_path(relative: &str) -> String {
    format!("{}/{}", env!("CARGO_MANIFEST_DIR"), relative)
}

pub fn registry() -> Result<FileRegistry> {
    FileRegistry::from_path(&manifest_path("test_data/registry.yaml"))
}

pub fn offline_engine(registry: &FileRegistry) -> Result<LocalOfflineEngine> {
    let config = OfflineStoreConfig::Local {
        tables: BTreeMap::from([
            ("feast.driver_stats".to_string(), "driver_stats.json".to_string()),
            (
                "feast.customer_profile".to_string(),
                "customer_profile.json".to_string(),
            ),
        ]),
    };
    let dir = manifest_path("test_data");
    LocalOfflineEngine::from_config(&config, Some(&dir), registry.feature_views())
}

pub fn driver_key(driver_id: i64) -> EntityKey {
    EntityKey {
        join_keys: vec!["driver_id".to_string()],
        entity_values: vec![Value {
            val: Some(Val::Int64Val(driver_id)),
        }],
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 4, 12, 0, 0, 0).unwrap()
}

pub fn driver_records(count: usize) -> Vec<WriteRecord> {
    (0..count)
        .map(|i| {
            let values = HashMap::from([
                (
                    "conv_rate".to_string(),
                    Value {
                        val: Some(Val::FloatVal(i as f32 / count as f32)),
                    },
                ),
                (
                    "avg_daily_trips".to_string(),
                    Value {
                        val: Some(Val::Int64Val(i as i64)),
                    },
                ),
            ]);
            WriteRecord::new(
                driver_key(1000 + i as i64),
                values,
                base_time() + Duration::seconds(i as i64),
                None,
            )
        })
        .collect()
}

/// Entity rows over `drivers` drivers, one row per driver and hour.
pub fn entity_table(drivers: i64, hours: i64) -> Table {
    let rows = (0..drivers)
        .flat_map(|driver| {
            (0..hours).map(move |hour| {
                vec![
                    Cell::Int(1000 + driver),
                    Cell::Timestamp(base_time() + Duration::hours(hour)),
                ]
            })
        })
        .collect();
    Table::new(
        vec!["driver_id".to_string(), "event_timestamp".to_string()],
        rows,
    )
    .expect("entity table rows match columns")
}

/// Feature rows for `drivers` drivers, one row every 30 minutes.
pub fn driver_stats_table(drivers: i64, hours: i64) -> Table {
    let rows = (0..drivers)
        .flat_map(|driver| {
            (0..hours * 2).map(move |slot| {
                let ts = base_time() - Duration::hours(1) + Duration::minutes(30 * slot);
                vec![
                    Cell::Int(1000 + driver),
                    Cell::Timestamp(ts),
                    Cell::Timestamp(ts + Duration::minutes(5)),
                    Cell::Float(slot as f64 / 100.0),
                    Cell::Float(0.5),
                    Cell::Int(slot),
                ]
            })
        })
        .collect();
    Table::new(
        vec![
            "driver_id".to_string(),
            "event_timestamp".to_string(),
            "created".to_string(),
            "conv_rate".to_string(),
            "acc_rate".to_string(),
            "avg_daily_trips".to_string(),
        ],
        rows,
    )
    .expect("feature table rows match columns")
}
