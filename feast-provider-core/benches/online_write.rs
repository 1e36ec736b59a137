use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::sync::Arc;
use tokio::runtime::Runtime;

#[path = "common.rs"]
mod common;

use common::driver_records;
use feast_provider_core::config::{EntityKeySerializationVersion, OnlineWriteConfig};
use feast_provider_core::online_write::OnlineWriter;
use feast_provider_core::onlinestore::Datastore;
use feast_provider_core::onlinestore::memory::InMemoryDatastore;

fn bench_online_write(c: &mut Criterion) {
    let runtime = Runtime::new().expect("failed to create tokio runtime");
    let records = driver_records(1000);

    c.bench_function("online_write_batch_1000_rows", |b| {
        b.to_async(&runtime).iter_batched(
            || records.clone(),
            |records| async move {
                let store: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
                let writer = OnlineWriter::new(
                    store,
                    "bench",
                    EntityKeySerializationVersion::V3,
                    OnlineWriteConfig::default(),
                )
                .expect("invalid writer config");
                writer
                    .write_batch("driver_hourly_stats", records, None)
                    .await
                    .expect("online write failed");
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(online_write_benches, bench_online_write);
criterion_main!(online_write_benches);
