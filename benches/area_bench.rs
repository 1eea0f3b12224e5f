//! Benchmarks for area file operations

use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::TempDir;

use areastore::{
    Config, ConfigAreaFile, IntervalSemantics, ObjectInfo, PersistenceMode, RestructureMode, TimeAuthority,
};

const OBJECTS: u64 = 1_000;

fn bench_config() -> Config {
    Config::builder().sync_on_flush(false).build()
}

/// Area with `OBJECTS` flushed dynamic objects, half of them invalid
fn populated_area(dir: &TempDir) -> ConfigAreaFile {
    let area = ConfigAreaFile::create_with(bench_config(), dir.path().join("bench.area"), "area.bench", 1, 1).unwrap();
    for id in 1..=OBJECTS {
        let object = area
            .create_dynamic_object(id, 7, &format!("obj.{}", id), 0, "bench", PersistenceMode::Persistent)
            .unwrap();
        object.set_config_data(1, vec![id as u8; 64]);
        if id % 2 == 0 {
            area.set_invalid(&ObjectInfo::from(object)).unwrap();
        }
    }
    area.flush().unwrap();
    area
}

fn area_benchmarks(c: &mut Criterion) {
    c.bench_function("create_and_flush_100_dynamic_objects", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let area =
                    ConfigAreaFile::create_with(bench_config(), dir.path().join("bench.area"), "area.bench", 1, 1)
                        .unwrap();
                (dir, area)
            },
            |(_dir, area)| {
                for id in 1..=100u64 {
                    area.create_dynamic_object(id, 7, "", 0, "bench", PersistenceMode::Persistent)
                        .unwrap();
                }
                area.flush().unwrap();
            },
            BatchSize::PerIteration,
        )
    });

    c.bench_function("restructure_remove_gaps", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let area = populated_area(&dir);
                (dir, area)
            },
            |(_dir, area)| {
                area.restructure(RestructureMode::RemoveGaps).unwrap();
            },
            BatchSize::PerIteration,
        )
    });

    let dir = TempDir::new().unwrap();
    let area = populated_area(&dir);
    area.restructure(RestructureMode::RemoveGaps).unwrap();

    c.bench_function("query_all_history", |b| {
        b.iter(|| {
            area.query(0, i64::MAX, TimeAuthority::Local, IntervalSemantics::Overlap, &[])
                .unwrap()
        })
    });

    c.bench_function("get_old_object_by_id", |b| {
        let mut id = 0;
        b.iter(|| {
            id = id % OBJECTS + 2;
            area.get_old_object(id).unwrap()
        })
    });

    let reopened_dir = TempDir::new().unwrap();
    let path = reopened_dir.path().join("bench.area");
    {
        let area = ConfigAreaFile::create_with(bench_config(), &path, "area.bench", 1, 1).unwrap();
        for id in 1..=OBJECTS {
            area.create_dynamic_object(id, 7, "", 0, "bench", PersistenceMode::Persistent)
                .unwrap();
        }
        area.close().unwrap();
    }
    c.bench_function("open_1000_objects", |b| {
        b.iter(|| {
            let area = ConfigAreaFile::open_with(bench_config(), &path, 1, &BTreeMap::new()).unwrap();
            area.close().unwrap();
        })
    });
}

criterion_group!(benches, area_benchmarks);
criterion_main!(benches);
