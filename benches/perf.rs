use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::runtime::Runtime;
use udfcoord::FunctionCoordinator;
use udfcoord::config::{CoordConfig, DurabilityMode};
use udfcoord::registry::types::{DataType, Value};
use udfcoord::sandbox::WasmSandbox;
use udfcoord::store::MemoryMetaStore;
use udfcoord::tso::LocalTimestampSource;

const ADD_ONE: &str = r#"(module
    (func (export "add_one") (param i32) (result i32)
        local.get 0
        i32.const 1
        i32.add))"#;

fn in_memory(config: CoordConfig) -> FunctionCoordinator {
    let sandbox = Arc::new(WasmSandbox::new(config.sandbox.clone()).expect("sandbox"));
    FunctionCoordinator::with_components(
        config,
        Arc::new(MemoryMetaStore::new()),
        Arc::new(LocalTimestampSource::default()),
        sandbox,
    )
    .expect("coordinator")
}

fn bench_hot_paths(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let coord = rt.block_on(async {
        let coord = in_memory(CoordConfig::default());
        coord
            .create_function("add_one", ADD_ONE.as_bytes().to_vec(), vec![DataType::Int32])
            .await
            .expect("create");
        coord
    });

    c.bench_function("get_function_info", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(coord.get_function_info("add_one").await.expect("info"));
            })
        })
    });

    let mut arg = 0i32;
    c.bench_function("run_add_one_cached_module", |b| {
        b.iter(|| {
            rt.block_on(async {
                arg = arg.wrapping_add(1);
                let out = coord
                    .run_function("add_one", vec![Value::Int32(black_box(arg))], None)
                    .await
                    .expect("run");
                black_box(out);
            })
        })
    });

    let mut next = 0u64;
    c.bench_function("create_then_drop_in_memory", |b| {
        b.iter(|| {
            rt.block_on(async {
                next += 1;
                let name = format!("f{next}");
                coord
                    .create_function(&name, ADD_ONE.as_bytes().to_vec(), vec![DataType::Int32])
                    .await
                    .expect("create");
                coord.drop_function(&name).await.expect("drop");
            })
        })
    });
}

fn bench_log_store(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let dir = tempdir().expect("temp");
    let config = CoordConfig {
        durability_mode: DurabilityMode::OsBuffered,
        ..CoordConfig::default()
    };
    let coord = rt.block_on(async {
        FunctionCoordinator::open(config, dir.path()).expect("open")
    });

    let mut next = 0u64;
    c.bench_function("create_then_drop_log_store_buffered", |b| {
        b.iter(|| {
            rt.block_on(async {
                next += 1;
                let name = format!("f{next}");
                coord
                    .create_function(&name, ADD_ONE.as_bytes().to_vec(), vec![DataType::Int32])
                    .await
                    .expect("create");
                coord.drop_function(&name).await.expect("drop");
            })
        })
    });
}

criterion_group!(benches, bench_hot_paths, bench_log_store);
criterion_main!(benches);
