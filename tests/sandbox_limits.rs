use std::sync::Arc;
use std::time::{Duration, Instant};
use udfcoord::FunctionCoordinator;
use udfcoord::config::{CoordConfig, SandboxConfig};
use udfcoord::error::{CoordError, SandboxResource};
use udfcoord::registry::types::{DataType, Value};
use udfcoord::sandbox::WasmSandbox;
use udfcoord::store::MemoryMetaStore;
use udfcoord::tso::LocalTimestampSource;

const SPIN: &str = r#"(module
    (func (export "spin") (param i32)
        (loop $forever (br $forever))))"#;

const ADD_ONE: &str = r#"(module
    (func (export "add_one") (param i32) (result i32)
        local.get 0
        i32.const 1
        i32.add))"#;

const HOG: &str = r#"(module
    (memory 1)
    (func (export "hog") (result i32)
        i32.const 1024
        memory.grow))"#;

const COUNTER: &str = r#"(module
    (global $n (mut i64) (i64.const 0))
    (func (export "counter") (param i64) (result i64)
        global.get $n
        local.get 0
        i64.add
        global.set $n
        global.get $n))"#;

const DIVIDE: &str = r#"(module
    (func (export "divide") (param i32 i32) (result i32)
        local.get 0
        local.get 1
        i32.div_s))"#;

fn coordinator(max_execution_ms: u64) -> Arc<FunctionCoordinator> {
    let config = CoordConfig {
        sandbox: SandboxConfig {
            max_execution_ms,
            max_memory_bytes: 8 * 1024 * 1024,
            ..SandboxConfig::default()
        },
        max_concurrent_runs: 4,
        ..CoordConfig::default()
    };
    let sandbox = Arc::new(WasmSandbox::new(config.sandbox.clone()).expect("sandbox"));
    Arc::new(
        FunctionCoordinator::with_components(
            config,
            Arc::new(MemoryMetaStore::new()),
            Arc::new(LocalTimestampSource::default()),
            sandbox,
        )
        .expect("coordinator"),
    )
}

fn is_limit(err: &CoordError) -> bool {
    matches!(
        err,
        CoordError::ResourceExceeded {
            resource: SandboxResource::ExecutionTime | SandboxResource::Fuel,
            ..
        }
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn endless_run_aborts_while_other_operations_proceed() {
    let coord = coordinator(300);
    coord
        .create_function("spin", SPIN.as_bytes().to_vec(), vec![DataType::Int32])
        .await
        .expect("create spin");

    let runner = {
        let coord = Arc::clone(&coord);
        tokio::spawn(async move {
            let started = Instant::now();
            let result = coord.run_function("spin", vec![Value::Int32(0)], None).await;
            (result, started.elapsed())
        })
    };

    // Mutations and reads on other names while the spin is in flight.
    for i in 0..5 {
        let name = format!("other_{i}");
        coord
            .create_function(&name, ADD_ONE.as_bytes().to_vec(), vec![DataType::Int32])
            .await
            .expect("create during spin");
        coord.get_function_info(&name).await.expect("info during spin");
    }
    coord.drop_function("other_0").await.expect("drop during spin");

    let (result, elapsed) = runner.await.expect("join");
    let err = result.expect_err("spin cannot finish");
    assert!(is_limit(&err), "unexpected error: {err:?}");
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");

    let out = coord
        .run_function("other_1", vec![Value::Int32(41)], None)
        .await
        .expect("run after abort");
    assert_eq!(out, vec![Value::Int32(42)]);
    coord.get_function_info("spin").await.expect("spin stays registered");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_runs_are_independent() {
    let coord = coordinator(200);
    coord
        .create_function("spin", SPIN.as_bytes().to_vec(), vec![DataType::Int32])
        .await
        .expect("create spin");
    coord
        .create_function("add_one", ADD_ONE.as_bytes().to_vec(), vec![DataType::Int32])
        .await
        .expect("create add_one");

    let spinning = {
        let coord = Arc::clone(&coord);
        tokio::spawn(async move { coord.run_function("spin", vec![Value::Int32(0)], None).await })
    };
    let adds: Vec<_> = (0..8)
        .map(|i| {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                coord
                    .run_function("add_one", vec![Value::Int32(i)], None)
                    .await
            })
        })
        .collect();
    for (i, handle) in adds.into_iter().enumerate() {
        let out = handle.await.expect("join").expect("add_one");
        assert_eq!(out, vec![Value::Int32(i as i32 + 1)]);
    }
    let err = spinning.await.expect("join").expect_err("spin");
    assert!(is_limit(&err), "unexpected error: {err:?}");
}

#[tokio::test]
async fn caller_timeout_shortens_the_run() {
    let coord = coordinator(10_000);
    coord
        .create_function("spin", SPIN.as_bytes().to_vec(), vec![DataType::Int32])
        .await
        .expect("create");
    let started = Instant::now();
    let err = coord
        .run_function(
            "spin",
            vec![Value::Int32(0)],
            Some(Duration::from_millis(100)),
        )
        .await
        .expect_err("limited");
    assert!(is_limit(&err), "unexpected error: {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn memory_ceiling_is_enforced() {
    let coord = coordinator(1_000);
    coord
        .create_function("hog", HOG.as_bytes().to_vec(), vec![])
        .await
        .expect("create");
    let err = coord.run_function("hog", vec![], None).await.expect_err("64 MiB");
    assert!(matches!(
        err,
        CoordError::ResourceExceeded {
            resource: SandboxResource::Memory,
            ..
        }
    ));
}

#[tokio::test]
async fn no_state_leaks_between_invocations() {
    let coord = coordinator(1_000);
    coord
        .create_function("counter", COUNTER.as_bytes().to_vec(), vec![DataType::Int64])
        .await
        .expect("create");
    for step in [3i64, 7, 11] {
        let out = coord
            .run_function("counter", vec![Value::Int64(step)], None)
            .await
            .expect("run");
        assert_eq!(out, vec![Value::Int64(step)]);
    }
}

#[tokio::test]
async fn runtime_fault_is_a_trap_and_function_stays_usable() {
    let coord = coordinator(1_000);
    coord
        .create_function(
            "divide",
            DIVIDE.as_bytes().to_vec(),
            vec![DataType::Int32, DataType::Int32],
        )
        .await
        .expect("create");
    let err = coord
        .run_function("divide", vec![Value::Int32(1), Value::Int32(0)], None)
        .await
        .expect_err("divide by zero");
    assert_eq!(err.code_str(), "sandbox_trap");
    let out = coord
        .run_function("divide", vec![Value::Int32(9), Value::Int32(3)], None)
        .await
        .expect("divide");
    assert_eq!(out, vec![Value::Int32(3)]);
}

#[tokio::test]
async fn wrong_argument_types_never_reach_the_sandbox() {
    let coord = coordinator(1_000);
    coord
        .create_function("add_one", ADD_ONE.as_bytes().to_vec(), vec![DataType::Int32])
        .await
        .expect("create");
    let err = coord
        .run_function("add_one", vec![Value::Double(1.0)], None)
        .await
        .expect_err("double for int32");
    assert_eq!(err.code_str(), "argument_type_mismatch");
    assert_eq!(coord.metrics().module_cache.misses, 0);
}

#[tokio::test]
async fn malformed_body_fails_at_run_not_at_create() {
    let coord = coordinator(1_000);
    coord
        .create_function("junk", b"\0asm\xff\xff".to_vec(), vec![])
        .await
        .expect("create accepts opaque bytes");
    let err = coord.run_function("junk", vec![], None).await.expect_err("compile");
    assert_eq!(err.code_str(), "compile_error");
    coord.get_function_info("junk").await.expect("still registered");
}
