use std::sync::Arc;
use udfcoord::FunctionCoordinator;
use udfcoord::config::CoordConfig;
use udfcoord::error::CoordError;
use udfcoord::registry::types::{DataType, Value};
use udfcoord::sandbox::WasmSandbox;
use udfcoord::store::MemoryMetaStore;
use udfcoord::task::{
    CreateFunctionRequest, DropFunctionRequest, GetFunctionInfoRequest, MsgType,
    RunFunctionRequest, Task, TaskRequest,
};
use udfcoord::tso::LocalTimestampSource;

const ADD_ONE: &str = r#"(module
    (func (export "add_one") (param i32) (result i32)
        local.get 0
        i32.const 1
        i32.add))"#;

fn coordinator_at(first_ts: u64) -> FunctionCoordinator {
    let config = CoordConfig::default();
    let sandbox = Arc::new(WasmSandbox::new(config.sandbox.clone()).expect("sandbox"));
    FunctionCoordinator::with_components(
        config,
        Arc::new(MemoryMetaStore::new()),
        Arc::new(LocalTimestampSource::starting_at(first_ts)),
        sandbox,
    )
    .expect("coordinator")
}

#[tokio::test]
async fn add_one_full_lifecycle() {
    let coord = coordinator_at(100);
    let binary = ADD_ONE.as_bytes().to_vec();

    let ts = coord
        .create_function("add_one", binary.clone(), vec![DataType::Int32])
        .await
        .expect("create");
    assert_eq!(ts, 100);

    let info = coord.get_function_info("add_one").await.expect("info");
    assert_eq!(info.binary, binary);
    assert_eq!(info.arg_types, vec![DataType::Int32]);
    assert_eq!(info.registered_at, 100);

    let out = coord
        .run_function("add_one", vec![Value::Int32(5)], None)
        .await
        .expect("run");
    assert_eq!(out, vec![Value::Int32(6)]);

    coord.drop_function("add_one").await.expect("drop");
    let err = coord.get_function_info("add_one").await.expect_err("dropped");
    assert!(matches!(err, CoordError::NotFound { .. }));
    let err = coord
        .run_function("add_one", vec![Value::Int32(5)], None)
        .await
        .expect_err("dropped");
    assert!(matches!(err, CoordError::NotFound { .. }));
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let coord = coordinator_at(1);
    let first = coord
        .create_function("add_one", ADD_ONE.as_bytes().to_vec(), vec![DataType::Int32])
        .await
        .expect("create");
    let err = coord
        .create_function("add_one", b"\0asm\x01\0\0\0".to_vec(), vec![])
        .await
        .expect_err("duplicate");
    assert_eq!(err.code_str(), "already_exists");
    let info = coord.get_function_info("add_one").await.expect("info");
    assert_eq!(info.registered_at, first);
    assert_eq!(info.arg_types, vec![DataType::Int32]);
}

#[tokio::test]
async fn committed_timestamps_are_strictly_increasing() {
    let coord = coordinator_at(1);
    let mut seen = Vec::new();
    for i in 0..8 {
        let name = format!("f{i}");
        seen.push(
            coord
                .create_function(&name, ADD_ONE.as_bytes().to_vec(), vec![DataType::Int32])
                .await
                .expect("create"),
        );
        if i % 2 == 0 {
            seen.push(coord.drop_function(&name).await.expect("drop"));
        }
    }
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    assert_eq!(coord.list_functions().expect("list").len(), 4);
}

#[tokio::test]
async fn every_task_kind_rejects_foreign_envelope() {
    let coord = coordinator_at(1);
    let requests: Vec<TaskRequest> = vec![
        CreateFunctionRequest::new("f", ADD_ONE.as_bytes().to_vec(), vec![]).into(),
        DropFunctionRequest::new("f").into(),
        GetFunctionInfoRequest::new("f").into(),
        RunFunctionRequest::new("f", vec![]).into(),
    ];
    for request in requests {
        let expected = request.expected_kind();
        let foreign = if expected == MsgType::CreateFunction {
            MsgType::GetFunctionInfo
        } else {
            MsgType::CreateFunction
        };
        let mut request = request;
        match &mut request {
            TaskRequest::CreateFunction(r) => r.base.msg_type = foreign,
            TaskRequest::DropFunction(r) => r.base.msg_type = foreign,
            TaskRequest::GetFunctionInfo(r) => r.base.msg_type = foreign,
            TaskRequest::RunFunction(r) => r.base.msg_type = foreign,
        }
        let err = coord
            .submit(Task::new(request))
            .await
            .expect_err("foreign envelope");
        assert_eq!(err.code_str(), "invalid_operation_kind");
    }
    assert!(coord.list_functions().expect("list").is_empty());
    assert_eq!(coord.metrics().executor.mutations_total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_race_to_one_winner() {
    let coord = Arc::new(coordinator_at(1));
    let handles: Vec<_> = (0..12)
        .map(|i| {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                coord
                    .create_function("contended", vec![i as u8 + 1], vec![])
                    .await
            })
        })
        .collect();
    let mut winners = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e.code_str(), "already_exists"),
        }
    }
    assert_eq!(winners, 1);
}
