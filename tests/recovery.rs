use std::fs::{self, OpenOptions};
use std::io::Write;
use udfcoord::FunctionCoordinator;
use udfcoord::config::{CoordConfig, RecoveryMode};
use udfcoord::registry::types::{DataType, Value};
use udfcoord::store::log::LOG_FILE_NAME;
use tempfile::tempdir;

const DOUBLE_IT: &str = r#"(module
    (func (export "double_it") (param i64) (result i64)
        local.get 0
        i64.const 2
        i64.mul))"#;

#[tokio::test]
async fn registry_survives_restart() {
    let dir = tempdir().expect("temp");
    let (created_ts, dropped_ts) = {
        let coord = FunctionCoordinator::open(CoordConfig::default(), dir.path()).expect("open");
        let created = coord
            .create_function("double_it", DOUBLE_IT.as_bytes().to_vec(), vec![DataType::Int64])
            .await
            .expect("create");
        coord
            .create_function("temp", DOUBLE_IT.as_bytes().to_vec(), vec![DataType::Int64])
            .await
            .expect("create temp");
        let dropped = coord.drop_function("temp").await.expect("drop temp");
        coord.shutdown().await;
        (created, dropped)
    };

    let coord = FunctionCoordinator::open(CoordConfig::default(), dir.path()).expect("reopen");
    assert_eq!(coord.recovery_report().functions, 1);
    assert_eq!(coord.list_functions().expect("list"), vec!["double_it".to_string()]);
    let info = coord.get_function_info("double_it").await.expect("info");
    assert_eq!(info.registered_at, created_ts);
    let out = coord
        .run_function("double_it", vec![Value::Int64(21)], None)
        .await
        .expect("run");
    assert_eq!(out, vec![Value::Int64(42)]);

    assert_eq!(coord.recovery_report().high_water_mark, dropped_ts);
    let ts = coord
        .create_function("next", DOUBLE_IT.as_bytes().to_vec(), vec![DataType::Int64])
        .await
        .expect("create after restart");
    assert!(ts > dropped_ts);
    coord.shutdown().await;
}

#[tokio::test]
async fn torn_log_tail_is_discarded_on_open() {
    let dir = tempdir().expect("temp");
    {
        let coord = FunctionCoordinator::open(CoordConfig::default(), dir.path()).expect("open");
        coord
            .create_function("double_it", DOUBLE_IT.as_bytes().to_vec(), vec![DataType::Int64])
            .await
            .expect("create");
        coord.shutdown().await;
    }
    let path = dir.path().join(LOG_FILE_NAME);
    let mut file = OpenOptions::new().append(true).open(&path).expect("open log");
    file.write_all(&[0, 0, 1, 0, 9, 9, 9]).expect("append torn bytes");
    drop(file);

    let coord = FunctionCoordinator::open(CoordConfig::default(), dir.path()).expect("reopen");
    coord.get_function_info("double_it").await.expect("survived");
    coord
        .create_function("after", DOUBLE_IT.as_bytes().to_vec(), vec![DataType::Int64])
        .await
        .expect("append after truncation");
    coord.shutdown().await;
}

#[tokio::test]
async fn corrupt_log_fails_strict_open_and_recovers_permissively() {
    let dir = tempdir().expect("temp");
    {
        let coord = FunctionCoordinator::open(CoordConfig::default(), dir.path()).expect("open");
        for name in ["first", "second"] {
            coord
                .create_function(name, DOUBLE_IT.as_bytes().to_vec(), vec![DataType::Int64])
                .await
                .expect("create");
        }
        coord.shutdown().await;
    }
    let path = dir.path().join(LOG_FILE_NAME);
    let mut bytes = fs::read(&path).expect("read log");
    let at = bytes.len() - 10;
    bytes[at] ^= 0x5A;
    fs::write(&path, &bytes).expect("write log");

    let err = FunctionCoordinator::open(CoordConfig::default(), dir.path())
        .err()
        .expect("strict open fails");
    assert_eq!(err.code_str(), "integrity_error");

    let permissive = CoordConfig {
        recovery_mode: RecoveryMode::Permissive,
        ..CoordConfig::default()
    };
    let coord = FunctionCoordinator::open(permissive, dir.path()).expect("permissive open");
    assert_eq!(coord.list_functions().expect("list"), vec!["first".to_string()]);
    coord.shutdown().await;
}
