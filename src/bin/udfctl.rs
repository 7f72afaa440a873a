use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use udfcoord::FunctionCoordinator;
use udfcoord::config::{CoordConfig, RecoveryMode};
use udfcoord::registry::types::{DataType, Value};
use udfcoord::store::LogMetaStore;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    let rest = &args[2..];
    match args[1].as_str() {
        "create" => block_on(cmd_create(rest)),
        "drop" => block_on(cmd_drop(rest)),
        "info" => block_on(cmd_info(rest)),
        "list" => block_on(cmd_list(rest)),
        "run" => block_on(cmd_run(rest)),
        "compact" => cmd_compact(rest),
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

fn block_on<F: std::future::Future<Output = Result<(), String>>>(fut: F) -> Result<(), String> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("tokio runtime: {e}"))?
        .block_on(fut)
}

async fn cmd_create(args: &[String]) -> Result<(), String> {
    let coord = open(args)?;
    let name = parse_flag_value(args, "--name").ok_or("--name is required")?;
    let binary_path = parse_flag_value(args, "--binary").ok_or("--binary is required")?;
    let binary =
        std::fs::read(&binary_path).map_err(|e| format!("read {binary_path}: {e}"))?;
    let arg_types = parse_arg_types(args)?;
    let result = coord.create_function(&name, binary, arg_types).await;
    coord.shutdown().await;
    let ts = result.map_err(|e| format!("create {name}: {e}"))?;
    println!("{}", json!({ "created": name, "ts": ts }));
    Ok(())
}

async fn cmd_drop(args: &[String]) -> Result<(), String> {
    let coord = open(args)?;
    let name = parse_flag_value(args, "--name").ok_or("--name is required")?;
    let result = coord.drop_function(&name).await;
    coord.shutdown().await;
    let ts = result.map_err(|e| format!("drop {name}: {e}"))?;
    println!("{}", json!({ "dropped": name, "ts": ts }));
    Ok(())
}

async fn cmd_info(args: &[String]) -> Result<(), String> {
    let coord = open(args)?;
    let name = parse_flag_value(args, "--name").ok_or("--name is required")?;
    let info = coord
        .get_function_info(&name)
        .await
        .map_err(|e| format!("info {name}: {e}"))?;
    println!(
        "{}",
        json!({
            "name": info.name,
            "arg_types": info.arg_types,
            "registered_at": info.registered_at,
            "binary_bytes": info.binary.len(),
            "binary_blake3": blake3::hash(&info.binary).to_hex().to_string(),
        })
    );
    Ok(())
}

async fn cmd_list(args: &[String]) -> Result<(), String> {
    let coord = open(args)?;
    for name in coord.list_functions().map_err(|e| format!("list: {e}"))? {
        println!("{name}");
    }
    Ok(())
}

async fn cmd_run(args: &[String]) -> Result<(), String> {
    let coord = open(args)?;
    let name = parse_flag_value(args, "--name").ok_or("--name is required")?;
    let info = coord
        .get_function_info(&name)
        .await
        .map_err(|e| format!("run {name}: {e}"))?;
    let raw = parse_flag_value(args, "--args").unwrap_or_default();
    let raw: Vec<&str> = raw.split(',').filter(|s| !s.trim().is_empty()).collect();
    if raw.len() != info.arg_types.len() {
        return Err(format!(
            "{name} takes {} arguments, got {}",
            info.arg_types.len(),
            raw.len()
        ));
    }
    let values = info
        .arg_types
        .iter()
        .zip(raw)
        .map(|(ty, raw)| Value::parse_as(*ty, raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    let timeout = match parse_flag_value(args, "--timeout-ms") {
        Some(ms) => Some(Duration::from_millis(
            ms.parse()
                .map_err(|e| format!("invalid --timeout-ms: {e}"))?,
        )),
        None => None,
    };
    let out = coord
        .run_function(&name, values, timeout)
        .await
        .map_err(|e| format!("run {name}: {} ({e})", e.code_str()))?;
    let rendered: Vec<String> = out.iter().map(Value::to_string).collect();
    println!("{}", json!({ "function": name, "results": rendered }));
    Ok(())
}

fn cmd_compact(args: &[String]) -> Result<(), String> {
    let data_dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let config = parse_config(args);
    let store = LogMetaStore::open(
        Path::new(&data_dir),
        config.durability_mode,
        config.recovery_mode,
    )
    .map_err(|e| format!("open {data_dir}: {e}"))?;
    let report = store.compact().map_err(|e| format!("compact: {e}"))?;
    println!(
        "{}",
        json!({
            "live_entries": report.live_entries,
            "bytes_before": report.bytes_before,
            "bytes_after": report.bytes_after,
        })
    );
    Ok(())
}

fn open(args: &[String]) -> Result<FunctionCoordinator, String> {
    let data_dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    FunctionCoordinator::open(parse_config(args), Path::new(&data_dir))
        .map_err(|e| format!("open {data_dir}: {e}"))
}

fn parse_config(args: &[String]) -> CoordConfig {
    let mut config = if args.iter().any(|a| a == "--dev") {
        CoordConfig::development()
    } else {
        CoordConfig::default()
    };
    if args.iter().any(|a| a == "--permissive") {
        config.recovery_mode = RecoveryMode::Permissive;
    }
    config
}

fn parse_arg_types(args: &[String]) -> Result<Vec<DataType>, String> {
    let Some(raw) = parse_flag_value(args, "--arg-types") else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<DataType>().map_err(|e| e.to_string()))
        .collect()
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn print_usage() {
    eprintln!(
        "usage:
  udfctl create --data-dir <dir> --name <name> --binary <file> [--arg-types int32,int64]
  udfctl drop --data-dir <dir> --name <name>
  udfctl info --data-dir <dir> --name <name>
  udfctl list --data-dir <dir>
  udfctl run --data-dir <dir> --name <name> [--args 1,2] [--timeout-ms <ms>]
  udfctl compact --data-dir <dir>
flags: --dev (development preset), --permissive (permissive recovery)"
    );
}
