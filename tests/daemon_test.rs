//! Daemon lifecycle: start, control surface availability, orderly
//! shutdown with a clean STOP, and crash detection from a stale
//! liveness marker.

use meshtun::daemon::{self, config::Config};
use meshtun::device::mem::MemTunProvider;
use meshtun::device::TunProvider;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("meshtun-daemon-{}-{}", tag, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn server_config(data_dir: &PathBuf, listen_port: u16, control_port: u16) -> Config {
    let config: Config = toml::from_str(&format!(
        r#"
        [node]
        mode = "server"
        name = "hub"
        data_dir = "{}"

        [network]
        listen_addr = "127.0.0.1:{}"
        control_addr = "127.0.0.1:{}"
        "#,
        data_dir.display(),
        listen_port,
        control_port
    ))
    .unwrap();
    config.validate().unwrap();
    config
}

fn lifecycle_kinds(data_dir: &PathBuf) -> Vec<String> {
    let text = fs::read_to_string(data_dir.join("lifecycle.jsonl")).unwrap_or_default();
    text.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|v| v["event"].as_str().map(str::to_string))
        .collect()
}

async fn control_call(port: u16, request: Value) -> Value {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .unwrap();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await.unwrap();
    serde_json::from_str(line.trim()).unwrap()
}

#[tokio::test]
async fn clean_run_records_start_and_stop() {
    let data_dir = temp_dir("clean");
    let cfg = server_config(&data_dir, 47862, 47861);

    let (provider, _opened_rx) = MemTunProvider::new();
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(daemon::run(cfg, Arc::new(provider) as Arc<dyn TunProvider>, cancel))
    };

    // The control surface comes up as part of the start order.
    let mut up = false;
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", 47861)).await.is_ok() {
            up = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(up, "control socket never came up");

    let response = control_call(47861, json!({"id": 1, "method": "status"})).await;
    assert_eq!(response["result"]["node_name"], "hub");
    assert_eq!(response["result"]["server_mode"], true);

    // The liveness marker exists while the daemon runs.
    assert!(data_dir.join(".alive").exists());

    cancel.cancel();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();

    let kinds = lifecycle_kinds(&data_dir);
    assert!(kinds.contains(&"START".to_string()));
    assert!(kinds.contains(&"STOP".to_string()));
    assert!(!kinds.contains(&"CRASH".to_string()));
    assert!(!data_dir.join(".alive").exists(), "marker not removed");

    fs::remove_dir_all(&data_dir).unwrap();
}

#[tokio::test]
async fn stale_marker_records_a_crash_for_the_previous_run() {
    let data_dir = temp_dir("crash");
    fs::create_dir_all(&data_dir).unwrap();
    // Simulate a run that never reached a clean STOP.
    fs::write(data_dir.join(".alive"), "12345").unwrap();

    let cfg = server_config(&data_dir, 47864, 47863);
    let (provider, _opened_rx) = MemTunProvider::new();
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(daemon::run(cfg, Arc::new(provider) as Arc<dyn TunProvider>, cancel))
    };

    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", 47863)).await.is_ok() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    // The crash is visible over the control surface.
    let response = control_call(
        47863,
        json!({"id": 1, "method": "crash_stats", "params": {"since": "-1h"}}),
    )
    .await;
    assert_eq!(response["result"]["crashes"], 1);

    cancel.cancel();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();

    let kinds = lifecycle_kinds(&data_dir);
    assert_eq!(kinds.iter().filter(|k| *k == "CRASH").count(), 1);
    assert!(kinds.contains(&"STOP".to_string()));

    fs::remove_dir_all(&data_dir).unwrap();
}
