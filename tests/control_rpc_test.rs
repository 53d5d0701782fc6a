//! Control RPC contract over the loopback socket: id echo, result shapes,
//! the protocol error codes, and request ordering within one connection.

use meshtun::control::{server as control_server, NodeCtx, Role};
use meshtun::crypto::plain::PlainCipher;
use meshtun::crypto::Cipher;
use meshtun::device::mem::MemTun;
use meshtun::device::{TunAdapter, TunConfig};
use meshtun::server::{ServerEngine, ServerEngineConfig};
use meshtun::store::mem::MemStore;
use meshtun::store::{LifecycleEvent, LifecycleKind, Store};
use meshtun::topology::now_unix;
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

async fn start_control(port: u16) -> (Arc<MemStore>, CancellationToken) {
    let (tun, _host) = MemTun::new(TunConfig::new(
        Ipv4Addr::new(10, 8, 0, 1),
        Ipv4Addr::new(10, 8, 0, 1),
    ));
    let cancel = CancellationToken::new();
    let cipher: Arc<Box<dyn Cipher>> = Arc::new(Box::new(PlainCipher::new()));
    let store = Arc::new(MemStore::new());
    let engine = ServerEngine::new(
        ServerEngineConfig {
            node_name: "hub".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            subnet: "10.8.0.0/24".parse().unwrap(),
            public_addr: None,
        },
        tun as Arc<dyn TunAdapter>,
        store.clone() as Arc<dyn Store>,
        cipher,
        false,
        None,
        cancel.clone(),
    );
    store
        .append_lifecycle(LifecycleEvent {
            timestamp: now_unix(),
            event: LifecycleKind::Start,
            reason: "test".to_string(),
            uptime_seconds: 0,
            route_all_at_event: false,
            route_restored: false,
            version: meshtun::VERSION.to_string(),
        })
        .unwrap();

    let ctx = Arc::new(NodeCtx {
        node_name: "hub".to_string(),
        started_at: Instant::now(),
        store: store.clone(),
        role: Role::Server(engine),
        update_command: None,
    });
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = control_server::run(format!("127.0.0.1:{}", port), ctx, cancel).await;
        });
    }
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    (store, cancel)
}

struct ControlClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl ControlClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        self.reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(response.trim()).unwrap()
    }

    async fn call(&mut self, id: u64, method: &str, params: Value) -> Value {
        self.send_raw(&json!({ "id": id, "method": method, "params": params }).to_string())
            .await
    }
}

#[tokio::test]
async fn status_and_unknown_method() {
    let (_store, cancel) = start_control(47851).await;
    let mut client = ControlClient::connect(47851).await;

    let response = client.call(7, "status", Value::Null).await;
    assert_eq!(response["id"], 7);
    let result = &response["result"];
    assert_eq!(result["node_name"], "hub");
    assert_eq!(result["version"], meshtun::VERSION);
    assert_eq!(result["vpn_address"], "10.8.0.1");
    assert_eq!(result["peer_count"], 0);
    assert_eq!(result["bytes_in"], 0);
    assert_eq!(result["bytes_out"], 0);
    assert_eq!(result["server_mode"], true);

    let response = client.call(8, "bogus", Value::Null).await;
    assert_eq!(response["id"], 8);
    assert_eq!(response["error"]["code"], -32601);
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("bogus"));

    cancel.cancel();
}

#[tokio::test]
async fn protocol_errors_keep_the_connection_open() {
    let (_store, cancel) = start_control(47852).await;
    let mut client = ControlClient::connect(47852).await;

    // Bad JSON: -32602, connection survives.
    let response = client.send_raw("{not json").await;
    assert_eq!(response["error"]["code"], -32602);

    // Bad time expression: -32602 with the parser's message.
    let response = client
        .call(2, "logs", json!({ "from": "-1x" }))
        .await;
    assert_eq!(response["error"]["code"], -32602);
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("unknown time unit"));

    // Bad granularity: -32602.
    let response = client
        .call(3, "stats", json!({ "granularity": "fortnight" }))
        .await;
    assert_eq!(response["error"]["code"], -32602);

    // Client-only method on a server: -32602.
    let response = client.call(4, "connect", Value::Null).await;
    assert_eq!(response["error"]["code"], -32602);

    // The same connection still answers real requests.
    let response = client.call(5, "status", Value::Null).await;
    assert_eq!(response["id"], 5);
    assert!(response.get("error").is_none());

    cancel.cancel();
}

#[tokio::test]
async fn responses_preserve_request_order() {
    let (_store, cancel) = start_control(47853).await;
    let mut client = ControlClient::connect(47853).await;

    for id in 1..=10u64 {
        let response = client.call(id, "status", Value::Null).await;
        assert_eq!(response["id"], id);
    }

    cancel.cancel();
}

#[tokio::test]
async fn lifecycle_and_crash_stats_read_the_store() {
    let (store, cancel) = start_control(47854).await;

    store
        .append_lifecycle(LifecycleEvent {
            timestamp: now_unix(),
            event: LifecycleKind::Crash,
            reason: "stale liveness marker at startup".to_string(),
            uptime_seconds: 0,
            route_all_at_event: false,
            route_restored: false,
            version: meshtun::VERSION.to_string(),
        })
        .unwrap();

    let mut client = ControlClient::connect(47854).await;

    let response = client.call(1, "lifecycle", json!({ "limit": 1 })).await;
    let events = response["result"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "CRASH");

    let response = client.call(2, "crash_stats", json!({ "since": "-1h" })).await;
    assert_eq!(response["result"]["crashes"], 1);
    assert_eq!(response["result"]["last_crash"]["event"], "CRASH");

    let response = client.call(3, "network_peers", Value::Null).await;
    assert_eq!(response["result"]["server_mode"], true);
    let peers = response["result"]["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["vpn_address"], "10.8.0.1");

    cancel.cancel();
}
