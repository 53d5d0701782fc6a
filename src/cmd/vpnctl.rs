//! CLI over the control RPC surface. Thin glue: build one request line,
//! print one response, exit 0 on success and non-zero on transport or
//! server error.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Matches the control server's response-line bound.
const MAX_RESPONSE_LINE: u64 = 10 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "vpnctl", version, about = "mesh VPN control CLI")]
struct Cli {
    /// Control socket of the node to talk to.
    #[arg(long, global = true, default_value = "127.0.0.1:9001")]
    node: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Node identity, uptime and traffic totals.
    Status,
    /// Directly connected peers (server mode).
    Peers,
    /// Full membership view.
    NetworkPeers,
    /// Node and edge view of the mesh.
    Topology,
    /// Query stored logs. Time syntax: -1h, -1d@d, 2026-03-05, now.
    Logs {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Query traffic metrics.
    Stats {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        /// raw, 1m, 1h or auto.
        #[arg(long)]
        granularity: Option<String>,
    },
    /// Route all host traffic through the tunnel (client mode).
    Connect,
    /// Announce disconnect and restore host routes (client mode).
    Disconnect {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Tunnel and routing state (client mode).
    ConnectionStatus,
    /// Run the deploy task; --all also notifies every peer.
    Update {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        rolling: bool,
    },
    /// Recent lifecycle events.
    Lifecycle {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Crash counts over a time range.
    Crashes {
        #[arg(long)]
        since: Option<String>,
    },
}

fn request_for(cmd: &Cmd) -> (&'static str, Value) {
    match cmd {
        Cmd::Status => ("status", Value::Null),
        Cmd::Peers => ("peers", Value::Null),
        Cmd::NetworkPeers => ("network_peers", Value::Null),
        Cmd::Topology => ("topology", Value::Null),
        Cmd::Logs { from, to, limit } => (
            "logs",
            json!({ "from": from, "to": to, "limit": limit }),
        ),
        Cmd::Stats {
            from,
            to,
            granularity,
        } => (
            "stats",
            json!({ "from": from, "to": to, "granularity": granularity }),
        ),
        Cmd::Connect => ("connect", Value::Null),
        Cmd::Disconnect { reason } => ("disconnect", json!({ "reason": reason })),
        Cmd::ConnectionStatus => ("connection_status", Value::Null),
        Cmd::Update { all, rolling } => ("update", json!({ "all": all, "rolling": rolling })),
        Cmd::Lifecycle { limit } => ("lifecycle", json!({ "limit": limit })),
        Cmd::Crashes { since } => ("crash_stats", json!({ "since": since })),
    }
}

async fn call(node: &str, method: &str, params: Value) -> Result<Value, String> {
    let stream = TcpStream::connect(node)
        .await
        .map_err(|e| format!("cannot reach {}: {}", node, e))?;
    let (read_half, mut write_half) = stream.into_split();

    let request = json!({ "id": 1, "method": method, "params": params });
    write_half
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .map_err(|e| format!("send failed: {}", e))?;

    let mut reader = BufReader::new(read_half).take(MAX_RESPONSE_LINE);
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| format!("receive failed: {}", e))?;
    if n == 0 {
        return Err("connection closed before a response".to_string());
    }

    let response: Value =
        serde_json::from_str(line.trim()).map_err(|e| format!("bad response: {}", e))?;
    if let Some(err) = response.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(format!("server error {}: {}", code, message));
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let (method, params) = request_for(&cli.cmd);

    match call(&cli.node, method, params).await {
        // Dashboards and scripts consume this; always emit valid JSON.
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("unprintable result: {}", e);
                std::process::exit(1);
            }
        },
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(1);
        }
    }
}
