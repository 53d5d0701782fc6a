//! Control RPC listener and method dispatch.
//!
//! Each connection is served sequentially: read one request line, run the
//! method, write one response line. Ordering within a connection follows
//! from that. Request lines are bounded so a confused client cannot balloon
//! memory; responses can be large (metrics payloads) and are the reason
//! the CLI reads with the same generous bound.

use crate::control::api::{
    self, parse_params, RpcError, RpcRequest, INVALID_PARAMS,
};
use crate::control::timerange;
use crate::control::{NodeCtx, Role};
use crate::proto::control::ControlMsg;
use crate::store::Granularity;
use crate::topology::now_unix;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Request/response line bound.
pub const MAX_LINE: u64 = 10 * 1024 * 1024;

const DEFAULT_LOG_LIMIT: usize = 100;
const DEFAULT_LIFECYCLE_LIMIT: usize = 20;

/// Binds the control socket and serves until cancellation.
pub async fn run(
    listen_addr: String,
    ctx: Arc<NodeCtx>,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!("control RPC listening on {}", listen_addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_conn(stream, ctx, cancel).await {
                        tracing::debug!("control client {} ended: {}", remote, e);
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve_conn(
    stream: TcpStream,
    ctx: Arc<NodeCtx>,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE);
    let mut line = String::new();

    loop {
        line.clear();
        reader.set_limit(MAX_LINE);

        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            n = reader.read_line(&mut line) => n?,
        };
        if n == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = dispatch(&ctx, &line).await;
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
}

/// Runs one request line to one response line. Never fails the connection:
/// protocol-level problems become error responses.
pub async fn dispatch(ctx: &NodeCtx, line: &str) -> String {
    let request: RpcRequest = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            return api::error_line(
                Value::Null,
                INVALID_PARAMS,
                &format!("bad request JSON: {}", e),
            )
        }
    };

    let id = request.id.clone();
    match handle(ctx, &request).await {
        Ok(result) => api::result_line(id, result),
        Err(err) => api::error_line(id, err.code, &err.message),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RangeParams {
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    granularity: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DisconnectParams {
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateParams {
    #[serde(default)]
    all: bool,
    #[serde(default)]
    rolling: bool,
}

#[derive(Debug, Default, Deserialize)]
struct LifecycleParams {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CrashParams {
    since: Option<String>,
}

async fn handle(ctx: &NodeCtx, request: &RpcRequest) -> Result<Value, RpcError> {
    match request.method.as_str() {
        "status" => status(ctx),
        "peers" => peers(ctx),
        "network_peers" => network_peers(ctx),
        "topology" => topology(ctx),
        "logs" => logs(ctx, &request.params),
        "stats" => stats(ctx, &request.params),
        "connect" => connect(ctx).await,
        "disconnect" => disconnect(ctx, &request.params).await,
        "connection_status" => connection_status(ctx),
        "update" => update(ctx, &request.params).await,
        "lifecycle" => lifecycle(ctx, &request.params),
        "crash_stats" => crash_stats(ctx, &request.params),
        other => Err(RpcError::unknown_method(other)),
    }
}

fn status(ctx: &NodeCtx) -> Result<Value, RpcError> {
    let uptime = ctx.started_at.elapsed().as_secs();
    let value = match &ctx.role {
        Role::Server(engine) => {
            let totals = engine.totals();
            json!({
                "node_name": ctx.node_name,
                "version": crate::VERSION,
                "uptime": uptime,
                "vpn_address": engine.vpn_addr().to_string(),
                "peer_count": engine.peer_count(),
                "bytes_in": totals.bytes_recv,
                "bytes_out": totals.bytes_sent,
                "server_mode": true,
                "reconnect_count": 0,
            })
        }
        Role::Client(engine) => {
            let counters = engine.counters();
            json!({
                "node_name": ctx.node_name,
                "version": crate::VERSION,
                "uptime": uptime,
                "vpn_address": engine.vpn_addr().map(|a| a.to_string()),
                "peer_count": engine.peer_count(),
                "bytes_in": counters.bytes_recv,
                "bytes_out": counters.bytes_sent,
                "server_mode": false,
                "reconnect_count": engine.reconnect_count(),
            })
        }
    };
    Ok(value)
}

fn peers(ctx: &NodeCtx) -> Result<Value, RpcError> {
    match &ctx.role {
        Role::Server(engine) => serde_json::to_value(engine.peers()).map_err(RpcError::internal),
        // Clients have no directly-connected peers to enumerate.
        Role::Client(_) => Ok(json!([])),
    }
}

fn network_peers(ctx: &NodeCtx) -> Result<Value, RpcError> {
    let entries = match &ctx.role {
        Role::Server(engine) => engine.peer_entries(),
        Role::Client(engine) => engine.peer_entries(),
    };
    Ok(json!({
        "peers": entries,
        "server_mode": ctx.role.is_server(),
    }))
}

fn topology(ctx: &NodeCtx) -> Result<Value, RpcError> {
    let view = match &ctx.role {
        Role::Server(engine) => engine.topology(),
        Role::Client(engine) => engine.topology(),
    };
    serde_json::to_value(view).map_err(RpcError::internal)
}

fn parse_window(
    from: Option<&str>,
    to: Option<&str>,
    default_from: &str,
) -> Result<crate::store::TimeRange, RpcError> {
    let now = OffsetDateTime::now_utc();
    timerange::parse_range(from.unwrap_or(default_from), to.unwrap_or("now"), now)
        .map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn logs(ctx: &NodeCtx, params: &Value) -> Result<Value, RpcError> {
    let params: RangeParams = parse_params(params)?;
    let range = parse_window(params.from.as_deref(), params.to.as_deref(), "-1h")?;
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT);

    let logs = ctx
        .store
        .query_logs(range, limit)
        .map_err(RpcError::internal)?;
    Ok(json!({
        "from": range.from,
        "to": range.to,
        "logs": logs,
    }))
}

fn stats(ctx: &NodeCtx, params: &Value) -> Result<Value, RpcError> {
    let params: RangeParams = parse_params(params)?;
    let range = parse_window(params.from.as_deref(), params.to.as_deref(), "-1h")?;
    let granularity = match params.granularity.as_deref() {
        Some(g) => Granularity::parse(g).map_err(|e| RpcError::invalid_params(e.to_string()))?,
        None => Granularity::Auto,
    };

    let samples = ctx
        .store
        .query_metrics(range, granularity)
        .map_err(RpcError::internal)?;
    Ok(json!({
        "from": range.from,
        "to": range.to,
        "samples": samples,
    }))
}

async fn connect(ctx: &NodeCtx) -> Result<Value, RpcError> {
    match &ctx.role {
        Role::Server(_) => Err(RpcError::invalid_params("connect is client-only")),
        Role::Client(engine) => {
            engine
                .engage_route_all()
                .await
                .map_err(RpcError::internal)?;
            Ok(json!({ "route_all": true }))
        }
    }
}

async fn disconnect(ctx: &NodeCtx, params: &Value) -> Result<Value, RpcError> {
    let params: DisconnectParams = parse_params(params)?;
    match &ctx.role {
        Role::Server(_) => Err(RpcError::invalid_params("disconnect is client-only")),
        Role::Client(engine) => {
            let reason = params.reason.unwrap_or_else(|| "cli disconnect".to_string());
            engine.disconnect(&reason).await.map_err(RpcError::internal)?;
            Ok(json!({ "disconnected": true }))
        }
    }
}

fn connection_status(ctx: &NodeCtx) -> Result<Value, RpcError> {
    match &ctx.role {
        Role::Server(_) => Err(RpcError::invalid_params("connection_status is client-only")),
        Role::Client(engine) => serde_json::to_value(engine.status()).map_err(RpcError::internal),
    }
}

async fn update(ctx: &NodeCtx, params: &Value) -> Result<Value, RpcError> {
    let params: UpdateParams = parse_params(params)?;

    let started = ctx.update_command.is_some();
    crate::daemon::spawn_update_task(ctx.update_command.clone());

    if params.all {
        if let Role::Server(engine) = &ctx.role {
            engine.broadcast(&ControlMsg::UpdateAvailable).await;
        }
    }

    Ok(json!({
        "started": started,
        "all": params.all,
        "rolling": params.rolling,
        "timestamp": now_unix(),
    }))
}

fn lifecycle(ctx: &NodeCtx, params: &Value) -> Result<Value, RpcError> {
    let params: LifecycleParams = parse_params(params)?;
    let events = ctx
        .store
        .lifecycle_tail(params.limit.unwrap_or(DEFAULT_LIFECYCLE_LIMIT))
        .map_err(RpcError::internal)?;
    serde_json::to_value(events).map_err(RpcError::internal)
}

fn crash_stats(ctx: &NodeCtx, params: &Value) -> Result<Value, RpcError> {
    let params: CrashParams = parse_params(params)?;
    let range = parse_window(params.since.as_deref(), None, "-7d")?;
    let stats = ctx.store.crash_stats(range).map_err(RpcError::internal)?;
    serde_json::to_value(stats).map_err(RpcError::internal)
}
