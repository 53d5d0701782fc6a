//! Daemon lifecycle: construction order, signal handling, and the ordered,
//! idempotent shutdown sequence.

use crate::client::{ClientEngine, ClientEngineConfig};
use crate::control::{self, NodeCtx, Role};
use crate::crypto::{new_cipher, Cipher};
use crate::daemon::config::{Config, Mode};
use crate::device::{TunAdapter, TunConfig, TunProvider};
use crate::network::tls::{server_acceptor, TlsClient};
use crate::server::{ServerEngine, ServerEngineConfig};
use crate::store::jsonl::JsonlStore;
use crate::store::{LifecycleEvent, LifecycleKind, MetricSample, Store};
use crate::topology::now_unix;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Liveness marker inside the data directory. Present between START and a
/// clean STOP; finding one at boot means the previous run crashed.
const ALIVE_MARKER: &str = ".alive";

/// Bound on joining each task during the ordered shutdown; a task that
/// outlives it is aborted so teardown always completes.
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the daemon to completion. `cancel` is the process-wide shutdown
/// signal; the client's failure path raises it too. Signals (SIGINT,
/// SIGTERM) are translated into the same orderly teardown.
pub async fn run(
    cfg: Config,
    provider: Arc<dyn TunProvider>,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let started_at = Instant::now();

    // Store first: everything after this can log lifecycle events.
    let store: Arc<dyn Store> = Arc::new(JsonlStore::open(&cfg.node.data_dir)?);
    let marker = cfg.node.data_dir.join(ALIVE_MARKER);
    record_previous_crash(&*store, &marker);
    fs::write(&marker, std::process::id().to_string())?;
    store.set_version("node", crate::VERSION)?;
    append_lifecycle(
        &*store,
        LifecycleKind::Start,
        "daemon start",
        0,
        false,
        false,
    );

    let cipher: Arc<Box<dyn Cipher>> = Arc::new(new_cipher(&cfg.crypto));
    let encrypted = !cfg.crypto.is_plain();

    // Role engine construction. The server opens its device now; a client
    // opens one per successful connect, once it knows its address.
    let mut server_device: Option<Arc<dyn TunAdapter>> = None;
    let role = match cfg.node.mode {
        Mode::Server => {
            let base = cfg.network.subnet.network().octets();
            let server_addr = Ipv4Addr::new(base[0], base[1], base[2], 1);
            let device = provider
                .open(TunConfig::new(server_addr, server_addr))
                .await?;
            server_device = Some(device.clone());

            let tls = match (cfg.tls.enabled, &cfg.tls.cert, &cfg.tls.key) {
                (true, Some(cert), Some(key)) => Some(server_acceptor(cert, key)?),
                _ => None,
            };
            let engine = ServerEngine::new(
                ServerEngineConfig {
                    node_name: cfg.node.name.clone(),
                    listen_addr: cfg.network.listen_addr.clone(),
                    subnet: cfg.network.subnet,
                    public_addr: cfg.network.public_addr.clone(),
                },
                device,
                store.clone(),
                cipher.clone(),
                encrypted,
                tls,
                cancel.clone(),
            );
            Role::Server(engine)
        }
        Mode::Client => {
            let server_addr = cfg
                .network
                .server_addr
                .clone()
                .ok_or("client mode requires network.server_addr")?;
            let tls = if cfg.tls.enabled {
                let host = cfg.server_host().ok_or("cannot derive TLS server name")?;
                Some(TlsClient::new(&host, cfg.tls.insecure_skip_verify)?)
            } else {
                None
            };
            let engine = ClientEngine::new(
                ClientEngineConfig {
                    node_name: cfg.node.name.clone(),
                    server_addr,
                    route_all: cfg.network.route_all,
                    update_command: cfg.update.command.clone(),
                },
                provider.clone(),
                store.clone(),
                cipher.clone(),
                encrypted,
                tls,
                cancel.clone(),
            );
            Role::Client(engine)
        }
    };

    // Control RPC before the engine serves, so the surface is up as soon
    // as there is anything to observe.
    let ctx = Arc::new(NodeCtx {
        node_name: cfg.node.name.clone(),
        started_at,
        store: store.clone(),
        role,
        update_command: cfg.update.command.clone(),
    });
    let control_handle = {
        let ctx = ctx.clone();
        let addr = cfg.network.control_addr.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = control::server::run(addr, ctx, cancel.clone()).await {
                tracing::error!("control RPC server failed: {}", e);
                cancel.cancel();
            }
        })
    };

    // Start the role engine.
    let engine_handle = match &ctx.role {
        Role::Server(engine) => {
            let engine = engine.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = engine.run().await {
                    tracing::error!("server engine failed: {}", e);
                    cancel.cancel();
                }
            }))
        }
        Role::Client(engine) => {
            if let Err(e) = engine.connect().await {
                // Startup failure: tear down what exists and exit non-zero.
                cancel.cancel();
                let tasks = Tasks {
                    control: control_handle,
                    engine: None,
                    metrics: None,
                };
                shutdown(&ctx, &marker, server_device.clone(), tasks, "startup failure").await;
                return Err(e);
            }
            None
        }
    };

    // Metrics tick, last in the start order.
    let metrics_handle = tokio::spawn(metrics_loop(ctx.clone(), cancel.clone()));

    // Park until a signal or internal cancellation.
    let reason = wait_for_shutdown(&cancel).await;
    if reason != "internal" {
        append_lifecycle(
            &*store,
            LifecycleKind::Signal,
            reason,
            started_at.elapsed().as_secs(),
            device_of(&ctx, &server_device)
                .map(|d| d.route_all_engaged())
                .unwrap_or(false),
            false,
        );
    }
    cancel.cancel();

    let tasks = Tasks {
        control: control_handle,
        engine: engine_handle,
        metrics: Some(metrics_handle),
    };
    shutdown(&ctx, &marker, server_device, tasks, reason).await;
    Ok(())
}

/// Handles of the daemon's long-running tasks, joined in spec order at
/// shutdown. A client role has no engine task: its forwarders live inside
/// the engine and stop on the same cancellation signal.
struct Tasks {
    control: JoinHandle<()>,
    engine: Option<JoinHandle<()>>,
    metrics: Option<JoinHandle<()>>,
}

fn device_of(ctx: &NodeCtx, server_device: &Option<Arc<dyn TunAdapter>>) -> Option<Arc<dyn TunAdapter>> {
    match &ctx.role {
        Role::Server(_) => server_device.clone(),
        Role::Client(engine) => engine.device(),
    }
}

/// The ordered teardown: metrics tick, then the overlay listener and its
/// sessions, then route restore and device close, then the control
/// socket, then STOP / marker / store. Each step is confirmed by joining
/// the task that owns it (bounded, aborting as a last resort) before the
/// next step runs. `cancel` must already be fired on entry; reaching here
/// twice is prevented by `run` having a single exit path, and every step
/// tolerates already-done state regardless.
async fn shutdown(
    ctx: &NodeCtx,
    marker: &Path,
    server_device: Option<Arc<dyn TunAdapter>>,
    tasks: Tasks,
    reason: &str,
) {
    if let Some(metrics) = tasks.metrics {
        join_or_abort(metrics, "metrics tick").await;
    }

    // The engine task returns only after its listener is dropped and
    // shutdown_sessions() has closed every session.
    if let Some(engine) = tasks.engine {
        join_or_abort(engine, "role engine").await;
    }

    let mut route_all_at_event = false;
    let mut route_restored = false;
    if let Some(device) = device_of(ctx, &server_device) {
        route_all_at_event = device.route_all_engaged();
        match device.restore_routes().await {
            Ok(()) => route_restored = true,
            Err(e) => tracing::error!("route restore during shutdown failed: {}", e),
        }
        device.close().await;
    }

    join_or_abort(tasks.control, "control RPC server").await;

    append_lifecycle(
        &*ctx.store,
        LifecycleKind::Stop,
        reason,
        ctx.started_at.elapsed().as_secs(),
        route_all_at_event,
        route_restored,
    );
    if let Err(e) = fs::remove_file(marker) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("could not remove liveness marker: {}", e);
        }
    }
    if let Err(e) = ctx.store.close() {
        tracing::warn!("store close failed: {}", e);
    }
    tracing::info!("daemon stopped ({})", reason);
}

/// Joins one shutdown step, aborting the task if it outlives the bound.
async fn join_or_abort(mut handle: JoinHandle<()>, what: &str) {
    match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("{} task ended abnormally: {}", what, e),
        Err(_) => {
            tracing::warn!(
                "{} did not stop within {:?}, aborting",
                what,
                SHUTDOWN_STEP_TIMEOUT
            );
            handle.abort();
            let _ = handle.await;
        }
    }
}

fn record_previous_crash(store: &dyn Store, marker: &Path) {
    if !marker.exists() {
        return;
    }
    tracing::warn!("stale liveness marker found; previous run did not stop cleanly");
    append_lifecycle(
        store,
        LifecycleKind::Crash,
        "stale liveness marker at startup",
        0,
        false,
        false,
    );
}

fn append_lifecycle(
    store: &dyn Store,
    kind: LifecycleKind,
    reason: &str,
    uptime_seconds: u64,
    route_all_at_event: bool,
    route_restored: bool,
) {
    let event = LifecycleEvent {
        timestamp: now_unix(),
        event: kind,
        reason: reason.to_string(),
        uptime_seconds,
        route_all_at_event,
        route_restored,
        version: crate::VERSION.to_string(),
    };
    if let Err(e) = store.append_lifecycle(event) {
        tracing::error!("failed to record lifecycle event: {}", e);
    }
    crate::store::log(store, "INFO", format!("lifecycle {:?}: {}", kind, reason));
}

/// Samples the daemon's traffic counters once a second.
async fn metrics_loop(ctx: Arc<NodeCtx>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let sample = match &ctx.role {
            Role::Server(engine) => {
                let totals = engine.totals();
                MetricSample {
                    timestamp: now_unix(),
                    bytes_in: totals.bytes_recv,
                    bytes_out: totals.bytes_sent,
                    packets_in: totals.packets_recv,
                    packets_out: totals.packets_sent,
                    peer_count: engine.peer_count() as u32,
                }
            }
            Role::Client(engine) => {
                let counters = engine.counters();
                MetricSample {
                    timestamp: now_unix(),
                    bytes_in: counters.bytes_recv,
                    bytes_out: counters.bytes_sent,
                    packets_in: counters.packets_recv,
                    packets_out: counters.packets_sent,
                    peer_count: engine.peer_count() as u32,
                }
            }
        };

        if let Err(e) = ctx.store.append_metric(sample) {
            tracing::warn!("metrics append failed: {}", e);
        }
    }
}

/// Waits for SIGINT, SIGTERM, or internal cancellation.
async fn wait_for_shutdown(cancel: &CancellationToken) -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = term.recv() => "SIGTERM",
                    _ = cancel.cancelled() => "internal",
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = cancel.cancelled() => "internal",
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = cancel.cancelled() => "internal",
        }
    }
}
