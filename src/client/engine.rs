//! Client role: one upstream session, two forwarders, and the failure
//! detector that guarantees host routing is restored whenever the tunnel
//! dies for any reason.

use crate::crypto::Cipher;
use crate::device::{TunAdapter, TunConfig, TunProvider};
use crate::network::peer_conn::{CounterSnapshot, PeerConn, PeerReader};
use crate::network::{dial, tls::TlsClient};
use crate::proto::control::{ControlMsg, DisconnectIntent};
use crate::proto::{packet, recv_assigned_addr, send_handshake, Handshake, PeerEntry};
use crate::store::{LifecycleEvent, LifecycleKind, Store};
use crate::topology::{client_view, now_unix, PeerDirectory, TopologyView};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Bounded wait for DISCONNECT_ACK; the disconnect proceeds regardless.
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ClientEngineConfig {
    pub node_name: String,
    pub server_addr: String,
    /// Engage route-all right after connecting.
    pub route_all: bool,
    pub update_command: Option<String>,
}

/// Answer to the `connection_status` control method.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub connected: bool,
    pub route_all: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_address: Option<String>,
    pub server_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
}

#[derive(Default)]
struct ConnState {
    connected: bool,
    route_all: bool,
    vpn_addr: Option<Ipv4Addr>,
    connected_at: Option<i64>,
    server_public: Option<IpAddr>,
    conn: Option<Arc<PeerConn>>,
    device: Option<Arc<dyn TunAdapter>>,
}

pub struct ClientEngine {
    cfg: ClientEngineConfig,
    cipher: Arc<Box<dyn Cipher>>,
    encrypted: bool,
    tls: Option<TlsClient>,
    provider: Arc<dyn TunProvider>,
    store: Arc<dyn Store>,
    state: RwLock<ConnState>,
    directory: PeerDirectory,
    /// Daemon-wide shutdown signal; the engine also raises it when the
    /// failure path wants the process gone.
    cancel: CancellationToken,
    /// One-shot failure broadcast: either forwarder trips it, the
    /// supervisor acts on it exactly once.
    failure: CancellationToken,
    ack_notify: tokio::sync::Notify,
    reconnect_count: AtomicU64,
    started_at: Instant,
}

impl ClientEngine {
    pub fn new(
        cfg: ClientEngineConfig,
        provider: Arc<dyn TunProvider>,
        store: Arc<dyn Store>,
        cipher: Arc<Box<dyn Cipher>>,
        encrypted: bool,
        tls: Option<TlsClient>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            cipher,
            encrypted,
            tls,
            provider,
            store,
            state: RwLock::new(ConnState::default()),
            directory: PeerDirectory::new(),
            cancel,
            failure: CancellationToken::new(),
            ack_notify: tokio::sync::Notify::new(),
            reconnect_count: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    /// Dials the server, adopts the assigned address, brings the tunnel
    /// up, and starts the forwarders and the failure supervisor.
    pub async fn connect(self: &Arc<Self>) -> crate::Result<()> {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);

        let (mut transport, remote) = dial(&self.cfg.server_addr, self.tls.as_ref()).await?;
        send_handshake(
            &mut transport,
            self.encrypted,
            &Handshake {
                hostname: self.cfg.node_name.clone(),
                os: std::env::consts::OS.to_string(),
                version: crate::VERSION.to_string(),
            },
        )
        .await?;
        let assigned = recv_assigned_addr(&mut transport).await?;
        tracing::info!("connected to {}, assigned {}", remote, assigned);

        let octets = assigned.octets();
        let gateway = Ipv4Addr::new(octets[0], octets[1], octets[2], 1);
        let device = self
            .provider
            .open(TunConfig::new(assigned, gateway))
            .await?;

        let (conn, reader) = PeerConn::pair(transport, remote, self.cipher.clone());

        if self.cfg.route_all {
            device.route_all(remote.ip()).await?;
        }

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.connected = true;
            state.route_all = self.cfg.route_all;
            state.vpn_addr = Some(assigned);
            state.connected_at = Some(now_unix());
            state.server_public = Some(remote.ip());
            state.conn = Some(conn.clone());
            state.device = Some(device.clone());
        }

        crate::store::log(
            &*self.store,
            "INFO",
            format!("connected to {} as {}", remote, assigned),
        );

        tokio::spawn(self.clone().uplink(device.clone(), conn));
        tokio::spawn(self.clone().downlink(reader, device.clone()));
        tokio::spawn(self.clone().supervise(device));
        Ok(())
    }

    /// Tunnel device -> peer socket.
    async fn uplink(self: Arc<Self>, device: Arc<dyn TunAdapter>, conn: Arc<PeerConn>) {
        loop {
            let pkt = tokio::select! {
                _ = self.cancel.cancelled() => return,
                pkt = device.read_packet() => pkt,
            };

            let pkt = match pkt {
                Ok(pkt) => pkt,
                Err(e) => {
                    self.raise_failure("tunnel device read", &e);
                    return;
                }
            };
            if let Err(e) = conn.write_packet(&pkt).await {
                self.raise_failure("uplink write", &e);
                return;
            }
        }
    }

    /// Peer socket -> tunnel device, with inline control handling.
    async fn downlink(self: Arc<Self>, mut reader: PeerReader, device: Arc<dyn TunAdapter>) {
        loop {
            let pkt = tokio::select! {
                _ = self.cancel.cancelled() => return,
                pkt = reader.read_packet() => pkt,
            };

            let pkt = match pkt {
                Ok(pkt) => pkt,
                Err(e) => {
                    self.raise_failure("downlink read", &e);
                    return;
                }
            };
            self.handle_downlink(pkt, &device).await;
        }
    }

    async fn handle_downlink(self: &Arc<Self>, pkt: Vec<u8>, device: &Arc<dyn TunAdapter>) {
        match ControlMsg::parse(&pkt) {
            None => {
                if packet::is_ip(&pkt) {
                    if let Err(e) = device.write_packet(&pkt).await {
                        tracing::debug!("tunnel write dropped: {}", e);
                    }
                } else {
                    tracing::warn!("dropping non-IP payload from server");
                }
            }
            Some(Ok(ControlMsg::PeerList(peers))) => {
                tracing::debug!("peer list updated: {} members", peers.len());
                self.directory.replace(peers);
            }
            Some(Ok(ControlMsg::UpdateAvailable)) => {
                tracing::info!("server announced an update");
                crate::daemon::spawn_update_task(self.cfg.update_command.clone());
            }
            Some(Ok(ControlMsg::ReconnectInvite(invite))) => {
                tracing::info!(
                    "reconnect invite from {} ({}), enable_routing={}",
                    invite.server_name,
                    invite.reason,
                    invite.should_enable_routing
                );
                if invite.should_enable_routing && !device.route_all_engaged() {
                    if let Err(e) = self.engage_route_all().await {
                        tracing::warn!("invite could not re-engage routing: {}", e);
                    }
                }
            }
            Some(Ok(ControlMsg::DisconnectAck)) => {
                self.ack_notify.notify_waiters();
            }
            Some(Ok(ControlMsg::ServerRestarting)) => {
                tracing::warn!("server is restarting");
            }
            Some(Ok(ControlMsg::DisconnectIntent(intent))) => {
                tracing::debug!("unexpected disconnect intent from server: {:?}", intent);
            }
            Some(Err(e)) => {
                tracing::warn!("bad control message: {}", e);
            }
        }
    }

    fn raise_failure(&self, what: &str, err: &crate::Error) {
        if self.cancel.is_cancelled() {
            // Orderly shutdown tears sockets down; not a failure.
            tracing::debug!("{} ended during shutdown: {}", what, err);
            return;
        }
        tracing::error!("{} failed: {}", what, err);
        self.failure.cancel();
    }

    /// The failure detector. On orderly shutdown it does nothing (the
    /// daemon's shutdown path restores routes); on the failure signal it
    /// restores host routing, records CONNECTION_LOST, and requests
    /// daemon shutdown. The process never keeps running with route-all
    /// engaged and a dead tunnel.
    async fn supervise(self: Arc<Self>, device: Arc<dyn TunAdapter>) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.failure.cancelled() => {
                let route_all_at_event = device.route_all_engaged();
                tracing::error!(
                    "tunnel lost; restoring host routes (route_all was {})",
                    route_all_at_event
                );

                let restored = device.restore_routes().await;
                if let Err(e) = &restored {
                    tracing::error!("route restore failed: {}", e);
                }

                {
                    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                    state.connected = false;
                    state.route_all = false;
                }

                let event = LifecycleEvent {
                    timestamp: now_unix(),
                    event: LifecycleKind::ConnectionLost,
                    reason: "tunnel I/O failure".to_string(),
                    uptime_seconds: self.started_at.elapsed().as_secs(),
                    route_all_at_event,
                    route_restored: restored.is_ok(),
                    version: crate::VERSION.to_string(),
                };
                if let Err(e) = self.store.append_lifecycle(event) {
                    tracing::error!("failed to record connection loss: {}", e);
                }
                crate::store::log(&*self.store, "ERROR", "tunnel lost, routes restored");

                self.cancel.cancel();
            }
        }
    }

    /// `connect` control method: (re-)engage route-all over the live
    /// tunnel. Requires a live session, which is exactly what keeps the
    /// failure path from ever re-engaging routing.
    pub async fn engage_route_all(&self) -> crate::Result<()> {
        let (device, server_public) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if !state.connected {
                return Err("not connected to a server".into());
            }
            (
                state.device.clone().ok_or("no tunnel device")?,
                state.server_public.ok_or("no server address")?,
            )
        };

        device.route_all(server_public).await?;
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .route_all = true;
        Ok(())
    }

    /// `disconnect` control method: announce intent, wait briefly for the
    /// ack, restore routes. Distinct from failure — the session stays up,
    /// the daemon stays alive, and a later `connect` re-engages routing.
    pub async fn disconnect(&self, reason: &str) -> crate::Result<()> {
        let (conn, device, route_all, vpn_addr) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if !state.connected {
                return Err("not connected to a server".into());
            }
            (
                state.conn.clone().ok_or("no live connection")?,
                state.device.clone().ok_or("no tunnel device")?,
                state.route_all,
                state.vpn_addr.map(|a| a.to_string()).unwrap_or_default(),
            )
        };

        let intent = ControlMsg::DisconnectIntent(DisconnectIntent {
            node_name: self.cfg.node_name.clone(),
            vpn_address: vpn_addr,
            reason: reason.to_string(),
            route_all,
        });

        let notified = self.ack_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match conn.write_control(&intent).await {
            Ok(()) => {
                if timeout(ACK_TIMEOUT, notified).await.is_err() {
                    tracing::debug!("no disconnect ack within {:?}", ACK_TIMEOUT);
                }
            }
            Err(e) => tracing::warn!("could not announce disconnect: {}", e),
        }

        device.restore_routes().await?;
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .route_all = false;
        tracing::info!("disconnected ({}), routes restored", reason);
        crate::store::log(
            &*self.store,
            "INFO",
            format!("intentional disconnect ({}), routes restored", reason),
        );
        Ok(())
    }

    pub fn status(&self) -> ClientStatus {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        ClientStatus {
            connected: state.connected,
            route_all: state.route_all,
            vpn_address: state.vpn_addr.map(|a| a.to_string()),
            server_addr: self.cfg.server_addr.clone(),
            connected_at: state.connected_at,
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .conn
            .as_ref()
            .map(|c| c.counters().snapshot())
            .unwrap_or_default()
    }

    pub fn vpn_addr(&self) -> Option<Ipv4Addr> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).vpn_addr
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn peer_entries(&self) -> Vec<PeerEntry> {
        self.directory.list()
    }

    pub fn peer_count(&self) -> usize {
        // Membership as broadcast includes this node and the server.
        self.directory.len().saturating_sub(1)
    }

    pub fn topology(&self) -> TopologyView {
        let peers = self.directory.list();
        let server_name = peers
            .iter()
            .find(|p| {
                p.vpn_address
                    .parse::<Ipv4Addr>()
                    .map(|a| a.octets()[3] == 1)
                    .unwrap_or(false)
            })
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "server".to_string());

        let (vpn_addr, connected_at) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            (
                state
                    .vpn_addr
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                state.connected_at,
            )
        };

        client_view(
            &self.cfg.node_name,
            &vpn_addr,
            &server_name,
            &peers,
            self.counters(),
            connected_at,
        )
    }

    pub fn update_command(&self) -> Option<String> {
        self.cfg.update_command.clone()
    }

    /// The live tunnel device, for the daemon's shutdown path.
    pub fn device(&self) -> Option<Arc<dyn TunAdapter>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .device
            .clone()
    }
}
