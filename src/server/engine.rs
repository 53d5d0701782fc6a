//! Server role: accept loop, per-session forwarding, peer-list fan-out,
//! and tunnel-to-peer routing.

use crate::crypto::Cipher;
use crate::device::TunAdapter;
use crate::network::peer_conn::{ConnCounters, CounterSnapshot, PeerConn, PeerReader};
use crate::network::{accept_with_backoff, tune_socket, BoxedTransport};
use crate::proto::control::{ControlMsg, DisconnectIntent};
use crate::proto::{packet, recv_handshake, send_assigned_addr, PeerEntry};
use crate::server::session::{Session, SessionTable};
use crate::store::Store;
use crate::topology::{now_unix, Edge, NodeInfo, TopologyView};
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Handshakes that take longer than this are dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a recorded disconnect intent stays relevant.
const INTENT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ServerEngineConfig {
    pub node_name: String,
    pub listen_addr: String,
    pub subnet: Ipv4Net,
    pub public_addr: Option<String>,
}

/// Row returned by the `peers` control method.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub name: String,
    pub vpn_address: String,
    pub remote_addr: String,
    pub os: String,
    pub version: String,
    pub connected_at: i64,
    pub counters: CounterSnapshot,
}

pub struct ServerEngine {
    cfg: ServerEngineConfig,
    cipher: Arc<Box<dyn Cipher>>,
    encrypted: bool,
    tls: Option<TlsAcceptor>,
    table: Arc<SessionTable>,
    device: Arc<dyn TunAdapter>,
    store: Arc<dyn Store>,
    totals: Arc<ConnCounters>,
    intents: Mutex<HashMap<Ipv4Addr, (DisconnectIntent, Instant)>>,
    cancel: CancellationToken,
}

impl ServerEngine {
    pub fn new(
        cfg: ServerEngineConfig,
        device: Arc<dyn TunAdapter>,
        store: Arc<dyn Store>,
        cipher: Arc<Box<dyn Cipher>>,
        encrypted: bool,
        tls: Option<TlsAcceptor>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let table = Arc::new(SessionTable::new(cfg.subnet));
        Arc::new(Self {
            cfg,
            cipher,
            encrypted,
            tls,
            table,
            device,
            store,
            totals: Arc::new(ConnCounters::default()),
            intents: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Binds the overlay listener and serves until cancellation. Also owns
    /// the single tunnel-device reader.
    pub async fn run(self: Arc<Self>) -> crate::Result<()> {
        let listener = TcpListener::bind(&self.cfg.listen_addr).await?;
        tracing::info!(
            "server {} listening on {} ({} as gateway)",
            self.cfg.node_name,
            self.cfg.listen_addr,
            self.table.server_addr()
        );

        tokio::spawn(self.clone().route_from_device());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                accepted = accept_with_backoff(&listener) => {
                    let (socket, remote) = accepted?;
                    let engine = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.handle_conn(socket, remote).await {
                            tracing::debug!("connection from {} ended: {}", remote, e);
                        }
                    });
                }
            }
        }

        self.shutdown_sessions().await;
        Ok(())
    }

    async fn handle_conn(self: Arc<Self>, socket: TcpStream, remote: SocketAddr) -> crate::Result<()> {
        tune_socket(&socket)?;
        let mut transport: BoxedTransport = match &self.tls {
            Some(acceptor) => Box::new(acceptor.accept(socket).await?),
            None => Box::new(socket),
        };

        let (peer_encrypted, identity) =
            match timeout(HANDSHAKE_TIMEOUT, recv_handshake(&mut transport)).await {
                Ok(Ok(hs)) => hs,
                Ok(Err(e)) => {
                    tracing::warn!("malformed handshake from {}: {}", remote, e);
                    return Ok(());
                }
                Err(_) => {
                    tracing::warn!("handshake timeout from {}", remote);
                    return Ok(());
                }
            };

        if peer_encrypted != self.encrypted {
            tracing::warn!(
                "{} ({}) encryption mode mismatch (peer {}, local {}), dropping",
                identity.hostname,
                remote,
                peer_encrypted,
                self.encrypted
            );
            return Ok(());
        }

        let assigned = self.table.assign_address(&identity.hostname)?;
        send_assigned_addr(&mut transport, assigned).await?;

        let (conn, reader) = PeerConn::pair(transport, remote, self.cipher.clone());
        let session = Arc::new(Session {
            identity,
            vpn_addr: assigned,
            remote_addr: remote,
            connected_at: now_unix(),
            conn: conn.clone(),
        });
        self.table.register(session.clone())?;
        tracing::info!("session up: {} at {} from {}", session.name(), assigned, remote);
        crate::store::log(
            &*self.store,
            "INFO",
            format!("session up: {} at {}", session.name(), assigned),
        );

        self.broadcast_peer_list().await;

        let result = self.forward_from_peer(&session, reader).await;
        let why = result
            .err()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "shutdown".to_string());
        tracing::info!("session down: {} at {} ({})", session.name(), assigned, why);
        crate::store::log(
            &*self.store,
            "INFO",
            format!("session down: {} at {} ({})", session.name(), assigned, why),
        );

        self.table.unregister(assigned);
        conn.shutdown().await;
        self.broadcast_peer_list().await;
        Ok(())
    }

    /// Per-session forwarding loop: control messages are handled inline,
    /// valid IP packets go to the tunnel device, everything else is
    /// dropped. Returns when the peer socket fails or the daemon stops.
    async fn forward_from_peer(
        &self,
        session: &Arc<Session>,
        mut reader: PeerReader,
    ) -> crate::Result<()> {
        loop {
            let pkt = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                pkt = reader.read_packet() => pkt?,
            };
            self.totals.add_recv(pkt.len());

            match ControlMsg::parse(&pkt) {
                Some(Ok(ControlMsg::DisconnectIntent(intent))) => {
                    self.record_intent(session.vpn_addr, intent);
                    if let Err(e) = session.conn.write_control(&ControlMsg::DisconnectAck).await {
                        tracing::debug!("ack to {} failed: {}", session.name(), e);
                    }
                }
                Some(Ok(msg)) => {
                    tracing::debug!("control from {}: {:?} (no server action)", session.name(), msg);
                }
                Some(Err(e)) => {
                    tracing::warn!("bad control message from {}: {}", session.name(), e);
                }
                None => {
                    if packet::is_ip(&pkt) {
                        if let Err(e) = self.device.write_packet(&pkt).await {
                            tracing::debug!("tunnel write for {} dropped: {}", session.name(), e);
                        }
                    } else {
                        tracing::warn!("dropping non-IP payload from {}", session.name());
                    }
                }
            }
        }
    }

    /// The single tunnel reader: routes each packet to the session owning
    /// its destination overlay address, drops on miss.
    async fn route_from_device(self: Arc<Self>) {
        loop {
            let pkt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                pkt = self.device.read_packet() => match pkt {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        tracing::error!("tunnel device read failed: {}", e);
                        break;
                    }
                },
            };

            let dst = match packet::ipv4_dst(&pkt) {
                Some(dst) => dst,
                None => continue,
            };
            let session = match self.table.lookup(dst) {
                Some(session) => session,
                None => {
                    tracing::trace!("no session for {}, dropping", dst);
                    continue;
                }
            };

            match session.conn.write_packet(&pkt).await {
                Ok(()) => self.totals.add_sent(pkt.len()),
                // The session's own forwarder sees the same error and
                // tears the session down.
                Err(e) => tracing::debug!("send to {} failed: {}", dst, e),
            }
        }
    }

    fn record_intent(&self, addr: Ipv4Addr, intent: DisconnectIntent) {
        tracing::info!(
            "{} announced disconnect ({}), route_all={}",
            intent.node_name,
            intent.reason,
            intent.route_all
        );
        let mut intents = self.intents.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        intents.retain(|_, (_, at)| now.duration_since(*at) < INTENT_TTL);
        intents.insert(addr, (intent, now));
    }

    /// Whether `addr` disconnected on purpose recently.
    pub fn intent_for(&self, addr: Ipv4Addr) -> Option<DisconnectIntent> {
        let mut intents = self.intents.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        intents.retain(|_, (_, at)| now.duration_since(*at) < INTENT_TTL);
        intents.get(&addr).map(|(intent, _)| intent.clone())
    }

    /// Membership including the server itself, in broadcast order.
    pub fn peer_entries(&self) -> Vec<PeerEntry> {
        let mut entries = vec![PeerEntry {
            name: self.cfg.node_name.clone(),
            vpn_address: self.table.server_addr().to_string(),
            hostname: self.cfg.node_name.clone(),
            os: std::env::consts::OS.to_string(),
            public_ip: self.cfg.public_addr.clone(),
            geo: None,
        }];
        for session in self.table.snapshot() {
            entries.push(PeerEntry {
                name: session.name().to_string(),
                vpn_address: session.vpn_addr.to_string(),
                hostname: session.identity.hostname.clone(),
                os: session.identity.os.clone(),
                public_ip: Some(session.remote_addr.ip().to_string()),
                geo: None,
            });
        }
        entries
    }

    /// Serialises the current peer list once and sends it to every live
    /// session. Failures are logged per peer and never abort the fan-out:
    /// the failing session's forwarder observes the same error.
    pub async fn broadcast_peer_list(&self) {
        let msg = ControlMsg::PeerList(self.peer_entries());
        self.broadcast(&msg).await;
    }

    pub async fn broadcast(&self, msg: &ControlMsg) {
        let payload = msg.encode();
        for session in self.table.snapshot() {
            if let Err(e) = session.conn.write_packet(&payload).await {
                tracing::warn!("broadcast to {} failed: {}", session.name(), e);
            }
        }
    }

    async fn shutdown_sessions(&self) {
        tracing::info!("closing {} sessions", self.table.len());
        self.broadcast(&ControlMsg::ServerRestarting).await;
        for session in self.table.snapshot() {
            session.conn.shutdown().await;
            self.table.unregister(session.vpn_addr);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.table.len()
    }

    pub fn vpn_addr(&self) -> Ipv4Addr {
        self.table.server_addr()
    }

    pub fn totals(&self) -> CounterSnapshot {
        self.totals.snapshot()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.table
            .snapshot()
            .iter()
            .map(|session| PeerSummary {
                name: session.name().to_string(),
                vpn_address: session.vpn_addr.to_string(),
                remote_addr: session.remote_addr.to_string(),
                os: session.identity.os.clone(),
                version: session.identity.version.clone(),
                connected_at: session.connected_at,
                counters: session.conn.counters().snapshot(),
            })
            .collect()
    }

    /// Server view: every live session is one hop away.
    pub fn topology(&self) -> TopologyView {
        let now = now_unix();
        let mut nodes = vec![NodeInfo {
            name: self.cfg.node_name.clone(),
            vpn_address: self.table.server_addr().to_string(),
            public_addr: self.cfg.public_addr.clone(),
            os: Some(std::env::consts::OS.to_string()),
            version: Some(crate::VERSION.to_string()),
            distance: 0,
            is_self: true,
            is_direct: false,
            connected_at: None,
            last_seen: now,
            counters: self.totals.snapshot(),
        }];
        let mut edges = Vec::new();

        for session in self.table.snapshot() {
            nodes.push(NodeInfo {
                name: session.name().to_string(),
                vpn_address: session.vpn_addr.to_string(),
                public_addr: Some(session.remote_addr.ip().to_string()),
                os: Some(session.identity.os.clone()),
                version: Some(session.identity.version.clone()),
                distance: 1,
                is_self: false,
                is_direct: true,
                connected_at: Some(session.connected_at),
                last_seen: now,
                counters: session.conn.counters().snapshot(),
            });
            edges.push(Edge {
                from: self.cfg.node_name.clone(),
                to: session.name().to_string(),
            });
        }

        TopologyView { nodes, edges }
    }
}
