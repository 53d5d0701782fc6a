//! Network membership as each node sees it.
//!
//! The server derives its view from the live session table plus itself;
//! a client derives its view from the last PEER_LIST it received plus the
//! server it is connected to. Neither view is authoritative beyond the
//! information its node actually has.

use crate::network::peer_conn::CounterSnapshot;
use crate::proto::PeerEntry;
use serde::Serialize;
use std::sync::RwLock;

/// One node in the topology. `distance` is hop count: 0 = self, 1 =
/// directly connected, 2 = reachable via the server relay.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub vpn_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub distance: u8,
    pub is_self: bool,
    pub is_direct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
    pub last_seen: i64,
    pub counters: CounterSnapshot,
}

/// A directly observed link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyView {
    pub nodes: Vec<NodeInfo>,
    pub edges: Vec<Edge>,
}

/// Client-side cache of the last PEER_LIST broadcast. Read-mostly.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<Vec<PeerEntry>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, peers: Vec<PeerEntry>) {
        *self.peers.write().unwrap_or_else(|e| e.into_inner()) = peers;
    }

    pub fn list(&self) -> Vec<PeerEntry> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Builds the client's view: self, the server one hop away, everyone else
/// behind the relay.
pub fn client_view(
    self_name: &str,
    self_addr: &str,
    server_name: &str,
    peers: &[PeerEntry],
    counters: CounterSnapshot,
    connected_at: Option<i64>,
) -> TopologyView {
    let now = now_unix();
    let mut nodes = vec![NodeInfo {
        name: self_name.to_string(),
        vpn_address: self_addr.to_string(),
        public_addr: None,
        os: Some(std::env::consts::OS.to_string()),
        version: Some(crate::VERSION.to_string()),
        distance: 0,
        is_self: true,
        is_direct: false,
        connected_at,
        last_seen: now,
        counters,
    }];
    let mut edges = Vec::new();

    for peer in peers {
        // The server always owns the .1 of the overlay subnet.
        let is_server = peer
            .vpn_address
            .parse::<std::net::Ipv4Addr>()
            .map(|a| a.octets()[3] == 1)
            .unwrap_or(false);
        if peer.name == self_name {
            continue;
        }

        nodes.push(NodeInfo {
            name: peer.name.clone(),
            vpn_address: peer.vpn_address.clone(),
            public_addr: peer.public_ip.clone(),
            os: Some(peer.os.clone()),
            version: None,
            distance: if is_server { 1 } else { 2 },
            is_self: false,
            is_direct: is_server,
            connected_at: None,
            last_seen: now,
            counters: CounterSnapshot::default(),
        });

        if is_server {
            edges.push(Edge {
                from: self_name.to_string(),
                to: peer.name.clone(),
            });
        } else {
            edges.push(Edge {
                from: server_name.to_string(),
                to: peer.name.clone(),
            });
        }
    }

    TopologyView { nodes, edges }
}
