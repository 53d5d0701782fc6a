//! Live session registry and address assignment.
//!
//! Sessions are indexed by VPN address; tasks hold table handles and look
//! sessions up on demand, so a torn-down session becomes a lookup miss
//! rather than a dangling reference.

use crate::network::peer_conn::PeerConn;
use crate::proto::Handshake;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};

/// First host number handed to clients; .1 is the server.
const FIRST_CLIENT_HOST: u8 = 2;
const LAST_CLIENT_HOST: u8 = 254;

/// State for one accepted, handshaken connection.
pub struct Session {
    pub identity: Handshake,
    pub vpn_addr: Ipv4Addr,
    pub remote_addr: SocketAddr,
    pub connected_at: i64,
    pub conn: Arc<PeerConn>,
}

impl Session {
    /// Display name: the hostname from the handshake.
    pub fn name(&self) -> &str {
        &self.identity.hostname
    }
}

struct TableInner {
    sessions: HashMap<Ipv4Addr, Arc<Session>>,
    by_hostname: HashMap<String, Ipv4Addr>,
    next_free: u8,
}

/// Registry of live sessions plus the sticky hostname -> address memory.
///
/// Assignment is strictly monotonic: an address abandoned by a hostname
/// that never returns is not reclaimed for the lifetime of the process.
pub struct SessionTable {
    network: Ipv4Net,
    inner: RwLock<TableInner>,
}

impl SessionTable {
    pub fn new(network: Ipv4Net) -> Self {
        Self {
            network,
            inner: RwLock::new(TableInner {
                sessions: HashMap::new(),
                by_hostname: HashMap::new(),
                next_free: FIRST_CLIENT_HOST,
            }),
        }
    }

    fn host_addr(&self, host: u8) -> Ipv4Addr {
        let base = self.network.network().octets();
        Ipv4Addr::new(base[0], base[1], base[2], host)
    }

    /// The server's own overlay address, always `.1`.
    pub fn server_addr(&self) -> Ipv4Addr {
        self.host_addr(1)
    }

    /// Assigns a VPN address for `hostname` under the directory lock.
    ///
    /// A hostname that connected before gets its old address back as long
    /// as no live session holds it; otherwise the next free number is
    /// allocated.
    pub fn assign_address(&self, hostname: &str) -> crate::Result<Ipv4Addr> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(&sticky) = inner.by_hostname.get(hostname) {
            if !inner.sessions.contains_key(&sticky) {
                return Ok(sticky);
            }
        }

        if inner.next_free > LAST_CLIENT_HOST {
            return Err("address pool exhausted".into());
        }
        let addr = self.host_addr(inner.next_free);
        inner.next_free += 1;
        inner.by_hostname.insert(hostname.to_string(), addr);
        Ok(addr)
    }

    /// Registers a session under its assigned address. Fails if the
    /// address is already live, which keeps at most one session per
    /// address even under racing handshakes.
    pub fn register(&self, session: Arc<Session>) -> crate::Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.sessions.contains_key(&session.vpn_addr) {
            return Err(format!("address {} already has a live session", session.vpn_addr).into());
        }
        inner.sessions.insert(session.vpn_addr, session);
        Ok(())
    }

    pub fn unregister(&self, addr: Ipv4Addr) -> Option<Arc<Session>> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .remove(&addr)
    }

    pub fn lookup(&self, addr: Ipv4Addr) -> Option<Arc<Session>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .get(&addr)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut sessions: Vec<Arc<Session>> = inner.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.vpn_addr);
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::plain::PlainCipher;
    use crate::crypto::Cipher;
    use crate::topology::now_unix;

    fn table() -> SessionTable {
        SessionTable::new("10.8.0.0/24".parse().unwrap())
    }

    fn fake_session(table: &SessionTable, hostname: &str) -> Arc<Session> {
        let addr = table.assign_address(hostname).unwrap();
        let cipher: Arc<Box<dyn Cipher>> = Arc::new(Box::new(PlainCipher::new()));
        let (transport, _other) = tokio::io::duplex(1024);
        let (conn, _reader) = PeerConn::pair(
            Box::new(transport),
            "127.0.0.1:9999".parse().unwrap(),
            cipher,
        );
        Arc::new(Session {
            identity: Handshake {
                hostname: hostname.to_string(),
                os: "linux".to_string(),
                version: crate::VERSION.to_string(),
            },
            vpn_addr: addr,
            remote_addr: "127.0.0.1:9999".parse().unwrap(),
            connected_at: now_unix(),
            conn,
        })
    }

    #[tokio::test]
    async fn distinct_hostnames_get_distinct_addresses() {
        let table = table();
        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            let addr = table.assign_address(&format!("host-{}", i)).unwrap();
            assert!(seen.insert(addr), "duplicate address {}", addr);
        }
    }

    #[tokio::test]
    async fn sticky_reassignment_after_disconnect() {
        let table = table();

        let alpha = fake_session(&table, "alpha");
        assert_eq!(alpha.vpn_addr, Ipv4Addr::new(10, 8, 0, 2));
        table.register(alpha.clone()).unwrap();

        let beta = fake_session(&table, "beta");
        assert_eq!(beta.vpn_addr, Ipv4Addr::new(10, 8, 0, 3));
        table.register(beta).unwrap();

        // alpha disconnects; its address is free again and comes back.
        table.unregister(alpha.vpn_addr);
        assert_eq!(
            table.assign_address("alpha").unwrap(),
            Ipv4Addr::new(10, 8, 0, 2)
        );
    }

    #[tokio::test]
    async fn live_sticky_address_forces_fresh_allocation() {
        let table = table();
        let alpha = fake_session(&table, "alpha");
        table.register(alpha).unwrap();

        // Same hostname while the first session is still live.
        assert_eq!(
            table.assign_address("alpha").unwrap(),
            Ipv4Addr::new(10, 8, 0, 3)
        );
    }

    #[tokio::test]
    async fn register_rejects_duplicate_address() {
        let table = table();
        let a = fake_session(&table, "alpha");
        table.register(a.clone()).unwrap();

        let clone = Arc::new(Session {
            identity: a.identity.clone(),
            vpn_addr: a.vpn_addr,
            remote_addr: a.remote_addr,
            connected_at: a.connected_at,
            conn: a.conn.clone(),
        });
        assert!(table.register(clone).is_err());
    }

    #[tokio::test]
    async fn pool_exhaustion() {
        let table = table();
        for i in 0..253 {
            table.assign_address(&format!("host-{}", i)).unwrap();
        }
        assert!(table.assign_address("one-too-many").is_err());
    }
}
