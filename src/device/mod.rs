//! Tunnel device adapter.
//!
//! The daemon owns exactly one tunnel device. Everything above it talks to
//! the `TunAdapter` capability interface; below it sit the OS
//! implementation (Linux/macOS via the `tun` crate plus routing-table
//! commands) and an in-memory fake for tests. A `TunProvider` hands out
//! adapters, since the client can only open the device after the server
//! has assigned it an address.

pub mod mem;
pub mod os;
pub mod routes;

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};

/// Parameters for opening the tunnel device.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Local overlay address (assigned by the server on clients).
    pub local_addr: Ipv4Addr,
    /// Overlay gateway, always the server's VPN address.
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
}

impl TunConfig {
    pub fn new(local_addr: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self {
            local_addr,
            gateway,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: crate::MTU,
        }
    }
}

/// Capability interface over the tunnel device and the host routing table.
#[async_trait]
pub trait TunAdapter: Send + Sync {
    /// Reads one IP packet from the host kernel.
    async fn read_packet(&self) -> crate::Result<Vec<u8>>;

    /// Hands one packet to the host kernel. Non-IP payloads (version
    /// nibble outside {4, 6}) are rejected with a recoverable error and
    /// counted; the session that delivered them continues.
    async fn write_packet(&self, pkt: &[u8]) -> crate::Result<()>;

    /// Replaces the host default route with the overlay gateway, keeping a
    /// pinned host route to the server's public address via the original
    /// gateway. Idempotent when already engaged.
    async fn route_all(&self, server_public: IpAddr) -> crate::Result<()>;

    /// Undoes `route_all`. A no-op if routing was never taken over; safe
    /// to call repeatedly. Must run before `close` on any path where
    /// route-all was engaged.
    async fn restore_routes(&self) -> crate::Result<()>;

    /// True while the default route points at the overlay.
    fn route_all_engaged(&self) -> bool;

    /// Packets rejected by `write_packet` validation.
    fn validation_drops(&self) -> u64;

    /// Best-effort teardown of the device itself.
    async fn close(&self);
}

/// Factory for tunnel adapters.
#[async_trait]
pub trait TunProvider: Send + Sync {
    async fn open(&self, cfg: TunConfig) -> crate::Result<std::sync::Arc<dyn TunAdapter>>;
}
