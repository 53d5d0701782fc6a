//! In-memory tunnel device for tests.
//!
//! Behaves like the OS adapter — packet validation, route-all state,
//! close-ends-reads — but the "host kernel" is a pair of channels handed
//! to the test.

use crate::device::{TunAdapter, TunConfig, TunProvider};
use crate::proto::packet;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct MemTun {
    pub cfg: TunConfig,
    inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    delivered_tx: mpsc::UnboundedSender<Vec<u8>>,
    engaged: AtomicBool,
    restore_calls: AtomicU64,
    drops: AtomicU64,
    closed: CancellationToken,
}

/// The test's side of the fake: inject packets the daemon will read,
/// observe packets the daemon wrote.
pub struct MemTunHost {
    pub inject_tx: mpsc::Sender<Vec<u8>>,
    pub delivered_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemTun {
    pub fn new(cfg: TunConfig) -> (Arc<Self>, MemTunHost) {
        let (inject_tx, inbound_rx) = mpsc::channel(1024);
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();

        let tun = Arc::new(Self {
            cfg,
            inbound_rx: Mutex::new(inbound_rx),
            delivered_tx,
            engaged: AtomicBool::new(false),
            restore_calls: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });
        let host = MemTunHost {
            inject_tx,
            delivered_rx,
        };
        (tun, host)
    }

    pub fn restore_calls(&self) -> u64 {
        self.restore_calls.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl TunAdapter for MemTun {
    async fn read_packet(&self) -> crate::Result<Vec<u8>> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err("tunnel device closed".into()),
            pkt = rx.recv() => pkt.ok_or_else(|| "tunnel device closed".into()),
        }
    }

    async fn write_packet(&self, pkt: &[u8]) -> crate::Result<()> {
        if !packet::is_ip(pkt) {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return Err("not an IP packet".into());
        }
        self.delivered_tx
            .send(pkt.to_vec())
            .map_err(|_| "tunnel device closed".into())
    }

    async fn route_all(&self, _server_public: IpAddr) -> crate::Result<()> {
        self.engaged.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn restore_routes(&self) -> crate::Result<()> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        self.engaged.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn route_all_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    fn validation_drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Provider that surfaces every opened fake to the test through a channel.
pub struct MemTunProvider {
    opened_tx: std::sync::Mutex<mpsc::UnboundedSender<(TunConfig, Arc<MemTun>, MemTunHost)>>,
}

impl MemTunProvider {
    #[allow(clippy::type_complexity)]
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<(TunConfig, Arc<MemTun>, MemTunHost)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                opened_tx: std::sync::Mutex::new(tx),
            },
            rx,
        )
    }
}

#[async_trait]
impl TunProvider for MemTunProvider {
    async fn open(&self, cfg: TunConfig) -> crate::Result<Arc<dyn TunAdapter>> {
        let (tun, host) = MemTun::new(cfg.clone());
        self.opened_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send((cfg, tun.clone(), host))
            .map_err(|_| "test dropped the provider receiver")?;
        Ok(tun as Arc<dyn TunAdapter>)
    }
}
