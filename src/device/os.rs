//! Real tunnel device over the `tun` crate.
//!
//! The kernel device is owned by a pump task; the adapter talks to it
//! through bounded channels, which keeps one reader and one writer on the
//! device no matter how many sessions sit above it.

use crate::device::routes::RouteManager;
use crate::device::{TunAdapter, TunConfig, TunProvider};
use crate::proto::packet;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const PUMP_QUEUE: usize = 1024;

pub struct OsTun {
    cfg: TunConfig,
    inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    routes: RouteManager,
    drops: AtomicU64,
    stop: CancellationToken,
}

impl OsTun {
    pub async fn open(cfg: TunConfig) -> crate::Result<Arc<Self>> {
        let mut device_cfg = tun::Configuration::default();
        device_cfg
            .address(cfg.local_addr)
            .netmask(cfg.netmask)
            .mtu(cfg.mtu)
            .up();

        #[cfg(target_os = "linux")]
        device_cfg.platform_config(|platform| {
            platform.ensure_root_privileges(true);
        });

        let dev = tun::create_as_async(&device_cfg)?;
        tracing::info!("tunnel device up: {} mtu {}", cfg.local_addr, cfg.mtu);

        let (inbound_tx, inbound_rx) = mpsc::channel(PUMP_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(PUMP_QUEUE);
        let stop = CancellationToken::new();

        tokio::spawn(pump(dev, cfg.mtu, inbound_tx, outbound_rx, stop.clone()));

        Ok(Arc::new(Self {
            cfg,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            routes: RouteManager::new(),
            drops: AtomicU64::new(0),
            stop,
        }))
    }
}

async fn pump(
    mut dev: tun::AsyncDevice,
    mtu: u16,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    stop: CancellationToken,
) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = vec![0u8; mtu as usize + 64];
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,

            read = dev.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if inbound_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("tunnel device read failed: {}", e);
                        break;
                    }
                }
            }

            pkt = outbound_rx.recv() => {
                match pkt {
                    Some(pkt) => {
                        if let Err(e) = dev.write(&pkt).await {
                            tracing::error!("tunnel device write failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    tracing::debug!("tunnel device pump stopped");
}

#[async_trait]
impl TunAdapter for OsTun {
    async fn read_packet(&self) -> crate::Result<Vec<u8>> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or_else(|| "tunnel device closed".into())
    }

    async fn write_packet(&self, pkt: &[u8]) -> crate::Result<()> {
        if !packet::is_ip(pkt) {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return Err("not an IP packet".into());
        }
        self.outbound_tx
            .send(pkt.to_vec())
            .await
            .map_err(|_| "tunnel device closed".into())
    }

    async fn route_all(&self, server_public: IpAddr) -> crate::Result<()> {
        self.routes.route_all(server_public, self.cfg.gateway)
    }

    async fn restore_routes(&self) -> crate::Result<()> {
        self.routes.restore()
    }

    fn route_all_engaged(&self) -> bool {
        self.routes.is_engaged()
    }

    fn validation_drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.stop.cancel();
    }
}

pub struct OsTunProvider;

#[async_trait]
impl TunProvider for OsTunProvider {
    async fn open(&self, cfg: TunConfig) -> crate::Result<Arc<dyn TunAdapter>> {
        Ok(OsTun::open(cfg).await? as Arc<dyn TunAdapter>)
    }
}
