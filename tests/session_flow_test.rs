//! Server session lifecycle over real loopback sockets:
//! handshake, sticky address assignment, peer-list fan-out, and
//! tunnel-to-peer routing with the in-memory device fake.

use meshtun::crypto::plain::PlainCipher;
use meshtun::crypto::Cipher;
use meshtun::device::mem::{MemTun, MemTunHost};
use meshtun::device::{TunAdapter, TunConfig};
use meshtun::network::dial;
use meshtun::network::peer_conn::{PeerConn, PeerReader};
use meshtun::proto::control::ControlMsg;
use meshtun::proto::{packet, recv_assigned_addr, send_handshake, Handshake};
use meshtun::server::{ServerEngine, ServerEngineConfig};
use meshtun::store::mem::MemStore;
use meshtun::store::Store;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn cipher() -> Arc<Box<dyn Cipher>> {
    Arc::new(Box::new(PlainCipher::new()))
}

/// Starts a server engine on the given loopback port with a fake device.
async fn start_server(
    port: u16,
) -> (Arc<ServerEngine>, Arc<MemTun>, MemTunHost, CancellationToken) {
    let (tun, host) = MemTun::new(TunConfig::new(
        Ipv4Addr::new(10, 8, 0, 1),
        Ipv4Addr::new(10, 8, 0, 1),
    ));
    let cancel = CancellationToken::new();
    let engine = ServerEngine::new(
        ServerEngineConfig {
            node_name: "hub".to_string(),
            listen_addr: format!("127.0.0.1:{}", port),
            subnet: "10.8.0.0/24".parse().unwrap(),
            public_addr: None,
        },
        tun.clone() as Arc<dyn TunAdapter>,
        Arc::new(MemStore::new()) as Arc<dyn Store>,
        cipher(),
        false,
        None,
        cancel.clone(),
    );

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let _ = engine.run().await;
        });
    }
    // Wait for the listener to come up.
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    (engine, tun, host, cancel)
}

/// Dials and handshakes like a client, returning the framed connection.
async fn join(port: u16, hostname: &str) -> (Ipv4Addr, Arc<PeerConn>, PeerReader) {
    let (mut transport, remote) = dial(&format!("127.0.0.1:{}", port), None)
        .await
        .expect("dial failed");
    send_handshake(
        &mut transport,
        false,
        &Handshake {
            hostname: hostname.to_string(),
            os: "linux".to_string(),
            version: meshtun::VERSION.to_string(),
        },
    )
    .await
    .expect("handshake failed");
    let assigned = recv_assigned_addr(&mut transport)
        .await
        .expect("no address reply");
    let (conn, reader) = PeerConn::pair(transport, remote, cipher());
    (assigned, conn, reader)
}

/// Reads frames until a PEER_LIST with `expected` members arrives,
/// returning the raw payload for byte-level comparison.
async fn peer_list_of(reader: &mut PeerReader, expected: usize) -> Vec<u8> {
    timeout(Duration::from_secs(5), async {
        loop {
            let payload = reader.read_packet().await.expect("read failed");
            if let Some(Ok(ControlMsg::PeerList(peers))) = ControlMsg::parse(&payload) {
                if peers.len() == expected {
                    return payload;
                }
            }
        }
    })
    .await
    .expect("peer list timeout")
}

#[tokio::test]
async fn address_assignment_is_sticky() {
    let (_engine, _tun, _host, cancel) = start_server(47831).await;

    let (alpha_addr, alpha_conn, _alpha_reader) = join(47831, "alpha").await;
    assert_eq!(alpha_addr, Ipv4Addr::new(10, 8, 0, 2));

    // alpha leaves; give the server a beat to unregister.
    alpha_conn.shutdown().await;
    drop(_alpha_reader);
    sleep(Duration::from_millis(200)).await;

    let (beta_addr, _beta_conn, _beta_reader) = join(47831, "beta").await;
    assert_eq!(beta_addr, Ipv4Addr::new(10, 8, 0, 3));

    // alpha comes back and finds its old address free.
    let (alpha_again, _conn, _reader) = join(47831, "alpha").await;
    assert_eq!(alpha_again, Ipv4Addr::new(10, 8, 0, 2));

    cancel.cancel();
}

#[tokio::test]
async fn peer_list_fans_out_identically() {
    let (_engine, _tun, _host, cancel) = start_server(47832).await;

    let (_a, _alpha_conn, mut alpha_reader) = join(47832, "alpha").await;
    let (_b, _beta_conn, mut beta_reader) = join(47832, "beta").await;
    let (_g, _gamma_conn, _gamma_reader) = join(47832, "gamma").await;

    // Both existing subscribers see the same four-member list
    // (hub + alpha + beta + gamma), byte-for-byte.
    let alpha_list = peer_list_of(&mut alpha_reader, 4).await;
    let beta_list = peer_list_of(&mut beta_reader, 4).await;
    assert_eq!(alpha_list, beta_list);

    match ControlMsg::parse(&alpha_list) {
        Some(Ok(ControlMsg::PeerList(peers))) => {
            let addrs: Vec<&str> = peers.iter().map(|p| p.vpn_address.as_str()).collect();
            assert_eq!(addrs, ["10.8.0.1", "10.8.0.2", "10.8.0.3", "10.8.0.4"]);
            assert_eq!(peers[0].name, "hub");
        }
        other => panic!("expected peer list, got {:?}", other),
    }

    cancel.cancel();
}

#[tokio::test]
async fn tunnel_packets_route_to_owning_session() {
    let (_engine, _tun, host, cancel) = start_server(47833).await;

    let (alpha_addr, _alpha_conn, mut alpha_reader) = join(47833, "alpha").await;
    let (_beta_addr, _beta_conn, _beta_reader) = join(47833, "beta").await;

    // Registration completes just after the address reply; give the
    // server a beat before injecting.
    sleep(Duration::from_millis(100)).await;

    // A packet surfacing from the server's tunnel device for 10.8.0.2
    // must arrive on alpha's socket and nowhere else.
    let pkt = packet::fake_ipv4(Ipv4Addr::new(10, 8, 0, 3), alpha_addr, b"ping");
    host.inject_tx.send(pkt.clone()).await.unwrap();

    let got = timeout(Duration::from_secs(5), async {
        loop {
            let payload = alpha_reader.read_packet().await.expect("read failed");
            if ControlMsg::parse(&payload).is_none() {
                return payload;
            }
        }
    })
    .await
    .expect("routed packet timeout");
    assert_eq!(got, pkt);

    cancel.cancel();
}

#[tokio::test]
async fn peer_packets_reach_the_tunnel_device() {
    let (_engine, _tun, mut host, cancel) = start_server(47834).await;

    let (alpha_addr, alpha_conn, _alpha_reader) = join(47834, "alpha").await;

    let pkt = packet::fake_ipv4(alpha_addr, Ipv4Addr::new(10, 8, 0, 1), b"up");
    alpha_conn.write_packet(&pkt).await.unwrap();

    let delivered = timeout(Duration::from_secs(5), host.delivered_rx.recv())
        .await
        .expect("tunnel delivery timeout")
        .expect("device closed");
    assert_eq!(delivered, pkt);

    cancel.cancel();
}

#[tokio::test]
async fn malformed_handshake_is_dropped_without_a_session() {
    let (engine, _tun, _host, cancel) = start_server(47835).await;

    let mut stream = tokio::net::TcpStream::connect("127.0.0.1:47835")
        .await
        .unwrap();
    use tokio::io::AsyncWriteExt;
    stream.write_all(&[1u8]).await.unwrap();
    stream.write_all(&9000u32.to_be_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.peer_count(), 0);

    cancel.cancel();
}
