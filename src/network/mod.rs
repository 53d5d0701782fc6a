//! Transport plumbing shared by both roles: dialing, socket tuning,
//! accept backoff, and the framed peer connection.

pub mod peer_conn;
pub mod tls;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Transport keep-alive probe interval.
pub const KEEPALIVE: Duration = Duration::from_secs(30);
/// Kernel socket buffer size on both directions.
const SOCKET_BUF: usize = 1024 * 1024;
/// Timeout for TCP connection establishment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte stream a peer connection runs over: plain TCP or TLS.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Tunes an overlay transport socket: Nagle off (every frame is flushed
/// anyway), keep-alive on so half-open peers surface within ~30 s, large
/// kernel buffers for bulk transfer.
pub fn tune_socket(stream: &TcpStream) -> crate::Result<()> {
    stream.set_nodelay(true)?;

    let sock = socket2::SockRef::from(stream);
    sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(KEEPALIVE))?;
    sock.set_recv_buffer_size(SOCKET_BUF)?;
    sock.set_send_buffer_size(SOCKET_BUF)?;
    Ok(())
}

/// Dials the server, applying the connect timeout, socket tuning, and the
/// optional TLS layer. Returns the transport and the resolved remote
/// address (which the client pins a host route for under route-all).
pub async fn dial(
    addr: &str,
    tls: Option<&tls::TlsClient>,
) -> crate::Result<(BoxedTransport, SocketAddr)> {
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(format!("connect to {} timed out", addr).into()),
    };
    let remote = stream.peer_addr()?;
    tune_socket(&stream)?;

    let transport: BoxedTransport = match tls {
        Some(client) => client.connect(stream).await?,
        None => Box::new(stream),
    };
    Ok((transport, remote))
}

/// Accepts one connection, retrying transient errors with exponential
/// backoff (1 s doubling to 64 s) before giving up.
pub async fn accept_with_backoff(listener: &TcpListener) -> crate::Result<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok((socket, addr)) => return Ok((socket, addr)),
            Err(err) => match err.kind() {
                ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionReset
                | ErrorKind::WouldBlock => {
                    if backoff > 64 {
                        tracing::error!("accept retry exhausted: {}", err);
                        return Err(err.into());
                    }
                    tracing::warn!("accept failed, retrying in {}s: {}", backoff, err);
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff *= 2;
                }
                _ => {
                    tracing::error!("fatal accept error: {}", err);
                    return Err(err.into());
                }
            },
        }
    }
}
