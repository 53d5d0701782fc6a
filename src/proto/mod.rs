//! Node-to-node wire protocol: handshake, address assignment, and the
//! inline control vocabulary.
//!
//! A connection starts with a raw (unframed) exchange:
//!
//! ```text
//! client -> server   ENC(1) || LEN(4, BE) || JSON{hostname, os, version}
//! server -> client   LEN(4, BE) || ASCII VPN address
//! ```
//!
//! after which both sides switch to framed packet mode (codec module).
//! `ENC` tells the server whether subsequent frames on this connection are
//! sealed.

pub mod control;
pub mod packet;

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the handshake JSON.
pub const MAX_HANDSHAKE_LEN: usize = 4096;
/// Upper bound on the assigned-address reply.
pub const MAX_ADDR_REPLY_LEN: usize = 64;

/// Peer identity presented at handshake. The hostname doubles as the
/// display name; it is not a security identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub hostname: String,
    pub os: String,
    pub version: String,
}

/// One row of a PEER_LIST control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub vpn_address: String,
    pub hostname: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,
}

/// Client side: sends the handshake immediately after transport connect.
pub async fn send_handshake<S>(stream: &mut S, encrypted: bool, hs: &Handshake) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(hs)?;
    if body.len() > MAX_HANDSHAKE_LEN {
        return Err(format!("handshake too large: {} bytes", body.len()).into());
    }

    stream.write_all(&[encrypted as u8]).await?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Server side: reads the handshake. The caller bounds this with a timeout;
/// a malformed or oversized handshake drops the connection.
pub async fn recv_handshake<S>(stream: &mut S) -> crate::Result<(bool, Handshake)>
where
    S: AsyncRead + Unpin,
{
    let mut enc = [0u8; 1];
    stream.read_exact(&mut enc).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_HANDSHAKE_LEN {
        return Err(format!("handshake length {} out of range", len).into());
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let hs: Handshake =
        serde_json::from_slice(&body).map_err(|e| format!("malformed handshake: {}", e))?;
    Ok((enc[0] != 0, hs))
}

/// Server side: replies with the assigned VPN address as an ASCII string.
pub async fn send_assigned_addr<S>(stream: &mut S, addr: Ipv4Addr) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let text = addr.to_string();
    stream.write_all(&(text.len() as u32).to_be_bytes()).await?;
    stream.write_all(text.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Client side: reads the assigned VPN address.
pub async fn recv_assigned_addr<S>(stream: &mut S) -> crate::Result<Ipv4Addr>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_ADDR_REPLY_LEN {
        return Err(format!("address reply length {} out of range", len).into());
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let text = std::str::from_utf8(&body).map_err(|_| "address reply is not UTF-8")?;
    Ok(text.parse::<Ipv4Addr>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> Handshake {
        Handshake {
            hostname: "alpha".to_string(),
            os: "linux".to_string(),
            version: "0.3.1".to_string(),
        }
    }

    #[tokio::test]
    async fn handshake_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        send_handshake(&mut client, true, &handshake()).await.unwrap();
        let (encrypted, hs) = recv_handshake(&mut server).await.unwrap();
        assert!(encrypted);
        assert_eq!(hs.hostname, "alpha");
        assert_eq!(hs.os, "linux");
    }

    #[tokio::test]
    async fn handshake_oversize_rejected() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        use tokio::io::AsyncWriteExt;
        client.write_all(&[0u8]).await.unwrap();
        client
            .write_all(&(MAX_HANDSHAKE_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        client.flush().await.unwrap();

        assert!(recv_handshake(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn assigned_addr_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(256);

        send_assigned_addr(&mut server, Ipv4Addr::new(10, 8, 0, 7)).await.unwrap();
        let addr = recv_assigned_addr(&mut client).await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 8, 0, 7));
    }
}
