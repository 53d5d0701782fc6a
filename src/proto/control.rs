//! Inline control messages.
//!
//! Control messages share the packet channel with tunneled IP traffic: a
//! payload beginning with the ASCII marker `CTRL:` is a control message,
//! anything else is expected to be an IP packet. The marker test must run
//! before IP validation — `C` is 0x43, so a control payload also happens
//! to carry a "version nibble" of 4.

use crate::proto::PeerEntry;
use serde::{Deserialize, Serialize};

pub const CTRL_PREFIX: &[u8] = b"CTRL:";

const PEER_LIST: &str = "PEER_LIST:";
const UPDATE_AVAILABLE: &str = "UPDATE_AVAILABLE";
const SERVER_RESTARTING: &str = "SERVER_RESTARTING";
const DISCONNECT_INTENT: &str = "DISCONNECT_INTENT:";
const DISCONNECT_ACK: &str = "DISCONNECT_ACK";
const RECONNECT_INVITE: &str = "RECONNECT_INVITE:";

/// Sent by a client before tearing its session down on purpose, so the
/// server can tell intent from failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectIntent {
    pub node_name: String,
    pub vpn_address: String,
    pub reason: String,
    pub route_all: bool,
}

/// Invitation for a disconnected client to come back, optionally
/// re-engaging full routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectInvite {
    pub server_name: String,
    pub reason: String,
    pub should_enable_routing: bool,
}

#[derive(Debug, Clone)]
pub enum ControlMsg {
    PeerList(Vec<PeerEntry>),
    UpdateAvailable,
    ServerRestarting,
    DisconnectIntent(DisconnectIntent),
    DisconnectAck,
    ReconnectInvite(ReconnectInvite),
}

impl ControlMsg {
    /// Serializes into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let text = match self {
            ControlMsg::PeerList(peers) => {
                // Broadcasts serialize once; failure here means a PeerEntry
                // field stopped being serializable, which is a programming
                // error, not a runtime condition.
                format!("{}{}", PEER_LIST, serde_json::to_string(peers).unwrap())
            }
            ControlMsg::UpdateAvailable => UPDATE_AVAILABLE.to_string(),
            ControlMsg::ServerRestarting => SERVER_RESTARTING.to_string(),
            ControlMsg::DisconnectIntent(intent) => {
                format!("{}{}", DISCONNECT_INTENT, serde_json::to_string(intent).unwrap())
            }
            ControlMsg::DisconnectAck => DISCONNECT_ACK.to_string(),
            ControlMsg::ReconnectInvite(invite) => {
                format!("{}{}", RECONNECT_INVITE, serde_json::to_string(invite).unwrap())
            }
        };

        let mut payload = Vec::with_capacity(CTRL_PREFIX.len() + text.len());
        payload.extend_from_slice(CTRL_PREFIX);
        payload.extend_from_slice(text.as_bytes());
        payload
    }

    /// Classifies a frame payload. `None` means "not a control message" —
    /// the payload should then go through IP validation. `Some(Err)` is a
    /// control payload that failed to parse; sessions log it and continue.
    pub fn parse(payload: &[u8]) -> Option<crate::Result<ControlMsg>> {
        let rest = payload.strip_prefix(CTRL_PREFIX)?;
        Some(Self::parse_body(rest))
    }

    fn parse_body(rest: &[u8]) -> crate::Result<ControlMsg> {
        let text = std::str::from_utf8(rest).map_err(|_| "control message is not UTF-8")?;

        if let Some(json) = text.strip_prefix(PEER_LIST) {
            let peers: Vec<PeerEntry> = serde_json::from_str(json)?;
            return Ok(ControlMsg::PeerList(peers));
        }
        if let Some(json) = text.strip_prefix(DISCONNECT_INTENT) {
            let intent: DisconnectIntent = serde_json::from_str(json)?;
            return Ok(ControlMsg::DisconnectIntent(intent));
        }
        if let Some(json) = text.strip_prefix(RECONNECT_INVITE) {
            let invite: ReconnectInvite = serde_json::from_str(json)?;
            return Ok(ControlMsg::ReconnectInvite(invite));
        }

        match text {
            UPDATE_AVAILABLE => Ok(ControlMsg::UpdateAvailable),
            SERVER_RESTARTING => Ok(ControlMsg::ServerRestarting),
            DISCONNECT_ACK => Ok(ControlMsg::DisconnectAck),
            other => Err(format!("unknown control message: {}", other).into()),
        }
    }
}
