//! Local control surface: a line-delimited JSON request/response protocol
//! on a loopback TCP socket, consumed by the CLI and dashboard.

pub mod api;
pub mod server;
pub mod timerange;

use crate::client::ClientEngine;
use crate::server::ServerEngine;
use crate::store::Store;
use std::sync::Arc;
use std::time::Instant;

/// Which engine this daemon runs.
pub enum Role {
    Server(Arc<ServerEngine>),
    Client(Arc<ClientEngine>),
}

impl Role {
    pub fn is_server(&self) -> bool {
        matches!(self, Role::Server(_))
    }
}

/// Everything the control methods need, handed over explicitly.
pub struct NodeCtx {
    pub node_name: String,
    pub started_at: Instant,
    pub store: Arc<dyn Store>,
    pub role: Role,
    pub update_command: Option<String>,
}
