//! Daemon configuration, loaded once at startup from TOML.

use crate::crypto::CipherConfig;
use anyhow::{bail, Context};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_crypto")]
    pub crypto: CipherConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub mode: Mode,

    // display name; defaults to the host's name
    #[serde(default = "default_node_name")]
    pub name: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    // overlay listener (server mode)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    // upstream server, host:port (client mode)
    pub server_addr: Option<String>,

    // overlay subnet; .1 is always the server
    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Net,

    // engage route-all right after connecting (client mode)
    #[serde(default)]
    pub route_all: bool,

    // local control RPC socket
    #[serde(default = "default_control_addr")]
    pub control_addr: String,

    // address this server is reachable at, advertised in peer lists
    pub public_addr: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            server_addr: None,
            subnet: default_subnet(),
            route_all: false,
            control_addr: default_control_addr(),
            public_addr: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    // shell command run by the `update` control method
    pub command: Option<String>,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string())
}

fn default_data_dir() -> PathBuf {
    crate::store::jsonl::JsonlStore::default_dir()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_subnet() -> Ipv4Net {
    "10.8.0.0/24".parse().unwrap()
}

fn default_control_addr() -> String {
    "127.0.0.1:9001".to_string()
}

fn default_true() -> bool {
    true
}

fn default_crypto() -> CipherConfig {
    CipherConfig::Plain
}

pub fn load(path: &str) -> anyhow::Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parsing config {}", path))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.network.subnet.prefix_len() != 24 {
            bail!("overlay subnet must be a /24, got {}", self.network.subnet);
        }

        match self.node.mode {
            Mode::Client => {
                if self.network.server_addr.is_none() {
                    bail!("client mode requires network.server_addr");
                }
            }
            Mode::Server => {
                if self.tls.enabled && (self.tls.cert.is_none() || self.tls.key.is_none()) {
                    bail!("tls.enabled on a server requires tls.cert and tls.key");
                }
            }
        }
        Ok(())
    }

    /// Hostname part of `server_addr` (for the TLS server name).
    pub fn server_host(&self) -> Option<String> {
        self.network
            .server_addr
            .as_ref()
            .map(|addr| addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_server_config() {
        let config: Config = toml::from_str(
            r#"
            [node]
            mode = "server"
            name = "hub"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.network.listen_addr, "0.0.0.0:8443");
        assert_eq!(config.network.control_addr, "127.0.0.1:9001");
        assert_eq!(config.network.subnet.to_string(), "10.8.0.0/24");
        assert!(config.tls.insecure_skip_verify);
    }

    #[test]
    fn client_requires_server_addr() {
        let config: Config = toml::from_str(
            r#"
            [node]
            mode = "client"
            name = "alpha"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn crypto_key_forms() {
        let config: Config = toml::from_str(
            r#"
            [node]
            mode = "server"
            name = "hub"

            [crypto]
            aes256gcm = "family-secret"
            "#,
        )
        .unwrap();
        assert!(!config.crypto.is_plain());
    }

    #[test]
    fn non_slash24_subnet_rejected() {
        let config: Config = toml::from_str(
            r#"
            [node]
            mode = "server"
            name = "hub"

            [network]
            subnet = "10.8.0.0/16"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_host_split() {
        let config: Config = toml::from_str(
            r#"
            [node]
            mode = "client"
            name = "alpha"

            [network]
            server_addr = "vpn.example.com:8443"
            "#,
        )
        .unwrap();
        assert_eq!(config.server_host().unwrap(), "vpn.example.com");
    }
}
