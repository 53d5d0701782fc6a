//! Host routing-table takeover and restore.
//!
//! `route_all` swaps the host's default route for the overlay gateway
//! while pinning a host route to the server's public address through the
//! original gateway, so the tunnel's own transport never loops into the
//! tunnel. `restore` puts everything back. State lives here so restore is
//! safe to call on every teardown path, engaged or not.

use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Engaged {
    original_gateway: String,
    server_public: IpAddr,
}

#[derive(Debug, Default)]
pub struct RouteManager {
    engaged: Mutex<Option<Engaged>>,
}

impl RouteManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Takes over the default route. Idempotent when already engaged.
    pub fn route_all(&self, server_public: IpAddr, overlay_gw: Ipv4Addr) -> crate::Result<()> {
        let mut engaged = self.engaged.lock().unwrap_or_else(|e| e.into_inner());
        if engaged.is_some() {
            tracing::debug!("route-all already engaged");
            return Ok(());
        }

        let original_gateway = default_gateway()?;
        tracing::info!(
            "taking over default route: {} -> {} (server {} pinned via {})",
            original_gateway,
            overlay_gw,
            server_public,
            original_gateway
        );

        pin_host_route(server_public, &original_gateway)?;
        if let Err(e) = replace_default_route(&overlay_gw.to_string()) {
            // Leave no half-takeover behind.
            let _ = unpin_host_route(server_public);
            return Err(e);
        }

        *engaged = Some(Engaged {
            original_gateway,
            server_public,
        });
        Ok(())
    }

    /// Restores the saved default route and drops the pinned host route.
    /// No-op when route-all was never engaged.
    pub fn restore(&self) -> crate::Result<()> {
        let mut engaged = self.engaged.lock().unwrap_or_else(|e| e.into_inner());
        let state = match engaged.take() {
            Some(state) => state,
            None => return Ok(()),
        };

        tracing::info!("restoring default route via {}", state.original_gateway);
        let unpin = unpin_host_route(state.server_public);
        let restore = replace_default_route(&state.original_gateway);

        // Report the first failure but attempt both steps regardless.
        unpin?;
        restore
    }
}

fn run(cmd: &str, args: &[&str]) -> crate::Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute {}: {}", cmd, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Tolerate re-runs on both OSes.
        if stderr.contains("already exists") || stderr.contains("not in table")
            || stderr.contains("No such process")
        {
            tracing::debug!("{} {:?}: {}", cmd, args, stderr.trim());
            return Ok(String::new());
        }
        return Err(format!("{} {:?} failed: {}", cmd, args, stderr.trim()).into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "linux")]
fn default_gateway() -> crate::Result<String> {
    let out = run("ip", &["route", "show", "default"])?;
    // "default via 192.168.1.1 dev eth0 ..."
    let mut words = out.split_whitespace();
    while let Some(word) = words.next() {
        if word == "via" {
            if let Some(gw) = words.next() {
                return Ok(gw.to_string());
            }
        }
    }
    Err("no default gateway found".into())
}

#[cfg(target_os = "linux")]
fn pin_host_route(server: IpAddr, gateway: &str) -> crate::Result<()> {
    let dst = format!("{}/32", server);
    run("ip", &["route", "replace", &dst, "via", gateway]).map(|_| ())
}

#[cfg(target_os = "linux")]
fn unpin_host_route(server: IpAddr) -> crate::Result<()> {
    let dst = format!("{}/32", server);
    run("ip", &["route", "del", &dst]).map(|_| ())
}

#[cfg(target_os = "linux")]
fn replace_default_route(gateway: &str) -> crate::Result<()> {
    run("ip", &["route", "replace", "default", "via", gateway]).map(|_| ())
}

#[cfg(target_os = "macos")]
fn default_gateway() -> crate::Result<String> {
    let out = run("route", &["-n", "get", "default"])?;
    for line in out.lines() {
        let line = line.trim();
        if let Some(gw) = line.strip_prefix("gateway:") {
            return Ok(gw.trim().to_string());
        }
    }
    Err("no default gateway found".into())
}

#[cfg(target_os = "macos")]
fn pin_host_route(server: IpAddr, gateway: &str) -> crate::Result<()> {
    let dst = server.to_string();
    run("route", &["-n", "add", "-host", &dst, gateway]).map(|_| ())
}

#[cfg(target_os = "macos")]
fn unpin_host_route(server: IpAddr) -> crate::Result<()> {
    let dst = server.to_string();
    run("route", &["-n", "delete", "-host", &dst]).map(|_| ())
}

#[cfg(target_os = "macos")]
fn replace_default_route(gateway: &str) -> crate::Result<()> {
    run("route", &["-n", "change", "default", gateway]).map(|_| ())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn default_gateway() -> crate::Result<String> {
    Err("route takeover is not supported on this platform".into())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn pin_host_route(_server: IpAddr, _gateway: &str) -> crate::Result<()> {
    Err("route takeover is not supported on this platform".into())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn unpin_host_route(_server: IpAddr) -> crate::Result<()> {
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn replace_default_route(_gateway: &str) -> crate::Result<()> {
    Err("route takeover is not supported on this platform".into())
}
