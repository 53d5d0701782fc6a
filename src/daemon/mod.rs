pub mod config;
pub mod supervisor;

pub use config::{Config, Mode};
pub use supervisor::run;

/// Runs the configured deploy/update command in the background. Invoked by
/// the `update` control method and by UPDATE_AVAILABLE broadcasts.
pub fn spawn_update_task(cmd: Option<String>) {
    let Some(cmd) = cmd else {
        tracing::info!("update requested but no update command is configured");
        return;
    };

    tokio::spawn(async move {
        tracing::info!("running update command: {}", cmd);
        match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .status()
            .await
        {
            Ok(status) if status.success() => tracing::info!("update command finished"),
            Ok(status) => tracing::error!("update command exited with {}", status),
            Err(e) => tracing::error!("update command failed to start: {}", e),
        }
    });
}
