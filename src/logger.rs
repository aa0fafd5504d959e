//! Repository-scoped audit events.
//!
//! Driven by the repo's `log.*` config keys: `log.file` appends a
//! timestamped line, `log.hook` spawns the configured executable with the
//! event text as its argument.  Both are best effort; an unwritable sink is
//! warned about and never fails the session.

use std::io::Write;
use std::process::Stdio;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::RepoConfig;
use crate::identity::Identity;

/// Record one audit event through every configured sink.
pub async fn log_event(config: &RepoConfig, identity: &Identity, event: &str) {
    info!(key = %identity.key, client_ip = ?identity.client_ip, event, "audit");

    if let Some(path) = config.log.get("file") {
        if let Err(e) = append_line(path, identity, event) {
            warn!(%path, error = %e, "failed to append audit line");
        }
    }

    if let Some(hook) = config.log.get("hook") {
        let mut cmd = tokio::process::Command::new(hook);
        cmd.arg(event)
            .env("KEY", &identity.key)
            .env("GIT_CONNECTED_EPOCH", identity.connected_epoch.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(ip) = identity.client_ip {
            cmd.env("SSH_CLIENT_IP", ip.to_string());
        }
        match cmd.status().await {
            Ok(status) if !status.success() => {
                warn!(%hook, %status, "logger hook exited non-zero");
            }
            Err(e) => warn!(%hook, error = %e, "failed to run logger hook"),
            _ => {}
        }
    }
}

fn append_line(path: &str, identity: &Identity, event: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let ip = identity
        .client_ip
        .map(|i| i.to_string())
        .unwrap_or_else(|| "-".to_string());
    writeln!(
        file,
        "{} {} {} {}",
        Utc::now().to_rfc3339(),
        identity.key,
        ip,
        event,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UNKNOWN_KEY;

    fn identity() -> Identity {
        Identity {
            key: UNKNOWN_KEY.to_string(),
            client_ip: Some("192.0.2.7".parse().unwrap()),
            client_port: None,
            server_ip: None,
            server_port: None,
            connected_epoch: 0,
        }
    }

    #[tokio::test]
    async fn log_file_receives_event() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("audit.log");
        let mut cfg = RepoConfig::default();
        cfg.log
            .insert("file".to_string(), log_path.display().to_string());

        log_event(&cfg, &identity(), "Blocked push attempt!").await;
        log_event(&cfg, &identity(), "session end").await;

        let text = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("Blocked push attempt!"));
        assert!(text.contains("192.0.2.7"));
    }

    #[tokio::test]
    async fn missing_sinks_are_silent() {
        let cfg = RepoConfig::default();
        // Nothing configured: only the tracing line fires.
        log_event(&cfg, &identity(), "session start").await;
    }
}
