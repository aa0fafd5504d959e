//! Caller identity derived from the SSH environment.
//!
//! `sshd` supplies the connection endpoints via `SSH_CLIENT` (or the newer
//! `SSH_CONNECTION`), and the key holder's tag via the `KEY` environment
//! variable injected by the `authorized_keys` forced-command line.  The
//! resulting tuple is constructed once at connection start and stays
//! immutable for the connection's lifetime.

use std::net::IpAddr;

// ---------------------------------------------------------------------------
// Identity tuple
// ---------------------------------------------------------------------------

/// The KEY tag used when no identity was supplied.
pub const UNKNOWN_KEY: &str = "UNKNOWN";

/// Immutable per-connection identity.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Short opaque tag for the SSH key holder; the primary ACL principal.
    pub key: String,
    pub client_ip: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub server_ip: Option<IpAddr>,
    pub server_port: Option<u16>,
    /// Unix epoch seconds at connection start.
    pub connected_epoch: i64,
}

impl Identity {
    /// Build the identity from the current process environment.
    pub fn from_env() -> Self {
        let key = std::env::var("KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_KEY.to_string());

        let ssh = std::env::var("SSH_CLIENT")
            .or_else(|_| std::env::var("SSH_CONNECTION"))
            .ok();

        let mut identity = Self {
            key,
            client_ip: None,
            client_port: None,
            server_ip: None,
            server_port: None,
            connected_epoch: chrono::Utc::now().timestamp(),
        };

        if let Some(ref raw) = ssh {
            identity.fill_endpoints(raw);
        }

        identity
    }

    /// Parse the `"client_ip client_port server_ip server_port"` form shared
    /// by `SSH_CLIENT` and `SSH_CONNECTION`.  Older three-token `SSH_CLIENT`
    /// values carry only the server port in the third slot.
    fn fill_endpoints(&mut self, raw: &str) {
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        self.client_ip = tokens.first().and_then(|t| t.parse().ok());
        self.client_port = tokens.get(1).and_then(|t| t.parse().ok());
        match tokens.len() {
            3 => self.server_port = tokens[2].parse().ok(),
            n if n >= 4 => {
                self.server_ip = tokens[2].parse().ok();
                self.server_port = tokens[3].parse().ok();
            }
            _ => {}
        }
    }

    /// Whether the process was reached through SSH at all.
    pub fn has_ssh_context() -> bool {
        std::env::var_os("SSH_CLIENT").is_some() || std::env::var_os("SSH_CONNECTION").is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> Identity {
        Identity {
            key: UNKNOWN_KEY.to_string(),
            client_ip: None,
            client_port: None,
            server_ip: None,
            server_port: None,
            connected_epoch: 0,
        }
    }

    #[test]
    fn four_token_connection() {
        let mut id = blank();
        id.fill_endpoints("192.0.2.7 51234 198.51.100.1 22");
        assert_eq!(id.client_ip.unwrap().to_string(), "192.0.2.7");
        assert_eq!(id.client_port, Some(51234));
        assert_eq!(id.server_ip.unwrap().to_string(), "198.51.100.1");
        assert_eq!(id.server_port, Some(22));
    }

    #[test]
    fn three_token_legacy_client() {
        let mut id = blank();
        id.fill_endpoints("2001:db8::42 40000 22");
        assert_eq!(id.client_ip.unwrap().to_string(), "2001:db8::42");
        assert_eq!(id.client_port, Some(40000));
        assert_eq!(id.server_ip, None);
        assert_eq!(id.server_port, Some(22));
    }

    #[test]
    fn garbage_tokens_leave_fields_unset() {
        let mut id = blank();
        id.fill_endpoints("not-an-ip nope");
        assert_eq!(id.client_ip, None);
        assert_eq!(id.client_port, None);
    }
}
