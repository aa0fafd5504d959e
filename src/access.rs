//! Operation classification and ACL enforcement.
//!
//! The leading token of the wire command selects the phase: `git-upload-pack`
//! is a read, `git-receive-pack` a write, anything else is refused.  Access
//! then reduces to set membership over the repo's `acl.*` lists (write
//! implies read, deploy implies read) plus the client-IP allow-list.

use anyhow::{bail, Result};

use crate::config::RepoConfig;
use crate::identity::Identity;
use crate::ipfilter;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// The two Git transport operations we serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Read,
    Write,
}

impl Phase {
    /// Map a wire command token onto its phase.
    pub fn from_op(op: &str) -> Result<Self> {
        match op {
            "git-upload-pack" => Ok(Phase::Read),
            "git-receive-pack" => Ok(Phase::Write),
            other => bail!("unsupported git operation: {other}"),
        }
    }

    /// The `read` / `write` suffix used in hook names and the IPC dir.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Read => "read",
            Phase::Write => "write",
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Outcome of the built-in access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted,
    /// `message` goes to the client, `audit` to the configured log sinks.
    Denied { message: String, audit: String },
}

impl Access {
    pub fn granted(&self) -> bool {
        matches!(self, Access::Granted)
    }
}

/// Check the connection identity against the repo's IP allow-list and ACLs.
///
/// A repository with no `acl.*` keys at all is open; it gets a writer
/// bootstrapped on first contact through the pipeline's self-install.
pub fn authorize(config: &RepoConfig, identity: &Identity, phase: Phase) -> Result<Access> {
    if !ipfilter::enforce(config, identity)? {
        return Ok(Access::Denied {
            message: ipfilter::BLOCKED_MESSAGE.to_string(),
            audit: format!("Blocked IP {:?}", identity.client_ip),
        });
    }

    if !config.has_acl {
        return Ok(Access::Granted);
    }

    let allowed = match phase {
        Phase::Read => config.can_read(&identity.key),
        Phase::Write => config.can_write(&identity.key),
    };

    if allowed {
        Ok(Access::Granted)
    } else {
        let (message, audit) = match phase {
            Phase::Read => (
                format!("git-server: access denied for {}", identity.key),
                "Blocked clone or pull attempt!".to_string(),
            ),
            Phase::Write => (
                format!("git-server: push denied for {}", identity.key),
                "Blocked push attempt!".to_string(),
            ),
        };
        Ok(Access::Denied { message, audit })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
