//! Client-IP allow-list enforcement.
//!
//! A repository may carry a comma-separated CIDR list in `acl.restrictip`.
//! The caller's address comes out of the SSH environment; matching is
//! first-N-bits equality of the packed address, which [`ipnet`] gives us via
//! `contains`.  Prefix widths outside the accepted per-family range mark a
//! rule as malformed: it is warned about and skipped.  A rule whose address
//! part does not parse at all is treated as a configuration error and fails
//! the whole check.

use std::net::IpAddr;

use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tracing::warn;

use crate::config::RepoConfig;
use crate::identity::Identity;

/// Message written to the client when its address is rejected.
pub const BLOCKED_MESSAGE: &str = "git-server: Your IP has been blocked.";

const V4_PREFIX_RANGE: std::ops::RangeInclusive<u8> = 8..=32;
const V6_PREFIX_RANGE: std::ops::RangeInclusive<u8> = 8..=128;

// ---------------------------------------------------------------------------
// Rule parsing
// ---------------------------------------------------------------------------

/// Parse one allow-list entry.
///
/// `Ok(Some(net))` is a usable rule, `Ok(None)` a malformed-but-skippable
/// one (bad prefix width), and `Err` an unparsable address.
fn parse_rule(rule: &str) -> Result<Option<IpNet>> {
    let rule = rule.trim();
    let (addr_part, prefix_part) = match rule.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (rule, None),
    };

    let addr: IpAddr = addr_part
        .parse()
        .with_context(|| format!("unparsable address in acl.restrictip entry {rule:?}"))?;

    let prefix = match prefix_part {
        None => None,
        Some(p) => match p.parse::<u8>() {
            Ok(n) => Some(n),
            Err(_) => {
                warn!(rule, "non-numeric prefix length; skipping rule");
                return Ok(None);
            }
        },
    };

    match addr {
        IpAddr::V4(v4) => {
            let n = prefix.unwrap_or(32);
            if !V4_PREFIX_RANGE.contains(&n) {
                warn!(rule, prefix = n, "IPv4 prefix outside [8,32]; skipping rule");
                return Ok(None);
            }
            Ok(Some(IpNet::V4(Ipv4Net::new(v4, n).expect("prefix checked"))))
        }
        IpAddr::V6(v6) => {
            let n = prefix.unwrap_or(128);
            if !V6_PREFIX_RANGE.contains(&n) {
                warn!(rule, prefix = n, "IPv6 prefix outside [8,128]; skipping rule");
                return Ok(None);
            }
            Ok(Some(IpNet::V6(Ipv6Net::new(v6, n).expect("prefix checked"))))
        }
    }
}

// ---------------------------------------------------------------------------
// Enforcement
// ---------------------------------------------------------------------------

/// Whether `client` is covered by the allow-list `rules` (comma-separated).
pub fn ip_allowed(rules: &str, client: IpAddr) -> Result<bool> {
    for raw in rules.split(',').filter(|r| !r.trim().is_empty()) {
        let Some(net) = parse_rule(raw)? else {
            continue;
        };
        if net.contains(&client) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Apply the repository's allow-list to the connection identity.
///
/// Allows when no restriction is configured, when there is no SSH context to
/// restrict on, or when any rule matches the client address.
pub fn enforce(config: &RepoConfig, identity: &Identity) -> Result<bool> {
    let Some(ref rules) = config.restrict_ip else {
        return Ok(true);
    };
    if rules.trim().is_empty() {
        return Ok(true);
    }
    let Some(client) = identity.client_ip else {
        return Ok(true);
    };
    ip_allowed(rules, client)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
