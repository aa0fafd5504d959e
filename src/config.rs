//! Per-repository configuration, read from `git config --list`.
//!
//! Nothing here comes from a config file of our own: the repository's git
//! config is the single source of truth.  The namespaces we consume are
//! `acl.*` (comma-separated KEY lists plus the CIDR allow-list), `proxy.url`
//! (upstream for the two-way reconciler), `log.*` (audit sinks) and the
//! `remote.here.url` / `remote.there.url` pair the reconciler verifies.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Result;

// ---------------------------------------------------------------------------
// RepoConfig
// ---------------------------------------------------------------------------

/// Parsed view of one repository's git config.
#[derive(Debug, Clone, Default)]
pub struct RepoConfig {
    pub readers: BTreeSet<String>,
    pub writers: BTreeSet<String>,
    pub deploy: BTreeSet<String>,
    /// Raw comma-separated CIDR allow-list (`acl.restrictip`).
    pub restrict_ip: Option<String>,
    pub proxy_url: Option<String>,
    /// `log.*` keys with the `log.` prefix stripped.
    pub log: BTreeMap<String, String>,
    pub advertise_push_options: bool,
    pub remote_here_url: Option<String>,
    pub remote_there_url: Option<String>,
    /// Whether any `acl.*` key was present at all.  A repository with no ACL
    /// configuration is open until its first writer is bootstrapped.
    pub has_acl: bool,
}

impl RepoConfig {
    /// Load and parse the config of the repository at `git_dir`.
    pub async fn load(git_dir: &Path) -> Result<Self> {
        let listing = crate::gitcmd::config_list(git_dir).await?;
        Ok(Self::parse(&listing))
    }

    /// Parse `git config --list` output (`key=value` per line).
    pub fn parse(listing: &str) -> Self {
        let mut cfg = Self::default();
        for line in listing.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            match key.as_str() {
                "acl.readers" => {
                    cfg.readers = split_keys(value);
                    cfg.has_acl = true;
                }
                "acl.writers" => {
                    cfg.writers = split_keys(value);
                    cfg.has_acl = true;
                }
                "acl.deploy" => {
                    cfg.deploy = split_keys(value);
                    cfg.has_acl = true;
                }
                "acl.restrictip" => {
                    cfg.restrict_ip = Some(value.trim().to_string());
                    cfg.has_acl = true;
                }
                "proxy.url" => cfg.proxy_url = Some(value.trim().to_string()),
                "receive.advertisepushoptions" => {
                    cfg.advertise_push_options = matches!(value.trim(), "true" | "1" | "yes");
                }
                "remote.here.url" => cfg.remote_here_url = Some(value.trim().to_string()),
                "remote.there.url" => cfg.remote_there_url = Some(value.trim().to_string()),
                _ => {
                    if let Some(subkey) = key.strip_prefix("log.") {
                        cfg.log.insert(subkey.to_string(), value.trim().to_string());
                    }
                }
            }
        }
        cfg
    }

    /// Read access: readers, plus the write and deploy lists (write implies
    /// read, deploy implies read).
    pub fn can_read(&self, key: &str) -> bool {
        self.readers.contains(key) || self.writers.contains(key) || self.deploy.contains(key)
    }

    /// Write access: writers only.
    pub fn can_write(&self, key: &str) -> bool {
        self.writers.contains(key)
    }

    pub fn can_deploy(&self, key: &str) -> bool {
        self.deploy.contains(key)
    }
}

fn split_keys(csv: &str) -> BTreeSet<String> {
    csv.split(',')
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
core.bare=true
acl.readers=carol, dave
acl.writers=alice
acl.deploy=deploybot
acl.restrictip=10.0.0.0/8,2001:db8::/32
proxy.url=ssh://up.example/x.git
log.file=/var/log/git-server.log
log.hook=/usr/local/bin/git-logger
receive.advertisepushoptions=true
remote.here.url=/srv/git/x.git
remote.there.url=ssh://up.example/x.git
";

    #[test]
    fn parses_all_namespaces() {
        let cfg = RepoConfig::parse(LISTING);
        assert!(cfg.has_acl);
        assert_eq!(cfg.readers.len(), 2);
        assert!(cfg.readers.contains("carol"));
        assert!(cfg.readers.contains("dave"));
        assert!(cfg.writers.contains("alice"));
        assert!(cfg.deploy.contains("deploybot"));
        assert_eq!(cfg.restrict_ip.as_deref(), Some("10.0.0.0/8,2001:db8::/32"));
        assert_eq!(cfg.proxy_url.as_deref(), Some("ssh://up.example/x.git"));
        assert_eq!(cfg.log.get("file").unwrap(), "/var/log/git-server.log");
        assert_eq!(cfg.log.get("hook").unwrap(), "/usr/local/bin/git-logger");
        assert!(cfg.advertise_push_options);
        assert_eq!(cfg.remote_here_url.as_deref(), Some("/srv/git/x.git"));
    }

    #[test]
    fn write_implies_read() {
        let cfg = RepoConfig::parse(LISTING);
        assert!(cfg.can_read("alice"));
        assert!(cfg.can_write("alice"));
        assert!(!cfg.can_write("carol"));
        assert!(cfg.can_read("carol"));
    }

    #[test]
    fn deploy_implies_read_but_not_write() {
        let cfg = RepoConfig::parse(LISTING);
        assert!(cfg.can_deploy("deploybot"));
        assert!(cfg.can_read("deploybot"));
        assert!(!cfg.can_write("deploybot"));
    }

    #[test]
    fn empty_reader_list_denies_outsiders() {
        let cfg = RepoConfig::parse("acl.readers=\nacl.writers=alice\n");
        assert!(cfg.has_acl);
        assert!(!cfg.can_read("bob"));
        assert!(cfg.can_read("alice"));
    }

    #[test]
    fn unconfigured_repo_has_no_acl() {
        let cfg = RepoConfig::parse("core.bare=true\nuser.email=x@y\n");
        assert!(!cfg.has_acl);
        assert!(cfg.readers.is_empty() && cfg.writers.is_empty());
    }

    #[test]
    fn key_case_is_normalised() {
        let cfg = RepoConfig::parse("ACL.Writers=alice\nReceive.AdvertisePushOptions=true\n");
        assert!(cfg.can_write("alice"));
        assert!(cfg.advertise_push_options);
    }
}
