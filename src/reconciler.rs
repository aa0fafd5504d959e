//! Two-way sync between a local bare repository and its configured proxy.
//!
//! The reconciler maintains a sibling working clone `<GIT_DIR>.workingdir`
//! with two remotes: `here` pointing at the local bare repo and `there` at
//! `proxy.url`.  Hook phases drive the direction: before a Git operation the
//! proxy side wins (or, with no prior agreement on record, both sides heal
//! toward whichever tip is newer), after a write the local side is pushed
//! out.  The single piece of persistent state is the `SYNCED` sentinel --
//! the joint `ls-remote` listing at the last moment both sides agreed --
//! written atomically and unlinked the moment the sides are known to
//! disagree.
//!
//! The reconciler is advisory: callers log its errors and still exit 0 so a
//! proxy outage never blocks Git itself.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::gitcmd;

// ---------------------------------------------------------------------------
// Hook phases
// ---------------------------------------------------------------------------

/// The four hook names that may invoke the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreRead,
    PreWrite,
    PostRead,
    PostWrite,
}

impl HookPhase {
    pub fn from_hook_name(name: &str) -> Result<Self> {
        // Accept a full path; only the file name matters.
        let base = name.rsplit('/').next().unwrap_or(name);
        match base {
            "pre-read" => Ok(Self::PreRead),
            "pre-write" => Ok(Self::PreWrite),
            "post-read" => Ok(Self::PostRead),
            "post-write" => Ok(Self::PostWrite),
            other => bail!("unknown hook name: {other}"),
        }
    }

    pub fn is_pre(self) -> bool {
        matches!(self, Self::PreRead | Self::PreWrite)
    }
}

// ---------------------------------------------------------------------------
// Ref listings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefKind {
    Branch,
    Tag,
}

/// One branch or tag name, independent of which side it lives on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefId {
    pub kind: RefKind,
    pub name: String,
}

/// A name whose tips differ between the two sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefDiff {
    pub id: RefId,
    pub here: Option<String>,
    pub there: Option<String>,
}

/// Keep only `refs/heads/*` and `refs/tags/*` lines (no `HEAD`, no peeled
/// `^{}` entries), sorted.
pub fn filter_listing(raw: &str) -> Vec<String> {
    let mut lines: Vec<String> = raw
        .lines()
        .filter_map(|line| {
            let (hash, name) = line.split_once('\t')?;
            if name.ends_with("^{}") {
                return None;
            }
            if !name.starts_with("refs/heads/") && !name.starts_with("refs/tags/") {
                return None;
            }
            Some(format!("{hash}\t{name}"))
        })
        .collect();
    lines.sort();
    lines
}

fn parse_listing(lines: &[String]) -> BTreeMap<RefId, String> {
    let mut map = BTreeMap::new();
    for line in lines {
        let Some((hash, name)) = line.split_once('\t') else {
            continue;
        };
        let id = if let Some(n) = name.strip_prefix("refs/heads/") {
            RefId {
                kind: RefKind::Branch,
                name: n.to_string(),
            }
        } else if let Some(n) = name.strip_prefix("refs/tags/") {
            RefId {
                kind: RefKind::Tag,
                name: n.to_string(),
            }
        } else {
            continue;
        };
        map.insert(id, hash.to_string());
    }
    map
}

/// Union of names whose hashes differ between the sides.
pub fn diff_refs(here: &[String], there: &[String]) -> Vec<RefDiff> {
    let here = parse_listing(here);
    let there = parse_listing(there);
    let mut ids: Vec<&RefId> = here.keys().chain(there.keys()).collect();
    ids.sort();
    ids.dedup();
    ids.into_iter()
        .filter_map(|id| {
            let h = here.get(id).cloned();
            let t = there.get(id).cloned();
            if h == t {
                None
            } else {
                Some(RefDiff {
                    id: id.clone(),
                    here: h,
                    there: t,
                })
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// SSH host helpers
// ---------------------------------------------------------------------------

/// Extract the host from an SSH remote URL (`ssh://user@host:port/path` or
/// scp-like `user@host:path`).  Non-SSH URLs yield `None`.
pub fn ssh_host(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("ssh://") {
        let authority = rest.split('/').next()?;
        let host = authority.rsplit('@').next()?.split(':').next()?;
        if host.is_empty() {
            return None;
        }
        return Some(host.to_string());
    }
    if url.contains("://") {
        return None;
    }
    let (head, _path) = url.split_once(':')?;
    if head.contains('/') || head.is_empty() {
        return None;
    }
    let host = head.rsplit('@').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn known_hosts_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    Path::new(&home).join(".ssh").join("known_hosts")
}

fn host_is_known(known_hosts: &str, host: &str) -> bool {
    known_hosts.lines().any(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return false;
        }
        line.split_whitespace()
            .next()
            .map(|hosts| {
                hosts.split(',').any(|h| {
                    // `[host]:port` entries carry a non-default port.
                    let bare = h
                        .strip_prefix('[')
                        .and_then(|rest| rest.split_once("]:"))
                        .map(|(inner, _port)| inner)
                        .unwrap_or(h);
                    bare == host
                })
            })
            .unwrap_or(false)
    })
}

/// Append the proxy host's keys to `known_hosts` when absent.
async fn ensure_known_host(host: &str) -> Result<()> {
    let path = known_hosts_path();
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    if host_is_known(&existing, host) {
        return Ok(());
    }

    info!(%host, "proxy host not in known_hosts; scanning");
    let output = tokio::process::Command::new("ssh-keyscan")
        .arg(host)
        .output()
        .await
        .context("failed to spawn ssh-keyscan")?;
    let keys = String::from_utf8_lossy(&output.stdout);
    if keys.trim().is_empty() {
        bail!("ssh-keyscan returned no keys for {host}");
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("cannot append to {}", path.display()))?;
    file.write_all(keys.as_bytes())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Directions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ThereToHere,
    HereToThere,
}

impl Direction {
    fn src(self) -> &'static str {
        match self {
            Self::ThereToHere => "there",
            Self::HereToThere => "here",
        }
    }

    fn dst(self) -> &'static str {
        match self {
            Self::ThereToHere => "here",
            Self::HereToThere => "there",
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    git_dir: PathBuf,
    workdir: PathBuf,
    proxy_url: String,
    phase: HookPhase,
}

impl Reconciler {
    pub fn new(git_dir: &Path, proxy_url: &str, phase: HookPhase) -> Self {
        let workdir = PathBuf::from(format!("{}.workingdir", git_dir.display()));
        Self {
            git_dir: git_dir.to_path_buf(),
            workdir,
            proxy_url: proxy_url.to_string(),
            phase,
        }
    }

    pub fn synced_path(&self) -> PathBuf {
        self.workdir.join(".git").join("SYNCED")
    }

    fn synced_present(&self) -> bool {
        std::fs::read_to_string(self.synced_path())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    }

    /// Persist the agreed listing atomically (write-temp-rename).
    fn write_synced(&self, listing: &[String]) -> Result<()> {
        let dir = self.workdir.join(".git");
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("cannot create temp file in {}", dir.display()))?;
        for line in listing {
            writeln!(tmp, "{line}")?;
        }
        tmp.persist(self.synced_path())
            .context("cannot persist SYNCED sentinel")?;
        Ok(())
    }

    fn clear_synced(&self) {
        let _ = std::fs::remove_file(self.synced_path());
    }

    /// Run the reconciliation for this phase.  Any failure clears the
    /// sentinel so the next pre-phase falls back to healing.
    pub async fn run(&self) -> Result<()> {
        if !self.workdir.exists() {
            if !self.phase.is_pre() {
                debug!("no working dir and post phase; nothing to do");
                return Ok(());
            }
            self.bootstrap().await?;
        }

        self.verify_remotes().await?;

        let result = self.reconcile().await;
        if result.is_err() {
            self.clear_synced();
        }
        result
    }

    /// Clone the working dir and wire both remotes, verifying the proxy is
    /// reachable before declaring the bootstrap good.
    async fn bootstrap(&self) -> Result<()> {
        info!(workdir = %self.workdir.display(), "bootstrapping proxy working dir");
        gitcmd::clone_with_origin("here", &self.git_dir, &self.workdir).await?;
        gitcmd::remote_add(&self.workdir, "there", &self.proxy_url).await?;

        if let Some(host) = ssh_host(&self.proxy_url) {
            if let Err(e) = ensure_known_host(&host).await {
                warn!(%host, error = %e, "could not prime known_hosts");
            }
        }

        let fetched = gitcmd::git(Some(&self.workdir), &["fetch", "there"], &[]).await?;
        let listed = if fetched.success {
            gitcmd::git(Some(&self.workdir), &["ls-remote", "there"], &[]).await?
        } else {
            fetched.clone()
        };

        if !fetched.success || !listed.success {
            let _ = std::fs::remove_dir_all(&self.workdir);
            let mut msg = format!(
                "proxy {} unreachable: {}",
                self.proxy_url,
                fetched.stderr.trim(),
            );
            if std::env::var_os("SSH_AUTH_SOCK").is_none() {
                msg.push_str(" (no SSH_AUTH_SOCK; consider `ForwardAgent yes` for this host)");
            }
            bail!(msg);
        }
        Ok(())
    }

    /// The working dir must still point where we expect; anything else means
    /// someone rewired it and the only safe move is to start over.
    async fn verify_remotes(&self) -> Result<()> {
        let git_dot = self.workdir.join(".git");
        let here = gitcmd::config_get(&git_dot, "remote.here.url").await?;
        let there = gitcmd::config_get(&git_dot, "remote.there.url").await?;

        let here_ok = here
            .as_deref()
            .map(|u| Path::new(u) == self.git_dir || u == self.git_dir.to_string_lossy())
            .unwrap_or(false);
        let there_ok = there.as_deref() == Some(self.proxy_url.as_str());

        if !here_ok || !there_ok {
            warn!(?here, ?there, "remote URLs diverged from expectation");
            let _ = std::fs::remove_dir_all(&self.workdir);
            bail!("Proxy mismatch.");
        }
        Ok(())
    }

    async fn listings(&self) -> Result<(Vec<String>, Vec<String>)> {
        let here = filter_listing(&gitcmd::ls_remote(&self.workdir, "here").await?);
        let there = filter_listing(&gitcmd::ls_remote(&self.workdir, "there").await?);
        Ok((here, there))
    }

    async fn reconcile(&self) -> Result<()> {
        let (here, there) = self.listings().await?;
        if here == there {
            debug!("both sides agree; refreshing sentinel");
            return self.write_synced(&here);
        }

        let synced = self.synced_present();

        let fetched_here = gitcmd::fetch_tags(&self.workdir, "here").await?;
        let fetched_there = gitcmd::fetch_tags(&self.workdir, "there").await?;
        if !fetched_here.success || !fetched_there.success {
            bail!(
                "fetch failed: {} {}",
                fetched_here.stderr.trim(),
                fetched_there.stderr.trim(),
            );
        }

        let diffs = diff_refs(&here, &there);
        info!(
            phase = ?self.phase,
            synced,
            differing = diffs.len(),
            "applying sync policy"
        );

        match (self.phase, synced) {
            (HookPhase::PreRead | HookPhase::PreWrite, false) => {
                for diff in &diffs {
                    self.heal(diff).await;
                }
            }
            (HookPhase::PreRead | HookPhase::PreWrite, true) => {
                for diff in &diffs {
                    self.sync_ref(Direction::ThereToHere, diff).await;
                }
            }
            (HookPhase::PostWrite, true) => {
                for diff in &diffs {
                    self.sync_ref(Direction::HereToThere, diff).await;
                }
            }
            _ => debug!("phase applies no policy"),
        }

        // Finalize: agreement decides the sentinel's fate.
        let (here, there) = self.listings().await?;
        if here == there {
            self.write_synced(&here)?;
        } else {
            debug!("sides still disagree; dropping sentinel");
            self.clear_synced();
        }
        Ok(())
    }

    /// With no prior agreement on record, move whichever side is older up to
    /// the newer tip; create refs that only one side has; leave truly
    /// divergent pairs alone.
    async fn heal(&self, diff: &RefDiff) {
        match (&diff.here, &diff.there) {
            (Some(h), Some(t)) => {
                if self.is_ancestor(h, t).await {
                    self.sync_ref(Direction::ThereToHere, diff).await;
                } else if self.is_ancestor(t, h).await {
                    self.sync_ref(Direction::HereToThere, diff).await;
                } else {
                    warn!(name = %diff.id.name, "too divergent; skipping");
                }
            }
            (Some(_), None) => self.sync_ref(Direction::HereToThere, diff).await,
            (None, Some(_)) => self.sync_ref(Direction::ThereToHere, diff).await,
            (None, None) => {}
        }
    }

    /// Ancestry probe: does `tip`'s history contain `ancestor`?
    async fn is_ancestor(&self, ancestor: &str, tip: &str) -> bool {
        match gitcmd::git(Some(&self.workdir), &["log", "--format=%H", tip], &[]).await {
            Ok(out) if out.success => out.stdout.lines().any(|l| l.trim() == ancestor),
            _ => false,
        }
    }

    /// Bring one differing ref on the destination side in line with the
    /// source side.  Failures are per-ref: logged, skipped, never fatal.
    async fn sync_ref(&self, dir: Direction, diff: &RefDiff) {
        let name = &diff.id.name;
        let (src_hash, dst_hash) = match dir {
            Direction::ThereToHere => (&diff.there, &diff.here),
            Direction::HereToThere => (&diff.here, &diff.there),
        };

        let result = match (src_hash, dst_hash, diff.id.kind) {
            // Source side dropped the ref: delete locally and push-delete.
            (None, Some(_), RefKind::Branch) => self.delete_branch(dir, name).await,
            (None, Some(_), RefKind::Tag) => self.delete_tag(dir, name).await,
            // Tag move or creation: always forced.
            (Some(hash), _, RefKind::Tag) => self.force_tag(dir, name, hash).await,
            // Branch present on the source: create or advance on the dest.
            (Some(_), None, RefKind::Branch) => self.create_branch(dir, name).await,
            (Some(_), Some(_), RefKind::Branch) => self.advance_branch(dir, name).await,
            (None, None, _) => Ok(()),
        };

        if let Err(e) = result {
            warn!(name, ?dir, error = %e, "ref sync failed; skipping");
        }
    }

    async fn delete_branch(&self, dir: Direction, name: &str) -> Result<()> {
        let _ = gitcmd::git(Some(&self.workdir), &["branch", "-D", name], &[]).await;
        let spec = format!(":refs/heads/{name}");
        gitcmd::git_ok(Some(&self.workdir), &["push", dir.dst(), spec.as_str()], &[]).await?;
        Ok(())
    }

    async fn delete_tag(&self, dir: Direction, name: &str) -> Result<()> {
        let _ = gitcmd::git(Some(&self.workdir), &["tag", "-d", name], &[]).await;
        let spec = format!(":refs/tags/{name}");
        gitcmd::git_ok(Some(&self.workdir), &["push", dir.dst(), spec.as_str()], &[]).await?;
        Ok(())
    }

    async fn force_tag(&self, dir: Direction, name: &str, hash: &str) -> Result<()> {
        gitcmd::git_ok(Some(&self.workdir), &["tag", "-f", name, hash], &[]).await?;
        let spec = format!("refs/tags/{name}");
        gitcmd::git_ok(
            Some(&self.workdir),
            &["push", "--force", dir.dst(), spec.as_str()],
            &[],
        )
        .await?;
        Ok(())
    }

    async fn create_branch(&self, dir: Direction, name: &str) -> Result<()> {
        let spec = format!("refs/remotes/{}/{}:refs/heads/{}", dir.src(), name, name);
        gitcmd::git_ok(Some(&self.workdir), &["push", dir.dst(), spec.as_str()], &[]).await?;
        Ok(())
    }

    async fn advance_branch(&self, dir: Direction, name: &str) -> Result<()> {
        let checkout = gitcmd::git(Some(&self.workdir), &["checkout", name], &[]).await?;
        if !checkout.success {
            let track = format!("{}/{}", dir.src(), name);
            gitcmd::git_ok(
                Some(&self.workdir),
                &["checkout", "--track", track.as_str()],
                &[],
            )
            .await?;
        }
        gitcmd::git_ok(
            Some(&self.workdir),
            &["pull", "--rebase", dir.src(), name],
            &[],
        )
        .await?;
        gitcmd::git_ok(Some(&self.workdir), &["push", dir.dst(), name], &[]).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
