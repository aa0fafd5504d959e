//! Client-side deploy daemon.
//!
//! A long-lived pull loop on a deploy host: each iteration fetches (the
//! server side blocks the fetch until a push lands or `deploy_patience`
//! expires), checks the branch out, rebases onto its upstream, and runs the
//! combined output through the pathology catalog.  Most recognized
//! conditions resolve by sleep-and-retry or by clearing a stale lock;
//! detecting a second deployer for the same working copy makes the younger
//! instance bow out.  An optional build command runs after each round,
//! serialized across daemons by an exclusive flock on `$GIT_DIR/config`.

pub mod pathology;
pub mod peer;
pub mod ps;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use clap::Parser;
use fs2::FileExt;
use rand::Rng;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::gitcmd;
use crate::pipeline::{LEGACY_OPTIONS_ENV, OPTIONS_ENV};
use self::pathology::{Classification, PathologyAction, PathologyTable};
use self::peer::PeerMarker;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug, Clone)]
#[command(
    name = "git-deploy",
    about = "Pull-and-rebuild daemon reacting to push notifications"
)]
pub struct DeployArgs {
    /// Branch to deploy.
    #[arg(long, conflicts_with = "branch_pos")]
    pub branch: Option<String>,

    /// Branch to deploy (positional form).
    #[arg(value_name = "BRANCH")]
    pub branch_pos: Option<String>,

    /// Change into this directory before anything else.
    #[arg(long)]
    pub chdir: Option<PathBuf>,

    /// Octal umask to apply at startup.
    #[arg(long)]
    pub umask: Option<String>,

    /// Client-supplied option forwarded to the server's hooks (repeatable).
    #[arg(short = 'O', value_name = "OPT")]
    pub option: Vec<String>,

    /// Build command to run (under the repo build lock) after each round.
    #[arg(long)]
    pub build: Option<String>,

    /// Repair a changed remote host key instead of just bailing out.
    #[arg(long)]
    pub fix_nasty: bool,

    /// Detach into the background.
    #[arg(long)]
    pub background: bool,

    /// Upper bound in seconds on the server-side push-notification wait.
    #[arg(long, default_value_t = 7200)]
    pub max_delay: u64,

    /// YAML file replacing the built-in pathology catalog.
    #[arg(long)]
    pub pathologies: Option<PathBuf>,

    /// Print the built-in pathology catalog as YAML and exit.
    #[arg(long)]
    pub dump_pathologies: bool,
}

impl DeployArgs {
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref().or(self.branch_pos.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Respawn argv
// ---------------------------------------------------------------------------

/// The recorded argv is immutable except for one scrub: a relative
/// `--chdir` would point somewhere else after the chdir, so it is dropped
/// from the respawn image.
pub fn scrub_respawn_argv(argv: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(argv.len());
    let mut i = 0;
    while i < argv.len() {
        let arg = &argv[i];
        if arg == "--chdir" && i + 1 < argv.len() {
            if !Path::new(&argv[i + 1]).is_absolute() {
                i += 2;
                continue;
            }
        } else if let Some(value) = arg.strip_prefix("--chdir=") {
            if !Path::new(value).is_absolute() {
                i += 1;
                continue;
            }
        }
        out.push(arg.clone());
        i += 1;
    }
    out
}

// ---------------------------------------------------------------------------
// Branch resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchGuess {
    Named(String),
    /// Detached HEAD at this commit; a `--contains` query resolves it.
    Detached(String),
}

/// First pass over `git branch -a` output: the starred line wins.
pub fn guess_branch(branch_listing: &str) -> Option<BranchGuess> {
    for line in branch_listing.lines() {
        let Some(rest) = line.strip_prefix("* ") else {
            continue;
        };
        let rest = rest.trim();
        if rest.starts_with('(') {
            // "(HEAD detached at 1a2b3c4)"
            let hash = rest
                .trim_end_matches(')')
                .rsplit(' ')
                .next()
                .unwrap_or("")
                .to_string();
            if hash.is_empty() {
                return None;
            }
            return Some(BranchGuess::Detached(hash));
        }
        return Some(BranchGuess::Named(rest.to_string()));
    }
    None
}

/// Second pass for detached heads: the first indented ref containing the
/// commit wins.  Remote-tracking names are reduced to their branch part.
pub fn first_containing_ref(contains_listing: &str) -> Option<String> {
    for line in contains_listing.lines() {
        if line.starts_with("* ") || line.trim().is_empty() || line.contains("->") {
            continue;
        }
        let name = line.trim();
        let name = name
            .strip_prefix("remotes/")
            .and_then(|rest| rest.split_once('/'))
            .map(|(_remote, branch)| branch)
            .unwrap_or(name);
        return Some(name.to_string());
    }
    None
}

async fn resolve_branch(cwd: &Path, requested: Option<&str>) -> Result<String> {
    if let Some(branch) = requested {
        return Ok(branch.to_string());
    }

    let listing = gitcmd::git_ok(Some(cwd), &["branch", "-a"], &[]).await?;
    match guess_branch(&listing.stdout) {
        Some(BranchGuess::Named(name)) => Ok(name),
        Some(BranchGuess::Detached(hash)) => {
            let contains = gitcmd::git_ok(Some(cwd), &["branch", "-a", "--contains", hash.as_str()], &[])
                .await?;
            first_containing_ref(&contains.stdout)
                .with_context(|| format!("no branch contains detached head {hash}"))
        }
        None => bail!("cannot determine a branch to deploy; use --branch"),
    }
}

// ---------------------------------------------------------------------------
// Option transport
// ---------------------------------------------------------------------------

/// Environment advertising the client options to the server's hooks.
pub fn transport_env(options: &[String]) -> Vec<(String, String)> {
    let joined = options.join("\n");
    vec![
        (OPTIONS_ENV.to_string(), joined.clone()),
        (LEGACY_OPTIONS_ENV.to_string(), joined),
        (
            "GIT_SSH_COMMAND".to_string(),
            format!("ssh -o SendEnv={OPTIONS_ENV} -o SendEnv={LEGACY_OPTIONS_ENV}"),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Daemonization
// ---------------------------------------------------------------------------

/// Double fork + `setsid`, stdio onto `/dev/null`.  Must run before the
/// async runtime exists.
pub fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};
    use std::os::fd::AsRawFd;

    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid failed")?;
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("cannot open /dev/null")?;
    for fd in 0..=2 {
        nix::unistd::dup2(devnull.as_raw_fd(), fd).context("dup2 failed")?;
    }
    Ok(())
}

/// Apply an octal umask string like `022`.
pub fn apply_umask(octal: &str) -> Result<()> {
    let bits = u32::from_str_radix(octal, 8)
        .with_context(|| format!("bad octal umask {octal:?}"))?;
    let mode = nix::sys::stat::Mode::from_bits_truncate(bits as nix::libc::mode_t);
    nix::sys::stat::umask(mode);
    Ok(())
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Control flow decision after one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Exit,
}

pub struct Daemon {
    cwd: PathBuf,
    git_dir: PathBuf,
    branch: String,
    build_cmd: Option<String>,
    fix_nasty: bool,
    table: PathologyTable,
    transport: Vec<(String, String)>,
    marker: PeerMarker,
    respawn_argv: Vec<String>,
    exe_path: PathBuf,
    started_at: SystemTime,
    single_shot: bool,
}

impl Daemon {
    /// Side-effect free construction from parsed arguments (the chdir and
    /// umask have already been applied by the binary).
    pub async fn new(args: &DeployArgs, argv: &[String]) -> Result<Self> {
        let cwd = std::env::current_dir().context("cannot determine cwd")?;
        let git_dir = gitcmd::rev_parse_git_dir(&cwd).await?;
        let branch = resolve_branch(&cwd, args.branch()).await?;

        // deploy_patience rides in front of the user's own options.
        let mut options = vec![format!("deploy_patience={}", args.max_delay)];
        options.extend(args.option.iter().cloned());

        let table = PathologyTable::load(args.pathologies.as_deref())?;
        let marker = PeerMarker::new(&git_dir, &cwd);
        let exe_path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from(&argv[0]));

        Ok(Self {
            cwd,
            git_dir,
            branch,
            build_cmd: args.build.clone(),
            fix_nasty: args.fix_nasty,
            table,
            transport: transport_env(&options),
            marker,
            respawn_argv: scrub_respawn_argv(argv),
            exe_path,
            started_at: SystemTime::now(),
            single_shot: std::env::var_os("PLEASE_INT").is_some(),
        })
    }

    /// Initial checkout, settle, first build, then the loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(branch = %self.branch, cwd = %self.cwd.display(), "deploy daemon starting");
        let checkout = gitcmd::git(Some(&self.cwd), &["checkout", self.branch.as_str()], &[]).await?;
        if !checkout.success {
            warn!(output = %checkout.stderr.trim(), "initial checkout failed");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.rebuild().await;

        loop {
            let control = self.iteration().await?;
            if control == LoopControl::Exit {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.rebuild().await;
            if self.single_shot {
                info!("PLEASE_INT set; leaving after one iteration");
                break;
            }
        }
        Ok(())
    }

    /// One round: respawn check, fetch under the waiting marker, checkout,
    /// rebase, classify, act.
    async fn iteration(&mut self) -> Result<LoopControl> {
        if self.respawn_due() {
            info!("executable updated on disk; respawning");
            let err = self.respawn();
            warn!(error = %err, "respawn failed; continuing with the old image");
        }

        self.marker.enter_waiting();
        let fetch = gitcmd::git(Some(&self.cwd), &["fetch"], &self.transport).await?;
        self.marker.leave_waiting();

        let checkout = gitcmd::git(Some(&self.cwd), &["checkout", self.branch.as_str()], &[]).await?;
        let upstream = format!("origin/{}", self.branch);
        let rebase = gitcmd::git(Some(&self.cwd), &["rebase", upstream.as_str()], &[]).await?;

        let combined = format!(
            "{}{}{}",
            fetch.combined(),
            checkout.combined(),
            rebase.combined(),
        );
        debug!(output = %combined.trim_end(), "round output");

        if rebase_is_stuck(&combined) {
            warn!("rebase left conflicts behind; aborting it");
            let _ = gitcmd::git(Some(&self.cwd), &["rebase", "--abort"], &[]).await;
        }

        match self.table.classify(&combined) {
            Classification::Matched {
                action,
                name,
                capture,
            } => {
                self.marker.record_pathology(&name);
                self.act(action, capture, &combined).await
            }
            Classification::Benign => Ok(LoopControl::Continue),
            Classification::Unrecognized => {
                error!(
                    output = %combined.trim_end(),
                    "unrecognized git output; operator attention required"
                );
                Ok(LoopControl::Exit)
            }
        }
    }

    async fn act(
        &mut self,
        action: PathologyAction,
        capture: Option<String>,
        output: &str,
    ) -> Result<LoopControl> {
        match action {
            PathologyAction::NastyHostKey => {
                warn!("remote host identification changed");
                if self.fix_nasty {
                    if let Err(e) = self.fix_nasty_host(output).await {
                        warn!(error = %e, "host key repair failed");
                    }
                }
                Ok(LoopControl::Exit)
            }

            PathologyAction::Diverged => {
                warn!(branch = %self.branch, "branch diverged; hard resetting");
                let _ = gitcmd::git(Some(&self.cwd), &["checkout", self.branch.as_str()], &[]).await;
                let upstream = format!("origin/{}", self.branch);
                let _ = gitcmd::git(
                    Some(&self.cwd),
                    &["reset", "--hard", upstream.as_str()],
                    &[],
                )
                .await;
                if self.marker.peer_waiting() {
                    info!("another deployer covers this checkout; exiting");
                    return Ok(LoopControl::Exit);
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(LoopControl::Continue)
            }

            PathologyAction::Unstaged => {
                if self.marker.peer_waiting() {
                    info!("another deployer covers this checkout; exiting");
                    return Ok(LoopControl::Exit);
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(LoopControl::Continue)
            }

            PathologyAction::LockCollision => {
                if let Some(lock) = capture {
                    if !ps::rebase_in_progress().await {
                        info!(%lock, "clearing orphaned lock file");
                        if let Err(e) = std::fs::remove_file(&lock) {
                            warn!(%lock, error = %e, "cannot remove lock file");
                        }
                    } else {
                        debug!(%lock, "a rebase is live; waiting it out");
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                }
                Ok(LoopControl::Continue)
            }

            PathologyAction::StaleRebaseApply => {
                if let Some(dir) = capture {
                    let stale = dir_older_than(Path::new(&dir), Duration::from_secs(3600));
                    if stale && !ps::rebase_in_progress().await {
                        info!(%dir, "removing stale rebase-apply directory");
                        if let Err(e) = std::fs::remove_dir_all(&dir) {
                            warn!(%dir, error = %e, "cannot remove rebase-apply directory");
                        }
                        return Ok(LoopControl::Continue);
                    }
                    debug!(%dir, "rebase-apply is fresh or owned; backing off");
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    return Ok(LoopControl::Exit);
                }
                Ok(LoopControl::Continue)
            }

            PathologyAction::UpToDate => {
                let delay = up_to_date_delay(&mut rand::thread_rng());
                debug!(secs = delay.as_secs(), "up to date; easing off");
                tokio::time::sleep(delay).await;
                Ok(LoopControl::Continue)
            }
        }
    }

    // ---- respawn ----------------------------------------------------------

    /// The on-disk executable is newer than this process's start.
    fn respawn_due(&self) -> bool {
        match std::fs::metadata(&self.exe_path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime > self.started_at,
            Err(_) => false,
        }
    }

    /// Replace the process image with the recorded argv.  Only returns on
    /// failure.
    fn respawn(&self) -> std::io::Error {
        use std::os::unix::process::CommandExt;
        std::process::Command::new(&self.respawn_argv[0])
            .args(&self.respawn_argv[1..])
            .exec()
    }

    // ---- rebuild ----------------------------------------------------------

    /// Run the build command while holding the repo build lock
    /// (`$GIT_DIR/config`, non-blocking exclusive).  A busy lock means a
    /// sibling daemon is already building; skip this round.
    pub async fn rebuild(&self) {
        let Some(ref build_cmd) = self.build_cmd else {
            return;
        };
        let lock_path = self.git_dir.join("config");
        let file = match std::fs::OpenOptions::new().read(true).open(&lock_path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %lock_path.display(), error = %e, "cannot open build lock");
                return;
            }
        };
        if file.try_lock_exclusive().is_err() {
            debug!("build lock busy; a sibling is building");
            return;
        }

        info!(cmd = %build_cmd, "running build");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(build_cmd)
            .current_dir(&self.cwd)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => info!("build succeeded"),
            Ok(s) => warn!(status = %s, "build failed"),
            Err(e) => warn!(error = %e, "cannot run build command"),
        }
        let _ = fs2::FileExt::unlock(&file);
    }

    // ---- host key repair --------------------------------------------------

    /// `--fix-nasty`: drop the offending key, re-scan host and address,
    /// append to known_hosts.
    async fn fix_nasty_host(&self, output: &str) -> Result<()> {
        let host = extract_offending_host(output)
            .context("output names no host; cannot repair the key")?;
        info!(%host, "repairing remote host key");

        let _ = tokio::process::Command::new("ssh-keygen")
            .args(["-R", &host])
            .output()
            .await;

        let mut scan_targets = vec![host.clone()];
        if let Ok(addrs) = tokio::net::lookup_host((host.as_str(), 22)).await {
            if let Some(v4) = addrs.filter(|a| a.is_ipv4()).map(|a| a.ip()).next() {
                scan_targets.push(v4.to_string());
            }
        }

        let scanned = tokio::process::Command::new("ssh-keyscan")
            .args(&scan_targets)
            .output()
            .await
            .context("failed to spawn ssh-keyscan")?;
        let keys = String::from_utf8_lossy(&scanned.stdout);
        if keys.trim().is_empty() {
            bail!("ssh-keyscan returned no keys for {host}");
        }

        let home = std::env::var("HOME").context("HOME unset")?;
        let path = Path::new(&home).join(".ssh").join("known_hosts");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(keys.as_bytes())?;
        info!(path = %path.display(), "known_hosts updated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Classification helpers
// ---------------------------------------------------------------------------

fn rebase_is_stuck(output: &str) -> bool {
    let re = Regex::new(r"CONFLICT|could not apply|Resolve all conflicts|rebase in progress")
        .expect("static regex");
    re.is_match(output)
}

/// `5s` base plus up to 54 extra seconds of jitter.
fn up_to_date_delay<R: Rng>(rng: &mut R) -> Duration {
    Duration::from_secs(5 + rng.gen_range(0..55))
}

fn dir_older_than(dir: &Path, age: Duration) -> bool {
    match std::fs::metadata(dir).and_then(|m| m.modified()) {
        Ok(mtime) => match SystemTime::now().duration_since(mtime) {
            Ok(elapsed) => elapsed > age,
            Err(_) => false,
        },
        Err(_) => false,
    }
}

fn extract_offending_host(output: &str) -> Option<String> {
    let re = Regex::new(r"(?i)host key for ([A-Za-z0-9.\[\]:_-]+?)[\s,!]").expect("static regex");
    re.captures(output)
        .map(|c| c[1].trim_matches(|ch| ch == '[' || ch == ']').to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_drops_relative_chdir_only() {
        let argv: Vec<String> = ["git-deploy", "--chdir", "work/app", "--branch", "main"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            scrub_respawn_argv(&argv),
            vec!["git-deploy", "--branch", "main"]
        );

        let argv: Vec<String> = ["git-deploy", "--chdir", "/srv/app", "main"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(scrub_respawn_argv(&argv), argv);

        let argv: Vec<String> = ["git-deploy", "--chdir=rel/app", "main"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(scrub_respawn_argv(&argv), vec!["git-deploy", "main"]);
    }

    #[test]
    fn branch_guess_from_starred_line() {
        let listing = "  feature\n* main\n  remotes/origin/main\n";
        assert_eq!(
            guess_branch(listing),
            Some(BranchGuess::Named("main".to_string()))
        );
    }

    #[test]
    fn branch_guess_detached_head() {
        let listing = "* (HEAD detached at 1a2b3c4)\n  main\n";
        assert_eq!(
            guess_branch(listing),
            Some(BranchGuess::Detached("1a2b3c4".to_string()))
        );
    }

    #[test]
    fn branch_guess_absent() {
        assert_eq!(guess_branch("  main\n  dev\n"), None);
    }

    #[test]
    fn containing_ref_skips_noise() {
        let listing = "\
* (HEAD detached at 1a2b3c4)
  remotes/origin/HEAD -> origin/main
  remotes/origin/release
  main
";
        assert_eq!(
            first_containing_ref(listing),
            Some("release".to_string())
        );
    }

    #[test]
    fn transport_joins_options_with_newlines() {
        let env = transport_env(&[
            "deploy_patience=7200".to_string(),
            "notify=ops".to_string(),
        ]);
        let opts = env
            .iter()
            .find(|(k, _)| k == OPTIONS_ENV)
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(opts, "deploy_patience=7200\nnotify=ops");

        let legacy = env
            .iter()
            .find(|(k, _)| k == LEGACY_OPTIONS_ENV)
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(legacy, opts);

        let ssh = env
            .iter()
            .find(|(k, _)| k == "GIT_SSH_COMMAND")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(ssh.contains("SendEnv=GIT_SERVER_OPTIONS"));
        assert!(ssh.contains("SendEnv=XMODIFIERS"));
    }

    #[test]
    fn up_to_date_delay_stays_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let d = up_to_date_delay(&mut rng).as_secs();
            assert!((5..=59).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn stuck_rebase_detection() {
        assert!(rebase_is_stuck(
            "CONFLICT (content): Merge conflict in a.txt"
        ));
        assert!(rebase_is_stuck("error: could not apply 1a2b3c4... fix"));
        assert!(!rebase_is_stuck("Successfully rebased"));
    }

    #[test]
    fn offending_host_extraction() {
        let out = "The ED25519 host key for up.example has changed,";
        assert_eq!(extract_offending_host(out).as_deref(), Some("up.example"));

        let out = "Host key for github.com has changed and you have requested strict checking.";
        assert_eq!(extract_offending_host(out).as_deref(), Some("github.com"));

        assert_eq!(extract_offending_host("nothing here"), None);
    }

    #[test]
    fn stale_dir_detection() {
        let tmp = tempfile::tempdir().unwrap();
        // Freshly created: not older than an hour.
        assert!(!dir_older_than(tmp.path(), Duration::from_secs(3600)));
        // But older than zero.
        std::thread::sleep(Duration::from_millis(10));
        assert!(dir_older_than(tmp.path(), Duration::from_millis(1)));
        // Missing directory is never stale.
        assert!(!dir_older_than(
            &tmp.path().join("nope"),
            Duration::from_secs(1)
        ));
    }

    #[tokio::test]
    async fn build_lock_serializes_rebuilds() {
        let tmp = tempfile::tempdir().unwrap();
        let git_dir = tmp.path().join("r.git");
        gitcmd::git_ok(None, &["init", "-q", "--bare", git_dir.to_str().unwrap()], &[])
            .await
            .unwrap();

        let out = tmp.path().join("built");
        let daemon = Daemon {
            cwd: tmp.path().to_path_buf(),
            git_dir: git_dir.clone(),
            branch: "main".to_string(),
            build_cmd: Some(format!("echo done >> {}", out.display())),
            fix_nasty: false,
            table: PathologyTable::builtin(),
            transport: vec![],
            marker: PeerMarker::new(&git_dir, tmp.path()),
            respawn_argv: vec!["git-deploy".to_string()],
            exe_path: PathBuf::from("/nonexistent"),
            started_at: SystemTime::now(),
            single_shot: true,
        };

        daemon.rebuild().await;
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "done\n");

        // With the lock held elsewhere, the build is skipped.
        let held = std::fs::OpenOptions::new()
            .read(true)
            .open(git_dir.join("config"))
            .unwrap();
        held.try_lock_exclusive().unwrap();
        daemon.rebuild().await;
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "done\n");
        fs2::FileExt::unlock(&held).unwrap();
    }

    #[tokio::test]
    async fn resolve_branch_prefers_request() {
        let tmp = tempfile::tempdir().unwrap();
        let branch = resolve_branch(tmp.path(), Some("release")).await.unwrap();
        assert_eq!(branch, "release");
    }
}
