//! The pre-hook / backend / post-hook pipeline.
//!
//! Once the gateway has resolved a repository, one session runs here:
//! built-in access checks and an optional `pre-<phase>` hook, then the Git
//! wire backend (only if the pre stage passed), then an optional
//! `post-<phase>` hook that observes both exit statuses but can never change
//! the session's.  Hooks communicate through environment variables and a
//! per-session scratch directory exported as `IPC`.
//!
//! The pipeline also installs itself into stock repositories: when the
//! running executable lives in a real `hooks/` directory and the target repo
//! still has its stock `hooks/`, the stock directory is moved aside and the
//! invoker's directory symlinked in its place, bootstrapping `acl.writers`
//! with the caller's KEY.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::access::{self, Access, Phase};
use crate::config::RepoConfig;
use crate::gitcmd;
use crate::identity::Identity;
use crate::logger;

/// Dedicated option-transport variable (forwarded via `SendEnv`).
pub const OPTIONS_ENV: &str = "GIT_SERVER_OPTIONS";
/// Historical transport abusing a locale variable sshd forwards by default;
/// still accepted for wire compatibility.
pub const LEGACY_OPTIONS_ENV: &str = "XMODIFIERS";

// ---------------------------------------------------------------------------
// Option transport
// ---------------------------------------------------------------------------

/// Split the newline-separated option transport, preferring the dedicated
/// variable over the legacy one.
pub fn collect_options(primary: Option<&str>, legacy: Option<&str>) -> Vec<String> {
    let raw = primary.filter(|s| !s.is_empty()).or(legacy).unwrap_or("");
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Map a `DEBUG=<v>` value onto a level: `0|off|false|""` is 0, a pure
/// decimal is itself, anything else is 1.
pub fn parse_debug(value: &str) -> u32 {
    match value.trim() {
        "" | "0" | "off" | "false" => 0,
        v if v.chars().all(|c| c.is_ascii_digit()) => v.parse().unwrap_or(1),
        _ => 1,
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One pipeline run: everything needed to drive the hooks and the backend.
pub struct Session {
    git_dir: PathBuf,
    phase: Phase,
    canonical_cmd: String,
    identity: Identity,
    config: RepoConfig,
    options: Vec<String>,
    debug: u32,
    ipc_dir: PathBuf,
}

/// Run the pipeline with identity and options taken from the environment.
pub async fn run(argv0: &Path, git_dir: &Path, op: &str, canonical_cmd: &str) -> Result<i32> {
    let identity = Identity::from_env();
    let options = collect_options(
        std::env::var(OPTIONS_ENV).ok().as_deref(),
        std::env::var(LEGACY_OPTIONS_ENV).ok().as_deref(),
    );
    let debug_env = std::env::var("DEBUG").ok();
    let session = Session::prepare(
        argv0,
        git_dir,
        op,
        canonical_cmd,
        identity,
        options,
        debug_env.as_deref(),
    )
    .await?;
    session.execute().await
}

impl Session {
    /// Classify the operation, self-install if the gate conditions hold,
    /// load the repo config and create the IPC scratch directory.
    pub async fn prepare(
        argv0: &Path,
        git_dir: &Path,
        op: &str,
        canonical_cmd: &str,
        identity: Identity,
        options: Vec<String>,
        debug_env: Option<&str>,
    ) -> Result<Self> {
        let phase = Phase::from_op(op)?;

        if let Err(e) = self_install(argv0, git_dir, &identity).await {
            warn!(error = %e, "self-install skipped");
        }

        let config = RepoConfig::load(git_dir).await?;

        let mut debug = debug_env.map(parse_debug).unwrap_or(0);
        for opt in &options {
            if let Some(v) = opt.strip_prefix("DEBUG=") {
                debug = parse_debug(v);
            }
        }

        if phase == Phase::Write && !options.is_empty() && !config.advertise_push_options {
            if let Err(e) = gitcmd::config_set_global("receive.advertisePushOptions", "true").await
            {
                warn!(error = %e, "could not advertise push options globally");
            }
        }

        let ipc_dir = git_dir.join("tmp").join(format!(
            "current-{}-{}-io",
            phase.as_str(),
            std::process::id(),
        ));
        create_private_dir(&ipc_dir)
            .with_context(|| format!("failed to create IPC dir {}", ipc_dir.display()))?;

        Ok(Self {
            git_dir: git_dir.to_path_buf(),
            phase,
            canonical_cmd: canonical_cmd.to_string(),
            identity,
            config,
            options,
            debug,
            ipc_dir,
        })
    }

    /// Environment every hook and the backend receive.
    fn hook_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("GIT_DIR".to_string(), self.git_dir.display().to_string()),
            ("KEY".to_string(), self.identity.key.clone()),
            ("IPC".to_string(), self.ipc_dir.display().to_string()),
            (
                "GIT_CONNECTED_EPOCH".to_string(),
                self.identity.connected_epoch.to_string(),
            ),
            ("DEBUG".to_string(), self.debug.to_string()),
            (
                "GIT_OPTION_COUNT".to_string(),
                self.options.len().to_string(),
            ),
        ];
        for (i, opt) in self.options.iter().enumerate() {
            env.push((format!("GIT_OPTION_{i}"), opt.clone()));
        }
        env
    }

    fn hook_path(&self, name: &str) -> Option<PathBuf> {
        let path = self.git_dir.join("hooks").join(name);
        if is_executable(&path) {
            Some(path)
        } else {
            None
        }
    }

    async fn run_hook(&self, path: &Path, extra_env: &[(String, String)]) -> i32 {
        debug!(hook = %path.display(), "running hook");
        let mut cmd = tokio::process::Command::new(path);
        cmd.stdin(Stdio::null());
        for (k, v) in self.hook_env() {
            cmd.env(k, v);
        }
        for (k, v) in extra_env {
            cmd.env(k, v);
        }
        match cmd.status().await {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                warn!(hook = %path.display(), error = %e, "failed to spawn hook");
                1
            }
        }
    }

    /// Drive the state machine; returns the session exit code.
    pub async fn execute(self) -> Result<i32> {
        let phase_name = self.phase.as_str();

        // Built-in access gate, then the custom pre-hook.
        let pre_status = match access::authorize(&self.config, &self.identity, self.phase)? {
            Access::Denied { message, audit } => {
                eprintln!("{message}");
                logger::log_event(&self.config, &self.identity, &audit).await;
                1
            }
            Access::Granted => match self.hook_path(&format!("pre-{phase_name}")) {
                Some(hook) => self.run_hook(&hook, &[]).await,
                None => 0,
            },
        };

        let git_status = if pre_status == 0 {
            self.run_backend(pre_status).await
        } else {
            debug!(pre_status, "pre stage vetoed; skipping backend");
            pre_status
        };

        if let Some(hook) = self.hook_path(&format!("post-{phase_name}")) {
            let original = std::env::var("SSH_ORIGINAL_COMMAND")
                .unwrap_or_else(|_| self.canonical_cmd.clone());
            let extra = [
                ("GIT_PRE_EXIT_STATUS".to_string(), pre_status.to_string()),
                ("GIT_EXIT_STATUS".to_string(), git_status.to_string()),
                ("SSH_ORIGINAL_COMMAND".to_string(), original),
            ];
            let post_status = self.run_hook(&hook, &extra).await;
            if post_status != 0 {
                // Logged only; the post-hook cannot change the exit code.
                warn!(post_status, "post hook exited non-zero");
            }
        }

        logger::log_event(
            &self.config,
            &self.identity,
            &format!("{phase_name} session exit {git_status}"),
        )
        .await;

        if self.debug == 0 {
            self.cleanup_ipc();
        } else {
            info!(ipc = %self.ipc_dir.display(), "DEBUG set; leaving IPC dir behind");
        }

        Ok(git_status)
    }

    /// Run the wire backend: the repo's `hooks/git-shell` override when
    /// executable, otherwise the system `git-shell`.  Stdio stays inherited
    /// so the pkt-line conversation flows through untouched.
    async fn run_backend(&self, pre_status: i32) -> i32 {
        let backend = self
            .hook_path("git-shell")
            .unwrap_or_else(|| PathBuf::from("git-shell"));
        debug!(backend = %backend.display(), cmd = %self.canonical_cmd, "running git backend");

        let mut cmd = tokio::process::Command::new(&backend);
        cmd.arg("-c").arg(&self.canonical_cmd);
        for (k, v) in self.hook_env() {
            cmd.env(k, v);
        }
        cmd.env("GIT_PRE_EXIT_STATUS", pre_status.to_string());
        match cmd.status().await {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                warn!(backend = %backend.display(), error = %e, "failed to spawn backend");
                1
            }
        }
    }

    /// Remove everything matching `$IPC*`, then drop `$GIT_DIR/tmp` if it
    /// emptied out.
    fn cleanup_ipc(&self) {
        let tmp = self.git_dir.join("tmp");
        let Some(prefix) = self.ipc_dir.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return;
        };
        if let Ok(entries) = std::fs::read_dir(&tmp) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(&prefix) {
                    let path = entry.path();
                    let removed = if path.is_dir() {
                        std::fs::remove_dir_all(&path)
                    } else {
                        std::fs::remove_file(&path)
                    };
                    if let Err(e) = removed {
                        warn!(path = %path.display(), error = %e, "failed to clean IPC entry");
                    }
                }
            }
        }
        let _ = std::fs::remove_dir(&tmp);
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::DirBuilder::new().mode(0o700).create(dir)?;
    Ok(())
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Self-install
// ---------------------------------------------------------------------------

/// Wire this installation's hooks directory into a stock repository.
///
/// Gated on the exact conditions: the running executable sits in a real
/// (non-symlink) directory named `hooks`, and the repo's `hooks` is a stock
/// directory that is neither a symlink nor already the invoker's directory.
/// The stock directory is moved aside with a single atomic rename.
async fn self_install(argv0: &Path, git_dir: &Path, identity: &Identity) -> Result<bool> {
    let Some(invoker_dir) = argv0.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(false);
    };
    if invoker_dir.file_name().map(|n| n != "hooks").unwrap_or(true) {
        return Ok(false);
    }
    let invoker_meta = std::fs::symlink_metadata(invoker_dir)
        .with_context(|| format!("cannot stat {}", invoker_dir.display()))?;
    if invoker_meta.file_type().is_symlink() {
        return Ok(false);
    }

    let repo_hooks = git_dir.join("hooks");
    let Ok(repo_meta) = std::fs::symlink_metadata(&repo_hooks) else {
        return Ok(false);
    };
    if repo_meta.file_type().is_symlink() || !repo_meta.is_dir() {
        return Ok(false);
    }
    match (repo_hooks.canonicalize(), invoker_dir.canonicalize()) {
        (Ok(a), Ok(b)) if a == b => return Ok(false),
        _ => {}
    }

    let aside = git_dir.join(format!("hooks.{}.PLEASE_DELETE", std::process::id()));
    std::fs::rename(&repo_hooks, &aside)
        .with_context(|| format!("cannot move stock hooks aside to {}", aside.display()))?;
    std::os::unix::fs::symlink(invoker_dir, &repo_hooks)
        .with_context(|| format!("cannot symlink hooks into {}", repo_hooks.display()))?;

    if gitcmd::config_get(git_dir, "acl.writers").await?.is_none() {
        gitcmd::config_set(git_dir, "acl.writers", &identity.key).await?;
        info!(key = %identity.key, "bootstrapped acl.writers");
    }

    info!(
        repo = %git_dir.display(),
        hooks = %invoker_dir.display(),
        "installed hook pipeline into repository"
    );
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn test_identity(key: &str) -> Identity {
        Identity {
            key: key.to_string(),
            client_ip: None,
            client_port: None,
            server_ip: None,
            server_port: None,
            connected_epoch: 1,
        }
    }

    async fn make_bare_repo(root: &Path) -> PathBuf {
        let repo = root.join("proj.git");
        gitcmd::git_ok(None, &["init", "-q", "--bare", repo.to_str().unwrap()], &[])
            .await
            .unwrap();
        repo
    }

    fn write_hook(repo: &Path, name: &str, body: &str) -> PathBuf {
        let path = repo.join("hooks").join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn debug_value_mapping() {
        assert_eq!(parse_debug(""), 0);
        assert_eq!(parse_debug("0"), 0);
        assert_eq!(parse_debug("off"), 0);
        assert_eq!(parse_debug("false"), 0);
        assert_eq!(parse_debug("3"), 3);
        assert_eq!(parse_debug("17"), 17);
        assert_eq!(parse_debug("yes"), 1);
        assert_eq!(parse_debug("verbose"), 1);
    }

    #[test]
    fn option_transport_prefers_dedicated_variable() {
        let opts = collect_options(Some("a\nb"), Some("legacy"));
        assert_eq!(opts, vec!["a", "b"]);

        let opts = collect_options(None, Some("x\n\ny\n"));
        assert_eq!(opts, vec!["x", "y"]);

        let opts = collect_options(Some(""), Some("z"));
        assert_eq!(opts, vec!["z"]);

        assert!(collect_options(None, None).is_empty());
    }

    #[tokio::test]
    async fn pre_hook_veto_skips_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = make_bare_repo(tmp.path()).await;
        let marker = tmp.path().join("backend-ran");
        write_hook(&repo, "pre-read", "#!/bin/sh\nexit 3\n");
        write_hook(
            &repo,
            "git-shell",
            &format!("#!/bin/sh\ntouch {}\nexit 0\n", marker.display()),
        );

        let cmd = format!("git-upload-pack '{}'", repo.display());
        let session = Session::prepare(
            Path::new("/usr/bin/git-server"),
            &repo,
            "git-upload-pack",
            &cmd,
            test_identity("alice"),
            vec![],
            None,
        )
        .await
        .unwrap();
        let code = session.execute().await.unwrap();

        assert_eq!(code, 3);
        assert!(!marker.exists(), "backend must not run after pre veto");
    }

    #[tokio::test]
    async fn statuses_flow_to_post_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = make_bare_repo(tmp.path()).await;
        let record = tmp.path().join("post-env");
        write_hook(&repo, "git-shell", "#!/bin/sh\nexit 7\n");
        write_hook(
            &repo,
            "post-read",
            &format!(
                "#!/bin/sh\necho \"pre=$GIT_PRE_EXIT_STATUS git=$GIT_EXIT_STATUS\" > {}\n",
                record.display()
            ),
        );

        let cmd = format!("git-upload-pack '{}'", repo.display());
        let session = Session::prepare(
            Path::new("/usr/bin/git-server"),
            &repo,
            "git-upload-pack",
            &cmd,
            test_identity("alice"),
            vec![],
            None,
        )
        .await
        .unwrap();
        let code = session.execute().await.unwrap();

        assert_eq!(code, 7, "backend exit propagates verbatim");
        let text = std::fs::read_to_string(&record).unwrap();
        assert_eq!(text.trim(), "pre=0 git=7");
    }

    #[tokio::test]
    async fn options_reach_hooks_and_ipc_is_cleaned() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = make_bare_repo(tmp.path()).await;
        let record = tmp.path().join("opts");
        write_hook(&repo, "git-shell", "#!/bin/sh\nexit 0\n");
        write_hook(
            &repo,
            "pre-read",
            &format!(
                "#!/bin/sh\necho \"n=$GIT_OPTION_COUNT 0=$GIT_OPTION_0 1=$GIT_OPTION_1\" > {}\ntest -d \"$IPC\" || exit 9\n",
                record.display()
            ),
        );

        let cmd = format!("git-upload-pack '{}'", repo.display());
        let session = Session::prepare(
            Path::new("/usr/bin/git-server"),
            &repo,
            "git-upload-pack",
            &cmd,
            test_identity("alice"),
            vec!["deploy_patience=30".to_string(), "ci=skip".to_string()],
            None,
        )
        .await
        .unwrap();
        let ipc = session.ipc_dir.clone();
        assert!(ipc.is_dir(), "IPC dir exists before hooks run");
        let code = session.execute().await.unwrap();

        assert_eq!(code, 0);
        let text = std::fs::read_to_string(&record).unwrap();
        assert_eq!(text.trim(), "n=2 0=deploy_patience=30 1=ci=skip");
        assert!(!ipc.exists(), "IPC dir removed without DEBUG");
        assert!(!repo.join("tmp").exists(), "empty tmp is rmdir'd");
    }

    #[tokio::test]
    async fn debug_option_keeps_ipc_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = make_bare_repo(tmp.path()).await;
        write_hook(&repo, "git-shell", "#!/bin/sh\nexit 0\n");

        let cmd = format!("git-upload-pack '{}'", repo.display());
        let session = Session::prepare(
            Path::new("/usr/bin/git-server"),
            &repo,
            "git-upload-pack",
            &cmd,
            test_identity("alice"),
            vec!["DEBUG=1".to_string()],
            None,
        )
        .await
        .unwrap();
        let ipc = session.ipc_dir.clone();
        session.execute().await.unwrap();
        assert!(ipc.is_dir(), "DEBUG leaves the IPC dir behind");
    }

    #[tokio::test]
    async fn acl_denial_behaves_like_failed_pre_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = make_bare_repo(tmp.path()).await;
        gitcmd::config_set(&repo, "acl.writers", "alice").await.unwrap();
        let marker = tmp.path().join("backend-ran");
        write_hook(
            &repo,
            "git-shell",
            &format!("#!/bin/sh\ntouch {}\nexit 0\n", marker.display()),
        );

        let cmd = format!("git-upload-pack '{}'", repo.display());
        let session = Session::prepare(
            Path::new("/usr/bin/git-server"),
            &repo,
            "git-upload-pack",
            &cmd,
            test_identity("bob"),
            vec![],
            None,
        )
        .await
        .unwrap();
        let code = session.execute().await.unwrap();

        assert_ne!(code, 0);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn self_install_wires_stock_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = make_bare_repo(tmp.path()).await;

        // A fake installation directory named `hooks` holding the binary.
        let install = tmp.path().join("dist").join("hooks");
        std::fs::create_dir_all(&install).unwrap();
        let argv0 = install.join("git-server");
        std::fs::write(&argv0, "").unwrap();

        let installed = self_install(&argv0, &repo, &test_identity("alice"))
            .await
            .unwrap();
        assert!(installed);

        let hooks = repo.join("hooks");
        let meta = std::fs::symlink_metadata(&hooks).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(hooks.canonicalize().unwrap(), install.canonicalize().unwrap());

        let aside: Vec<_> = std::fs::read_dir(&repo)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".PLEASE_DELETE"))
            .collect();
        assert_eq!(aside.len(), 1, "stock hooks moved aside once");

        let writers = gitcmd::config_get(&repo, "acl.writers").await.unwrap();
        assert_eq!(writers.as_deref(), Some("alice"));

        // Second run is a no-op: hooks is now a symlink.
        let again = self_install(&argv0, &repo, &test_identity("alice"))
            .await
            .unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn self_install_refuses_outside_hooks_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = make_bare_repo(tmp.path()).await;
        let installed = self_install(
            Path::new("/usr/bin/git-server"),
            &repo,
            &test_identity("alice"),
        )
        .await
        .unwrap();
        assert!(!installed);
        assert!(!std::fs::symlink_metadata(repo.join("hooks"))
            .unwrap()
            .file_type()
            .is_symlink());
    }
}
