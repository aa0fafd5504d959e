//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary for
//! the actual work.  Invocations never fail on a non-zero exit by default --
//! callers that need the pathology text of a failing `git rebase` get the
//! captured output either way, and callers that require success go through
//! [`git_ok`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Captured output
// ---------------------------------------------------------------------------

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; -1 when the process died to a signal.
    pub code: i32,
    pub success: bool,
}

impl GitOutput {
    /// Stdout followed by stderr, the way the deploy daemon's pathology
    /// catalog wants to see it.
    pub fn combined(&self) -> String {
        let mut s = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        s.push_str(&self.stdout);
        if !self.stdout.ends_with('\n') && !self.stdout.is_empty() {
            s.push('\n');
        }
        s.push_str(&self.stderr);
        s
    }
}

// ---------------------------------------------------------------------------
// Runners
// ---------------------------------------------------------------------------

/// Run `git <args>` with captured stdio, returning the output regardless of
/// exit status.
#[instrument(skip(envs))]
pub async fn git(cwd: Option<&Path>, args: &[&str], envs: &[(String, String)]) -> Result<GitOutput> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;

    let result = GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code().unwrap_or(-1),
        success: output.status.success(),
    };
    debug!(code = result.code, "git finished");
    Ok(result)
}

/// Like [`git`] but treats a non-zero exit as an error.
pub async fn git_ok(cwd: Option<&Path>, args: &[&str], envs: &[(String, String)]) -> Result<GitOutput> {
    let out = git(cwd, args, envs).await?;
    if !out.success {
        bail!(
            "git {} failed (status {}): {}",
            args.join(" "),
            out.code,
            out.stderr.trim(),
        );
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// `git config --list` for the given bare repository, all scopes merged the
/// way git itself merges them.
pub async fn config_list(git_dir: &Path) -> Result<String> {
    let dir_arg = format!("--git-dir={}", git_dir.display());
    let out = git_ok(None, &[&dir_arg, "config", "--list"], &[]).await?;
    Ok(out.stdout)
}

/// Read a single config key from the repository, `None` when unset.
pub async fn config_get(git_dir: &Path, key: &str) -> Result<Option<String>> {
    let dir_arg = format!("--git-dir={}", git_dir.display());
    let out = git(None, &[&dir_arg, "config", "--get", key], &[]).await?;
    if out.success {
        Ok(Some(out.stdout.trim_end().to_string()))
    } else {
        Ok(None)
    }
}

/// Set a config key in the repository's own config file.
pub async fn config_set(git_dir: &Path, key: &str, value: &str) -> Result<()> {
    let dir_arg = format!("--git-dir={}", git_dir.display());
    git_ok(None, &[&dir_arg, "config", key, value], &[]).await?;
    Ok(())
}

/// Set a config key in the caller's global git config.
pub async fn config_set_global(key: &str, value: &str) -> Result<()> {
    git_ok(None, &["config", "--global", key, value], &[]).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Remotes and refs
// ---------------------------------------------------------------------------

/// Raw `git ls-remote <remote>` listing from inside a working clone.
#[instrument]
pub async fn ls_remote(workdir: &Path, remote: &str) -> Result<String> {
    let out = git_ok(Some(workdir), &["ls-remote", remote], &[]).await?;
    Ok(out.stdout)
}

/// `git fetch --tags <remote>`, output captured.
#[instrument]
pub async fn fetch_tags(workdir: &Path, remote: &str) -> Result<GitOutput> {
    git(Some(workdir), &["fetch", "--tags", remote], &[]).await
}

/// `git clone -o <origin_name> <src> <dest>`.
#[instrument(fields(src = %src.display(), dest = %dest.display()))]
pub async fn clone_with_origin(origin_name: &str, src: &Path, dest: &Path) -> Result<()> {
    let src_s = src.display().to_string();
    let dest_s = dest.display().to_string();
    git_ok(None, &["clone", "-o", origin_name, src_s.as_str(), dest_s.as_str()], &[]).await?;
    Ok(())
}

/// `git remote add <name> <url>` inside a working clone.
pub async fn remote_add(workdir: &Path, name: &str, url: &str) -> Result<()> {
    git_ok(Some(workdir), &["remote", "add", name, url], &[]).await?;
    Ok(())
}

/// Resolve the `.git` directory governing `cwd` to an absolute path.
pub async fn rev_parse_git_dir(cwd: &Path) -> Result<PathBuf> {
    let out = git_ok(Some(cwd), &["rev-parse", "--git-dir"], &[]).await?;
    let raw = PathBuf::from(out.stdout.trim_end());
    let abs = if raw.is_absolute() { raw } else { cwd.join(raw) };
    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize git dir under {}", cwd.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        git_ok(Some(dir), &["init", "-q"], &[]).await.unwrap();
        git_ok(Some(dir), &["config", "user.name", "Test"], &[])
            .await
            .unwrap();
        git_ok(Some(dir), &["config", "user.email", "t@example.com"], &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn combined_concatenates_streams() {
        let out = GitOutput {
            stdout: "out line".to_string(),
            stderr: "err line\n".to_string(),
            code: 0,
            success: true,
        };
        assert_eq!(out.combined(), "out line\nerr line\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        // `git log` in an empty, non-repo directory fails but still captures.
        let out = git(Some(tmp.path()), &["log"], &[]).await.unwrap();
        assert!(!out.success);
        assert!(out.stderr.contains("not a git repository"));
    }

    #[tokio::test]
    async fn config_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r.git");
        git_ok(None, &["init", "-q", "--bare", repo.to_str().unwrap()], &[])
            .await
            .unwrap();

        config_set(&repo, "acl.writers", "alice,bob").await.unwrap();
        let got = config_get(&repo, "acl.writers").await.unwrap();
        assert_eq!(got.as_deref(), Some("alice,bob"));
        assert_eq!(config_get(&repo, "acl.readers").await.unwrap(), None);

        let listing = config_list(&repo).await.unwrap();
        assert!(listing.contains("acl.writers=alice,bob"));
    }

    #[tokio::test]
    async fn rev_parse_resolves_worktree() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path()).await;
        let git_dir = rev_parse_git_dir(tmp.path()).await.unwrap();
        assert!(git_dir.ends_with(".git"));
        assert!(git_dir.is_absolute());
    }
}
