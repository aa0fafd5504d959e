//! SSH entry point: forced-command parsing, repository resolution, handler
//! hand-off.
//!
//! Two invocation surfaces share one binary.  As an `authorized_keys` forced
//! command (Standard) the real request arrives in `SSH_ORIGINAL_COMMAND` and
//! any extra argv tokens of the form `KEY=VAL` are injected into the
//! environment.  As a login shell (Advanced) sshd hands us `-c <cmd>`
//! directly and the environment is left untouched.  Either way the command
//! is validated, the repository argument resolved to a bare `GIT_DIR`, and
//! control passes to the per-repo handler: a `hooks/git-server` override if
//! the repository ships one, otherwise the built-in hook pipeline.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::pipeline;

// ---------------------------------------------------------------------------
// Invocation modes
// ---------------------------------------------------------------------------

/// How the binary was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Forced command; the wire command came from `SSH_ORIGINAL_COMMAND`.
    Standard {
        command: String,
        env_pairs: Vec<(String, String)>,
    },
    /// Login shell / handler re-invocation: `-c <cmd>`.
    Advanced { command: String },
}

/// Classify argv (without argv\[0\]) into an invocation mode.
///
/// `original` is the value of `SSH_ORIGINAL_COMMAND`, passed in so the
/// classification stays a pure function.
pub fn detect_mode(args: &[String], original: Option<&str>) -> Result<Mode> {
    if args.len() == 2 && args[0] == "-c" {
        return Ok(Mode::Advanced {
            command: args[1].clone(),
        });
    }

    let Some(command) = original else {
        bail!("git-server: Only SSH allowed");
    };

    let mut env_pairs = Vec::new();
    for token in args {
        match token.split_once('=') {
            Some((k, v)) if !k.is_empty() => env_pairs.push((k.to_string(), v.to_string())),
            _ => warn!(%token, "ignoring non KEY=VAL argument"),
        }
    }

    Ok(Mode::Standard {
        command: command.to_string(),
        env_pairs,
    })
}

// ---------------------------------------------------------------------------
// Command grammar
// ---------------------------------------------------------------------------

/// A validated wire command: operation token plus cleaned repo argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub op: String,
    pub repo: String,
}

/// Validate `<op> <repo>` against the accepted grammar and clean the repo
/// argument (surrounding single quotes, one trailing `.git`).
pub fn parse_command(cmd: &str) -> Result<ParsedCommand> {
    let re = Regex::new(r"^(git-[\w-]+) (.+)$").expect("static regex");
    let caps = re
        .captures(cmd.trim())
        .with_context(|| "git-server: shell access denied".to_string())?;

    let op = caps[1].to_string();
    let mut repo = caps[2].trim().to_string();
    if repo.len() >= 2 && repo.starts_with('\'') && repo.ends_with('\'') {
        repo = repo[1..repo.len() - 1].to_string();
    }
    if let Some(stripped) = repo.strip_suffix(".git") {
        repo = stripped.to_string();
    }
    if repo.is_empty() {
        bail!("git-server: shell access denied");
    }
    Ok(ParsedCommand { op, repo })
}

// ---------------------------------------------------------------------------
// Repository resolution
// ---------------------------------------------------------------------------

/// Resolve a repo argument to an absolute bare `GIT_DIR`.
///
/// Candidates `<r>.git/.git`, `<r>/.git`, `<r>.git`, `<r>` are tried in
/// order; an absolute argument is tried as given first, then (with the
/// leading `/` stripped) relative to `home`, which is also the base for
/// `~/` and plain relative arguments.
pub fn resolve_git_dir(repo: &str, home: &Path) -> Result<PathBuf> {
    let r = repo.trim();
    let mut bases: Vec<PathBuf> = Vec::new();
    if let Some(rest) = r.strip_prefix("~/") {
        bases.push(home.join(rest));
    } else if r.starts_with('/') {
        bases.push(PathBuf::from(r));
        bases.push(home.join(r.trim_start_matches('/')));
    } else {
        bases.push(home.join(r));
    }

    for base in &bases {
        let b = base.display().to_string();
        let candidates = [
            PathBuf::from(format!("{b}.git/.git")),
            PathBuf::from(format!("{b}/.git")),
            PathBuf::from(format!("{b}.git")),
            base.clone(),
        ];
        for candidate in candidates {
            if candidate.is_dir() {
                let abs = candidate
                    .canonicalize()
                    .with_context(|| format!("cannot canonicalize {}", candidate.display()))?;
                debug!(repo, git_dir = %abs.display(), "repository resolved");
                return Ok(abs);
            }
        }
    }

    bail!("git-server: access to repository {r:?} denied");
}

// ---------------------------------------------------------------------------
// Roles and handler selection
// ---------------------------------------------------------------------------

/// Which half of the binary is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Front door: parse, resolve, hand off.
    Gateway,
    /// Installed inside a repo's `hooks/` directory; we ARE the handler.
    Handler,
}

/// The handler role is selected purely by where the invoked executable
/// lives: a parent directory named `hooks` means a prior gateway (or an
/// admin) already dispatched to this repository.
pub fn detect_role(argv0: &Path) -> Role {
    let in_hooks = argv0
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n == "hooks")
        .unwrap_or(false);
    if in_hooks {
        Role::Handler
    } else {
        Role::Gateway
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Pick the per-repo handler override, if one exists and is not ourselves.
fn handler_override(git_dir: &Path, argv0: &Path) -> Option<PathBuf> {
    let candidate = git_dir.join("hooks").join("git-server");
    if !is_executable(&candidate) {
        return None;
    }
    // Never re-exec ourselves through the override; that's an infinite loop.
    let same = match (candidate.canonicalize(), argv0.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if same {
        None
    } else {
        Some(candidate)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the gateway for the given argv; returns the session exit code.
pub async fn run(argv: &[String]) -> Result<i32> {
    let argv0 = PathBuf::from(&argv[0]);
    let role = detect_role(&argv0);

    let mode = detect_mode(&argv[1..], std::env::var("SSH_ORIGINAL_COMMAND").ok().as_deref())?;

    let command = match &mode {
        Mode::Advanced { command } => command.clone(),
        Mode::Standard { command, env_pairs } => {
            if !crate::identity::Identity::has_ssh_context() {
                bail!("git-server: Only SSH allowed");
            }
            for (k, v) in env_pairs {
                std::env::set_var(k, v);
            }
            command.clone()
        }
    };

    let parsed = parse_command(&command)?;
    let home = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/".to_string()));
    let git_dir = resolve_git_dir(&parsed.repo, &home)?;
    std::env::set_var("GIT_DIR", &git_dir);

    let canonical_cmd = format!("{} '{}'", parsed.op, git_dir.display());

    if role == Role::Gateway {
        if let Some(handler) = handler_override(&git_dir, &argv0) {
            info!(handler = %handler.display(), "handing off to repository handler");
            let status = tokio::process::Command::new(&handler)
                .arg("-c")
                .arg(&canonical_cmd)
                .status()
                .await
                .with_context(|| format!("failed to exec handler {}", handler.display()))?;
            return Ok(status.code().unwrap_or(1));
        }
    }

    pipeline::run(&argv0, &git_dir, &parsed.op, &canonical_cmd).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn advanced_mode_is_exact_dash_c() {
        let mode = detect_mode(&s(&["-c", "git-upload-pack 'x'"]), None).unwrap();
        assert_eq!(
            mode,
            Mode::Advanced {
                command: "git-upload-pack 'x'".to_string()
            }
        );
    }

    #[test]
    fn standard_mode_takes_original_command_and_env() {
        let mode = detect_mode(&s(&["KEY=alice", "junk"]), Some("git-upload-pack 'x'")).unwrap();
        match mode {
            Mode::Standard { command, env_pairs } => {
                assert_eq!(command, "git-upload-pack 'x'");
                assert_eq!(env_pairs, vec![("KEY".to_string(), "alice".to_string())]);
            }
            Mode::Advanced { .. } => panic!("not advanced"),
        }
    }

    #[test]
    fn standard_mode_without_original_command_is_refused() {
        let err = detect_mode(&s(&["KEY=alice"]), None).unwrap_err();
        assert!(err.to_string().contains("Only SSH allowed"));
    }

    #[test]
    fn command_grammar_accepts_git_subcommands() {
        let parsed = parse_command("git-receive-pack 'proj.git'").unwrap();
        assert_eq!(parsed.op, "git-receive-pack");
        assert_eq!(parsed.repo, "proj");

        let parsed = parse_command("git-upload-pack /srv/git/x").unwrap();
        assert_eq!(parsed.repo, "/srv/git/x");
    }

    #[test]
    fn command_grammar_rejects_shell() {
        assert!(parse_command("ls -la").is_err());
        assert!(parse_command("git-upload-pack").is_err());
        assert!(parse_command("rm -rf /; git-upload-pack 'x'").is_err());
    }

    #[test]
    fn resolution_prefers_earlier_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path();
        std::fs::create_dir_all(home.join("proj.git")).unwrap();
        std::fs::create_dir_all(home.join("proj")).unwrap();

        let dir = resolve_git_dir("proj", home).unwrap();
        assert!(dir.ends_with("proj.git"));
    }

    #[test]
    fn resolution_handles_tilde_and_absolute() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path();
        std::fs::create_dir_all(home.join("a/b.git")).unwrap();

        assert!(resolve_git_dir("~/a/b", home).unwrap().ends_with("b.git"));
        // Leading slash is stripped and retried relative to home.
        assert!(resolve_git_dir("/a/b", home).unwrap().ends_with("b.git"));
    }

    #[test]
    fn resolution_failure_names_the_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_git_dir("nosuch", tmp.path()).unwrap_err();
        assert!(err.to_string().contains("nosuch"));
    }

    #[test]
    fn role_from_argv0_location() {
        assert_eq!(
            detect_role(Path::new("/srv/git/x.git/hooks/git-server")),
            Role::Handler
        );
        assert_eq!(detect_role(Path::new("/usr/bin/git-server")), Role::Gateway);
        assert_eq!(detect_role(Path::new("git-server")), Role::Gateway);
    }

    #[test]
    fn override_requires_executable_bit() {
        let tmp = tempfile::tempdir().unwrap();
        let git_dir = tmp.path();
        std::fs::create_dir_all(git_dir.join("hooks")).unwrap();
        let hook = git_dir.join("hooks/git-server");
        std::fs::write(&hook, "#!/bin/sh\nexit 0\n").unwrap();

        assert!(handler_override(git_dir, Path::new("/usr/bin/git-server")).is_none());

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(
            handler_override(git_dir, Path::new("/usr/bin/git-server")).unwrap(),
            hook
        );
        // The override must never be the running executable itself.
        assert!(handler_override(git_dir, &hook).is_none());
    }
}
