//! Peer coordination through an advisory marker file.
//!
//! Each deploy daemon flocks `$GIT_DIR/deploy-waiting.lock` exclusively
//! while it sits in its push-notification wait, publishing `{pid, cwd,
//! state, since}` as JSON into the file.  A peer asking "is another deployer
//! for this cwd already waiting?" just tries the lock: failure to acquire
//! plus a matching `cwd` in the payload is a yes.  The lock is released
//! outside the wait so the marker never outlives a crashed holder.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Published state of one deploy daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerState {
    pub pid: u32,
    pub cwd: PathBuf,
    pub state: String,
    pub since: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pathology: Option<String>,
}

pub struct PeerMarker {
    path: PathBuf,
    cwd: PathBuf,
    held: Option<File>,
    last_pathology: Option<String>,
}

impl PeerMarker {
    pub fn new(git_dir: &Path, cwd: &Path) -> Self {
        Self {
            path: git_dir.join("deploy-waiting.lock"),
            cwd: cwd.to_path_buf(),
            held: None,
            last_pathology: None,
        }
    }

    fn state(&self, state: &str) -> PeerState {
        PeerState {
            pid: std::process::id(),
            cwd: self.cwd.clone(),
            state: state.to_string(),
            since: chrono::Utc::now().timestamp(),
            last_pathology: self.last_pathology.clone(),
        }
    }

    fn write_state(file: &mut File, state: &PeerState) -> Result<()> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        serde_json::to_writer(&mut *file, state)?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Take the marker before blocking on a fetch.  Best effort: when a peer
    /// already holds it, both daemons fetch and git's own locks mediate.
    pub fn enter_waiting(&mut self) {
        match self.try_acquire() {
            Ok(Some(mut file)) => {
                let state = self.state("waiting");
                if let Err(e) = Self::write_state(&mut file, &state) {
                    warn!(path = %self.path.display(), error = %e, "cannot publish waiting state");
                }
                self.held = Some(file);
            }
            Ok(None) => debug!(path = %self.path.display(), "marker held by a peer"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "cannot open peer marker"),
        }
    }

    /// Leave the wait: publish `active` and release the lock.
    pub fn leave_waiting(&mut self) {
        if let Some(mut file) = self.held.take() {
            let state = self.state("active");
            if let Err(e) = Self::write_state(&mut file, &state) {
                warn!(path = %self.path.display(), error = %e, "cannot publish active state");
            }
            // Dropping the handle releases the flock.
        }
    }

    /// Note the most recent pathology in the published payload.
    pub fn record_pathology(&mut self, name: &str) {
        self.last_pathology = Some(name.to_string());
        if let Ok(Some(mut file)) = self.try_acquire() {
            let state = self.state("active");
            let _ = Self::write_state(&mut file, &state);
        }
    }

    /// Is another deployer for the same cwd currently in its waiting state?
    pub fn peer_waiting(&self) -> bool {
        if self.held.is_some() {
            return false;
        }
        match self.try_acquire() {
            Ok(Some(_file)) => false,
            Ok(None) => match std::fs::read_to_string(&self.path) {
                Ok(text) => match serde_json::from_str::<PeerState>(&text) {
                    Ok(state) => state.state == "waiting" && state.cwd == self.cwd,
                    Err(_) => false,
                },
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    /// `Ok(Some(file))` with the exclusive lock held, `Ok(None)` when a peer
    /// has it.
    fn try_acquire(&self) -> Result<Option<File>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("cannot open {}", self.path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(_) => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_holder_is_visible_to_peers() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = tmp.path().join("work");

        let mut holder = PeerMarker::new(tmp.path(), &cwd);
        let observer = PeerMarker::new(tmp.path(), &cwd);

        assert!(!observer.peer_waiting(), "no one waits yet");

        holder.enter_waiting();
        assert!(observer.peer_waiting(), "holder is waiting");

        holder.leave_waiting();
        assert!(!observer.peer_waiting(), "lock released after the wait");
    }

    #[test]
    fn different_cwd_is_not_a_peer() {
        let tmp = tempfile::tempdir().unwrap();
        let mut holder = PeerMarker::new(tmp.path(), &tmp.path().join("a"));
        let observer = PeerMarker::new(tmp.path(), &tmp.path().join("b"));

        holder.enter_waiting();
        assert!(!observer.peer_waiting(), "other cwd means other deployment");
        holder.leave_waiting();
    }

    #[test]
    fn own_wait_is_not_a_peer() {
        let tmp = tempfile::tempdir().unwrap();
        let mut marker = PeerMarker::new(tmp.path(), tmp.path());
        marker.enter_waiting();
        assert!(!marker.peer_waiting());
        marker.leave_waiting();
    }

    #[test]
    fn payload_carries_pid_and_pathology() {
        let tmp = tempfile::tempdir().unwrap();
        let mut marker = PeerMarker::new(tmp.path(), tmp.path());
        marker.record_pathology("diverged");
        marker.enter_waiting();

        let text = std::fs::read_to_string(tmp.path().join("deploy-waiting.lock")).unwrap();
        let state: PeerState = serde_json::from_str(&text).unwrap();
        assert_eq!(state.pid, std::process::id());
        assert_eq!(state.state, "waiting");
        assert_eq!(state.last_pathology.as_deref(), Some("diverged"));
        marker.leave_waiting();
    }
}
