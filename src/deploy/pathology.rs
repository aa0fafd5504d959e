//! The pathology catalog: an ordered `regex -> action` table classifying
//! the combined output of one fetch/checkout/rebase round.
//!
//! Git's phrasing changes between versions, so the catalog is data, not
//! code: the built-in table can be dumped as YAML and swapped wholesale via
//! `--pathologies <file>`.  Classification walks the rules in order; when
//! none match, the output is benign only if it carries one of the known
//! harmless markers, otherwise the daemon treats it as a condition an
//! operator has to look at.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Actions and specs
// ---------------------------------------------------------------------------

/// What the daemon does when a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathologyAction {
    /// Remote host key changed; optionally repairable with `--fix-nasty`.
    NastyHostKey,
    /// Local branch diverged from its upstream; hard reset.
    Diverged,
    /// Unstaged changes block the rebase.
    Unstaged,
    /// An index/ref lock file is in the way.
    LockCollision,
    /// A leftover `rebase-apply` directory from a dead rebase.
    StaleRebaseApply,
    /// Nothing new; wait for the next push.
    UpToDate,
}

/// Serialized form of one rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub pattern: String,
    pub action: PathologyAction,
}

/// Serialized form of the whole table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub rules: Vec<RuleSpec>,
    /// Substrings that mark otherwise-unmatched output as harmless.
    pub benign: Vec<String>,
}

// ---------------------------------------------------------------------------
// Compiled table
// ---------------------------------------------------------------------------

/// How one round of output was classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Matched {
        action: PathologyAction,
        name: String,
        /// First capture group, when the rule has one (lock path,
        /// rebase-apply directory).
        capture: Option<String>,
    },
    Benign,
    Unrecognized,
}

pub struct PathologyTable {
    rules: Vec<(RuleSpec, Regex)>,
    benign: Vec<String>,
}

impl PathologyTable {
    /// The catalog matching current Git phrasing.
    pub fn builtin_spec() -> TableSpec {
        let rule = |name: &str, pattern: &str, action| RuleSpec {
            name: name.to_string(),
            pattern: pattern.to_string(),
            action,
        };
        TableSpec {
            rules: vec![
                rule(
                    "nasty-host-key",
                    r"POSSIBLE.*SOMEONE.*DOING.*NASTY",
                    PathologyAction::NastyHostKey,
                ),
                rule(
                    "diverged",
                    r"Your branch.*diverged",
                    PathologyAction::Diverged,
                ),
                rule(
                    "unstaged",
                    r"You have unstaged changes",
                    PathologyAction::Unstaged,
                ),
                rule(
                    "lock-collision",
                    r"fatal: Unable to create '(.+)': File exists\.",
                    PathologyAction::LockCollision,
                ),
                rule(
                    "stale-rebase-apply",
                    r"please rm -fr (/.*\.git/rebase-apply)",
                    PathologyAction::StaleRebaseApply,
                ),
                rule(
                    "up-to-date",
                    r"Current branch.*is up to date",
                    PathologyAction::UpToDate,
                ),
            ],
            benign: [
                "rewinding head to replay",
                "fast-forward",
                "Fast-forwarded",
                "but expected",
                "Unpacking objects",
                "Cannot rebase",
                "ecent commit",
                "Successfully rebased",
                "Already up to date",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::from_spec(Self::builtin_spec()).expect("builtin table compiles")
    }

    pub fn from_spec(spec: TableSpec) -> Result<Self> {
        let mut rules = Vec::with_capacity(spec.rules.len());
        for rule in spec.rules {
            let regex = Regex::new(&rule.pattern)
                .with_context(|| format!("bad pattern in rule {:?}", rule.name))?;
            rules.push((rule, regex));
        }
        Ok(Self {
            rules,
            benign: spec.benign,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let spec: TableSpec = serde_yaml::from_str(text).context("bad pathology table YAML")?;
        Self::from_spec(spec)
    }

    /// Built-in table unless an override file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::builtin()),
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("cannot read pathology table {}", p.display()))?;
                Self::from_yaml(&text)
            }
        }
    }

    /// YAML rendering of the built-in table, the format `load` accepts.
    pub fn builtin_yaml() -> String {
        serde_yaml::to_string(&Self::builtin_spec()).expect("builtin table serializes")
    }

    /// Walk the rules in order; fall through to the benign-marker check.
    pub fn classify(&self, output: &str) -> Classification {
        for (spec, regex) in &self.rules {
            if let Some(caps) = regex.captures(output) {
                return Classification::Matched {
                    action: spec.action,
                    name: spec.name.clone(),
                    capture: caps.get(1).map(|m| m.as_str().to_string()),
                };
            }
        }
        if output.trim().is_empty() || self.benign.iter().any(|m| output.contains(m.as_str())) {
            Classification::Benign
        } else {
            Classification::Unrecognized
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(output: &str) -> Classification {
        PathologyTable::builtin().classify(output)
    }

    #[test]
    fn nasty_host_key_detected() {
        let out = "\
@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@
@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @
@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@
IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!
";
        match classify(out) {
            Classification::Matched { action, .. } => {
                assert_eq!(action, PathologyAction::NastyHostKey);
            }
            other => panic!("expected nasty-host-key, got {other:?}"),
        }
    }

    #[test]
    fn diverged_and_unstaged() {
        assert!(matches!(
            classify("Your branch and 'origin/main' have diverged,"),
            Classification::Matched {
                action: PathologyAction::Diverged,
                ..
            }
        ));
        assert!(matches!(
            classify("error: cannot rebase: You have unstaged changes."),
            Classification::Matched {
                action: PathologyAction::Unstaged,
                ..
            }
        ));
    }

    #[test]
    fn lock_collision_captures_the_path() {
        let out = "fatal: Unable to create '/repo/.git/index.lock': File exists.";
        match classify(out) {
            Classification::Matched {
                action, capture, ..
            } => {
                assert_eq!(action, PathologyAction::LockCollision);
                assert_eq!(capture.as_deref(), Some("/repo/.git/index.lock"));
            }
            other => panic!("expected lock-collision, got {other:?}"),
        }
    }

    #[test]
    fn stale_rebase_apply_captures_the_dir() {
        let out = "\
It seems that there is already a rebase-apply directory, and
I wonder if you are in the middle of another rebase.  If that is the
case, please try
	git rebase (--continue | --abort | --skip)
If that is not the case, please rm -fr /repo/.git/rebase-apply
and run me again.
";
        match classify(out) {
            Classification::Matched {
                action, capture, ..
            } => {
                assert_eq!(action, PathologyAction::StaleRebaseApply);
                assert_eq!(capture.as_deref(), Some("/repo/.git/rebase-apply"));
            }
            other => panic!("expected stale-rebase-apply, got {other:?}"),
        }
    }

    #[test]
    fn up_to_date_wins_over_fallthrough() {
        assert!(matches!(
            classify("Current branch main is up to date."),
            Classification::Matched {
                action: PathologyAction::UpToDate,
                ..
            }
        ));
    }

    #[test]
    fn benign_markers_keep_the_loop_alive() {
        assert_eq!(
            classify("First, rewinding head to replay your work on top of it..."),
            Classification::Benign
        );
        assert_eq!(
            classify("Successfully rebased and updated refs/heads/main."),
            Classification::Benign
        );
        assert_eq!(classify(""), Classification::Benign);
    }

    #[test]
    fn unknown_output_is_unrecognized() {
        assert_eq!(
            classify("error: unable to write file deploy/target (Permission denied)"),
            Classification::Unrecognized
        );
    }

    #[test]
    fn yaml_roundtrip_preserves_order() {
        let yaml = PathologyTable::builtin_yaml();
        let table = PathologyTable::from_yaml(&yaml).unwrap();
        assert!(matches!(
            table.classify("Current branch x is up to date."),
            Classification::Matched {
                action: PathologyAction::UpToDate,
                ..
            }
        ));
    }

    #[test]
    fn override_table_replaces_builtin() {
        let yaml = "\
rules:
  - name: custom
    pattern: 'my custom failure'
    action: unstaged
benign: []
";
        let table = PathologyTable::from_yaml(yaml).unwrap();
        assert!(matches!(
            table.classify("my custom failure"),
            Classification::Matched {
                action: PathologyAction::Unstaged,
                ..
            }
        ));
        // The built-in rules are gone.
        assert_eq!(
            table.classify("Current branch main is up to date."),
            Classification::Unrecognized
        );
    }

    #[test]
    fn bad_pattern_is_reported() {
        let yaml = "\
rules:
  - name: broken
    pattern: '(['
    action: diverged
benign: []
";
        assert!(PathologyTable::from_yaml(yaml).is_err());
    }
}
