//! Parser for the per-session IPC artifacts.
//!
//! Custom hooks may leave two files in `$IPC`: `pushinfo.log` (indented ref
//! records, one per block, blank-line separated) and `log.trace` (an
//! strace-style capture of the wire backend).  This module reconstructs the
//! approximate client/server byte streams from `read(0, ...)` and
//! `write(1, ...)` lines, strips the pkt-line framing, pulls out the
//! `want` / `have` object ids and the `agent=` capability, and emits one
//! structured record for post-hooks to consume.
//!
//! When `log.trace` is missing the record is conjured from `pushinfo.log`
//! alone and carries `synthetic: true` -- downstream hooks decide how much
//! to trust it.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// One ref update from `pushinfo.log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub name: String,
}

/// The structured record handed to post-hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRecord {
    /// Backend command seen in the trace's `execve` line.
    pub operation: Option<String>,
    pub wants: Vec<String>,
    pub haves: Vec<String>,
    pub agent: Option<String>,
    pub refs: Vec<RefUpdate>,
    pub exit_status: Option<i32>,
    /// True when no real trace existed and the record was conjured from
    /// `pushinfo.log`.
    pub synthetic: bool,
}

// ---------------------------------------------------------------------------
// pushinfo.log
// ---------------------------------------------------------------------------

/// Parse the indented `old new refname` records.
pub fn parse_pushinfo(text: &str) -> Vec<RefUpdate> {
    let mut refs = Vec::new();
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 {
            continue;
        }
        if is_object_id(tokens[0]) && is_object_id(tokens[1]) {
            refs.push(RefUpdate {
                old: tokens[0].to_string(),
                new: tokens[1].to_string(),
                name: tokens[2].to_string(),
            });
        }
    }
    refs
}

fn is_object_id(s: &str) -> bool {
    s.len() >= 7 && s.chars().all(|c| c.is_ascii_hexdigit())
}

const ZERO_PREFIX: &str = "0000000";

fn is_null_id(s: &str) -> bool {
    s.starts_with(ZERO_PREFIX) && s.chars().all(|c| c == '0')
}

// ---------------------------------------------------------------------------
// log.trace
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TraceStreams {
    /// Client -> server bytes (`read(0, ...)`).
    input: String,
    /// Server -> client bytes (`write(1, ...)`).
    output: String,
    operation: Option<String>,
    exit_status: Option<i32>,
}

fn parse_trace(text: &str) -> TraceStreams {
    let exited = Regex::new(r"\+\+\+ exited with (\d+) \+\+\+").expect("static regex");
    let mut streams = TraceStreams::default();

    for line in text.lines() {
        let line = line.trim_start();
        if line.starts_with("execve(") {
            if streams.operation.is_none() {
                streams.operation = extract_quoted(line).map(|raw| {
                    let path = unescape(raw);
                    path.rsplit('/').next().unwrap_or(&path).to_string()
                });
            }
        } else if line.starts_with("read(0,") {
            if let Some(raw) = extract_quoted(line) {
                streams.input.push_str(&unescape(raw));
            }
        } else if line.starts_with("write(1,") {
            if let Some(raw) = extract_quoted(line) {
                streams.output.push_str(&unescape(raw));
            }
        } else if let Some(caps) = exited.captures(line) {
            streams.exit_status = caps[1].parse().ok();
        }
    }
    streams
}

/// The first double-quoted argument of a trace line, escapes untouched.
fn extract_quoted(line: &str) -> Option<&str> {
    let start = line.find('"')? + 1;
    let rest = &line[start..];
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some(&rest[..i]);
        }
    }
    None
}

/// Undo strace's C-style escaping (`\n`, `\t`, `\"`, `\\`, `\xHH`, octal).
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some(d @ '0'..='7') => {
                // Octal escape, up to three digits total.
                let mut value = d.to_digit(8).expect("octal digit");
                for _ in 0..2 {
                    match chars.peek() {
                        Some(&n @ '0'..='7') => {
                            value = value * 8 + n.to_digit(8).expect("octal digit");
                            chars.next();
                        }
                        _ => break,
                    }
                }
                out.push((value as u8) as char);
            }
            Some('x') => {
                let mut hex = String::new();
                while hex.len() < 2 {
                    match chars.peek() {
                        Some(h) if h.is_ascii_hexdigit() => {
                            hex.push(*h);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    out.push(byte as char);
                }
            }
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

// ---------------------------------------------------------------------------
// pkt-line framing
// ---------------------------------------------------------------------------

/// Strip the four-hex-digit pkt-line length prefixes, concatenating the
/// payloads.  `0000`-`0002` are flush/delimiter packets with no payload.
/// Anything that stops looking like pkt-line is passed through raw.
pub fn strip_pkt_lines(stream: &str) -> String {
    let mut out = String::new();
    let mut i = 0;
    loop {
        let Some(prefix) = stream.get(i..i + 4) else {
            if let Some(rest) = stream.get(i..) {
                out.push_str(rest);
            }
            break;
        };
        if !prefix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            if let Some(rest) = stream.get(i..) {
                out.push_str(rest);
            }
            break;
        }
        let len = usize::from_str_radix(prefix, 16).expect("hex checked");
        if len <= 2 {
            // flush-pkt / delim-pkt / response-end
            i += 4;
            continue;
        }
        match stream.get(i + 4..i + len) {
            Some(payload) => {
                out.push_str(payload);
                i += len;
            }
            None => {
                if let Some(rest) = stream.get(i..) {
                    out.push_str(rest);
                }
                break;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Token extraction
// ---------------------------------------------------------------------------

fn extract_tokens(text: &str) -> (Vec<String>, Vec<String>, Option<String>) {
    let wants_re = Regex::new(r"\bwant ([0-9a-f]{7,40})").expect("static regex");
    let haves_re = Regex::new(r"\bhave ([0-9a-f]{7,40})").expect("static regex");
    let agent_re = Regex::new(r"agent=([^\s\x00]+)").expect("static regex");

    let wants = wants_re
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();
    let haves = haves_re
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();
    let agent = agent_re.captures(text).map(|c| c[1].to_string());
    (wants, haves, agent)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Build the structured record for one IPC directory.
pub fn parse_ipc_dir(dir: &Path) -> Result<IpcRecord> {
    let pushinfo_text = std::fs::read_to_string(dir.join("pushinfo.log")).unwrap_or_default();
    let refs = parse_pushinfo(&pushinfo_text);

    let trace_path = dir.join("log.trace");
    match std::fs::read_to_string(&trace_path) {
        Ok(trace_text) => {
            let streams = parse_trace(&trace_text);
            let both = format!(
                "{}\n{}",
                strip_pkt_lines(&streams.input),
                strip_pkt_lines(&streams.output),
            );
            let (wants, haves, agent) = extract_tokens(&both);
            Ok(IpcRecord {
                operation: streams.operation,
                wants,
                haves,
                agent,
                refs,
                exit_status: streams.exit_status,
                synthetic: false,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "no trace; conjuring a synthetic record");
            // Approximate what a receive-pack trace would have shown: the
            // new tips are what the client offered, the old ones what the
            // server already had.
            let wants = refs
                .iter()
                .filter(|r| !is_null_id(&r.new))
                .map(|r| r.new.clone())
                .collect();
            let haves = refs
                .iter()
                .filter(|r| !is_null_id(&r.old))
                .map(|r| r.old.clone())
                .collect();
            Ok(IpcRecord {
                operation: (!refs.is_empty()).then(|| "git-receive-pack".to_string()),
                wants,
                haves,
                agent: None,
                refs,
                exit_status: None,
                synthetic: true,
            })
        }
        Err(e) => Err(e).with_context(|| format!("cannot read {}", trace_path.display())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
