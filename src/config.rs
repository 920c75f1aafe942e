//! `upssched.conf` grammar (§6 of the spec): `CMDSCRIPT`, `PIPEFN`,
//! `LOCKFN` must precede any `AT` line; `AT <notify-type> <upsname> <verb>
//! <arg1> [<arg2>]`. This is the minimum grammar the scheduler requires —
//! everything else about config-file parsing is out of scope.
//!
//! Reuses the line codec (C1) to tokenize each config line, the same way
//! the original source's single `pconf_*` parser backs both the config
//! file and the socket wire protocol.

use std::fs;
use std::path::{Path, PathBuf};

use crate::codec::{Feed, Parser};
use crate::error::{Result, UpsError};

/// One `AT` directive's action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    StartTimer,
    CancelTimer,
    Execute,
}

#[derive(Debug, Clone)]
pub struct AtEntry {
    pub notify_type: String,
    pub upsname: String,
    pub verb: Verb,
    pub arg1: String,
    pub arg2: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchedConfig {
    pub cmdscript: PathBuf,
    pub pipefn: PathBuf,
    pub lockfn: PathBuf,
    pub entries: Vec<AtEntry>,
}

/// A resolved action to take for a given `(upsname, notify_type)` pair, in
/// the order the matching `AT` lines appeared in the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    StartTimer { name: String, seconds: String },
    CancelTimer { name: String, fallback: Option<String> },
    Execute { command: String },
}

fn tokenize_line(line: &str) -> Vec<String> {
    let mut p = Parser::new();
    let mut out = Vec::new();
    for b in line.bytes() {
        if let Feed::Complete(args) = p.feed(b) {
            out = args;
        }
    }
    if let Feed::Complete(args) = p.feed(b'\n') {
        out = args;
    }
    out
}

impl SchedConfig {
    pub fn load(path: &Path) -> Result<SchedConfig> {
        let text = fs::read_to_string(path)
            .map_err(|e| UpsError::Configuration(format!("reading {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<SchedConfig> {
        let mut cmdscript: Option<PathBuf> = None;
        let mut pipefn: Option<PathBuf> = None;
        let mut lockfn: Option<PathBuf> = None;
        let mut entries = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let args = tokenize_line(raw);
            if args.is_empty() {
                continue;
            }
            match args[0].as_str() {
                "CMDSCRIPT" if args.len() >= 2 => cmdscript = Some(PathBuf::from(&args[1])),
                "PIPEFN" if args.len() >= 2 => pipefn = Some(PathBuf::from(&args[1])),
                "LOCKFN" if args.len() >= 2 => lockfn = Some(PathBuf::from(&args[1])),
                "AT" if args.len() >= 5 => {
                    if cmdscript.is_none() {
                        return Err(UpsError::Configuration(
                            "CMDSCRIPT must be set before any ATs in the config file!".into(),
                        ));
                    }
                    if pipefn.is_none() {
                        return Err(UpsError::Configuration(
                            "PIPEFN must be set before any ATs in the config file!".into(),
                        ));
                    }
                    if lockfn.is_none() {
                        return Err(UpsError::Configuration(
                            "LOCKFN must be set before any ATs in the config file!".into(),
                        ));
                    }
                    let verb = match args[3].as_str() {
                        "START-TIMER" => Verb::StartTimer,
                        "CANCEL-TIMER" => Verb::CancelTimer,
                        "EXECUTE" => Verb::Execute,
                        other => {
                            return Err(UpsError::Configuration(format!(
                                "invalid command: {}",
                                other
                            )))
                        }
                    };
                    entries.push(AtEntry {
                        notify_type: args[1].clone(),
                        upsname: args[2].clone(),
                        verb,
                        arg1: args[4].clone(),
                        arg2: args.get(5).cloned(),
                    });
                }
                _ => {
                    log::warn!("upssched.conf:{}: invalid directive: {:?}", lineno + 1, args);
                }
            }
        }

        Ok(SchedConfig {
            cmdscript: cmdscript.ok_or_else(|| {
                UpsError::Configuration("CMDSCRIPT must be set before any ATs in the config file!".into())
            })?,
            pipefn: pipefn.ok_or_else(|| {
                UpsError::Configuration("PIPEFN must be set before any ATs in the config file!".into())
            })?,
            lockfn: lockfn.ok_or_else(|| {
                UpsError::Configuration("LOCKFN must be set before any ATs in the config file!".into())
            })?,
            entries,
        })
    }

    /// Resolve the actions that apply to the given upsname/notify_type
    /// pair, in config-file order. `*` in the `AT` line's upsname matches
    /// any `upsname`; notify-type matching is case-insensitive.
    pub fn actions_for(&self, upsname: &str, notify_type: &str) -> Vec<Action> {
        self.entries
            .iter()
            .filter(|e| e.upsname == upsname || e.upsname == "*")
            .filter(|e| e.notify_type.eq_ignore_ascii_case(notify_type))
            .map(|e| match e.verb {
                Verb::StartTimer => Action::StartTimer {
                    name: e.arg1.clone(),
                    seconds: e.arg2.clone().unwrap_or_default(),
                },
                Verb::CancelTimer => Action::CancelTimer {
                    name: e.arg1.clone(),
                    fallback: e.arg2.clone(),
                },
                Verb::Execute => Action::Execute {
                    command: e.arg1.clone(),
                },
            })
            .collect()
    }
}
