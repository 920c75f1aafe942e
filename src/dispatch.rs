//! Command dispatcher (C4): maps parsed frames to actions against the
//! timer queue, or to the execute hook.

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};

use log::{error, info, warn};

use crate::timer::TimerQueue;

/// A recognized (or not) frame from the scheduler socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Start { name: String, seconds: String },
    Cancel { name: String, fallback: Option<String> },
    Ping,
    NoBroadcast,
    Logout,
    DumpAll,
    Unknown(Vec<String>),
}

impl Frame {
    pub fn parse(args: &[String]) -> Frame {
        if args.is_empty() {
            return Frame::Unknown(args.to_vec());
        }
        match args[0].as_str() {
            "CANCEL" if args.len() >= 2 => Frame::Cancel {
                name: args[1].clone(),
                fallback: args.get(2).cloned(),
            },
            "START" if args.len() >= 3 => Frame::Start {
                name: args[1].clone(),
                seconds: args[2].clone(),
            },
            "PING" => Frame::Ping,
            "NOBROADCAST" => Frame::NoBroadcast,
            "LOGOUT" => Frame::Logout,
            "DUMPALL" => Frame::DumpAll,
            _ => Frame::Unknown(args.to_vec()),
        }
    }
}

/// The caller-supplied action invoked with a timer/command name on timer
/// expiry or on cancel-with-fallback. Runs synchronously on the event loop
/// thread and may block — a known backpressure point, documented rather
/// than hidden.
pub trait ExecuteHook {
    fn execute(&self, name: &str);
}

/// Binds the hook to `<cmdscript> <name>` as two separate `argv` entries
/// (never a shell string — see the spec's redesign note on the original's
/// shell-substitution quoting hazard).
pub struct ScriptHook {
    pub cmdscript: std::path::PathBuf,
}

impl ExecuteHook for ScriptHook {
    fn execute(&self, name: &str) {
        info!("event: {}", name);
        match Command::new(&self.cmdscript).arg(name).status() {
            Ok(status) => log_child_status(&self.cmdscript, name, status),
            Err(e) => error!(
                "execute command failure: {} {}: {}",
                self.cmdscript.display(),
                name,
                e
            ),
        }
    }
}

fn log_child_status(cmdscript: &std::path::Path, name: &str, status: ExitStatus) {
    if let Some(code) = status.code() {
        if code != 0 {
            info!(
                "exec_cmd({} {}) returned {}",
                cmdscript.display(),
                name,
                code
            );
        }
    } else if let Some(sig) = status.signal() {
        warn!(
            "exec_cmd({} {}) terminated with signal {}",
            cmdscript.display(),
            name,
            sig
        );
    }
}

/// Reply emitted for a given frame once its state-mutating side effects
/// (if any) have run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Pong,
    DumpDone,
    ErrUnknown,
    /// No reply is sent and the connection should be closed after this.
    CloseAfter(Box<Reply>),
}

/// Apply one frame's semantics against the timer queue and execute hook.
/// Returns the reply to send, or `None` for frames (currently none) that
/// don't reply at all.
pub fn dispatch(frame: &Frame, timers: &mut TimerQueue, hook: &dyn ExecuteHook) -> Reply {
    match frame {
        Frame::Start { name, seconds } => {
            timers.insert_from_str(name, seconds);
            Reply::Ok
        }
        Frame::Cancel { name, fallback } => {
            let found = timers.cancel_first(name);
            if !found {
                if let Some(cmd) = fallback {
                    if !cmd.is_empty() {
                        info!("cancel {}, event: {}", name, cmd);
                        hook.execute(cmd);
                    }
                }
            }
            Reply::Ok
        }
        Frame::Ping => Reply::Pong,
        Frame::NoBroadcast => Reply::Ok,
        Frame::Logout => Reply::CloseAfter(Box::new(Reply::Ok)),
        Frame::DumpAll => Reply::DumpDone,
        Frame::Unknown(args) => {
            info!("unknown command on socket: {:?}", args);
            Reply::ErrUnknown
        }
    }
}

impl Reply {
    /// Render this reply as the line(s) of text to write to the
    /// connection (without trailing `\n`; the registry's `write_line`
    /// appends it).
    pub fn as_text(&self) -> &'static str {
        match self {
            Reply::Ok => "OK",
            Reply::Pong => "PONG",
            Reply::DumpDone => "DUMPDONE",
            Reply::ErrUnknown => "ERR UNKNOWN",
            Reply::CloseAfter(inner) => inner.as_text(),
        }
    }
}
