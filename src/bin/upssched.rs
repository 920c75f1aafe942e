//! `upssched`: invoked by a monitoring client (e.g. on a power-state
//! change) with `UPSNAME`/`NOTIFYTYPE` in the environment. Resolves the
//! matching `AT` directives from its config file and, for each one, either
//! runs the command directly (`EXECUTE`) or relays a timer request to the
//! scheduler daemon, spawning it on demand if nothing is listening yet.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{debug, error};

use upscore::codec::{self, Feed};
use upscore::config::{Action, SchedConfig};
use upscore::dispatch::{ExecuteHook, ScriptHook};
use upscore::{logging, spawn, UpsError};

/// Timeout on a single reply read from the daemon. Not specified for this
/// socket in the spec (only the tracked-request layer's timeouts are); the
/// scheduler's own frames are tiny and answered immediately, so a short
/// fixed bound is enough to avoid hanging on a wedged daemon.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "upssched",
    about = "Relay a UPS notification to the scheduler daemon's timer/command actions"
)]
struct Cli {
    /// Path to upssched.conf.
    #[arg(short = 'c', long = "config", default_value = "/etc/nut/upssched.conf")]
    config: PathBuf,

    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init("upssched", cli.verbose);

    if let Err(e) = run(&cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> upscore::Result<()> {
    let upsname = std::env::var("UPSNAME")
        .map_err(|_| UpsError::Environment("UPSNAME must be set in the environment".into()))?;
    let notifytype = std::env::var("NOTIFYTYPE")
        .map_err(|_| UpsError::Environment("NOTIFYTYPE must be set in the environment".into()))?;

    let cfg = SchedConfig::load(&cli.config)?;
    let actions = cfg.actions_for(&upsname, &notifytype);
    if actions.is_empty() {
        debug!("no AT entry matches {} / {}", upsname, notifytype);
        return Ok(());
    }

    let mut conn: Option<UnixStream> = None;

    for action in actions {
        match action {
            Action::Execute { command } => {
                let hook = ScriptHook {
                    cmdscript: cfg.cmdscript.clone(),
                };
                hook.execute(&command);
            }
            Action::StartTimer { name, seconds } => {
                let stream = ensure_conn(&mut conn, &cfg, cli.verbose)?;
                send_frame_and_await_reply(stream, &[&"START".to_string(), &name, &seconds])?;
            }
            Action::CancelTimer { name, fallback } => {
                let stream = ensure_conn(&mut conn, &cfg, cli.verbose)?;
                let cancel = "CANCEL".to_string();
                let mut args = vec![&cancel, &name];
                if let Some(ref f) = fallback {
                    args.push(f);
                }
                send_frame_and_await_reply(stream, &args)?;
            }
        }
    }

    Ok(())
}

fn ensure_conn<'a>(
    conn: &'a mut Option<UnixStream>,
    cfg: &SchedConfig,
    verbose: bool,
) -> upscore::Result<&'a mut UnixStream> {
    if conn.is_none() {
        let stream =
            spawn::ensure_connected(&cfg.pipefn, &cfg.lockfn, &cfg.cmdscript, verbose)?;
        stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .map_err(UpsError::from)?;
        *conn = Some(stream);
    }
    Ok(conn.as_mut().expect("just populated"))
}

fn send_frame_and_await_reply(stream: &mut UnixStream, args: &[&String]) -> upscore::Result<()> {
    let line: String = args
        .iter()
        .map(|a| codec::encode_token(a.as_str()))
        .collect::<Vec<_>>()
        .join(" ");
    stream
        .write_all(format!("{}\n", line).as_bytes())
        .map_err(UpsError::from)?;

    let mut parser = codec::Parser::new();
    let mut buf = [0u8; 128];
    loop {
        let n = stream.read(&mut buf).map_err(UpsError::from)?;
        if n == 0 {
            return Err(UpsError::PeerTransport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "scheduler daemon closed the connection",
            )));
        }
        for &b in &buf[..n] {
            match parser.feed(b) {
                Feed::Complete(reply) => {
                    debug!("scheduler replied: {:?}", reply);
                    return Ok(());
                }
                Feed::Error(msg) => {
                    return Err(UpsError::PeerProtocol(msg.to_string()));
                }
                Feed::Pending => {}
            }
        }
    }
}
