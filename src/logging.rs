//! Ambient logging setup shared by both binaries: human-readable output on
//! a terminal, syslog once detached (the normal way this daemon runs, spawned
//! on demand with no controlling tty).

use std::io::IsTerminal;

use log::LevelFilter;

/// Install a `log` backend appropriate to how this process was started.
/// `process_name` becomes the syslog tag.
pub fn init(process_name: &str, verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    if std::io::stderr().is_terminal() {
        env_logger::Builder::new().filter_level(level).init();
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: process_name.to_string(),
        pid: std::process::id() as i32,
    };

    match syslog::unix(formatter) {
        Ok(logger) => {
            let boxed = Box::new(syslog::BasicLogger::new(logger));
            if log::set_boxed_logger(boxed).is_ok() {
                log::set_max_level(level);
                return;
            }
        }
        Err(e) => eprintln!("{}: could not connect to syslog: {}", process_name, e),
    }

    // Syslog unavailable (e.g. sandboxed test run); fall back rather than
    // running with no logger at all.
    env_logger::Builder::new().filter_level(level).init();
}
