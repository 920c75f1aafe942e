//! `upsdrvquery`: minimal CLI front-end to the tracked-request layer (C6),
//! for manually poking a running driver's socket or for other tools that
//! want a one-shot correlated query without linking the library directly.

use std::path::PathBuf;

use clap::Parser;
use log::error;

use upscore::logging;
use upscore::tracked::{self, Timeout, Verbosity};

#[derive(Parser)]
#[command(
    name = "upsdrvquery",
    about = "Send one tracked query to a driver's socket and print its status"
)]
struct Cli {
    /// Path to the driver's Unix-domain socket.
    #[arg(short = 's', long = "socket")]
    socket: PathBuf,

    /// Seconds to wait for the reply; 0 waits indefinitely (spec §4.6).
    #[arg(short = 't', long = "timeout", default_value_t = 2)]
    timeout_secs: i64,

    /// Send PING and drain leftover broadcasts before the real query.
    #[arg(long)]
    ping: bool,

    /// Suppress routine connect-failure logging (for opportunistic callers
    /// that expect the driver may not be running).
    #[arg(long)]
    hushed: bool,

    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// The query words, e.g. `INSTCMD load.off`.
    #[arg(required = true)]
    query: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    logging::init("upsdrvquery", cli.verbose);

    let verbosity = if cli.hushed { Verbosity::Hushed } else { Verbosity::Normal };
    let query = cli.query.join(" ");

    let mut client = match tracked::DriverClient::connect(&cli.socket, verbosity) {
        Ok(c) => c,
        Err(e) => {
            error!("connect to {}: {}", cli.socket.display(), e);
            std::process::exit(1);
        }
    };

    if let Err(e) = client.prepare(cli.ping, Timeout::new(2, 0)) {
        error!("prepare failed: {}", e);
        std::process::exit(1);
    }

    let status = client.request(&query, Timeout::new(cli.timeout_secs, 0));
    client.teardown();

    if status < 0 {
        error!("tracked query {:?} failed (code {})", query, status);
        std::process::exit(1);
    }

    println!("{}", status);
    std::process::exit(if status > 255 { 255 } else { status });
}
