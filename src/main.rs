//! dimutex: distributed mutual exclusion with consistent global snapshots.
//!
//! Spawns every peer of a Ricart–Agrawala group inside this process, each
//! with its own TCP link and its own event loop, plus a workload thread
//! per peer that cycles through the critical section. Chandy–Lamport
//! snapshots are taken round-robin once a second and dumped per peer; on
//! SIGINT/SIGTERM the dumps are replayed and checked for safety
//! violations, and the exit code reports the outcome.

mod link;
mod mutex;
mod snapshot;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use link::TcpLink;
use mutex::{AppHandle, AppRequest, MutexNode, PeerGroup};
use snapshot::{verify_all, DumpParser};

/// Output file the workload threads mark their critical sections in.
const WORKLOAD_OUT: &str = "mxOUT.txt";

/// Distributed mutual exclusion with consistent global snapshots.
#[derive(Parser, Debug)]
#[command(name = "dimutex")]
struct Args {
    /// Enable debug logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Count RESP_OK twice at peer 0, provoking a safety violation the
    /// verifier must catch.
    #[arg(short = 'f', long = "fail")]
    fail: bool,

    /// Listen addresses of every peer, in id order. At least two.
    #[arg(required = true, num_args = 2..)]
    addresses: Vec<String>,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let n = args.addresses.len();
    let dump_dir = PathBuf::from(".");

    for id in 0..n {
        let group = PeerGroup::new(args.addresses.clone(), id);
        let handle = match TcpLink::bind(group.self_addr()) {
            Ok(handle) => handle,
            Err(e) => {
                error!(id, addr = group.self_addr(), "failed to bind link: {}", e);
                process::exit(1);
            }
        };

        let (mut node, app) = MutexNode::new(group, handle, dump_dir.clone());
        if args.fail && id == 0 {
            warn!(id, "failure injection enabled: permissions counted twice");
            node = node.with_failure_injection();
        }

        thread::spawn(move || node.run());
        thread::spawn(move || worker(id, app));
    }

    wait_for_signal();

    info!("replaying snapshot dumps");
    let parser = match DumpParser::load(&dump_dir, n) {
        Ok(parser) => parser,
        Err(e) => {
            error!("snapshot replay failed: {}", e);
            process::exit(1);
        }
    };

    match verify_all(parser.records()) {
        Ok(sets) => {
            info!(sets, "no inconsistencies detected in snapshots");
        }
        Err(e) => {
            error!("inconsistency detected in snapshots: {}", e);
            process::exit(1);
        }
    }
}

/// The application workload: request entry, hold the critical section
/// long enough to append its `|` `.` pair to the shared output file,
/// release, repeat. Interleaved pairs in the file would mean two holders.
fn worker(id: usize, app: AppHandle) {
    // Give every peer time to bind before the first request fans out.
    thread::sleep(Duration::from_secs(2));

    let mut file = match OpenOptions::new()
        .append(true)
        .create(true)
        .open(WORKLOAD_OUT)
    {
        Ok(file) => file,
        Err(e) => {
            error!(id, "failed opening {}: {}", WORKLOAD_OUT, e);
            return;
        }
    };

    loop {
        if app.req.send(AppRequest::Enter).is_err() {
            return;
        }
        if app.grant.recv().is_err() {
            return;
        }

        if let Err(e) = write!(file, "|").and_then(|_| write!(file, ".")) {
            error!(id, "failed writing to {}: {}", WORKLOAD_OUT, e);
            return;
        }

        if app.req.send(AppRequest::Exit).is_err() {
            return;
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

/// Block until SIGINT or SIGTERM.
fn wait_for_signal() {
    let (tx, rx) = bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    }) {
        error!("failed installing signal handler: {}", e);
        process::exit(1);
    }
    let _ = rx.recv();
    info!("shutdown signal received");
}
