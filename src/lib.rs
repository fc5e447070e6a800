/// # Static Server
///
/// A concurrent static file server. Connections are multiplexed over a
/// bounded worker pool; each one runs a small state machine that parses
/// requests incrementally, resolves them inside the document root through a
/// shared metadata cache, and streams file bodies in fixed-size chunks.
///
/// The `run` function initializes logging and serves until SIGINT/SIGTERM.
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod http;
pub mod logger;
pub mod parser;
pub mod range;
pub mod response;
pub mod server;
pub mod utils;

use crate::config::ServerConfig;
use crate::server::Server;
use clap::Parser;
use log::{debug, error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

/// Parses configuration, sets up logging and signal handling, and runs the
/// server until it is asked to stop.
///
/// The first SIGINT/SIGTERM starts a graceful drain; a second one exits
/// immediately. A missing document root is created with a default page; any
/// other failure to start (root is not a directory, bind error) is logged
/// and the process exits with status 1.
pub fn run() {
    let config = ServerConfig::parse();

    if let Err(e) = logger::init(&config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }
    debug!("Log filter set to: {}", config.log_level);

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Server error: {e}");
            std::process::exit(1);
        }
    };

    // Set once the first signal is seen; a second signal then exits at once.
    let signalled = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        let registered = signal_hook::flag::register_conditional_shutdown(
            signal,
            1,
            Arc::clone(&signalled),
        )
        .and_then(|_| signal_hook::flag::register(signal, Arc::clone(&signalled)));
        if let Err(e) = registered {
            warn!("Could not install handler for signal {signal}: {e}");
        }
    }

    let shutdown = server.shutdown_handle();
    let watcher = Signals::new([SIGINT, SIGTERM]).and_then(|mut signals| {
        thread::Builder::new()
            .name("static-server-signals".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!("Received signal {signal}, draining connections");
                    shutdown.trigger();
                }
            })
    });
    if let Err(e) = watcher {
        warn!("Could not watch for shutdown signals: {e}");
    }

    if let Err(e) = server.run(None) {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
