use std::io;
use std::process::ExitCode;

use scgi_server::server::State;
use scgi_server::{Config, Server};


// A single thread is plenty for the echo responder; the event loop never
// blocks on a single connection.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let mut server = Server::new(Config::default());
    let mut states = server.subscribe();

    let local = match server.start() {
        Ok(addr) => addr,
        Err(e) => {
            let error: &dyn std::error::Error = &e;
            tracing::error!(error, "unable to start SCGI server");
            return ExitCode::FAILURE;
        },
    };
    println!("SCGI server ready on {local}");

    // Serve until we receive a quit signal or the server stops on its own
    let res = tokio::select! {
        biased;  // poll in order, so quit() future first
        r = quit() => r,
        r = states.wait_for(|s| *s == State::Idle) => {
            r.map(|_| ()).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        },
    };
    if let Err(e) = res {
        let error: &dyn std::error::Error = &e;
        tracing::error!(error, "waiting for shutdown failed");
    }

    // Close the listener and any open connections before exiting the runtime
    tracing::info!("shutting down");
    server.stop().await;
    match server.last_error() {
        Some(_) => ExitCode::FAILURE,
        None => ExitCode::SUCCESS,
    }
}


/// Waits for a signal to shut the SCGI server down.
#[cfg(not(unix))]
fn quit() -> impl std::future::Future<Output = io::Result<()>> {
    tokio::signal::ctrl_c()
}

/// Waits for a signal to shut the SCGI server down.
#[cfg(unix)]
async fn quit() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}


/// Sets up a basic `tracing` subscriber to stderr. Its verbosity level is
/// configured with the `RUST_LOG` environment variable.
fn init_tracing() {
    use tracing_subscriber::{filter::LevelFilter, fmt};
    let max_level = match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => match var.parse::<LevelFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Ignoring `RUST_LOG={var}`: {e}");
                LevelFilter::INFO
            },
        },
        Ok(_) | Err(std::env::VarError::NotPresent) => LevelFilter::INFO,
        Err(e) => {
            eprintln!("Ignoring `RUST_LOG`: {e}");
            LevelFilter::INFO
        },
    };

    fmt::fmt()
        .with_timer(fmt::time::uptime())
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();
}
