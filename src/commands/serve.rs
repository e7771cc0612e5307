//! Serve command implementation
//!
//! The privileged helper. Owns every device session, runs the fan control
//! loops and answers requests on stdin/stdout until the client leaves.

use crate::commands::{open_gateway, spawn_control_loops};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::ipc::{serve, SessionEnd};
use crate::services::TelemetryFeed;

use std::io;

/// Execute the `serve` subcommand
pub fn run_serve(config: &Config) -> Result<()> {
    let gateway = open_gateway(config)?;
    let feed = TelemetryFeed::new();
    let devices = gateway.device_indices();
    let mut loops = spawn_control_loops(&gateway, &devices, config, &feed)?;

    // Ctrl-C in the client's terminal reaches this process too. The client
    // handles it and ends the session, which is what stops us.
    ctrlc::set_handler(|| log::debug!("Ignoring interrupt; waiting for the client")).map_err(|e| {
        AppError::Io(io::Error::other(format!("Failed to set signal handler: {}", e)))
    })?;

    log::info!("Serving {} GPU(s)", devices.len());
    let stdin = io::stdin();
    let stdout = io::stdout();
    let ended = serve(stdin.lock(), stdout.lock(), &gateway, &feed);

    for control in &mut loops {
        control.stop();
    }

    // Unconditional: also after a broken session
    if let Err(e) = gateway.release_fans() {
        log::error!("Failed to restore automatic fan control: {}", e);
    }

    match ended? {
        SessionEnd::Eof => log::info!("Client disconnected"),
        SessionEnd::Shutdown => log::info!("Shutdown requested"),
    }
    Ok(())
}
