//! concord-hook: CLI hook handler for Concord session coordination.
//!
//! Called by the host's hook configuration once per event. Each call is a
//! fresh process: it opens the shared store, lets the kernel decide, prints
//! the host-facing response (if any) and exits.
//!
//! ## Subcommands
//!
//! - `handle`: Main hook handler, reads JSON from stdin
//! - `status`: Prints this session's coordination state as JSON
//! - `release`: Releases one file claim held by this session
//! - `cleanup`: Sweeps stale sessions, claims and workflow state now

mod commands;
mod handle;
mod logging;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "concord-hook")]
#[command(about = "Concord session coordination hook")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a hook event (reads JSON from stdin)
    Handle,

    /// Print the current session's coordination state
    Status {
        /// Session token as the host reports it
        #[arg(long)]
        session_id: Option<String>,

        /// Working directory used to resolve the project
        #[arg(long)]
        cwd: Option<String>,
    },

    /// Release a file claim held by the current session
    Release {
        /// File to release (absolute, or relative to the project root)
        #[arg(value_name = "FILE")]
        file: String,

        #[arg(long)]
        session_id: Option<String>,

        #[arg(long)]
        cwd: Option<String>,
    },

    /// Remove stale coordination state immediately
    Cleanup,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Handle => {
            // Only an unreadable stdin gets here; every other failure fails open.
            if let Err(e) = handle::run() {
                tracing::error!(error = %e, "concord-hook handle failed");
                std::process::exit(1);
            }
        }
        Commands::Status { session_id, cwd } => {
            if let Err(e) = commands::status(session_id.as_deref(), cwd.as_deref()) {
                eprintln!("concord-hook status: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Release {
            file,
            session_id,
            cwd,
        } => {
            if let Err(e) = commands::release(&file, session_id.as_deref(), cwd.as_deref()) {
                eprintln!("concord-hook release: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Cleanup => {
            if let Err(e) = commands::cleanup() {
                eprintln!("concord-hook cleanup: {}", e);
                std::process::exit(1);
            }
        }
    }
}
