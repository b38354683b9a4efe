//! The CLI surface (spec.md §6 minimum: `serve --port P --config path`,
//! `replay-audit <session_id>`).

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "relay-server", version, about = "Experiment coordination server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Starts the coordinator and the axum listener.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Prints the persisted parity result for a finished session without
    /// starting a server.
    ReplayAudit {
        session_id: String,
        #[arg(long, default_value = "data")]
        audit_dir: String,
        #[arg(long, default_value = "default")]
        experiment_id: String,
    },
}
