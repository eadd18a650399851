use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "portkeeper: supervise one process bound to a TCP port")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Use system-wide config (/etc/portkeeper/portkeeper.toml)
    #[arg(long, conflicts_with = "config", global = true)]
    pub system: bool,

    /// Override the configured port for this invocation. Command arguments
    /// that carry the configured port (`7080`, `--port=7080`, `host:7080`)
    /// are rewritten to the new one
    #[arg(long, short = 'p', global = true)]
    pub port: Option<u16>,

    /// Debug-level logging (RUST_LOG still takes precedence)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub sub: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Free the port, launch the process and wait until it listens (Exit 0 = listening, 1 = failed)
    Start,
    /// Stop the process (Exit 0 = stopped or was not running, 1 = could not stop)
    Stop,
    /// Stop then start (Exit code = start's)
    Restart,
    /// Report whether the process is running (Exit 0 = running, 1 = stopped)
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}
