//! Command-line surface.

use clap::{Parser, Subcommand};

use crate::config::{AgentConfig, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "outpost", about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the cloud-side management server against the current cluster.
    Server(ServerConfig),

    /// Run an edge agent that mirrors its entitled resources locally.
    Agent(AgentConfig),
}
