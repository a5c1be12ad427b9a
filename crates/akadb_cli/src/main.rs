//! AkaDB CLI
//!
//! Launches and inspects AkaDB clusters.
//!
//! # Commands
//!
//! - `serve` - Run a cluster behind the HTTP server
//! - `dump-log` - Print a node's commit log from a data directory
//! - `version` - Show version information

mod commands;

use akadb_core::{IsolationLevel, NodeId};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// AkaDB multi-node record store.
#[derive(Parser)]
#[command(name = "akadb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster behind the HTTP server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Number of nodes; node 1 is central
        #[arg(long, default_value_t = 3)]
        nodes: u8,

        /// Node used when a request names none
        #[arg(long, default_value = "1")]
        local_node: NodeId,

        /// Persist commit logs under this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Startup isolation level
        #[arg(long, default_value = "READ COMMITTED")]
        isolation: IsolationLevel,

        /// Start in manual commit mode
        #[arg(long)]
        manual_commit: bool,

        /// Status probe timeout in milliseconds
        #[arg(long, default_value_t = 2000)]
        probe_timeout_ms: u64,

        /// Delivery attempts before a replication link is marked lagging
        #[arg(long, default_value_t = 5)]
        max_attempts: u32,
    },

    /// Print a node's commit log from a data directory
    DumpLog {
        /// Data directory the cluster was served from
        #[arg(long)]
        data_dir: PathBuf,

        /// Node whose log is printed
        #[arg(long, default_value = "1")]
        node: NodeId,

        /// Print only the most recent entries
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            bind,
            nodes,
            local_node,
            data_dir,
            isolation,
            manual_commit,
            probe_timeout_ms,
            max_attempts,
        } => {
            let options = commands::serve::ServeOptions {
                bind,
                nodes,
                local_node,
                data_dir,
                isolation,
                auto_commit: !manual_commit,
                probe_timeout_ms,
                max_attempts,
            };
            commands::serve::run(options)?;
        }
        Commands::DumpLog {
            data_dir,
            node,
            limit,
            format,
        } => {
            commands::dump_log::run(&data_dir, node, limit, &format)?;
        }
        Commands::Version => {
            println!("AkaDB v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
