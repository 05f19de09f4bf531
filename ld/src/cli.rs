//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// leased - durable lease store daemon
#[derive(Parser, Debug)]
#[command(
    name = "leased",
    version,
    about = "Lease-based work-item store: claim, update and recover entities"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Daemon socket (overrides ipc.socket-path)
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Serve,

    /// Check that the daemon is alive
    Ping,

    /// Ask the daemon to stop
    Shutdown,

    /// Acquire the lease on an entity
    Acquire {
        key: String,

        /// Lease holder name
        #[arg(short, long)]
        owner: String,

        /// Lease duration in seconds (default: lease.default-duration-secs)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Extend a held lease
    Renew {
        key: String,

        #[arg(short, long)]
        token: String,

        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Give up a held lease
    Release {
        key: String,

        #[arg(short, long)]
        token: String,
    },

    /// Show the active lease on an entity
    Lease { key: String },

    /// Print an entity
    Get { key: String },

    /// Fetch an entity and lease it in one step
    GetAndLease {
        key: String,

        #[arg(short, long)]
        owner: String,

        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Write an entity payload
    Put {
        key: String,

        /// Payload, stored as UTF-8 bytes
        payload: String,

        /// Version the write expects (0 creates the entity)
        #[arg(short = 'v', long = "expect", default_value_t = 0)]
        expected: u64,

        /// Only write while holding this lease token
        #[arg(short, long)]
        token: Option<String>,
    },

    /// Delete an entity
    Delete {
        key: String,

        #[arg(short = 'v', long = "expect")]
        expected: u64,

        /// Lease token, required while the entity is leased
        #[arg(short, long)]
        token: Option<String>,
    },

    /// List entities
    List {
        /// Only keys starting with this prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Claim a batch of unleased entities
    Claim {
        #[arg(short, long)]
        owner: String,

        /// Maximum number of entities to claim
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,

        #[arg(short, long)]
        duration: Option<u64>,

        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Run a recovery pass now
    Scan,
}
