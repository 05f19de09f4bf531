//! leased - lease store daemon
//!
//! CLI entry point: runs the daemon or talks to a running one.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::{debug, info};

use leased::cli::{Cli, Command};
use leased::config::{Config, data_dir};
use leased::daemon;
use leased::ipc::{ClientError, LeaseClient};
use leasestore::{Entity, Lease, Version};

fn parse_level(level: Option<&str>) -> tracing::Level {
    match level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some("INFO") | None => tracing::Level::INFO,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    }
}

/// The daemon logs to a file; client commands log warnings to stderr
fn setup_logging(to_file: bool, log_level: Option<&str>) -> Result<()> {
    let level = match (to_file, log_level) {
        (false, None) => tracing::Level::WARN,
        _ => parse_level(log_level),
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if to_file {
        let log_dir = data_dir().join("logs");
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        let log_file = fs::File::create(log_dir.join("leased.log")).context("Failed to create log file")?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let serving = matches!(cli.command, Command::Serve);
    setup_logging(serving, cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let socket_path: PathBuf = cli.socket.clone().unwrap_or_else(|| config.ipc.socket_path.clone());

    debug!(command = ?cli.command, "main: dispatching command");
    if serving {
        info!(?socket_path, "leased starting");
        return daemon::run(config, socket_path).await;
    }

    let client = LeaseClient::with_socket_path(socket_path)
        .with_timeout(config.ipc.timeout())
        .with_retry(config.retry.clone());

    run_client_command(&client, cli.command).await.map_err(|e| match e {
        ClientError::Transport(msg) if !client.socket_exists() => eyre::eyre!(
            "{} (no socket at {}; is the daemon running?)",
            msg,
            client.socket_path().display()
        ),
        other => other.into(),
    })
}

async fn run_client_command(client: &LeaseClient, command: Command) -> Result<(), ClientError> {
    match command {
        Command::Serve => {
            return Err(ClientError::Daemon("serve runs the daemon itself".to_string()));
        }

        Command::Ping => {
            let version = client.ping().await?;
            println!("{} Daemon is alive (version {})", "✓".green(), version);
        }

        Command::Shutdown => {
            client.shutdown().await?;
            println!("{} Daemon stopping", "✓".green());
        }

        Command::Acquire { key, owner, duration } => {
            let lease = client.acquire(&key, &owner, duration).await?;
            print_lease(&key, &lease);
        }

        Command::Renew { key, token, duration } => {
            let expires_at = client.renew(&key, &token, duration).await?;
            println!("{} Renewed {} until {}", "✓".green(), key.cyan(), format_expiry(expires_at));
        }

        Command::Release { key, token } => {
            client.release(&key, &token).await?;
            println!("{} Released {}", "✓".green(), key.cyan());
        }

        Command::Lease { key } => match client.current_lease(&key).await? {
            Some(lease) => print_lease(&key, &lease),
            None => println!("{} is not leased", key.cyan()),
        },

        Command::Get { key } => {
            let entity = client.get(&key).await?;
            print_entity(&entity);
        }

        Command::GetAndLease { key, owner, duration } => {
            let (entity, lease) = client.get_and_lease(&key, &owner, duration).await?;
            print_entity(&entity);
            print_lease(&key, &lease);
        }

        Command::Put {
            key,
            payload,
            expected,
            token,
        } => {
            let version = client
                .put(&key, payload.into_bytes(), Version(expected), token.as_deref())
                .await?;
            println!("{} Wrote {} at version {}", "✓".green(), key.cyan(), version);
        }

        Command::Delete { key, expected, token } => {
            client.delete(&key, Version(expected), token.as_deref()).await?;
            println!("{} Deleted {}", "✓".green(), key.cyan());
        }

        Command::List { prefix } => {
            let entities = client.list(prefix.as_deref()).await?;
            if entities.is_empty() {
                println!("{}", "No entities".dimmed());
            }
            for entity in &entities {
                print_entity(entity);
            }
        }

        Command::Claim {
            owner,
            limit,
            duration,
            prefix,
        } => {
            let claimed = client.claim(&owner, limit, duration, prefix.as_deref()).await?;
            if claimed.is_empty() {
                println!("{}", "Nothing to claim".dimmed());
            }
            for entry in &claimed {
                print_lease(&entry.key, &entry.lease);
            }
        }

        Command::Scan => {
            let stats = client.scan().await?;
            println!("{} Recovery pass: {}", "✓".green(), stats);
        }
    }
    Ok(())
}

fn format_expiry(expires_at: i64) -> String {
    chrono::DateTime::from_timestamp_millis(expires_at)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| expires_at.to_string())
}

fn print_lease(key: &str, lease: &Lease) {
    println!(
        "{} {} held by {} until {}",
        key.cyan(),
        lease.token.yellow(),
        lease.owner,
        format_expiry(lease.expires_at).dimmed()
    );
}

fn print_entity(entity: &Entity) {
    println!(
        "{} {} {}",
        entity.key.cyan(),
        format!("v{}", entity.version).yellow(),
        String::from_utf8_lossy(&entity.payload)
    );
}
