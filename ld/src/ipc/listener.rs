//! IPC listener for the daemon side
//!
//! Binds the Unix Domain Socket, accepts connections and answers each request
//! through the StoreManager.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{FrameError, read_message};
use super::messages::{ClaimedLease, Request, Response};
use crate::config::LeaseConfig;
use crate::daemon::stop_requested;
use crate::service::{ServiceError, ServiceResponse, StoreManager};

/// Everything a connection handler needs
#[derive(Clone)]
pub struct ServerContext {
    pub manager: StoreManager,
    pub lease: LeaseConfig,
    /// Flipped to `true` to stop the daemon
    pub shutdown: watch::Sender<bool>,
}

/// Create a listener at a specific path
///
/// Handles cleanup of stale socket files from previous runs.
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener: creating IPC socket");

    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    // Clean up stale socket if exists
    if socket_path.exists() {
        debug!(?socket_path, "create_listener: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind IPC socket")?;
    debug!(?socket_path, "create_listener: socket bound successfully");

    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Accept connections until the shutdown flag is raised
pub async fn serve(listener: UnixListener, ctx: ServerContext) -> Result<()> {
    let mut shutdown_rx = ctx.shutdown.subscribe();
    let ctx = Arc::new(ctx);
    info!("IPC listener accepting connections");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &ctx).await {
                            warn!(error = %e, "IPC connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept IPC connection"),
            },
            _ = stop_requested(&mut shutdown_rx) => {
                info!("IPC listener stopping");
                break;
            }
        }
    }

    Ok(())
}

/// Read one request, answer it, and act on shutdown after the reply is out
async fn handle_connection(mut stream: UnixStream, ctx: &ServerContext) -> Result<()> {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            let message = format!("{:#}", e);
            return send_response(&mut stream, &Response::Error { message }).await;
        }
    };

    let is_shutdown = matches!(request, Request::Shutdown);
    let response = handle_request(ctx, request).await;
    send_response(&mut stream, &response).await?;

    if is_shutdown {
        info!("Shutdown requested over IPC");
        ctx.shutdown.send_replace(true);
    }
    Ok(())
}

/// Read a single request line, refusing anything over the size limit
pub async fn read_request(stream: &mut UnixStream) -> Result<Request> {
    let line = match read_message(stream).await {
        Ok(line) => line,
        Err(FrameError::Closed) => return Err(eyre::eyre!("Empty message received")),
        Err(e) => return Err(e.into()),
    };

    if line.trim().is_empty() {
        return Err(eyre::eyre!("Empty message received"));
    }

    let request: Request = serde_json::from_str(line.trim()).context("Failed to parse IPC message")?;
    debug!(?request, "read_request: parsed request");

    Ok(request)
}

/// Send a response on the stream
pub async fn send_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let response_json = serde_json::to_string(response).context("Failed to serialize response")?;
    stream
        .write_all(response_json.as_bytes())
        .await
        .context("Failed to write response")?;
    stream.write_all(b"\n").await.context("Failed to write newline")?;
    stream.flush().await.context("Failed to flush response")?;
    debug!(?response, "send_response: sent response");
    Ok(())
}

/// Map a request onto the store and its outcome onto a response
pub async fn handle_request(ctx: &ServerContext, request: Request) -> Response {
    let manager = &ctx.manager;

    match request {
        Request::AcquireLease {
            key,
            owner,
            duration_secs,
        } => match lease_duration(ctx, duration_secs) {
            Ok(duration) => respond(manager.acquire(&key, &owner, duration).await, Response::Lease),
            Err(response) => response,
        },

        Request::RenewLease {
            key,
            token,
            duration_secs,
        } => match lease_duration(ctx, duration_secs) {
            Ok(duration) => respond(manager.renew(&key, &token, duration).await, |lease| {
                Response::Renewed {
                    expires_at: lease.expires_at,
                }
            }),
            Err(response) => response,
        },

        Request::ReleaseLease { key, token } => respond(manager.release(&key, &token).await, |_| Response::Ok),

        Request::GetLease { key } => respond(manager.current(&key).await, |lease| Response::CurrentLease { lease }),

        Request::GetAndLease {
            key,
            owner,
            duration_secs,
        } => match lease_duration(ctx, duration_secs) {
            Ok(duration) => respond(
                manager.get_and_acquire(&key, &owner, duration).await,
                |(entity, lease)| Response::Leased { entity, lease },
            ),
            Err(response) => response,
        },

        Request::GetEntity { key } => respond(manager.get(&key).await, Response::Entity),

        Request::PutEntity {
            key,
            payload,
            expected_version,
            token,
        } => respond(manager.put(&key, payload, expected_version, token).await, |version| {
            Response::Version { version }
        }),

        Request::DeleteEntity {
            key,
            expected_version,
            token,
        } => respond(manager.delete(&key, expected_version, token).await, |_| Response::Ok),

        Request::ListEntities { prefix } => {
            respond(manager.list(prefix).await, |entities| Response::Entities { entities })
        }

        Request::ClaimBatch {
            owner,
            limit,
            duration_secs,
            prefix,
        } => match lease_duration(ctx, duration_secs) {
            Ok(duration) => respond(manager.claim(&owner, limit, duration, prefix).await, |claimed| {
                Response::Claimed {
                    leases: claimed
                        .into_iter()
                        .map(|(key, lease)| ClaimedLease { key, lease })
                        .collect(),
                }
            }),
            Err(response) => response,
        },

        Request::Scan => respond(manager.scan().await, Response::Stats),

        Request::Ping => Response::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },

        Request::Shutdown => Response::Ok,
    }
}

fn lease_duration(ctx: &ServerContext, requested_secs: Option<u64>) -> Result<Duration, Response> {
    ctx.lease
        .duration(requested_secs)
        .map_err(|message| Response::Error { message })
}

fn respond<T>(result: ServiceResponse<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(ServiceError::Store(error)) => Response::StoreError { error },
        Err(e) => Response::Error { message: e.to_string() },
    }
}
