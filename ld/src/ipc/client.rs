//! IPC client for talking to the daemon
//!
//! Each call opens a connection, sends one request line and reads one
//! response line. `StoreUnavailable` answers are retried with exponential
//! backoff; every other error is returned as-is.

use std::path::{Path, PathBuf};
use std::time::Duration;

use backoff::backoff::Backoff;
use leasestore::{Entity, Lease, RecoveryStats, StoreError, Version};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::messages::{ClaimedLease, Request, Response};
use super::{FrameError, MAX_MESSAGE_SIZE, get_socket_path, read_message};
use crate::config::RetryConfig;

/// Default timeout for IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors seen by IPC callers
#[derive(Debug, Error)]
pub enum ClientError {
    /// The store refused the operation
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The daemon rejected the request itself
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Could not reach the daemon or the exchange broke off
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response: {0:?}")]
    Unexpected(Box<Response>),
}

impl ClientError {
    /// Check if the failure is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Store(e) if e.is_transient())
    }

    fn transport(context: &str, e: impl std::fmt::Display) -> Self {
        ClientError::Transport(format!("{}: {}", context, e))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client for the lease store daemon
#[derive(Debug, Clone)]
pub struct LeaseClient {
    socket_path: PathBuf,
    timeout: Duration,
    retry: RetryConfig,
}

impl Default for LeaseClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseClient {
    /// Create a new client with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(get_socket_path())
    }

    /// Create a client with a custom socket path
    pub fn with_socket_path(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry policy for transient store errors
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check if the daemon socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    // === Leases ===

    pub async fn acquire(&self, key: &str, owner: &str, duration_secs: Option<u64>) -> ClientResult<Lease> {
        let request = Request::AcquireLease {
            key: key.to_string(),
            owner: owner.to_string(),
            duration_secs,
        };
        match self.call(request).await? {
            Response::Lease(lease) => Ok(lease),
            other => Err(unexpected(other)),
        }
    }

    /// Extend a lease, returning the new expiry (Unix milliseconds)
    pub async fn renew(&self, key: &str, token: &str, duration_secs: Option<u64>) -> ClientResult<i64> {
        let request = Request::RenewLease {
            key: key.to_string(),
            token: token.to_string(),
            duration_secs,
        };
        match self.call(request).await? {
            Response::Renewed { expires_at } => Ok(expires_at),
            other => Err(unexpected(other)),
        }
    }

    pub async fn release(&self, key: &str, token: &str) -> ClientResult<()> {
        let request = Request::ReleaseLease {
            key: key.to_string(),
            token: token.to_string(),
        };
        expect_ok(self.call(request).await?)
    }

    pub async fn current_lease(&self, key: &str) -> ClientResult<Option<Lease>> {
        match self.call(Request::GetLease { key: key.to_string() }).await? {
            Response::CurrentLease { lease } => Ok(lease),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch an entity and lease it in one step
    pub async fn get_and_lease(
        &self,
        key: &str,
        owner: &str,
        duration_secs: Option<u64>,
    ) -> ClientResult<(Entity, Lease)> {
        let request = Request::GetAndLease {
            key: key.to_string(),
            owner: owner.to_string(),
            duration_secs,
        };
        match self.call(request).await? {
            Response::Leased { entity, lease } => Ok((entity, lease)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn claim(
        &self,
        owner: &str,
        limit: usize,
        duration_secs: Option<u64>,
        prefix: Option<&str>,
    ) -> ClientResult<Vec<ClaimedLease>> {
        let request = Request::ClaimBatch {
            owner: owner.to_string(),
            limit,
            duration_secs,
            prefix: prefix.map(str::to_string),
        };
        match self.call(request).await? {
            Response::Claimed { leases } => Ok(leases),
            other => Err(unexpected(other)),
        }
    }

    // === Entities ===

    pub async fn get(&self, key: &str) -> ClientResult<Entity> {
        match self.call(Request::GetEntity { key: key.to_string() }).await? {
            Response::Entity(entity) => Ok(entity),
            other => Err(unexpected(other)),
        }
    }

    /// Conditional write; pass the lease token to make it a guarded write
    pub async fn put(
        &self,
        key: &str,
        payload: Vec<u8>,
        expected_version: Version,
        token: Option<&str>,
    ) -> ClientResult<Version> {
        let request = Request::PutEntity {
            key: key.to_string(),
            payload,
            expected_version,
            token: token.map(str::to_string),
        };
        match self.call(request).await? {
            Response::Version { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Conditional delete; a leased entity needs the holder's token
    pub async fn delete(&self, key: &str, expected_version: Version, token: Option<&str>) -> ClientResult<()> {
        let request = Request::DeleteEntity {
            key: key.to_string(),
            expected_version,
            token: token.map(str::to_string),
        };
        expect_ok(self.call(request).await?)
    }

    pub async fn list(&self, prefix: Option<&str>) -> ClientResult<Vec<Entity>> {
        let request = Request::ListEntities {
            prefix: prefix.map(str::to_string),
        };
        match self.call(request).await? {
            Response::Entities { entities } => Ok(entities),
            other => Err(unexpected(other)),
        }
    }

    // === Daemon ===

    /// Run a recovery pass now
    pub async fn scan(&self) -> ClientResult<RecoveryStats> {
        match self.call(Request::Scan).await? {
            Response::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    /// Check if daemon is alive and get its version
    pub async fn ping(&self) -> ClientResult<String> {
        match self.call(Request::Ping).await? {
            Response::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Request daemon to shutdown gracefully
    pub async fn shutdown(&self) -> ClientResult<()> {
        expect_ok(self.call(Request::Shutdown).await?)
    }

    /// Send a request, retrying while the store reports itself unavailable
    pub async fn call(&self, request: Request) -> ClientResult<Response> {
        let mut backoff = self.retry.backoff();
        let mut attempt = 0u32;

        loop {
            match self.send_request(&request).await {
                Err(err) if err.is_transient() => match backoff.next_backoff() {
                    Some(delay) => {
                        attempt += 1;
                        warn!(?delay, attempt, error = %err, "call: retrying transient failure");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                result => return result,
            }
        }
    }

    /// One request/response exchange; store errors come back as `ClientError::Store`
    async fn send_request(&self, request: &Request) -> ClientResult<Response> {
        debug!(socket_path = ?self.socket_path, ?request, "send_request: called");

        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|e| ClientError::transport("Connection timeout", e))?
            .map_err(|e| ClientError::transport("Failed to connect to daemon socket", e))?;

        let response = self.exchange(stream, request).await?;
        debug!(?response, "send_request: received response");

        match response {
            Response::StoreError { error } => Err(ClientError::Store(error)),
            Response::Error { message } => Err(ClientError::Daemon(message)),
            other => Ok(other),
        }
    }

    async fn exchange(&self, mut stream: UnixStream, request: &Request) -> ClientResult<Response> {
        let mut request_json =
            serde_json::to_string(request).map_err(|e| ClientError::transport("Failed to serialize request", e))?;
        if request_json.len() > MAX_MESSAGE_SIZE {
            return Err(ClientError::Transport(format!(
                "Request too large: {} bytes",
                request_json.len()
            )));
        }
        request_json.push('\n');

        tokio::time::timeout(self.timeout, async {
            stream.write_all(request_json.as_bytes()).await?;
            stream.flush().await
        })
        .await
        .map_err(|e| ClientError::transport("Write timeout", e))?
        .map_err(|e| ClientError::transport("Failed to write request", e))?;

        let response_line = tokio::time::timeout(self.timeout, read_message(&mut stream))
            .await
            .map_err(|e| ClientError::transport("Read timeout", e))?
            .map_err(|e| match e {
                FrameError::Closed => ClientError::Transport("Daemon closed the connection".to_string()),
                other => ClientError::transport("Failed to read response", other),
            })?;

        serde_json::from_str(response_line.trim()).map_err(|e| ClientError::transport("Failed to parse response", e))
    }
}

fn expect_ok(response: Response) -> ClientResult<()> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::Unexpected(Box::new(response))
}
