//! Integration tests for the leased daemon
//!
//! A real daemon on a temporary socket, driven by the IPC client and the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use assert_cmd::Command;
use leased::config::Config;
use leased::daemon;
use leased::ipc::{ClientError, LeaseClient};
use leasestore::{SqliteStore, Store, StoreError, Version};
use predicates::prelude::*;
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct Daemon {
    _temp: TempDir,
    socket_path: PathBuf,
    store_path: PathBuf,
    handle: JoinHandle<eyre::Result<()>>,
}

impl Daemon {
    fn client(&self) -> LeaseClient {
        LeaseClient::with_socket_path(&self.socket_path)
    }

    async fn stop(self) {
        self.client().shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();
        assert!(!self.socket_path.exists(), "socket should be cleaned up");
    }
}

async fn start_daemon(configure: impl FnOnce(&mut Config)) -> Daemon {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let socket_path = temp.path().join("leased.sock");

    let mut config = Config::default();
    config.storage.path = temp.path().join("store.db");
    config.scanner.enabled = false;
    configure(&mut config);
    let store_path = config.storage.path.clone();

    let handle = tokio::spawn(daemon::run(config, socket_path.clone()));
    wait_for_socket(&socket_path).await;

    Daemon {
        _temp: temp,
        socket_path,
        store_path,
        handle,
    }
}

async fn wait_for_socket(socket_path: &Path) {
    let client = LeaseClient::with_socket_path(socket_path);
    for _ in 0..100 {
        if client.ping().await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon did not start listening on {}", socket_path.display());
}

// =============================================================================
// Client against a live daemon
// =============================================================================

#[tokio::test]
async fn test_job_lifecycle_over_socket() {
    let daemon = start_daemon(|_| {}).await;
    let worker_1 = daemon.client();
    let worker_2 = daemon.client();

    let v1 = worker_1.put("job-1", b"A".to_vec(), Version::ABSENT, None).await.unwrap();
    assert_eq!(v1, Version(1));

    let lease = worker_1.acquire("job-1", "worker-1", Some(30)).await.unwrap();
    assert_eq!(lease.owner, "worker-1");

    match worker_2.acquire("job-1", "worker-2", Some(30)).await.unwrap_err() {
        ClientError::Store(StoreError::LeaseConflict { owner, .. }) => assert_eq!(owner, "worker-1"),
        other => panic!("Expected LeaseConflict, got {:?}", other),
    }

    let expires_at = worker_1.renew("job-1", &lease.token, Some(60)).await.unwrap();
    assert!(expires_at > lease.expires_at);

    let v2 = worker_1
        .put("job-1", b"B".to_vec(), v1, Some(&lease.token))
        .await
        .unwrap();
    assert_eq!(v2, Version(2));

    // While worker-1 holds the lease nobody else may write or delete
    let err = worker_2.put("job-1", b"HIJACK".to_vec(), v2, None).await.unwrap_err();
    assert!(matches!(err, ClientError::Store(StoreError::LeaseConflict { .. })));
    let err = worker_2.delete("job-1", v2, None).await.unwrap_err();
    assert!(matches!(err, ClientError::Store(StoreError::LeaseConflict { .. })));
    let err = worker_2.delete("job-1", v2, Some("forged")).await.unwrap_err();
    assert!(matches!(err, ClientError::Store(StoreError::InvalidToken(_))));

    worker_1.release("job-1", &lease.token).await.unwrap();
    assert_eq!(worker_2.current_lease("job-1").await.unwrap(), None);

    // A stale unconditional writer loses
    let err = worker_2.put("job-1", b"C".to_vec(), v1, None).await.unwrap_err();
    assert!(matches!(err, ClientError::Store(StoreError::VersionConflict { .. })));

    let entity = worker_2.get("job-1").await.unwrap();
    assert_eq!(entity.payload, b"B".to_vec());
    assert_eq!(entity.version, v2);

    worker_2.delete("job-1", v2, None).await.unwrap();
    assert!(matches!(
        worker_2.get("job-1").await,
        Err(ClientError::Store(StoreError::NotFound(_)))
    ));

    daemon.stop().await;
}

#[tokio::test]
async fn test_get_and_lease_over_socket() {
    let daemon = start_daemon(|_| {}).await;
    let client = daemon.client();
    let v1 = client.put("job-1", b"A".to_vec(), Version::ABSENT, None).await.unwrap();

    let (entity, lease) = client.get_and_lease("job-1", "worker-1", Some(30)).await.unwrap();
    assert_eq!(entity.payload, b"A".to_vec());
    assert_eq!(entity.version, v1);
    assert_eq!(lease.owner, "worker-1");

    match client.get_and_lease("job-1", "worker-2", None).await.unwrap_err() {
        ClientError::Store(StoreError::LeaseConflict { owner, .. }) => assert_eq!(owner, "worker-1"),
        other => panic!("Expected LeaseConflict, got {:?}", other),
    }
    assert!(matches!(
        client.get_and_lease("missing", "worker-1", None).await,
        Err(ClientError::Store(StoreError::NotFound(_)))
    ));

    // The holder finishes the item
    client.delete("job-1", v1, Some(&lease.token)).await.unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn test_expired_claims_are_recovered_by_scan() {
    let daemon = start_daemon(|_| {}).await;
    let client = daemon.client();

    for i in 0..4u8 {
        client
            .put(&format!("job-{}", i), vec![i], Version::ABSENT, None)
            .await
            .unwrap();
    }
    client.put("other-1", vec![], Version::ABSENT, None).await.unwrap();

    let claimed = client.claim("crashed-worker", 10, Some(1), Some("job-")).await.unwrap();
    assert_eq!(claimed.len(), 4);
    assert!(client.claim("worker-2", 10, None, Some("job-")).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let stats = client.scan().await.unwrap();
    assert_eq!(stats.reclaimed, 4);

    let reclaimed = client.claim("worker-2", 10, None, Some("job-")).await.unwrap();
    assert_eq!(reclaimed.len(), 4);
    assert!(reclaimed.iter().all(|c| c.lease.owner == "worker-2"));

    assert_eq!(client.list(None).await.unwrap().len(), 5);
    assert_eq!(client.list(Some("other-")).await.unwrap().len(), 1);

    daemon.stop().await;
}

#[tokio::test]
async fn test_background_recovery_loop() {
    let daemon = start_daemon(|config| {
        config.scanner.enabled = true;
        config.scanner.interval_secs = 1;
    })
    .await;
    let client = daemon.client();

    client.put("job-1", vec![], Version::ABSENT, None).await.unwrap();
    client.acquire("job-1", "worker-1", Some(1)).await.unwrap();

    // A second connection to the same file sees whether the lease is still recorded
    let observer = SqliteStore::open(&daemon.store_path).unwrap();
    assert_eq!(observer.scan_expired(i64::MAX).unwrap().len(), 1);

    let mut cleared = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if observer.scan_expired(i64::MAX).unwrap().is_empty() {
            cleared = true;
            break;
        }
    }
    assert!(cleared, "expired lease was never cleared");

    daemon.stop().await;
}

#[tokio::test]
async fn test_lease_duration_limits_are_enforced() {
    let daemon = start_daemon(|config| config.lease.max_duration_secs = 60).await;
    let client = daemon.client();
    client.put("job-1", vec![], Version::ABSENT, None).await.unwrap();

    let err = client.acquire("job-1", "worker-1", Some(61)).await.unwrap_err();
    assert!(matches!(err, ClientError::Daemon(_)));

    let err = client.acquire("job-1", "worker-1", Some(0)).await.unwrap_err();
    assert!(matches!(err, ClientError::Daemon(_)));

    client.acquire("job-1", "worker-1", None).await.unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn test_entities_survive_restart() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("store.db");

    let first = start_daemon({
        let db_path = db_path.clone();
        move |config| config.storage.path = db_path
    })
    .await;
    first
        .client()
        .put("job-1", b"persisted".to_vec(), Version::ABSENT, None)
        .await
        .unwrap();
    first.stop().await;

    let second = start_daemon(move |config| config.storage.path = db_path).await;
    let entity = second.client().get("job-1").await.unwrap();
    assert_eq!(entity.payload, b"persisted".to_vec());
    assert_eq!(entity.version, Version(1));
    second.stop().await;
}

// =============================================================================
// CLI
// =============================================================================

fn leased(socket_path: &Path) -> Command {
    let mut cmd = Command::cargo_bin("leased").unwrap();
    cmd.arg("--socket").arg(socket_path);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("leased")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("acquire"))
        .stdout(predicate::str::contains("claim"));
}

#[test]
fn test_cli_without_daemon_fails() {
    let temp = TempDir::new().unwrap();
    leased(&temp.path().join("missing.sock"))
        .arg("ping")
        .assert()
        .failure()
        .stderr(predicate::str::contains("is the daemon running"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cli_against_daemon() {
    let daemon = start_daemon(|_| {}).await;
    let socket_path = daemon.socket_path.clone();

    tokio::task::spawn_blocking(move || {
        leased(&socket_path)
            .args(["put", "job-1", "hello"])
            .assert()
            .success()
            .stdout(predicate::str::contains("version 1"));

        leased(&socket_path)
            .args(["get", "job-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("hello"));

        leased(&socket_path)
            .args(["put", "job-1", "stale", "--expect", "0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Version conflict"));

        leased(&socket_path)
            .args(["acquire", "job-1", "--owner", "cli-worker"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cli-worker"));

        leased(&socket_path)
            .args(["acquire", "job-1", "--owner", "someone-else"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Lease conflict"));

        leased(&socket_path)
            .args(["put", "job-1", "hijack", "--expect", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Lease conflict"));
    })
    .await
    .unwrap();

    daemon.stop().await;
}
