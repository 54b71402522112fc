//! Registration, shard mutual exclusion, crash detection via lease expiry,
//! and discovery through prefix watches.

use pserver::coord::{registration_key, Coordinator, PSERVER_PREFIX};
use pserver::optimizer::OptimizerConfig;
use pserver::{Error, MemCoordinator, PserverConfig, PserverServer, ServiceRegistration};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

fn test_config(shard: u32, dir: &Path) -> PserverConfig {
    PserverConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        shard,
        checkpoint_dir: dir.to_path_buf(),
        lease_ttl_secs: 1,
        heartbeat_interval_ms: 50,
        register_attempts: 3,
        register_backoff_ms: 50,
        drain_timeout_ms: 2_000,
        optimizer: OptimizerConfig::Sgd { learning_rate: 0.1 },
        ..Default::default()
    }
}

async fn spawn_server(
    coord: &MemCoordinator,
    config: PserverConfig,
) -> (
    watch::Sender<bool>,
    tokio::task::JoinHandle<pserver::Result<()>>,
    SocketAddr,
) {
    let shard = config.shard;
    let server = PserverServer::new(config, Arc::new(coord.clone())).unwrap();
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(server.serve(rx));

    let key = registration_key(shard);
    for _ in 0..200 {
        if let Some(raw) = coord.get(&key).await.unwrap() {
            let reg: ServiceRegistration = serde_json::from_slice(&raw).unwrap();
            let addr: SocketAddr = reg.address.parse().unwrap();
            return (tx, handle, addr);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never registered");
}

#[tokio::test]
async fn test_second_server_cannot_claim_live_shard() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let coord = MemCoordinator::new();

    let (tx, handle, _addr) = spawn_server(&coord, test_config(0, dir_a.path())).await;

    // Same shard, live lease: registration retries, then gives up
    let config = PserverConfig {
        register_attempts: 2,
        register_backoff_ms: 10,
        ..test_config(0, dir_b.path())
    };
    let rival = PserverServer::new(config, Arc::new(coord.clone())).unwrap();
    let (_rival_tx, rival_rx) = watch::channel(false);
    let outcome = rival.serve(rival_rx).await;
    assert!(matches!(outcome, Err(Error::ShardAlreadyClaimed(0))));

    // The incumbent is untouched
    assert!(coord.get(&registration_key(0)).await.unwrap().is_some());

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_crash_frees_shard_after_lease_expiry() {
    let dir = TempDir::new().unwrap();
    let coord = MemCoordinator::new();

    // Run the first instance on its own runtime so tearing it down kills
    // every task at once, heartbeats included, like a process crash would
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = PserverServer::new(test_config(0, dir.path()), Arc::new(coord.clone())).unwrap();
    let (_crash_tx, crash_rx) = watch::channel(false);
    rt.spawn(server.serve(crash_rx));

    let key = registration_key(0);
    let mut registered = false;
    for _ in 0..200 {
        if coord.get(&key).await.unwrap().is_some() {
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registered, "server never registered");

    // Crash mid-serve; no drain, no deregistration
    rt.shutdown_background();

    // The registration outlives the crash only until the lease TTL runs out
    assert!(coord.get(&registration_key(0)).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(coord.get(&registration_key(0)).await.unwrap().is_none());

    // A replacement can claim the shard and resume
    let (tx, handle, _addr) = spawn_server(&coord, test_config(0, dir.path())).await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_heartbeats_keep_registration_past_ttl() {
    let dir = TempDir::new().unwrap();
    let coord = MemCoordinator::new();

    let (tx, handle, _addr) = spawn_server(&coord, test_config(0, dir.path())).await;

    // Well past the 1s lease TTL; renewals must have kept the key alive,
    // and the heartbeat field must have moved
    let key = registration_key(0);
    let raw = coord.get(&key).await.unwrap().unwrap();
    let first: ServiceRegistration = serde_json::from_slice(&raw).unwrap();

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let raw = coord.get(&key).await.unwrap().unwrap();
    let later: ServiceRegistration = serde_json::from_slice(&raw).unwrap();
    assert_eq!(later.registered_at, first.registered_at);
    assert!(later.last_heartbeat >= first.last_heartbeat);

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_watch_observes_join_and_leave() {
    let dir = TempDir::new().unwrap();
    let coord = MemCoordinator::new();
    let mut events = coord.watch_prefix(PSERVER_PREFIX).await.unwrap();

    let (tx, handle, _addr) = spawn_server(&coord, test_config(4, dir.path())).await;

    // First event under the prefix is this shard coming up
    let ev = events.recv().await.unwrap();
    assert_eq!(ev.key, registration_key(4));
    let reg: ServiceRegistration = serde_json::from_slice(&ev.value.unwrap()).unwrap();
    assert_eq!(reg.shard, 4);

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // Drain eventually surfaces the departure as a delete; heartbeat puts
    // and the checkpoint record may arrive first
    loop {
        let ev = events.recv().await.unwrap();
        if ev.key == registration_key(4) && ev.value.is_none() {
            break;
        }
    }
}
