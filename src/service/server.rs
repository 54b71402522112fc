//! Server lifecycle
//!
//! Drives the service through registering -> restoring -> serving ->
//! draining, owning the TCP accept loop and the background lease-renewal and
//! scheduled-snapshot tasks. The registration lease is scoped to this run:
//! claimed before restore, renewed while serving, released on drain.

use crate::checkpoint::CheckpointManager;
use crate::common::{utils, Error, PserverConfig, Result};
use crate::coord::{registration_key, Coordinator, LeaseHandle, ServiceRegistration};
use crate::rpc::wire::{read_frame, write_frame, Request, Response};
use crate::service::pserver::{PserverService, ServiceState};
use crate::store::ParameterStore;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

pub struct PserverServer {
    config: PserverConfig,
    coordinator: Arc<dyn Coordinator>,
    service: Arc<PserverService>,
}

impl PserverServer {
    pub fn new(config: PserverConfig, coordinator: Arc<dyn Coordinator>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ParameterStore::new());
        let checkpoints = Arc::new(CheckpointManager::new(
            config.shard,
            config.checkpoint_dir.clone(),
            Arc::clone(&coordinator),
        ));
        let service = Arc::new(PserverService::new(
            store,
            config.optimizer.build(),
            checkpoints,
        ));

        Ok(Self {
            config,
            coordinator,
            service,
        })
    }

    pub fn service(&self) -> Arc<PserverService> {
        Arc::clone(&self.service)
    }

    /// Run the full lifecycle. Returns when `shutdown` fires (after a clean
    /// drain) or when a fatal coordination failure exhausts its retries.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "pserver shard {} listening on {}",
            self.config.shard,
            local_addr
        );

        self.service.set_state(ServiceState::Registering);
        let registered_at = utils::timestamp_now();
        let lease = match self.register_with_backoff(local_addr, registered_at).await {
            Ok(lease) => lease,
            Err(e) => {
                self.service.set_state(ServiceState::Stopped);
                return Err(e);
            }
        };

        self.service.set_state(ServiceState::Restoring);
        match self.service.restore().await {
            Ok(Some(version)) => {
                tracing::info!("Resumed from checkpoint v{}", version);
            }
            Ok(None) => {
                tracing::info!("No prior checkpoint for shard {}, starting empty", self.config.shard);
            }
            Err(e @ (Error::CorruptCheckpoint(_) | Error::CheckpointNotFound(_)))
                if self.config.allow_cold_start =>
            {
                tracing::warn!("Checkpoint unusable ({}), cold-starting with empty store", e);
            }
            Err(e) => {
                tracing::error!("Restore failed: {}", e);
                let _ = self.coordinator.revoke_lease(&lease).await;
                self.service.set_state(ServiceState::Stopped);
                return Err(e);
            }
        }

        self.service.set_state(ServiceState::Serving);

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(1);
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.coordinator),
            lease,
            self.config.clone(),
            local_addr,
            registered_at,
            fatal_tx,
        ));
        let snapshots = tokio::spawn(snapshot_loop(
            Arc::clone(&self.service),
            self.config.checkpoint_interval(),
        ));

        let outcome = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(
                            Arc::clone(&self.service),
                            stream,
                            peer,
                            self.config.request_timeout(),
                        ));
                    }
                    Err(e) => tracing::warn!("accept error: {}", e),
                },
                _ = shutdown.changed() => break Ok(()),
                Some(e) = fatal_rx.recv() => break Err(e),
            }
        };

        // Drain: no new connections, no new pushes; reads keep working until
        // the final snapshot is out.
        self.service.set_state(ServiceState::Draining);
        drop(listener);
        snapshots.abort();

        if !self.service.wait_idle(self.config.drain_timeout()).await {
            tracing::warn!(
                "Drain timed out with {} requests in flight",
                self.service.in_flight()
            );
        }

        match self.service.checkpoint().await {
            Ok(record) => tracing::info!("Final checkpoint v{} saved", record.version),
            Err(e) => tracing::warn!("Final checkpoint failed: {}", e),
        }

        // The lease stays renewed through the final snapshot; release it last.
        heartbeat.abort();
        if let Err(e) = self
            .coordinator
            .delete(&registration_key(self.config.shard))
            .await
        {
            tracing::warn!("Deregistration failed: {}", e);
        }
        if let Err(e) = self.coordinator.revoke_lease(&lease).await {
            tracing::warn!("Lease revoke failed: {}", e);
        }

        self.service.set_state(ServiceState::Stopped);
        outcome
    }

    async fn register_with_backoff(
        &self,
        address: SocketAddr,
        registered_at: u64,
    ) -> Result<LeaseHandle> {
        let key = registration_key(self.config.shard);
        let mut delay = self.config.register_backoff();

        for attempt in 1..=self.config.register_attempts {
            let registration = ServiceRegistration {
                shard: self.config.shard,
                address: address.to_string(),
                registered_at,
                last_heartbeat: utils::timestamp_now(),
            };
            let raw = serde_json::to_vec(&registration)
                .map_err(|e| Error::Internal(format!("registration serialize error: {e}")))?;

            match self
                .coordinator
                .register(self.config.shard, &key, &raw, self.config.lease_ttl())
                .await
            {
                Ok(lease) => {
                    tracing::info!(
                        "Registered shard {} at {} (lease {})",
                        self.config.shard,
                        address,
                        lease.id
                    );
                    return Ok(lease);
                }
                Err(e)
                    if attempt < self.config.register_attempts
                        && (e.is_retryable() || matches!(e, Error::ShardAlreadyClaimed(_))) =>
                {
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                    let pause = delay + Duration::from_millis(jitter);
                    tracing::warn!(
                        "Registration attempt {}/{} failed: {}, retrying in {:?}",
                        attempt,
                        self.config.register_attempts,
                        e,
                        pause
                    );
                    tokio::time::sleep(pause).await;
                    delay *= 2;
                }
                Err(e) => {
                    tracing::error!("Registration failed permanently: {}", e);
                    return Err(e);
                }
            }
        }

        unreachable!("registration loop returns on the final attempt")
    }
}

/// Renew the lease and refresh the heartbeat field of the registration
/// record. Consecutive failures past the configured limit are fatal; an
/// external orchestrator reschedules the process.
async fn heartbeat_loop(
    coordinator: Arc<dyn Coordinator>,
    lease: LeaseHandle,
    config: PserverConfig,
    address: SocketAddr,
    registered_at: u64,
    fatal_tx: mpsc::Sender<Error>,
) {
    let key = registration_key(config.shard);
    let mut ticker = tokio::time::interval(config.heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut failures = 0u32;
    loop {
        ticker.tick().await;

        let result = async {
            coordinator.renew_lease(&lease).await?;
            let registration = ServiceRegistration {
                shard: config.shard,
                address: address.to_string(),
                registered_at,
                last_heartbeat: utils::timestamp_now(),
            };
            let raw = serde_json::to_vec(&registration)
                .map_err(|e| Error::Internal(format!("registration serialize error: {e}")))?;
            coordinator.put(&key, &raw, Some(&lease)).await
        }
        .await;

        match result {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    "Heartbeat failure {}/{}: {}",
                    failures,
                    config.heartbeat_failure_limit,
                    e
                );
                if failures >= config.heartbeat_failure_limit {
                    tracing::error!("Heartbeat retries exhausted, giving up shard {}", config.shard);
                    let _ = fatal_tx.send(e).await;
                    return;
                }
            }
        }
    }
}

/// Scheduled snapshots while serving.
async fn snapshot_loop(service: Arc<PserverService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = service.checkpoint().await {
            tracing::warn!("Scheduled checkpoint failed: {}", e);
        }
    }
}

/// Serve sequential request/response pairs on one connection.
async fn handle_connection(
    service: Arc<PserverService>,
    mut stream: TcpStream,
    peer: SocketAddr,
    request_timeout: Duration,
) {
    tracing::debug!("Connection from {}", peer);

    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Read error from {}: {}", peer, e);
                break;
            }
        };

        let response = match tokio::time::timeout(request_timeout, dispatch(&service, request)).await
        {
            Ok(response) => response,
            Err(_) => Response::from_error(&Error::Timeout("request deadline exceeded".into())),
        };

        if let Err(e) = write_frame(&mut stream, &response).await {
            tracing::debug!("Write error to {}: {}", peer, e);
            break;
        }
    }

    tracing::debug!("Connection from {} closed", peer);
}

async fn dispatch(service: &PserverService, request: Request) -> Response {
    let result = match request {
        Request::InitParameter { name, shape, value } => service
            .init_parameter(&name, shape, value)
            .map(|version| Response::Initialized { version }),
        Request::PushGradient {
            trainer,
            name,
            grad,
            seq,
        } => service
            .push_gradient(&trainer, &name, &grad, seq)
            .map(|version| Response::Pushed { version }),
        Request::PullParameter { name } => service
            .pull_parameter(&name)
            .map(|(value, version)| Response::Parameter { value, version }),
        Request::Checkpoint => service
            .checkpoint()
            .await
            .map(|record| Response::Checkpointed { record }),
        Request::ListParameters => service
            .list_parameters()
            .map(|names| Response::Parameters { names }),
    };

    result.unwrap_or_else(|e| {
        tracing::debug!("Request rejected: {}", e);
        Response::from_error(&e)
    })
}
