//! The parameter-server service core
//!
//! Binds RPC requests to store/optimizer/checkpoint operations and enforces
//! the admission invariants: requests are validated (including the per
//! trainer/name sequence guard) before any mutation, so a rejected request
//! never leaves partial state.

use crate::checkpoint::{CheckpointManager, CheckpointRecord};
use crate::common::{Error, Result};
use crate::optimizer::Optimizer;
use crate::store::{ParameterStore, Tensor};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a pserver instance. Transitions are linear; `Stopped` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Registering,
    Restoring,
    Serving,
    Draining,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Starting => "starting",
            ServiceState::Registering => "registering",
            ServiceState::Restoring => "restoring",
            ServiceState::Serving => "serving",
            ServiceState::Draining => "draining",
            ServiceState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

pub struct PserverService {
    store: Arc<ParameterStore>,
    optimizer: Box<dyn Optimizer>,
    checkpoints: Arc<CheckpointManager>,
    state: RwLock<ServiceState>,
    /// Last accepted sequence per (trainer, parameter) pair.
    seqs: Mutex<HashMap<(String, String), u64>>,
    in_flight: AtomicU64,
}

impl PserverService {
    pub fn new(
        store: Arc<ParameterStore>,
        optimizer: Box<dyn Optimizer>,
        checkpoints: Arc<CheckpointManager>,
    ) -> Self {
        Self {
            store,
            optimizer,
            checkpoints,
            state: RwLock::new(ServiceState::Starting),
            seqs: Mutex::new(HashMap::new()),
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, next: ServiceState) {
        let mut state = self.state.write();
        tracing::info!("Service state: {} -> {}", *state, next);
        *state = next;
    }

    /// Create a parameter block; idempotent on retransmission.
    pub fn init_parameter(&self, name: &str, shape: Vec<usize>, value: Tensor) -> Result<u64> {
        self.ensure_serving()?;
        self.store.create_or_get(name, shape, value)
    }

    /// Apply one gradient step after the sequence guard admits it.
    ///
    /// The guard reserves `seq` before the update and rolls the reservation
    /// back if validation rejects the gradient, so a failed push changes
    /// neither the block nor the idempotence table.
    pub fn push_gradient(&self, trainer: &str, name: &str, grad: &Tensor, seq: u64) -> Result<u64> {
        self.ensure_serving()?;
        let _guard = InFlightGuard::enter(&self.in_flight);

        let key = (trainer.to_string(), name.to_string());
        let previous = {
            let mut seqs = self.seqs.lock();
            if let Some(&last) = seqs.get(&key) {
                if seq <= last {
                    return Err(Error::StaleUpdate { last, got: seq });
                }
            }
            seqs.insert(key.clone(), seq)
        };

        match self.store.apply_update(name, grad, self.optimizer.as_ref()) {
            Ok(version) => Ok(version),
            Err(e) => {
                let mut seqs = self.seqs.lock();
                if seqs.get(&key) == Some(&seq) {
                    match previous {
                        Some(last) => seqs.insert(key, last),
                        None => seqs.remove(&key),
                    };
                }
                Err(e)
            }
        }
    }

    /// Copy of the current value and version. Reads stay available while the
    /// service drains.
    pub fn pull_parameter(&self, name: &str) -> Result<(Tensor, u64)> {
        self.ensure_readable()?;
        self.store.read_snapshot(name)
    }

    pub fn list_parameters(&self) -> Result<Vec<String>> {
        self.ensure_readable()?;
        Ok(self.store.list_names())
    }

    /// Snapshot the store and publish the record.
    pub async fn checkpoint(&self) -> Result<CheckpointRecord> {
        self.ensure_readable()?;
        self.checkpoints.save(&self.store).await
    }

    /// Startup restore; runs before the service accepts traffic.
    pub(crate) async fn restore(&self) -> Result<Option<u64>> {
        self.checkpoints.restore(&self.store).await
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no request is mid-update, up to `timeout`. Returns whether
    /// the service went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn ensure_serving(&self) -> Result<()> {
        let state = self.state();
        if state != ServiceState::Serving {
            return Err(Error::NotServing(state.to_string()));
        }
        Ok(())
    }

    fn ensure_readable(&self) -> Result<()> {
        match self.state() {
            ServiceState::Serving | ServiceState::Draining => Ok(()),
            state => Err(Error::NotServing(state.to_string())),
        }
    }
}

/// RAII counter for requests inside their critical section.
struct InFlightGuard<'a>(&'a AtomicU64);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
