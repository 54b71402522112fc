//! In-process coordinator
//!
//! A single-process stand-in for etcd with the same contract: lease-bound
//! keys, lazy TTL expiry, compare-and-swap, and prefix watches. Used by the
//! test suites and for single-node development runs.

use crate::common::{Error, Result};
use crate::coord::{CoordEvent, Coordinator, LeaseHandle};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
pub struct MemCoordinator {
    inner: Arc<Mutex<MemState>>,
}

#[derive(Default)]
struct MemState {
    kvs: HashMap<String, MemEntry>,
    leases: HashMap<i64, LeaseState>,
    next_lease: i64,
    watchers: Vec<WatcherEntry>,
}

struct MemEntry {
    value: Vec<u8>,
    lease: Option<i64>,
}

struct LeaseState {
    expires: Instant,
    ttl: Duration,
}

struct WatcherEntry {
    prefix: String,
    tx: mpsc::UnboundedSender<CoordEvent>,
}

impl MemCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemState {
    /// Expire leases lazily and drop the keys they held, as etcd would.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            self.leases.remove(&id);
            let dead: Vec<String> = self
                .kvs
                .iter()
                .filter(|(_, e)| e.lease == Some(id))
                .map(|(k, _)| k.clone())
                .collect();
            for key in dead {
                self.kvs.remove(&key);
                self.notify(&key, None);
            }
        }
    }

    fn notify(&mut self, key: &str, value: Option<&[u8]>) {
        self.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return true;
            }
            w.tx.send(CoordEvent {
                key: key.to_string(),
                value: value.map(<[u8]>::to_vec),
            })
            .is_ok()
        });
    }
}

#[async_trait]
impl Coordinator for MemCoordinator {
    async fn register(
        &self,
        shard: u32,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<LeaseHandle> {
        let mut state = self.inner.lock();
        state.purge_expired();

        if state.kvs.contains_key(key) {
            return Err(Error::ShardAlreadyClaimed(shard));
        }

        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseState {
                expires: Instant::now() + ttl,
                ttl,
            },
        );
        state.kvs.insert(
            key.to_string(),
            MemEntry {
                value: value.to_vec(),
                lease: Some(id),
            },
        );
        state.notify(key, Some(value));

        Ok(LeaseHandle { id })
    }

    async fn renew_lease(&self, lease: &LeaseHandle) -> Result<()> {
        let mut state = self.inner.lock();
        state.purge_expired();

        match state.leases.get_mut(&lease.id) {
            Some(l) => {
                l.expires = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(Error::Coordination(format!(
                "lease {} has expired",
                lease.id
            ))),
        }
    }

    async fn revoke_lease(&self, lease: &LeaseHandle) -> Result<()> {
        let mut state = self.inner.lock();
        state.leases.remove(&lease.id);

        let dead: Vec<String> = state
            .kvs
            .iter()
            .filter(|(_, e)| e.lease == Some(lease.id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            state.kvs.remove(&key);
            state.notify(&key, None);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.inner.lock();
        state.purge_expired();
        Ok(state.kvs.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<&LeaseHandle>) -> Result<()> {
        let mut state = self.inner.lock();
        state.purge_expired();

        let lease_id = match lease {
            Some(l) => {
                if !state.leases.contains_key(&l.id) {
                    return Err(Error::Coordination(format!("lease {} has expired", l.id)));
                }
                Some(l.id)
            }
            None => None,
        };

        state.kvs.insert(
            key.to_string(),
            MemEntry {
                value: value.to_vec(),
                lease: lease_id,
            },
        );
        state.notify(key, Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.inner.lock();
        if state.kvs.remove(key).is_some() {
            state.notify(key, None);
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool> {
        let mut state = self.inner.lock();
        state.purge_expired();

        let current = state.kvs.get(key).map(|e| e.value.as_slice());
        if current != expected {
            return Ok(false);
        }

        state.kvs.insert(
            key.to_string(),
            MemEntry {
                value: new.to_vec(),
                lease: None,
            },
        );
        state.notify(key, Some(new));
        Ok(true)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<CoordEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().watchers.push(WatcherEntry {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::registration_key;

    #[tokio::test]
    async fn test_register_mutual_exclusion() {
        let coord = MemCoordinator::new();
        let key = registration_key(0);
        let ttl = Duration::from_secs(10);

        coord.register(0, &key, b"addr-a", ttl).await.unwrap();
        let err = coord.register(0, &key, b"addr-b", ttl).await;
        assert!(matches!(err, Err(Error::ShardAlreadyClaimed(0))));

        // A different shard is free to register
        coord
            .register(1, &registration_key(1), b"addr-b", ttl)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lease_expiry_frees_shard() {
        let coord = MemCoordinator::new();
        let key = registration_key(3);

        let lease = coord
            .register(3, &key, b"addr", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coord.get(&key).await.unwrap().is_none());
        assert!(coord.renew_lease(&lease).await.is_err());

        // Crash detected, shard reclaimable
        coord
            .register(3, &key, b"addr2", Duration::from_secs(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_renewal_keeps_lease_alive() {
        let coord = MemCoordinator::new();
        let key = registration_key(0);
        let lease = coord
            .register(0, &key, b"addr", Duration::from_millis(80))
            .await
            .unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            coord.renew_lease(&lease).await.unwrap();
        }
        assert!(coord.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let coord = MemCoordinator::new();

        assert!(coord.compare_and_swap("k", None, b"v1").await.unwrap());
        assert!(!coord.compare_and_swap("k", None, b"v2").await.unwrap());
        assert!(!coord
            .compare_and_swap("k", Some(b"wrong"), b"v2")
            .await
            .unwrap());
        assert!(coord.compare_and_swap("k", Some(b"v1"), b"v2").await.unwrap());
        assert_eq!(coord.get("k").await.unwrap().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_watch_sees_changes() {
        let coord = MemCoordinator::new();
        let mut rx = coord.watch_prefix("/pservers/").await.unwrap();

        coord.put("/pservers/0/registration", b"a", None).await.unwrap();
        coord.put("/other/key", b"x", None).await.unwrap();
        coord.delete("/pservers/0/registration").await.unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.key, "/pservers/0/registration");
        assert_eq!(ev.value.as_deref(), Some(b"a".as_slice()));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.key, "/pservers/0/registration");
        assert!(ev.value.is_none());
    }

    #[tokio::test]
    async fn test_revoke_drops_bound_keys() {
        let coord = MemCoordinator::new();
        let key = registration_key(7);
        let lease = coord
            .register(7, &key, b"addr", Duration::from_secs(10))
            .await
            .unwrap();

        coord.revoke_lease(&lease).await.unwrap();
        assert!(coord.get(&key).await.unwrap().is_none());
    }
}
