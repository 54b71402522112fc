//! etcd-backed coordinator
//!
//! etcd is consumed as a black-box key-value store: lease grant/keep-alive
//! for registration liveness, transactions for compare-and-swap, and watch
//! streams for prefix change feeds. Every call is bounded by the configured
//! coordination timeout.

use crate::common::{Error, Result};
use crate::coord::{CoordEvent, Coordinator, LeaseHandle};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, PutOptions, Txn, TxnOp, WatchOptions,
};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct EtcdCoordinator {
    client: Client,
    timeout: Duration,
}

impl EtcdCoordinator {
    /// Connect to the given etcd endpoints. `timeout` bounds this call and
    /// every subsequent one.
    pub async fn connect(endpoints: &[String], timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_timeout(timeout)
            .with_connect_timeout(timeout);

        let client = match tokio::time::timeout(timeout, Client::connect(endpoints, Some(options)))
            .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => return Err(Error::Coordination(e.to_string())),
            Err(_) => return Err(Error::CoordinationTimeout),
        };

        tracing::info!("Connected to etcd: {:?}", endpoints);
        Ok(Self { client, timeout })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(Error::Coordination(e.to_string())),
            Err(_) => Err(Error::CoordinationTimeout),
        }
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn register(
        &self,
        shard: u32,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<LeaseHandle> {
        let mut client = self.client.clone();
        let lease = self
            .bounded(client.lease_grant(ttl.as_secs().max(1) as i64, None))
            .await?;
        let lease_id = lease.id();

        // Create-if-absent bound to the fresh lease; losing the transaction
        // means another live instance holds the shard.
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);

        let resp = self.bounded(client.txn(txn)).await?;
        if !resp.succeeded() {
            // Drop the unused lease; losing the race to claim is the caller's
            // signal, not this cleanup.
            let _ = self.bounded(client.lease_revoke(lease_id)).await;
            return Err(Error::ShardAlreadyClaimed(shard));
        }

        Ok(LeaseHandle { id: lease_id })
    }

    async fn renew_lease(&self, lease: &LeaseHandle) -> Result<()> {
        let mut client = self.client.clone();
        let id = lease.id;

        let fut = async move {
            let (mut keeper, mut stream) = client.lease_keep_alive(id).await?;
            keeper.keep_alive().await?;
            stream.message().await
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(Some(resp))) if resp.ttl() > 0 => Ok(()),
            Ok(Ok(_)) => Err(Error::Coordination(format!("lease {id} has expired"))),
            Ok(Err(e)) => Err(Error::Coordination(e.to_string())),
            Err(_) => Err(Error::CoordinationTimeout),
        }
    }

    async fn revoke_lease(&self, lease: &LeaseHandle) -> Result<()> {
        let mut client = self.client.clone();
        self.bounded(client.lease_revoke(lease.id)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = self.bounded(client.get(key, None)).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<&LeaseHandle>) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|l| PutOptions::new().with_lease(l.id));
        self.bounded(client.put(key, value, options)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        self.bounded(client.delete(key, None)).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool> {
        let mut client = self.client.clone();

        let compare = match expected {
            Some(value) => Compare::value(key, CompareOp::Equal, value),
            None => Compare::create_revision(key, CompareOp::Equal, 0),
        };
        let txn = Txn::new()
            .when([compare])
            .and_then([TxnOp::put(key, new, None)]);

        let resp = self.bounded(client.txn(txn)).await?;
        Ok(resp.succeeded())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<CoordEvent>> {
        let mut client = self.client.clone();
        let options = WatchOptions::new().with_prefix();

        let (watcher, mut stream) = self
            .bounded(client.watch(prefix, Some(options)))
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Watcher lives as long as the forwarding task; dropping it
            // cancels the server-side watch.
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("etcd watch stream error: {}", e);
                        break;
                    }
                };
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = String::from_utf8_lossy(kv.key()).to_string();
                    let value = match event.event_type() {
                        EventType::Put => Some(kv.value().to_vec()),
                        EventType::Delete => None,
                    };
                    if tx.send(CoordEvent { key, value }).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
