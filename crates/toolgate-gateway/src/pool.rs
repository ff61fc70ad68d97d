//! Process-wide cache of downstream connections, one per server name

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use toolgate_core::ToolServer;
use toolgate_mcp::{Connector, DownstreamClient};

type Slot = Arc<OnceCell<Arc<dyn DownstreamClient>>>;

/// Lazily connects to downstream servers and shares each connection across
/// every session. Each server name owns a `OnceCell`, so concurrent first
/// calls wait on one connect instead of racing to open several. A failed
/// connect leaves the cell empty and the next caller tries again.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    slots: DashMap<String, Slot>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, name: &str) -> Slot {
        self.slots.entry(name.to_string()).or_default().clone()
    }

    /// The live connection for `server`, connecting on first use
    pub async fn get(&self, server: &ToolServer) -> Result<Arc<dyn DownstreamClient>> {
        loop {
            let mut slot = self.slot(&server.name);

            let stale = slot.get().is_some_and(|existing| existing.is_closed());
            if stale {
                warn!("Connection to '{}' is gone, reconnecting", server.name);
                self.slots
                    .remove_if(&server.name, |_, current| Arc::ptr_eq(current, &slot));
                slot = self.slot(&server.name);
            }

            let client = slot
                .get_or_try_init(|| async {
                    let client = self.connector.connect(server).await?;
                    info!("Pooled connection to '{}'", server.name);
                    Ok::<_, anyhow::Error>(client)
                })
                .await?;
            let client = Arc::clone(client);

            // An evict during the connect orphans the slot; nothing would ever close its client
            let current = self
                .slots
                .get(&server.name)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &slot));
            if current {
                return Ok(client);
            }
            warn!(
                "Connection to '{}' was evicted while connecting, reconnecting",
                server.name
            );
            client.close().await;
        }
    }

    /// Drop and close the connection for `name`, if any. Used when a server's
    /// registration changes so the next call reconnects with the new transport.
    pub async fn evict(&self, name: &str) {
        if let Some((_, slot)) = self.slots.remove(name)
            && let Some(client) = slot.get()
        {
            client.close().await;
            info!("Evicted pooled connection to '{}'", name);
        }
    }

    /// Number of established connections
    pub fn connected(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    /// Close every pooled connection (shutdown)
    pub async fn close_all(&self) {
        let clients: Vec<Arc<dyn DownstreamClient>> = self
            .slots
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        self.slots.clear();

        for client in &clients {
            client.close().await;
        }
        if !clients.is_empty() {
            info!("Closed {} downstream connections", clients.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClient, FakeConnector, server};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_first_calls_connect_once() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_client(FakeClient::new("research"))
                .with_delay(Duration::from_millis(50)),
        );
        let pool = Arc::new(ConnectionPool::new(connector.clone()));
        let target = server("research");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = Arc::clone(&pool);
            let target = target.clone();
            handles.push(tokio::spawn(async move { pool.get(&target).await.map(|_| ()) }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.connected(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_client(FakeClient::new("flaky"))
                .failing(1),
        );
        let pool = ConnectionPool::new(connector.clone());
        let target = server("flaky");

        assert!(pool.get(&target).await.is_err());
        assert_eq!(pool.connected(), 0);

        let client = pool.get(&target).await.unwrap();
        assert_eq!(client.server_name(), "flaky");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let connector = Arc::new(FakeConnector::new().with_client(FakeClient::new("market")));
        let pool = ConnectionPool::new(connector.clone());
        let target = server("market");

        let first = pool.get(&target).await.unwrap();
        first.close().await;

        pool.get(&target).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_evict_during_connect_leaves_one_tracked_connection() {
        let alpha = Arc::new(FakeClient::new("alpha"));
        let connector = Arc::new(
            FakeConnector::new()
                .with_shared_client(alpha.clone())
                .with_delay(Duration::from_millis(100)),
        );
        let pool = Arc::new(ConnectionPool::new(connector.clone()));

        let pending = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get(&server("alpha")).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.evict("alpha").await;

        pending.await.unwrap().unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.connected(), 1);
        assert!(!alpha.is_closed());

        pool.get(&server("alpha")).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_evict_and_close_all() {
        let alpha = Arc::new(FakeClient::new("alpha"));
        let beta = Arc::new(FakeClient::new("beta"));
        let connector = Arc::new(
            FakeConnector::new()
                .with_shared_client(alpha.clone())
                .with_shared_client(beta.clone()),
        );
        let pool = ConnectionPool::new(connector);

        pool.get(&server("alpha")).await.unwrap();
        pool.get(&server("beta")).await.unwrap();
        assert_eq!(pool.connected(), 2);

        pool.evict("alpha").await;
        assert!(alpha.is_closed());
        assert_eq!(pool.connected(), 1);

        pool.close_all().await;
        assert!(beta.is_closed());
        assert_eq!(pool.connected(), 0);
    }
}
