//! Upstream selection and health tracking
//!
//! Declaration order is priority: after every health check the lowest-indexed
//! client that passed becomes active. When nothing passes the previous choice
//! is kept.

use super::{Upstream, bounded};
use crate::config::Config;
use crate::upstream::RpcClient;
use crate::{Error, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Consecutive failures before a client is considered sick
pub const SICK_THRESHOLD: u32 = 5;

/// Consecutive successes before a sick client is trusted again
pub const ALIVE_THRESHOLD: u32 = 5;

#[derive(Debug, Default)]
struct Classification {
    sick: bool,
    sick_rate: u32,
    success_rate: u32,
}

/// Per-client health slot. Only the health check writes `class`; the request
/// path reports through the atomic counters.
#[derive(Debug, Default)]
struct Health {
    class: Mutex<Classification>,
    pending_failures: AtomicU32,
    accepts: AtomicU64,
    rejects: AtomicU64,
    fails: AtomicU64,
}

impl Health {
    fn mark_sick(&self) {
        let mut class = self.class.lock();
        class.sick_rate += 1;
        class.success_rate = 0;
        if !class.sick && class.sick_rate >= SICK_THRESHOLD {
            class.sick = true;
            self.fails.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn mark_alive(&self) {
        let mut class = self.class.lock();
        if class.sick {
            class.success_rate += 1;
            if class.success_rate >= ALIVE_THRESHOLD {
                *class = Classification::default();
            }
        } else {
            class.sick_rate = 0;
        }
    }

    fn is_sick(&self) -> bool {
        self.class.lock().sick
    }
}

/// Snapshot of one upstream for statistics
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStats {
    pub name: String,
    pub url: String,
    pub sick: bool,
    pub active: bool,
    pub accepts: u64,
    pub rejects: u64,
    pub fails: u64,
}

/// Ordered, index-stable set of upstream clients
pub struct UpstreamPool {
    clients: Vec<Arc<dyn Upstream>>,
    health: Vec<Health>,
    active: AtomicUsize,
}

impl UpstreamPool {
    /// Create a pool; at least one client is required
    pub fn new(clients: Vec<Arc<dyn Upstream>>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::config("at least one upstream is required"));
        }
        let health = clients.iter().map(|_| Health::default()).collect();
        Ok(Self {
            clients,
            health,
            active: AtomicUsize::new(0),
        })
    }

    /// Build HTTP clients for every configured upstream
    pub fn from_config(config: &Config) -> Result<Self> {
        let clients = config
            .upstream
            .iter()
            .map(|u| {
                RpcClient::new(u, &config.proxy.rpc_namespace)
                    .map(|c| Arc::new(c) as Arc<dyn Upstream>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(clients)
    }

    /// Currently selected client
    pub fn active(&self) -> Arc<dyn Upstream> {
        Arc::clone(&self.clients[self.active_index()])
    }

    /// Index of the currently selected client
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Number of configured clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Record a failed request-path call; folded in by the next check
    pub fn record_failure(&self, index: usize) {
        if let Some(h) = self.health.get(index) {
            h.pending_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a share the upstream accepted
    pub fn record_accept(&self, index: usize) {
        if let Some(h) = self.health.get(index) {
            h.accepts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a share the upstream rejected
    pub fn record_reject(&self, index: usize) {
        if let Some(h) = self.health.get(index) {
            h.rejects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Probe every client concurrently and re-select the active one.
    ///
    /// Returns the active index after the check.
    pub async fn check_all(&self) -> usize {
        let probes = self
            .clients
            .iter()
            .map(|client| async move { bounded(client.as_ref(), client.check()).await });
        let results = join_all(probes).await;

        let mut candidate = None;
        for (index, result) in results.into_iter().enumerate() {
            let health = &self.health[index];
            let name = self.clients[index].name();

            let pending = health.pending_failures.swap(0, Ordering::Relaxed);
            for _ in 0..pending {
                health.mark_sick();
            }

            let passed = match result {
                Ok(()) => {
                    health.mark_alive();
                    !health.is_sick()
                }
                Err(e) => {
                    health.mark_sick();
                    warn!(upstream = name, error = %e, "Upstream didn't pass check");
                    false
                }
            };
            debug!(upstream = name, passed, "Upstream checked");

            if passed && candidate.is_none() {
                candidate = Some(index);
            }
        }

        let current = self.active_index();
        match candidate {
            Some(index) if index != current => {
                info!(upstream = self.clients[index].name(), "Switching to upstream");
                self.active.store(index, Ordering::Release);
                index
            }
            Some(index) => index,
            None => {
                warn!(
                    upstream = self.clients[current].name(),
                    "No healthy upstream, keeping current"
                );
                current
            }
        }
    }

    /// Statistics for every client in declaration order
    pub fn stats(&self) -> Vec<UpstreamStats> {
        let active = self.active_index();
        self.clients
            .iter()
            .zip(&self.health)
            .enumerate()
            .map(|(index, (client, health))| UpstreamStats {
                name: client.name().to_string(),
                url: client.url().to_string(),
                sick: health.is_sick(),
                active: index == active,
                accepts: health.accepts.load(Ordering::Relaxed),
                rejects: health.rejects.load(Ordering::Relaxed),
                fails: health.fails.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct Scripted {
        name: String,
        healthy: AtomicBool,
    }

    impl Scripted {
        fn new(name: &str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                healthy: AtomicBool::new(healthy),
            })
        }

        fn set(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Upstream for Scripted {
        fn name(&self) -> &str {
            &self.name
        }
        fn url(&self) -> &str {
            "http://scripted"
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(100)
        }
        async fn get_work(&self) -> Result<Vec<String>> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(vec!["0x1".into(), "0x2".into(), "0x3".into()])
            } else {
                Err(Error::upstream(&self.name, "down"))
            }
        }
        async fn submit_work(&self, _params: &[String]) -> Result<bool> {
            Ok(true)
        }
        async fn submit_hashrate(&self, _rate: &str, _id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn pool(clients: &[Arc<Scripted>]) -> UpstreamPool {
        UpstreamPool::new(
            clients
                .iter()
                .map(|c| Arc::clone(c) as Arc<dyn Upstream>)
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(UpstreamPool::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_prefers_lowest_healthy_index() {
        let a = Scripted::new("a", false);
        let b = Scripted::new("b", true);
        let c = Scripted::new("c", true);
        let pool = pool(&[a.clone(), b, c]);

        assert_eq!(pool.check_all().await, 1);
        assert_eq!(pool.active().name(), "b");

        // A single failure is not enough to make "a" sick, so it fails back at once
        a.set(true);
        assert_eq!(pool.check_all().await, 0);
    }

    #[tokio::test]
    async fn test_all_failing_keeps_active() {
        let a = Scripted::new("a", true);
        let b = Scripted::new("b", true);
        let pool = pool(&[a.clone(), b.clone()]);
        pool.active.store(1, Ordering::SeqCst);

        a.set(false);
        b.set(false);
        assert_eq!(pool.check_all().await, 1);
        assert_eq!(pool.active().name(), "b");
    }

    #[tokio::test]
    async fn test_sick_hysteresis() {
        let a = Scripted::new("a", false);
        let b = Scripted::new("b", true);
        let pool = pool(&[a.clone(), b]);

        for _ in 0..SICK_THRESHOLD {
            pool.check_all().await;
        }
        assert!(pool.stats()[0].sick);
        assert_eq!(pool.stats()[0].fails, 1);

        // Recovered probes do not count until the alive threshold is reached
        a.set(true);
        for _ in 0..ALIVE_THRESHOLD - 1 {
            assert_eq!(pool.check_all().await, 1);
        }
        assert_eq!(pool.check_all().await, 0);
        assert!(!pool.stats()[0].sick);
    }

    #[tokio::test]
    async fn test_request_failures_fold_into_check() {
        let a = Scripted::new("a", true);
        let b = Scripted::new("b", true);
        let pool = pool(&[a, b]);

        for _ in 0..SICK_THRESHOLD {
            pool.record_failure(0);
        }
        assert!(!pool.stats()[0].sick);

        assert_eq!(pool.check_all().await, 1);
        assert!(pool.stats()[0].sick);
    }

    #[test]
    fn test_counters() {
        let pool = pool(&[Scripted::new("a", true)]);
        pool.record_accept(0);
        pool.record_accept(0);
        pool.record_reject(0);
        pool.record_accept(7);

        let stats = pool.stats();
        assert_eq!(stats[0].accepts, 2);
        assert_eq!(stats[0].rejects, 1);
        assert!(stats[0].active);
    }
}
