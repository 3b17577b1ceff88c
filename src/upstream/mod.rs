//! Upstream blockchain nodes
//!
//! [`Upstream`] is the seam between the gateway and a node. [`RpcClient`]
//! talks JSON-RPC over HTTP; tests substitute scripted implementations.
//! [`UpstreamPool`] owns the ordered client list and decides which one is
//! active.

pub mod client;
pub mod pool;

pub use client::RpcClient;
pub use pool::{ALIVE_THRESHOLD, SICK_THRESHOLD, UpstreamPool, UpstreamStats};

use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// One upstream node
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Display name
    fn name(&self) -> &str;

    /// Endpoint, for statistics
    fn url(&self) -> &str;

    /// Per-call timeout
    fn timeout(&self) -> Duration;

    /// Fetch the current work package: `[header, seed, target, height?]`
    async fn get_work(&self) -> Result<Vec<String>>;

    /// Submit `[nonce, header, mix]`; `Ok(false)` means the node rejected it
    async fn submit_work(&self, params: &[String]) -> Result<bool>;

    /// Forward a reported hashrate `[rate, id]`
    async fn submit_hashrate(&self, rate: &str, id: &str) -> Result<bool>;

    /// Liveness probe
    async fn check(&self) -> Result<()> {
        self.get_work().await.map(|_| ())
    }
}

/// Run an upstream call bounded by that upstream's timeout
pub async fn bounded<T, F>(upstream: &dyn Upstream, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let limit = upstream.timeout();
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(upstream.name(), limit)),
    }
}
