//! JSON-RPC over HTTP client for one upstream node

use super::Upstream;
use crate::config::UpstreamConfig;
use crate::protocol::Method;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// HTTP JSON-RPC client.
///
/// Immutable after construction apart from the request id counter.
#[derive(Debug)]
pub struct RpcClient {
    name: String,
    url: Url,
    timeout: Duration,
    namespace: String,
    http: Client,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Build a client from an upstream descriptor
    pub fn new(config: &UpstreamConfig, namespace: &str) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| Error::config(format!("Invalid upstream URL: {}", e)))?;
        let timeout = config.timeout_duration()?;

        let http = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(config.pool.max(1))
            .user_agent(format!("getwork-gateway/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            name: config.name.clone(),
            url,
            timeout,
            namespace: namespace.to_string(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue one call and return its `result`
    #[instrument(skip(self, params), fields(upstream = %self.name))]
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(&self.name, self.timeout)
                } else {
                    Error::from(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::upstream(
                &self.name,
                format!("HTTP status {}", status),
            ));
        }

        let body: RpcResponse = response.json().await?;
        if let Some(err) = body.error {
            return Err(Error::upstream(
                &self.name,
                format!("{} (code {})", err.message, err.code),
            ));
        }

        debug!(method, "upstream call completed");
        body.result
            .ok_or_else(|| Error::upstream(&self.name, "response without result"))
    }

    fn expect_bool(&self, value: Value) -> Result<bool> {
        value
            .as_bool()
            .ok_or_else(|| Error::upstream(&self.name, format!("expected boolean, got {}", value)))
    }
}

#[async_trait]
impl Upstream for RpcClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        self.url.as_str()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn get_work(&self) -> Result<Vec<String>> {
        let method = Method::GetWork.in_namespace(&self.namespace);
        let result = self.call(&method, json!([])).await?;
        let work: Vec<String> = serde_json::from_value(result)
            .map_err(|e| Error::upstream(&self.name, format!("malformed work: {}", e)))?;
        if work.len() < 3 {
            return Err(Error::upstream(
                &self.name,
                format!("work package has {} fields", work.len()),
            ));
        }
        Ok(work)
    }

    async fn submit_work(&self, params: &[String]) -> Result<bool> {
        let method = Method::SubmitWork.in_namespace(&self.namespace);
        let result = self.call(&method, json!(params)).await?;
        self.expect_bool(result)
    }

    async fn submit_hashrate(&self, rate: &str, id: &str) -> Result<bool> {
        let method = Method::SubmitHashrate.in_namespace(&self.namespace);
        let result = self.call(&method, json!([rate, id])).await?;
        self.expect_bool(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(url: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: "main".to_string(),
            url: url.to_string(),
            timeout: "2s".to_string(),
            pool: 4,
        }
    }

    #[test]
    fn test_client_creation() {
        let client = RpcClient::new(&descriptor("http://127.0.0.1:8543"), "aqua").unwrap();
        assert_eq!(client.name(), "main");
        assert_eq!(client.url(), "http://127.0.0.1:8543/");
        assert_eq!(client.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_url() {
        assert!(RpcClient::new(&descriptor("not a url"), "aqua").is_err());
    }

    #[test]
    fn test_request_shape() {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 3,
            method: "aqua_getWork",
            params: json!([]),
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded,
            json!({"jsonrpc": "2.0", "id": 3, "method": "aqua_getWork", "params": []})
        );
    }
}
