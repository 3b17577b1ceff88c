//! Gateway engine
//!
//! Wires the upstream pool, template cache, miner registry and round
//! accounting together, runs the two background loops and serves miner
//! connections over HTTP.

use crate::config::{Config, Settings};
use crate::logging::session_span;
use crate::miner::{MinerRegistry, MinerSnapshot};
use crate::protocol::MAX_LINE_LENGTH;
use crate::session::{Route, Session};
use crate::shutdown::{Shutdown, ShutdownCause};
use crate::stats::{LuckStats, RoundStats};
use crate::template::TemplateCache;
use crate::upstream::{UpstreamPool, UpstreamStats};
use crate::utils::current_timestamp_millis;
use crate::{Error, Result};
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures::TryStreamExt;
use futures::channel::mpsc;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, error, info, warn};

/// Responses buffered per connection before the session waits on the client
const RESPONSE_BUFFER: usize = 16;

/// Current template as shown in statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateStats {
    pub header: String,
    pub height: Option<u64>,
    pub difficulty: u128,
    pub fetched_at: String,
}

/// Everything the statistics endpoint reports
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub now: i64,
    pub active_upstream: String,
    pub upstreams: Vec<UpstreamStats>,
    pub template: Option<TemplateStats>,
    pub luck: LuckStats,
    pub miners_total: usize,
    pub hashrate: f64,
    pub miners: Vec<MinerSnapshot>,
}

/// The gateway engine
pub struct Gateway {
    pool: UpstreamPool,
    templates: TemplateCache,
    miners: MinerRegistry,
    rounds: RoundStats,
    settings: ArcSwap<Settings>,
    shutdown: Shutdown,
    block_found: Notify,
    upstream_names: Vec<(String, String)>,
}

impl Gateway {
    /// Build a gateway with HTTP upstream clients from the configuration
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = UpstreamPool::from_config(config)?;
        let gateway = Self::with_pool(pool, config.settings()?);
        Ok(Arc::new(gateway))
    }

    /// Build a gateway around an existing pool
    pub fn with_pool(pool: UpstreamPool, settings: Settings) -> Self {
        let upstream_names = pool
            .stats()
            .into_iter()
            .map(|u| (u.name, normalize_url(&u.url)))
            .collect();
        Self {
            pool,
            templates: TemplateCache::new(),
            miners: MinerRegistry::new(),
            rounds: RoundStats::new(),
            settings: ArcSwap::from_pointee(settings),
            shutdown: Shutdown::new(),
            block_found: Notify::new(),
            upstream_names,
        }
    }

    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }

    pub fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    pub fn miners(&self) -> &MinerRegistry {
        &self.miners
    }

    pub fn rounds(&self) -> &RoundStats {
        &self.rounds
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Current runtime tunables
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Ask the refresh loop for a template fetch right away
    pub fn notify_block_found(&self) {
        self.block_found.notify_one();
    }

    /// Swap the runtime tunables for those in `config`.
    ///
    /// The upstream list is fixed for the life of the process; changes to it
    /// are reported and ignored.
    pub fn reload_config(&self, config: &Config) -> Result<()> {
        config.validate()?;
        let settings = config.settings()?;

        let requested: Vec<(String, String)> = config
            .upstream
            .iter()
            .map(|u| (u.name.clone(), normalize_url(&u.url)))
            .collect();
        if requested != self.upstream_names {
            warn!("Upstream changes take effect after a restart");
        }

        self.settings.store(Arc::new(settings));
        info!("Configuration reloaded");
        Ok(())
    }

    /// Consistent-per-part view of the gateway state
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let settings = self.settings();
        let miners = self.miners.snapshot(
            settings.hashrate_window,
            settings.client_timeout,
            settings.hide_ip,
        );
        let hashrate = miners.iter().filter(|m| !m.timeout).map(|m| m.hashrate).sum();
        let upstreams = self.pool.stats();
        let active_upstream = self.pool.active().name().to_string();

        StatsSnapshot {
            now: current_timestamp_millis(),
            active_upstream,
            upstreams,
            template: self.templates.current().map(|t| TemplateStats {
                header: t.header.clone(),
                height: t.height,
                difficulty: t.difficulty,
                fetched_at: t.fetched_at.to_rfc3339(),
            }),
            luck: self
                .rounds
                .luck(settings.luck_window, settings.large_luck_window),
            miners_total: miners.len(),
            hashrate,
            miners,
        }
    }

    /// Start the template refresh and health check loops
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let refresh = Arc::clone(self);
        let health = Arc::clone(self);
        vec![
            tokio::spawn(async move { refresh.refresh_loop().await }),
            tokio::spawn(async move { health.health_loop().await }),
        ]
    }

    async fn refresh_loop(&self) {
        info!("Block template refresh loop started");
        loop {
            let interval = self.settings().block_refresh_interval;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.block_found.notified() => debug!("Refreshing after block found"),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.templates.fetch(&self.pool) => {}
            }
        }
        info!("Block template refresh loop stopped");
    }

    async fn health_loop(&self) {
        info!("Upstream health check loop started");
        loop {
            let interval = self.settings().upstream_check_interval;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.pool.check_all() => {}
            }
        }
        info!("Upstream health check loop stopped");
    }

    /// Miner-facing router
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/{id}", post(handle_single))
            .route("/{first}/{id}", post(handle_double))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Bind `addr` and serve until shutdown
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::server(format!("failed to bind {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Fetch the first template, start the background loops and serve
    /// `listener` until the shutdown token fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Proxy listening");
        }

        // Serving without a template only yields "Work not ready"; keep going
        let _ = self.templates.fetch(&self.pool).await;
        let loops = self.spawn_background();

        let app = Arc::clone(&self).router();
        let shutdown = self.shutdown.clone();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
        let mut server = tokio::spawn(async move { server.await });

        tokio::select! {
            result = &mut server => {
                let message = match result {
                    Ok(Ok(())) => "server stopped unexpectedly".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };
                error!(error = %message, "Proxy server failed");
                self.shutdown.cancel(ShutdownCause::ServerFailure(message));
            }
            _ = self.shutdown.cancelled() => {
                let grace = self.settings().shutdown_grace;
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(_) => info!("Connections drained"),
                    Err(_) => {
                        warn!(?grace, "Grace period elapsed, closing remaining connections");
                        server.abort();
                    }
                }
            }
        }

        for handle in loops {
            let _ = handle.await;
        }

        match self.shutdown.cause() {
            Some(ShutdownCause::ServerFailure(message)) => Err(Error::server(message.clone())),
            _ => Ok(()),
        }
    }

    fn open_session(self: Arc<Self>, route: Route, request: Request) -> Response {
        let ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default();

        let data = request
            .into_body()
            .into_data_stream()
            .map_err(io::Error::other);
        let lines = FramedRead::new(
            StreamReader::new(data),
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);

        let session = Session::new(self, ip, route);
        let span = session_span(
            &session.id().to_string(),
            &session.route().miner_id,
            session.ip(),
        );
        tokio::spawn(session.run(lines, tx).instrument(span));

        match Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from_stream(rx))
        {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Failed to build response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

fn normalize_url(raw: &str) -> String {
    url::Url::parse(raw)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

async fn handle_single(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
    request: Request,
) -> Response {
    gateway.open_session(Route::from_segments(None, &id), request)
}

async fn handle_double(
    State(gateway): State<Arc<Gateway>>,
    Path((first, id)): Path<(String, String)>,
    request: Request,
) -> Response {
    gateway.open_session(Route::from_segments(Some(&first), &id), request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Upstream;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fixed;

    #[async_trait]
    impl Upstream for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn url(&self) -> &str {
            "http://fixed/"
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        async fn get_work(&self) -> Result<Vec<String>> {
            Ok(vec![
                format!("0x{}", "a".repeat(64)),
                format!("0x{}", "b".repeat(64)),
                format!("0x00000001{}", "0".repeat(56)),
            ])
        }
        async fn submit_work(&self, _params: &[String]) -> Result<bool> {
            Ok(true)
        }
        async fn submit_hashrate(&self, _rate: &str, _id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn gateway() -> Arc<Gateway> {
        let pool = UpstreamPool::new(vec![Arc::new(Fixed) as Arc<dyn Upstream>]).unwrap();
        let settings = Config::default().settings().unwrap();
        Arc::new(Gateway::with_pool(pool, settings))
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let gateway = gateway();
        let snapshot = gateway.stats_snapshot();
        assert_eq!(snapshot.active_upstream, "fixed");
        assert!(snapshot.template.is_none());
        assert_eq!(snapshot.miners_total, 0);

        gateway.templates().fetch(gateway.pool()).await.unwrap();
        gateway.miners().get_or_create("rig", "10.0.0.1");

        let snapshot = gateway.stats_snapshot();
        assert_eq!(snapshot.template.unwrap().difficulty, 1u128 << 32);
        assert_eq!(snapshot.miners_total, 1);
        assert!(serde_json::to_string(&gateway.stats_snapshot()).is_ok());
    }

    #[tokio::test]
    async fn test_reload_swaps_settings() {
        let gateway = gateway();
        assert!(!gateway.settings().submit_hashrate);

        let mut config = Config::default();
        config.proxy.submit_hashrate = true;
        config.proxy.client_timeout = "10s".to_string();
        gateway.reload_config(&config).unwrap();

        assert!(gateway.settings().submit_hashrate);
        assert_eq!(gateway.settings().client_timeout, Duration::from_secs(10));

        config.proxy.luck_window = "bogus".to_string();
        assert!(gateway.reload_config(&config).is_err());
        assert!(gateway.settings().submit_hashrate);
    }

    #[tokio::test]
    async fn test_background_loops_stop_on_shutdown() {
        let gateway = gateway();
        let handles = gateway.spawn_background();
        gateway
            .shutdown()
            .cancel(ShutdownCause::Requested("test".into()));
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_block_found_triggers_refresh() {
        let gateway = gateway();
        let mut config = Config::default();
        config.proxy.block_refresh_interval = "1h".to_string();
        gateway.reload_config(&config).unwrap();

        let handles = gateway.spawn_background();
        assert!(gateway.templates().current().is_none());
        gateway.notify_block_found();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while gateway.templates().current().is_none() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gateway.templates().current().is_some());

        gateway
            .shutdown()
            .cancel(ShutdownCause::Requested("test".into()));
        for handle in handles {
            let _ = handle.await;
        }
    }
}
