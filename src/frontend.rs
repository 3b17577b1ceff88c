//! JSON statistics endpoint
//!
//! `GET /stats` returns [`crate::gateway::StatsSnapshot`]. When a password is
//! configured the endpoint requires HTTP basic auth.

use crate::config::FrontendConfig;
use crate::gateway::Gateway;
use crate::shutdown::ShutdownCause;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct Credentials {
    login: String,
    password: String,
}

impl Credentials {
    fn matches(&self, authorization: Option<&HeaderValue>) -> bool {
        let Some(value) = authorization.and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((login, password)) => login == self.login && password == self.password,
            None => false,
        }
    }
}

async fn stats(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.stats_snapshot())
}

async fn require_auth(
    State(credentials): State<Credentials>,
    request: Request,
    next: Next,
) -> Response {
    if credentials.matches(request.headers().get(header::AUTHORIZATION)) {
        return next.run(request).await;
    }
    warn!("Rejected statistics request with bad credentials");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"getwork-gateway\"")],
    )
        .into_response()
}

/// Router serving the statistics endpoint
pub fn stats_router(gateway: Arc<Gateway>, config: &FrontendConfig) -> Router {
    let router = Router::new()
        .route("/stats", get(stats))
        .with_state(gateway);

    let router = if config.password.is_empty() {
        router
    } else {
        let credentials = Credentials {
            login: config.login.clone(),
            password: config.password.clone(),
        };
        router.layer(middleware::from_fn_with_state(credentials, require_auth))
    };

    router.layer(TraceLayer::new_for_http())
}

/// Serve the statistics endpoint on `addr` until shutdown.
///
/// Failing to bind, or the server exiting on its own, stops the gateway.
pub async fn serve(gateway: Arc<Gateway>, addr: SocketAddr, config: FrontendConfig) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %addr, error = %e, "Failed to bind statistics endpoint");
            gateway.shutdown().cancel(ShutdownCause::ServerFailure(format!(
                "failed to bind statistics endpoint {}: {}",
                addr, e
            )));
            return;
        }
    };
    info!(address = %addr, "Statistics endpoint listening");

    let shutdown = gateway.shutdown().clone();
    let app = stats_router(Arc::clone(&gateway), &config);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if gateway.shutdown().is_cancelled() {
        return;
    }

    let message = match result {
        Ok(()) => "statistics endpoint stopped unexpectedly".to_string(),
        Err(e) => format!("statistics endpoint failed: {}", e),
    };
    error!(error = %message, "Statistics endpoint failed");
    gateway
        .shutdown()
        .cancel(ShutdownCause::ServerFailure(message));
}
