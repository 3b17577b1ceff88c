//! Process-wide cancellation
//!
//! A single token observed by the serving loop and both background loops.
//! The first recorded cause wins; later calls only log.

use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why the gateway stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Operator signal, by name
    Signal(String),
    /// The serving socket failed
    ServerFailure(String),
    /// Requested through the API
    Requested(String),
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Signal(name) => write!(f, "received signal {}", name),
            ShutdownCause::ServerFailure(msg) => write!(f, "server failure: {}", msg),
            ShutdownCause::Requested(msg) => write!(f, "{}", msg),
        }
    }
}

/// Cloneable shutdown handle
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    cause: Arc<OnceCell<ShutdownCause>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with `cause`. Returns false if already cancelled.
    pub fn cancel(&self, cause: ShutdownCause) -> bool {
        match self.cause.set(cause.clone()) {
            Ok(()) => {
                info!(%cause, "Shutting down");
                self.token.cancel();
                true
            }
            Err(_) => {
                debug!(%cause, "Shutdown already in progress");
                false
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The winning cause, once cancelled
    pub fn cause(&self) -> Option<&ShutdownCause> {
        self.cause.get()
    }

    /// Resolves when cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
