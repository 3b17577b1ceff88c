//! getWork Mining Gateway
//!
//! Sits between getWork miners and a small set of upstream nodes:
//! - Health-driven upstream failover with priority failback
//! - Shared block template cache refreshed on a timer and on found blocks
//! - Line-delimited JSON-RPC sessions over HTTP POST
//! - Per-miner share, hashrate and luck accounting

pub mod config;
pub mod difficulty;
pub mod error;
pub mod frontend;
pub mod gateway;
pub mod logging;
pub mod miner;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod stats;
pub mod template;
pub mod upstream;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::{Gateway, StatsSnapshot};
pub use shutdown::{Shutdown, ShutdownCause};

/// Application information
pub const APP_NAME: &str = "getwork-gateway";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
