//! Per-connection protocol session
//!
//! A session reads newline-delimited requests from one HTTP request body and
//! writes one response line per request into the response body, in order.
//! Framing violations abort the connection without a response.

use crate::difficulty::resolve_override;
use crate::gateway::Gateway;
use crate::miner::{IssuedWork, Miner};
use crate::protocol::{ErrorReply, Method, Request, Response};
use crate::upstream::bounded;
use crate::utils::{decode_hex_fixed, format_hash_rate, parse_hex_quantity, short_hash};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{Value, json};
use std::io;
use std::sync::Arc;
use tokio_util::codec::LinesCodecError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of one dispatched request
pub type Outcome = std::result::Result<Value, ErrorReply>;

/// Sender half of a streamed response body
pub type BodySender = mpsc::Sender<std::result::Result<Bytes, io::Error>>;

/// Route parameters a miner connected with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Miner identity
    pub miner_id: String,
    /// Difficulty segment, if present
    pub difficulty: Option<String>,
}

impl Route {
    /// Classify a one- or two-segment path.
    ///
    /// In `/{first}/{id}` a first segment starting with `0x` is an ignored
    /// prefix; anything else is a difficulty.
    pub fn from_segments(first: Option<&str>, id: &str) -> Self {
        let difficulty = first
            .filter(|s| !s.starts_with("0x"))
            .map(str::to_string);
        Self {
            miner_id: id.to_string(),
            difficulty,
        }
    }
}

/// One miner connection
pub struct Session {
    id: Uuid,
    ip: String,
    route: Route,
    gateway: Arc<Gateway>,
    miner: Option<Arc<Miner>>,
}

impl Session {
    pub fn new(gateway: Arc<Gateway>, ip: impl Into<String>, route: Route) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip: ip.into(),
            route,
            gateway,
            miner: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    fn miner(&mut self) -> Arc<Miner> {
        if let Some(miner) = &self.miner {
            return Arc::clone(miner);
        }
        let miner = self
            .gateway
            .miners()
            .get_or_create(&self.route.miner_id, &self.ip);
        self.miner = Some(Arc::clone(&miner));
        miner
    }

    /// The registered miner for this route, without creating one
    fn known_miner(&mut self) -> Option<Arc<Miner>> {
        if self.miner.is_none() {
            self.miner = self.gateway.miners().get(&self.route.miner_id);
        }
        self.miner.clone()
    }

    /// Drive the session until the body ends, the client idles out, a framing
    /// error occurs or the gateway shuts down.
    pub async fn run<S>(mut self, mut lines: S, mut tx: BodySender)
    where
        S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
    {
        let shutdown = self.gateway.shutdown().clone();
        loop {
            let idle = self.gateway.settings().client_timeout;
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Closing session for shutdown");
                    break;
                }
                next = tokio::time::timeout(idle, lines.next()) => next,
            };

            let line = match next {
                Err(_) => {
                    debug!(?idle, "Client idle timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    warn!("Socket flood detected");
                    abort(&mut tx, "socket flood").await;
                    break;
                }
                Ok(Some(Err(LinesCodecError::Io(e)))) => {
                    info!(error = %e, "Error reading request body");
                    abort(&mut tx, "read error").await;
                    break;
                }
                Ok(Some(Ok(line))) => line,
            };

            if line.trim().is_empty() {
                continue;
            }

            let request = match Request::decode(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Dropping connection");
                    abort(&mut tx, "malformed request").await;
                    break;
                }
            };

            let response = self.dispatch(request).await;
            let encoded = match response.to_line() {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(error = %e, "Failed to encode response");
                    abort(&mut tx, "encode failure").await;
                    break;
                }
            };
            if tx.send(Ok(Bytes::from(encoded))).await.is_err() {
                debug!("Client went away");
                break;
            }
        }
    }

    /// Answer one request
    pub async fn dispatch(&mut self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let outcome = match request.method_enum() {
            Method::GetWork => self.get_work(),
            Method::SubmitWork => self.submit_work(&request).await,
            Method::SubmitHashrate => self.submit_hashrate(&request).await,
            Method::Unknown(method) => {
                warn!(method = %method, "Unknown RPC method");
                Err(ErrorReply::method_not_supported(&method))
            }
        };
        Response::from_outcome(id, outcome)
    }

    fn get_work(&mut self) -> Outcome {
        let template = self
            .gateway
            .templates()
            .current()
            .ok_or_else(ErrorReply::work_not_ready)?;
        let settings = self.gateway.settings();
        let miner = self.miner();

        let resolved = resolve_override(
            self.route.difficulty.as_deref(),
            settings.difficulty_multiplier,
        );
        let (difficulty, target) = match &resolved {
            Some(o) => (o.difficulty, Some(o.target.as_str())),
            None => (template.difficulty, None),
        };

        miner.issue_work(
            IssuedWork {
                header: template.header.clone(),
                difficulty,
                block_difficulty: template.difficulty,
                height: template.height,
            },
            &self.ip,
        );
        debug!(header = short_hash(&template.header), %difficulty, "Issued work");

        Ok(json!(template.work_reply(target)))
    }

    async fn submit_work(&mut self, request: &Request) -> Outcome {
        let miner = self.known_miner();
        let params = match submission_params(request) {
            Ok(params) => params,
            Err(reason) => {
                if let Some(miner) = &miner {
                    miner.record_invalid();
                }
                warn!(reason = %reason, "Malformed submission");
                return Err(ErrorReply::invalid_params(reason));
            }
        };

        let Some(miner) = miner else {
            info!(
                header = short_hash(&params[1]),
                "Submission before any work was issued"
            );
            return Ok(json!(false));
        };
        let issued = match miner.issued() {
            Some(work) if work.header.eq_ignore_ascii_case(&params[1]) => work,
            _ => {
                miner.record_stale();
                info!(header = short_hash(&params[1]), "Stale share");
                return Ok(json!(false));
            }
        };

        let pool = self.gateway.pool();
        let index = pool.active_index();
        let upstream = pool.active();
        let settings = self.gateway.settings();

        match bounded(upstream.as_ref(), upstream.submit_work(&params)).await {
            Ok(true) => {
                pool.record_accept(index);
                miner.record_share(issued.difficulty, settings.hashrate_window, true);
                let luck = self
                    .gateway
                    .rounds()
                    .record_block(issued.block_difficulty, settings.large_luck_window);
                info!(
                    upstream = upstream.name(),
                    height = ?issued.height,
                    hashrate = %format_hash_rate(miner.hashrate(settings.hashrate_window)),
                    luck,
                    "Block found"
                );
                self.gateway.notify_block_found();
                Ok(json!(true))
            }
            Ok(false) if issued.difficulty < issued.block_difficulty => {
                // A share at the miner's own target that is not a block
                pool.record_reject(index);
                miner.record_share(issued.difficulty, settings.hashrate_window, false);
                self.gateway.rounds().record_work(issued.difficulty);
                debug!(upstream = upstream.name(), "Share below block target");
                Ok(json!(false))
            }
            Ok(false) => {
                pool.record_reject(index);
                miner.record_reject();
                warn!(upstream = upstream.name(), "Share rejected by upstream");
                Ok(json!(false))
            }
            Err(e) => {
                if e.is_upstream_fault() {
                    pool.record_failure(index);
                }
                error!(
                    upstream = upstream.name(),
                    kind = e.category(),
                    error = %e,
                    "Share submission failed"
                );
                Err(ErrorReply::upstream_failure())
            }
        }
    }

    async fn submit_hashrate(&mut self, request: &Request) -> Outcome {
        let settings = self.gateway.settings();
        if !settings.submit_hashrate {
            return Ok(json!(true));
        }

        let (rate, id) = hashrate_params(request).map_err(ErrorReply::invalid_params)?;
        let value = parse_hex_quantity(&rate).map_err(ErrorReply::invalid_params)?;
        match self.known_miner() {
            Some(miner) => miner.record_hashrate_sample(value, settings.hashrate_window),
            None => debug!(rate = %rate, "Hashrate from a miner without work"),
        }

        let upstream = self.gateway.pool().active();
        tokio::spawn(async move {
            if let Err(e) = bounded(upstream.as_ref(), upstream.submit_hashrate(&rate, &id)).await
            {
                debug!(upstream = upstream.name(), error = %e, "Hashrate forward failed");
            }
        });

        Ok(json!(true))
    }
}

/// Validate `[nonce, header, mix]`
fn submission_params(request: &Request) -> std::result::Result<Vec<String>, String> {
    let params = request
        .string_params()
        .ok_or_else(|| "expected an array of strings".to_string())?;
    if params.len() != 3 {
        return Err(format!("expected 3 params, got {}", params.len()));
    }
    for (value, (name, len)) in params.iter().zip([("nonce", 8), ("header", 32), ("mix", 32)]) {
        decode_hex_fixed(value, len).map_err(|e| format!("{}: {}", name, e))?;
    }
    Ok(params)
}

/// Validate `[rate, id]`
fn hashrate_params(request: &Request) -> std::result::Result<(String, String), String> {
    let params = request
        .string_params()
        .ok_or_else(|| "expected an array of strings".to_string())?;
    let [rate, id] = <[String; 2]>::try_from(params)
        .map_err(|p| format!("expected 2 params, got {}", p.len()))?;
    let digits = id
        .strip_prefix("0x")
        .ok_or_else(|| "id: missing 0x prefix".to_string())?;
    hex::decode(digits).map_err(|e| format!("id: {}", e))?;
    Ok((rate, id))
}

/// Abort the response body so the client sees the connection drop
async fn abort(tx: &mut BodySender, reason: &str) {
    let _ = tx
        .send(Err(io::Error::new(io::ErrorKind::InvalidData, reason.to_string())))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(params: Value) -> Request {
        Request {
            id: Some(json!(1)),
            method: "eth_submitWork".to_string(),
            params,
        }
    }

    fn hash(c: char) -> String {
        format!("0x{}", c.to_string().repeat(64))
    }

    #[test]
    fn test_route_classification() {
        assert_eq!(
            Route::from_segments(None, "rig1"),
            Route { miner_id: "rig1".into(), difficulty: None }
        );
        assert_eq!(
            Route::from_segments(Some("0xdeadbeef"), "rig1").difficulty,
            None
        );
        assert_eq!(
            Route::from_segments(Some("5"), "rig1").difficulty,
            Some("5".to_string())
        );
    }

    #[test]
    fn test_submission_params() {
        let good = request(json!(["0x0000000000000001", hash('a'), hash('b')]));
        assert_eq!(submission_params(&good).unwrap().len(), 3);

        assert!(submission_params(&request(json!(["0x01", hash('a'), hash('b')]))).is_err());
        assert!(submission_params(&request(json!(["0x0000000000000001", hash('a')]))).is_err());
        assert!(submission_params(&request(json!([1, 2, 3]))).is_err());
        assert!(submission_params(&request(json!({"nonce": "0x1"}))).is_err());
        assert!(
            submission_params(&request(json!(["0000000000000001", hash('a'), hash('b')])))
                .is_err()
        );
    }

    #[test]
    fn test_hashrate_params() {
        let ok = request(json!(["0x500000", hash('c')]));
        assert_eq!(hashrate_params(&ok).unwrap().0, "0x500000");

        assert!(hashrate_params(&request(json!(["0x500000"]))).is_err());
        assert!(hashrate_params(&request(json!(["0x500000", "nothex"]))).is_err());
    }
}
