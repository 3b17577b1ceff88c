//! Miner registry
//!
//! Miners are identified by the route segment they connect with. An entry is
//! created on the first getWork from an unseen identity and lives until the
//! process exits.

use crate::utils::current_timestamp_millis;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Work handed to a miner by its latest getWork
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedWork {
    pub header: String,
    /// Share difficulty the miner was asked for
    pub difficulty: u128,
    /// Difficulty of the block the header belongs to
    pub block_difficulty: u128,
    pub height: Option<u64>,
}

#[derive(Debug)]
struct MinerState {
    ip: String,
    issued: Option<IssuedWork>,
    valid_shares: u64,
    stale_shares: u64,
    invalid_shares: u64,
    rejects: u64,
    accepts: u64,
    shares: VecDeque<(Instant, u128)>,
    reported: VecDeque<(Instant, u128)>,
    last_beat: Instant,
    last_beat_millis: i64,
}

fn prune<T>(samples: &mut VecDeque<(Instant, T)>, now: Instant, window: Duration) {
    while let Some((at, _)) = samples.front() {
        if now.saturating_duration_since(*at) > window {
            samples.pop_front();
        } else {
            break;
        }
    }
}

/// A connected (or once connected) miner
#[derive(Debug)]
pub struct Miner {
    id: String,
    started_at: Instant,
    state: RwLock<MinerState>,
}

impl Miner {
    fn new(id: &str, ip: &str, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            started_at: now,
            state: RwLock::new(MinerState {
                ip: ip.to_string(),
                issued: None,
                valid_shares: 0,
                stale_shares: 0,
                invalid_shares: 0,
                rejects: 0,
                accepts: 0,
                shares: VecDeque::new(),
                reported: VecDeque::new(),
                last_beat: now,
                last_beat_millis: current_timestamp_millis(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remember the work just handed out
    pub fn issue_work(&self, work: IssuedWork, ip: &str) {
        let mut state = self.state.write();
        state.issued = Some(work);
        if state.ip != ip {
            state.ip = ip.to_string();
        }
        state.last_beat = Instant::now();
        state.last_beat_millis = current_timestamp_millis();
    }

    /// Work handed out by the latest getWork
    pub fn issued(&self) -> Option<IssuedWork> {
        self.state.read().issued.clone()
    }

    /// Count a submission against a header that is no longer current
    pub fn record_stale(&self) {
        self.state.write().stale_shares += 1;
    }

    /// Count a submission with malformed parameters
    pub fn record_invalid(&self) {
        self.state.write().invalid_shares += 1;
    }

    /// Count a submission the upstream refused
    pub fn record_reject(&self) {
        self.state.write().rejects += 1;
    }

    /// Count a valid share of `difficulty`; `block` when the upstream accepted it
    pub fn record_share(&self, difficulty: u128, window: Duration, block: bool) {
        self.record_share_at(Instant::now(), difficulty, window, block);
    }

    fn record_share_at(&self, now: Instant, difficulty: u128, window: Duration, block: bool) {
        let mut state = self.state.write();
        state.valid_shares += 1;
        if block {
            state.accepts += 1;
        }
        state.shares.push_back((now, difficulty));
        prune(&mut state.shares, now, window);
        state.last_beat = now;
        state.last_beat_millis = current_timestamp_millis();
    }

    /// Record a self-reported hashrate
    pub fn record_hashrate_sample(&self, rate: u128, window: Duration) {
        self.record_hashrate_sample_at(Instant::now(), rate, window);
    }

    fn record_hashrate_sample_at(&self, now: Instant, rate: u128, window: Duration) {
        let mut state = self.state.write();
        state.reported.push_back((now, rate));
        prune(&mut state.reported, now, window);
    }

    /// Effective hashrate in hashes per second over `window`, bounded by the
    /// miner's age
    pub fn hashrate(&self, window: Duration) -> f64 {
        self.hashrate_at(Instant::now(), window)
    }

    fn hashrate_at(&self, now: Instant, window: Duration) -> f64 {
        let state = self.state.read();
        let span = now.saturating_duration_since(self.started_at).min(window);
        let secs = span.as_secs_f64().max(1.0);
        let work: f64 = state
            .shares
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= window)
            .map(|(_, d)| *d as f64)
            .sum();
        work / secs
    }

    /// Consistent view of this miner
    pub fn snapshot(&self, window: Duration, timeout: Duration, hide_ip: bool) -> MinerSnapshot {
        let now = Instant::now();
        let hashrate = self.hashrate_at(now, window);
        let state = self.state.read();
        let reported_hashrate = state
            .reported
            .back()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= window)
            .map(|(_, rate)| *rate)
            .unwrap_or(0);

        MinerSnapshot {
            id: self.id.clone(),
            ip: if hide_ip { None } else { Some(state.ip.clone()) },
            hashrate,
            reported_hashrate,
            valid_shares: state.valid_shares,
            stale_shares: state.stale_shares,
            invalid_shares: state.invalid_shares,
            rejects: state.rejects,
            accepts: state.accepts,
            last_beat: state.last_beat_millis,
            timeout: now.saturating_duration_since(state.last_beat) > timeout,
            height: state.issued.as_ref().and_then(|w| w.height),
        }
    }
}

/// Miner statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinerSnapshot {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub hashrate: f64,
    pub reported_hashrate: u128,
    pub valid_shares: u64,
    pub stale_shares: u64,
    pub invalid_shares: u64,
    pub rejects: u64,
    pub accepts: u64,
    /// Unix milliseconds of the last getWork or accepted share
    pub last_beat: i64,
    pub timeout: bool,
    pub height: Option<u64>,
}

/// Concurrent map of miners
#[derive(Debug, Default)]
pub struct MinerRegistry {
    miners: DashMap<String, Arc<Miner>>,
}

impl MinerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a miner, creating it on first sight.
    ///
    /// Concurrent callers for the same id all receive the same entry.
    pub fn get_or_create(&self, id: &str, ip: &str) -> Arc<Miner> {
        if let Some(miner) = self.miners.get(id) {
            return Arc::clone(miner.value());
        }
        let entry = self
            .miners
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Miner::new(id, ip, Instant::now())));
        Arc::clone(entry.value())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Miner>> {
        self.miners.get(id).map(|m| Arc::clone(m.value()))
    }

    pub fn len(&self) -> usize {
        self.miners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.miners.is_empty()
    }

    /// Snapshot of every miner, sorted by id
    pub fn snapshot(&self, window: Duration, timeout: Duration, hide_ip: bool) -> Vec<MinerSnapshot> {
        let miners: Vec<Arc<Miner>> = self.miners.iter().map(|m| Arc::clone(m.value())).collect();
        let mut snapshots: Vec<MinerSnapshot> = miners
            .iter()
            .map(|m| m.snapshot(window, timeout, hide_ip))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }
}
