//! Round and luck accounting
//!
//! Share work below the block target accumulates in the current round. Every
//! block the upstream accepts closes the round and records its luck (round
//! work plus the block's own work, over block difficulty) under the block's
//! timestamp. Values near 1.0 mean blocks arrive as often as expected.

use crate::utils::current_timestamp_millis;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Default)]
struct RoundState {
    round_shares: u64,
    round_work: u128,
    /// (unix millis, luck) in insertion order
    blocks: VecDeque<(i64, f64)>,
}

impl RoundState {
    fn prune(&mut self, now_ms: i64, large_window: Duration) {
        let horizon = now_ms - large_window.as_millis() as i64;
        while let Some((at, _)) = self.blocks.front() {
            if *at < horizon {
                self.blocks.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Luck over one trailing window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LuckWindow {
    pub window_secs: u64,
    pub blocks_found: usize,
    /// Mean luck ratio, 0 when no blocks were found
    pub luck: f64,
}

/// Luck for the short and large windows plus the open round
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LuckStats {
    pub window: LuckWindow,
    pub large_window: LuckWindow,
    pub round_shares: u64,
    pub round_work: u128,
}

/// Shared round counters
#[derive(Debug, Default)]
pub struct RoundStats {
    inner: Mutex<RoundState>,
}

impl RoundStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a share of `difficulty` that fell short of the block target
    pub fn record_work(&self, difficulty: u128) {
        let mut state = self.inner.lock();
        state.round_shares += 1;
        state.round_work = state.round_work.saturating_add(difficulty);
    }

    /// Close the round for an accepted block and return its luck
    pub fn record_block(&self, block_difficulty: u128, large_window: Duration) -> f64 {
        self.record_block_at(current_timestamp_millis(), block_difficulty, large_window)
    }

    fn record_block_at(&self, now_ms: i64, block_difficulty: u128, large_window: Duration) -> f64 {
        let mut state = self.inner.lock();
        let block_difficulty = block_difficulty.max(1);
        let work = state.round_work.saturating_add(block_difficulty);
        let luck = work as f64 / block_difficulty as f64;
        state.blocks.push_back((now_ms, luck));
        state.round_shares = 0;
        state.round_work = 0;
        state.prune(now_ms, large_window);
        luck
    }

    /// Luck over both windows
    pub fn luck(&self, window: Duration, large_window: Duration) -> LuckStats {
        self.luck_at(current_timestamp_millis(), window, large_window)
    }

    fn luck_at(&self, now_ms: i64, window: Duration, large_window: Duration) -> LuckStats {
        let mut state = self.inner.lock();
        state.prune(now_ms, large_window);

        let summarize = |span: Duration| {
            let horizon = now_ms - span.as_millis() as i64;
            let (count, total) = state
                .blocks
                .iter()
                .filter(|(at, _)| *at >= horizon)
                .fold((0usize, 0.0f64), |(n, sum), (_, luck)| (n + 1, sum + luck));
            LuckWindow {
                window_secs: span.as_secs(),
                blocks_found: count,
                luck: if count == 0 { 0.0 } else { total / count as f64 },
            }
        };

        LuckStats {
            window: summarize(window),
            large_window: summarize(large_window),
            round_shares: state.round_shares,
            round_work: state.round_work,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(86400);

    #[test]
    fn test_shares_accumulate_round_work() {
        let stats = RoundStats::new();
        stats.record_work(100);
        stats.record_work(250);

        let luck = stats.luck_at(2, HOUR, DAY);
        assert_eq!(luck.round_shares, 2);
        assert_eq!(luck.round_work, 350);
        assert_eq!(luck.window.blocks_found, 0);
        assert_eq!(luck.window.luck, 0.0);
    }

    #[test]
    fn test_block_closes_round() {
        let stats = RoundStats::new();
        stats.record_work(500);
        let luck = stats.record_block_at(10, 1_000, DAY);
        assert!((luck - 1.5).abs() < 1e-9);

        let summary = stats.luck_at(20, HOUR, DAY);
        assert_eq!(summary.round_work, 0);
        assert_eq!(summary.round_shares, 0);
        assert_eq!(summary.window.blocks_found, 1);
        assert!((summary.window.luck - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_block_without_round_work_has_unit_luck() {
        let stats = RoundStats::new();
        assert!((stats.record_block_at(0, 1_000, DAY) - 1.0).abs() < 1e-9);
        assert!((stats.record_block_at(1, 0, DAY) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_windows_and_pruning() {
        let stats = RoundStats::new();
        let hour_ms = HOUR.as_millis() as i64;

        stats.record_block_at(0, 1_000, DAY);
        stats.record_work(2_000);
        stats.record_block_at(5 * hour_ms, 1_000, DAY);

        let summary = stats.luck_at(5 * hour_ms + 1, HOUR, DAY);
        assert_eq!(summary.window.blocks_found, 1);
        assert!((summary.window.luck - 3.0).abs() < 1e-9);
        assert_eq!(summary.large_window.blocks_found, 2);
        assert!((summary.large_window.luck - 2.0).abs() < 1e-9);

        // Beyond the large window the first block is dropped
        let later = stats.luck_at(25 * hour_ms, HOUR, DAY);
        assert_eq!(later.large_window.blocks_found, 1);
        assert_eq!(stats.inner.lock().blocks.len(), 1);
    }
}
