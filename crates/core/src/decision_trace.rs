//! Decision trace retention.
//!
//! Every attempt or skip leaves a trace explaining what we saw and which
//! thresholds applied. Traces live in per-user rings inside an LRU store
//! bounded both in users and wall-clock age, and back the miss classifier's
//! nearest-in-time lookup.

use alloy::primitives::{Address, B256};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;

use crate::risk_gate::SkipReason;

/// What the decision was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Attempt,
    Skip,
}

/// Submission metadata attached to attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptMeta {
    pub tx_hash: B256,
    pub key_index: usize,
    pub gas_price_gwei: f64,
}

/// The thresholds in force when the decision was made. Always finite.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TraceThresholds {
    pub min_debt_usd: f64,
    pub min_profit_usd: f64,
    pub max_slippage_pct: f64,
}

/// One decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub user: Address,
    pub ts_ms: u64,
    pub block: u64,
    /// How far our view lagged the chain head at decision time.
    pub head_lag_blocks: u64,
    pub hf_at_decision: f64,
    pub hf_prev_block: Option<f64>,
    pub action: DecisionAction,
    pub skip_reason: Option<SkipReason>,
    pub thresholds: TraceThresholds,
    pub est_debt_usd: Option<f64>,
    pub est_profit_usd: Option<f64>,
    pub attempt_meta: Option<AttemptMeta>,
}

impl DecisionTrace {
    /// An attempt trace. `skip_reason` is structurally absent.
    #[allow(clippy::too_many_arguments)]
    pub fn attempt(
        user: Address,
        ts_ms: u64,
        block: u64,
        head_lag_blocks: u64,
        hf_at_decision: f64,
        hf_prev_block: Option<f64>,
        thresholds: TraceThresholds,
        est_debt_usd: f64,
        est_profit_usd: f64,
        meta: AttemptMeta,
    ) -> Self {
        Self {
            user,
            ts_ms,
            block,
            head_lag_blocks,
            hf_at_decision,
            hf_prev_block,
            action: DecisionAction::Attempt,
            skip_reason: None,
            thresholds,
            est_debt_usd: Some(est_debt_usd),
            est_profit_usd: Some(est_profit_usd),
            attempt_meta: Some(meta),
        }
    }

    /// A skip trace. `skip_reason` is structurally present.
    #[allow(clippy::too_many_arguments)]
    pub fn skip(
        user: Address,
        ts_ms: u64,
        block: u64,
        head_lag_blocks: u64,
        hf_at_decision: f64,
        hf_prev_block: Option<f64>,
        thresholds: TraceThresholds,
        reason: SkipReason,
        est_debt_usd: Option<f64>,
        est_profit_usd: Option<f64>,
    ) -> Self {
        Self {
            user,
            ts_ms,
            block,
            head_lag_blocks,
            hf_at_decision,
            hf_prev_block,
            action: DecisionAction::Skip,
            skip_reason: Some(reason),
            thresholds,
            est_debt_usd,
            est_profit_usd,
            attempt_meta: None,
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct TraceStoreConfig {
    /// Maximum users retained.
    pub max_users: usize,
    /// Traces kept per user.
    pub ring_size: usize,
    /// Wall-clock retention per trace.
    pub trace_ttl_ms: u64,
    /// Lookup window for miss classification.
    pub miss_window_ms: u64,
}

impl Default for TraceStoreConfig {
    fn default() -> Self {
        Self {
            max_users: 2_048,
            ring_size: 8,
            trace_ttl_ms: 30 * 60 * 1000,
            miss_window_ms: 5 * 60 * 1000,
        }
    }
}

struct UserRing {
    traces: SmallVec<[DecisionTrace; 4]>,
    last_used: u64,
}

/// LRU store of per-user trace rings.
pub struct DecisionTraceStore {
    rings: Mutex<(HashMap<Address, UserRing>, u64)>,
    config: TraceStoreConfig,
}

impl DecisionTraceStore {
    pub fn new(config: TraceStoreConfig) -> Self {
        Self {
            rings: Mutex::new((HashMap::new(), 0)),
            config,
        }
    }

    pub fn config(&self) -> &TraceStoreConfig {
        &self.config
    }

    /// Record a decision, evicting the least recently used user at
    /// capacity and the oldest trace past the ring size.
    pub fn record(&self, trace: DecisionTrace) {
        let mut guard = self.rings.lock();
        let (map, clock) = &mut *guard;
        *clock += 1;
        let tick = *clock;

        if !map.contains_key(&trace.user) && map.len() >= self.config.max_users {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, ring)| ring.last_used)
                .map(|(k, _)| *k)
            {
                map.remove(&oldest);
            }
        }

        let ring = map.entry(trace.user).or_insert_with(|| UserRing {
            traces: SmallVec::new(),
            last_used: tick,
        });
        ring.last_used = tick;
        ring.traces.push(trace);
        while ring.traces.len() > self.config.ring_size {
            ring.traces.remove(0);
        }
    }

    /// Whether any trace exists for the user (regardless of age).
    pub fn has_traces(&self, user: &Address) -> bool {
        self.rings.lock().0.contains_key(user)
    }

    /// Most recent unexpired trace for a user.
    pub fn latest(&self, user: &Address, now_ms: u64) -> Option<DecisionTrace> {
        let mut guard = self.rings.lock();
        let (map, clock) = &mut *guard;
        let ring = map.get_mut(user)?;
        *clock += 1;
        ring.last_used = *clock;
        ring.traces
            .iter()
            .rev()
            .find(|t| now_ms.saturating_sub(t.ts_ms) <= self.config.trace_ttl_ms)
            .cloned()
    }

    /// The trace nearest in time to `event_ts_ms`, within the miss window
    /// (clamped by the trace TTL).
    pub fn find_decision(&self, user: &Address, event_ts_ms: u64) -> Option<DecisionTrace> {
        let window = self.config.miss_window_ms.min(self.config.trace_ttl_ms);
        let guard = self.rings.lock();
        let ring = guard.0.get(user)?;

        ring.traces
            .iter()
            .filter(|t| t.ts_ms.abs_diff(event_ts_ms) <= window)
            .min_by_key(|t| t.ts_ms.abs_diff(event_ts_ms))
            .cloned()
    }

    /// Drop traces past their TTL; empty users go with them.
    pub fn prune(&self, now_ms: u64) {
        let mut guard = self.rings.lock();
        let ttl = self.config.trace_ttl_ms;
        for ring in guard.0.values_mut() {
            ring.traces
                .retain(|t| now_ms.saturating_sub(t.ts_ms) <= ttl);
        }
        guard.0.retain(|_, ring| !ring.traces.is_empty());
    }

    pub fn user_count(&self) -> usize {
        self.rings.lock().0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> TraceThresholds {
        TraceThresholds {
            min_debt_usd: 25.0,
            min_profit_usd: 1.0,
            max_slippage_pct: 0.5,
        }
    }

    fn skip_trace(byte: u8, ts_ms: u64, reason: SkipReason) -> DecisionTrace {
        DecisionTrace::skip(
            Address::repeat_byte(byte),
            ts_ms,
            1000,
            0,
            0.98,
            None,
            thresholds(),
            reason,
            Some(100.0),
            None,
        )
    }

    #[test]
    fn test_constructors_enforce_reason_invariant() {
        let attempt = DecisionTrace::attempt(
            Address::repeat_byte(1),
            1_000,
            1000,
            1,
            0.97,
            Some(1.01),
            thresholds(),
            500.0,
            12.0,
            AttemptMeta {
                tx_hash: B256::repeat_byte(0xAA),
                key_index: 0,
                gas_price_gwei: 60.0,
            },
        );
        assert_eq!(attempt.action, DecisionAction::Attempt);
        assert!(attempt.skip_reason.is_none());

        let skip = skip_trace(1, 1_000, SkipReason::DustPosition);
        assert_eq!(skip.action, DecisionAction::Skip);
        assert!(skip.skip_reason.is_some());
    }

    #[test]
    fn test_find_decision_nearest_in_window() {
        let store = DecisionTraceStore::new(TraceStoreConfig {
            miss_window_ms: 10_000,
            ..Default::default()
        });
        let user = Address::repeat_byte(1);
        store.record(skip_trace(1, 1_000, SkipReason::DustPosition));
        store.record(skip_trace(1, 8_000, SkipReason::InsufficientProfit));

        let found = store.find_decision(&user, 7_000).unwrap();
        assert_eq!(found.skip_reason, Some(SkipReason::InsufficientProfit));

        // Outside the window: nothing.
        assert!(store.find_decision(&user, 50_000).is_none());
    }

    #[test]
    fn test_ring_bounded() {
        let store = DecisionTraceStore::new(TraceStoreConfig {
            ring_size: 2,
            ..Default::default()
        });
        for i in 0..5u64 {
            store.record(skip_trace(1, i * 1_000, SkipReason::DustPosition));
        }
        let user = Address::repeat_byte(1);
        // Only the newest two survive: the nearest trace to t=0 is t=3000.
        let nearest = store.find_decision(&user, 0).unwrap();
        assert_eq!(nearest.ts_ms, 3_000);
        let latest = store.latest(&user, 10_000).unwrap();
        assert_eq!(latest.ts_ms, 4_000);
    }

    #[test]
    fn test_user_lru_eviction() {
        let store = DecisionTraceStore::new(TraceStoreConfig {
            max_users: 2,
            ..Default::default()
        });
        store.record(skip_trace(1, 1_000, SkipReason::DustPosition));
        store.record(skip_trace(2, 2_000, SkipReason::DustPosition));
        // Touch user 1 so user 2 is LRU.
        store.latest(&Address::repeat_byte(1), 2_000);
        store.record(skip_trace(3, 3_000, SkipReason::DustPosition));

        assert!(store.has_traces(&Address::repeat_byte(1)));
        assert!(!store.has_traces(&Address::repeat_byte(2)));
        assert!(store.has_traces(&Address::repeat_byte(3)));
    }

    #[test]
    fn test_ttl_prune() {
        let store = DecisionTraceStore::new(TraceStoreConfig {
            trace_ttl_ms: 5_000,
            ..Default::default()
        });
        store.record(skip_trace(1, 1_000, SkipReason::DustPosition));
        store.prune(10_000);
        assert_eq!(store.user_count(), 0);
    }
}
