//! Maps competitor liquidations to the reason we missed them.
//!
//! Every `LiquidationCall` we did not send gets classified: either the
//! borrower was never on our radar, we deliberately filtered them, we were
//! simply slower, or something unexplained happened. The notes field keeps
//! the numeric thresholds behind each verdict so audits do not have to
//! reconstruct config history.

use alloy::primitives::{Address, U256};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::decision_trace::{DecisionAction, DecisionTrace, DecisionTraceStore};
use crate::risk_gate::SkipReason;

/// Closed set of miss reasons; string tags feed metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Ours,
    NotInWatchSet,
    Raced,
    HfTransient,
    FilteredMinDebt,
    FilteredMinProfit,
    FilteredSlippage,
    FilteredPrefund,
    FilteredPriceStale,
    FilteredCallstaticFail,
    ExecutionFiltered,
    LatencyHeadLag,
    LatencyPricingDelay,
    Unknown,
}

impl MissReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ours => "ours",
            Self::NotInWatchSet => "not_in_watch_set",
            Self::Raced => "raced",
            Self::HfTransient => "hf_transient",
            Self::FilteredMinDebt => "filtered.min_debt",
            Self::FilteredMinProfit => "filtered.min_profit",
            Self::FilteredSlippage => "filtered.slippage",
            Self::FilteredPrefund => "filtered.prefund",
            Self::FilteredPriceStale => "filtered.price_stale",
            Self::FilteredCallstaticFail => "filtered.callstatic_fail",
            Self::ExecutionFiltered => "execution_filtered",
            Self::LatencyHeadLag => "latency.head_lag",
            Self::LatencyPricingDelay => "latency.pricing_delay",
            Self::Unknown => "unknown",
        }
    }
}

/// A competitor liquidation observed on chain.
#[derive(Debug, Clone)]
pub struct CompetitorLiquidation {
    pub user: Address,
    pub liquidator: Address,
    pub collateral_asset: Address,
    pub debt_asset: Address,
    pub debt_to_cover: U256,
    pub liquidated_collateral: U256,
    pub block: u64,
    pub ts_ms: u64,
}

/// Classification output.
#[derive(Debug, Clone)]
pub struct ClassifiedMiss {
    pub reason: MissReason,
    /// Numeric thresholds that drove the verdict.
    pub notes: String,
    pub trace: Option<DecisionTrace>,
}

/// Classifier configuration.
#[derive(Debug, Clone)]
pub struct MissClassifierConfig {
    /// Head lag beyond this many blocks is a latency miss.
    pub head_lag_blocks: u64,
    /// Users first seen liquidatable within this many blocks of the
    /// competitor call count as transient.
    pub hf_transient_blocks: u64,
    /// Bound on the watched/first-seen memory.
    pub memory_capacity: usize,
}

impl Default for MissClassifierConfig {
    fn default() -> Self {
        Self {
            head_lag_blocks: 2,
            hf_transient_blocks: 3,
            memory_capacity: 16_384,
        }
    }
}

/// Bounded FIFO memory of addresses.
struct AddressMemory {
    set: HashSet<Address>,
    order: VecDeque<Address>,
    capacity: usize,
}

impl AddressMemory {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, address: Address) {
        if self.set.insert(address) {
            if self.order.len() >= self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                }
            }
            self.order.push_back(address);
        }
    }

    fn contains(&self, address: &Address) -> bool {
        self.set.contains(address)
    }
}

/// Miss classifier over the decision trace store.
pub struct MissClassifier {
    config: MissClassifierConfig,
    our_executors: HashSet<Address>,
    /// Users that were ever in any watch tier.
    watched: Mutex<AddressMemory>,
    /// Block at which a user was first seen with HF below 1.
    first_liquidatable: Mutex<HashMap<Address, u64>>,
}

impl MissClassifier {
    pub fn new(our_executors: Vec<Address>, config: MissClassifierConfig) -> Self {
        let capacity = config.memory_capacity;
        Self {
            config,
            our_executors: our_executors.into_iter().collect(),
            watched: Mutex::new(AddressMemory::new(capacity)),
            first_liquidatable: Mutex::new(HashMap::new()),
        }
    }

    /// Record that a user entered some watch tier.
    pub fn note_tracked(&self, user: Address) {
        self.watched.lock().insert(user);
    }

    /// Record the first block a user was observed liquidatable.
    pub fn note_liquidatable(&self, user: Address, block: u64) {
        let mut map = self.first_liquidatable.lock();
        map.entry(user).or_insert(block);
        if map.len() > self.config.memory_capacity {
            // Drop the lowest block entries; they are the oldest sightings.
            let mut blocks: Vec<_> = map.iter().map(|(a, b)| (*b, *a)).collect();
            blocks.sort_unstable();
            for (_, address) in blocks.into_iter().take(map.len() / 4) {
                map.remove(&address);
            }
        }
    }

    /// Classify a competitor liquidation against our decision history.
    pub fn classify(
        &self,
        event: &CompetitorLiquidation,
        traces: &DecisionTraceStore,
    ) -> ClassifiedMiss {
        let classified = self.classify_inner(event, traces);
        metrics::increment_counter!(
            "miss_classified_total",
            "reason" => classified.reason.as_str()
        );
        classified
    }

    fn classify_inner(
        &self,
        event: &CompetitorLiquidation,
        traces: &DecisionTraceStore,
    ) -> ClassifiedMiss {
        if self.our_executors.contains(&event.liquidator) {
            return ClassifiedMiss {
                reason: MissReason::Ours,
                notes: format!("liquidator={}", event.liquidator),
                trace: None,
            };
        }

        let trace = traces.find_decision(&event.user, event.ts_ms);

        let Some(trace) = trace else {
            if !self.watched.lock().contains(&event.user) {
                return ClassifiedMiss {
                    reason: MissReason::NotInWatchSet,
                    notes: "user never entered any tier".to_string(),
                    trace: None,
                };
            }
            if let Some(first_block) = self.first_liquidatable.lock().get(&event.user).copied() {
                let blocks_since = event.block.saturating_sub(first_block);
                if blocks_since <= self.config.hf_transient_blocks {
                    return ClassifiedMiss {
                        reason: MissReason::HfTransient,
                        notes: format!(
                            "blocks_since_first_seen={blocks_since} <= {}",
                            self.config.hf_transient_blocks
                        ),
                        trace: None,
                    };
                }
            }
            return ClassifiedMiss {
                reason: MissReason::Raced,
                notes: "watched but no decision near the event".to_string(),
                trace: None,
            };
        };

        if trace.action == DecisionAction::Attempt {
            return ClassifiedMiss {
                reason: MissReason::Raced,
                notes: format!(
                    "attempt at ts={} lost to {}",
                    trace.ts_ms, event.liquidator
                ),
                trace: Some(trace),
            };
        }

        // Skip traces: filter codes map directly; hf_not_below_threshold
        // falls through to the latency analysis below.
        if let Some(reason) = trace.skip_reason {
            if let Some(filtered) = map_skip_reason(reason) {
                let notes = format!(
                    "skip={} min_debt_usd={} min_profit_usd={} max_slippage_pct={}",
                    reason.as_str(),
                    trace.thresholds.min_debt_usd,
                    trace.thresholds.min_profit_usd,
                    trace.thresholds.max_slippage_pct
                );
                return ClassifiedMiss {
                    reason: filtered,
                    notes,
                    trace: Some(trace),
                };
            }
        }

        if trace.head_lag_blocks > self.config.head_lag_blocks {
            return ClassifiedMiss {
                reason: MissReason::LatencyHeadLag,
                notes: format!(
                    "head_lag_blocks={} > {}",
                    trace.head_lag_blocks, self.config.head_lag_blocks
                ),
                trace: Some(trace),
            };
        }

        if trace.hf_at_decision >= 1.0 && trace.hf_prev_block.map(|hf| hf < 1.0).unwrap_or(false) {
            return ClassifiedMiss {
                reason: MissReason::LatencyPricingDelay,
                notes: format!(
                    "hf_at_decision={} hf_prev_block={:?}",
                    trace.hf_at_decision, trace.hf_prev_block
                ),
                trace: Some(trace),
            };
        }

        ClassifiedMiss {
            reason: MissReason::Unknown,
            notes: String::new(),
            trace: Some(trace),
        }
    }
}

/// Skip reasons that represent a deliberate filter map to their public
/// `filtered.*` code; threshold-timing reasons return `None` and are
/// analyzed as latency instead.
fn map_skip_reason(reason: SkipReason) -> Option<MissReason> {
    match reason {
        SkipReason::DustPosition | SkipReason::BelowMinDebtUsd | SkipReason::BelowMinRepayUsd => {
            Some(MissReason::FilteredMinDebt)
        }
        SkipReason::InsufficientProfit => Some(MissReason::FilteredMinProfit),
        SkipReason::SlippageExceeded => Some(MissReason::FilteredSlippage),
        SkipReason::InsufficientPrefund => Some(MissReason::FilteredPrefund),
        SkipReason::PriceStale | SkipReason::PriceMissing => Some(MissReason::FilteredPriceStale),
        SkipReason::CallstaticFailed => Some(MissReason::FilteredCallstaticFail),
        SkipReason::ExecutionDisabled
        | SkipReason::GasPriceTooHigh
        | SkipReason::ScalingAnomaly
        | SkipReason::DailyLossLimit
        | SkipReason::DuplicateBlock => Some(MissReason::ExecutionFiltered),
        SkipReason::HfNotBelowThreshold => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision_trace::{AttemptMeta, TraceStoreConfig, TraceThresholds};
    use alloy::primitives::B256;

    fn thresholds() -> TraceThresholds {
        TraceThresholds {
            min_debt_usd: 25.0,
            min_profit_usd: 1.0,
            max_slippage_pct: 0.5,
        }
    }

    fn event(user_byte: u8, block: u64, ts_ms: u64) -> CompetitorLiquidation {
        CompetitorLiquidation {
            user: Address::repeat_byte(user_byte),
            liquidator: Address::repeat_byte(0xEE),
            collateral_asset: Address::repeat_byte(0xC0),
            debt_asset: Address::repeat_byte(0xD0),
            debt_to_cover: U256::from(1_000u64),
            liquidated_collateral: U256::from(1_050u64),
            block,
            ts_ms,
        }
    }

    fn classifier() -> (MissClassifier, DecisionTraceStore) {
        (
            MissClassifier::new(
                vec![Address::repeat_byte(0x99)],
                MissClassifierConfig::default(),
            ),
            DecisionTraceStore::new(TraceStoreConfig::default()),
        )
    }

    #[test]
    fn test_ours() {
        let (classifier, traces) = classifier();
        let mut event = event(1, 12345, 10_000);
        event.liquidator = Address::repeat_byte(0x99);
        assert_eq!(
            classifier.classify(&event, &traces).reason,
            MissReason::Ours
        );
    }

    #[test]
    fn test_not_in_watch_set() {
        let (classifier, traces) = classifier();
        // User 0x00..00 never tracked, no trace.
        let event = event(0, 12345, 10_000);
        assert_eq!(
            classifier.classify(&event, &traces).reason,
            MissReason::NotInWatchSet
        );
    }

    #[test]
    fn test_raced_on_attempt() {
        let (classifier, traces) = classifier();
        classifier.note_tracked(Address::repeat_byte(1));
        traces.record(DecisionTrace::attempt(
            Address::repeat_byte(1),
            5_000,
            12346,
            0,
            0.98,
            None,
            thresholds(),
            500.0,
            10.0,
            AttemptMeta {
                tx_hash: B256::repeat_byte(0xAA),
                key_index: 0,
                gas_price_gwei: 60.0,
            },
        ));

        let classified = classifier.classify(&event(1, 12346, 10_000), &traces);
        assert_eq!(classified.reason, MissReason::Raced);
        assert!(classified.trace.is_some());
    }

    #[test]
    fn test_hf_transient() {
        let (classifier, traces) = classifier();
        let user = Address::repeat_byte(2);
        classifier.note_tracked(user);
        classifier.note_liquidatable(user, 12343);

        // Competitor lands two blocks after we first saw HF < 1; we had
        // no decision yet.
        let classified = classifier.classify(&event(2, 12345, 10_000), &traces);
        assert_eq!(classified.reason, MissReason::HfTransient);
        assert!(classified.notes.contains("blocks_since_first_seen=2"));
    }

    #[test]
    fn test_watched_without_trace_is_raced() {
        let (classifier, traces) = classifier();
        let user = Address::repeat_byte(3);
        classifier.note_tracked(user);
        classifier.note_liquidatable(user, 12000);

        // First seen long ago: not transient.
        assert_eq!(
            classifier.classify(&event(3, 12345, 10_000), &traces).reason,
            MissReason::Raced
        );
    }

    #[test]
    fn test_filtered_dust_maps_to_min_debt() {
        let (classifier, traces) = classifier();
        classifier.note_tracked(Address::repeat_byte(4));
        traces.record(DecisionTrace::skip(
            Address::repeat_byte(4),
            9_000,
            12345,
            0,
            0.99,
            None,
            thresholds(),
            SkipReason::DustPosition,
            Some(5.0),
            None,
        ));

        let classified = classifier.classify(&event(4, 12345, 10_000), &traces);
        assert_eq!(classified.reason, MissReason::FilteredMinDebt);
        assert!(classified.notes.contains("min_debt_usd=25"));
    }

    #[test]
    fn test_filtered_unprofitable() {
        let (classifier, traces) = classifier();
        classifier.note_tracked(Address::repeat_byte(5));
        traces.record(DecisionTrace::skip(
            Address::repeat_byte(5),
            9_000,
            12345,
            0,
            0.99,
            None,
            thresholds(),
            SkipReason::InsufficientProfit,
            Some(100.0),
            Some(5.0),
        ));

        assert_eq!(
            classifier.classify(&event(5, 12345, 10_000), &traces).reason,
            MissReason::FilteredMinProfit
        );
    }

    #[test]
    fn test_latency_head_lag() {
        let (classifier, traces) = classifier();
        classifier.note_tracked(Address::repeat_byte(6));
        traces.record(DecisionTrace::skip(
            Address::repeat_byte(6),
            9_000,
            12345,
            3,
            1.01,
            None,
            thresholds(),
            SkipReason::HfNotBelowThreshold,
            None,
            None,
        ));

        let classified = classifier.classify(&event(6, 12345, 10_000), &traces);
        assert_eq!(classified.reason, MissReason::LatencyHeadLag);
        assert!(classified.notes.contains("head_lag_blocks=3 > 2"));
    }

    #[test]
    fn test_latency_pricing_delay() {
        let (classifier, traces) = classifier();
        classifier.note_tracked(Address::repeat_byte(7));
        traces.record(DecisionTrace::skip(
            Address::repeat_byte(7),
            9_000,
            12345,
            1,
            1.002,
            Some(0.997),
            thresholds(),
            SkipReason::HfNotBelowThreshold,
            None,
            None,
        ));

        assert_eq!(
            classifier.classify(&event(7, 12345, 10_000), &traces).reason,
            MissReason::LatencyPricingDelay
        );
    }

    #[test]
    fn test_unknown_fallback() {
        let (classifier, traces) = classifier();
        classifier.note_tracked(Address::repeat_byte(8));
        traces.record(DecisionTrace::skip(
            Address::repeat_byte(8),
            9_000,
            12345,
            0,
            1.05,
            Some(1.04),
            thresholds(),
            SkipReason::HfNotBelowThreshold,
            None,
            None,
        ));

        assert_eq!(
            classifier.classify(&event(8, 12345, 10_000), &traces).reason,
            MissReason::Unknown
        );
    }
}
