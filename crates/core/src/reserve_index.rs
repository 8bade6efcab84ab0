//! Per-reserve index snapshots and recheck gating.
//!
//! Reserve interest indexes accrue in RAY precision. A reserve-data update
//! only forces position rechecks when either index moved enough basis
//! points since the last recompute, which keeps quiet reserves from
//! burning RPC budget.

use alloy::primitives::{Address, U256};
use dashmap::DashMap;

use crate::wad_math::delta_bps;

/// Snapshot of both indexes at the last recompute.
#[derive(Debug, Clone)]
pub struct ReserveIndices {
    pub reserve: Address,
    /// RAY-scaled cumulative liquidity index.
    pub liquidity_index: U256,
    /// RAY-scaled cumulative variable borrow index.
    pub variable_borrow_index: U256,
    pub block_number: u64,
}

/// Outcome of the recheck gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecheckDecision {
    pub should: bool,
    /// Largest absolute index move in basis points.
    pub max_delta_bps: u64,
    pub reason: &'static str,
}

/// Tracker of reserve index snapshots.
pub struct ReserveIndexTracker {
    snapshots: DashMap<Address, ReserveIndices>,
    /// Recheck when max(|delta|) reaches this many bps.
    threshold_bps: u64,
}

impl ReserveIndexTracker {
    pub fn new(threshold_bps: u64) -> Self {
        Self {
            snapshots: DashMap::new(),
            threshold_bps,
        }
    }

    /// Gate a reserve-data update. The first observation of a reserve
    /// always triggers. A triggering decision commits the new snapshot,
    /// since the caller recomputes immediately after.
    pub fn should_recheck(
        &self,
        reserve: Address,
        new_liquidity_index: U256,
        new_variable_borrow_index: U256,
        block_number: u64,
    ) -> RecheckDecision {
        let Some(prior) = self.snapshots.get(&reserve).map(|s| s.clone()) else {
            self.commit(reserve, new_liquidity_index, new_variable_borrow_index, block_number);
            return RecheckDecision {
                should: true,
                max_delta_bps: 0,
                reason: "first_observation",
            };
        };

        let liq_delta = delta_bps(prior.liquidity_index, new_liquidity_index).unsigned_abs();
        let var_delta =
            delta_bps(prior.variable_borrow_index, new_variable_borrow_index).unsigned_abs();
        let max_delta = liq_delta.max(var_delta);

        if max_delta >= self.threshold_bps {
            self.commit(reserve, new_liquidity_index, new_variable_borrow_index, block_number);
            RecheckDecision {
                should: true,
                max_delta_bps: max_delta,
                reason: "index_moved",
            }
        } else {
            RecheckDecision {
                should: false,
                max_delta_bps: max_delta,
                reason: "below_threshold",
            }
        }
    }

    /// Current snapshot for a reserve.
    pub fn get(&self, reserve: &Address) -> Option<ReserveIndices> {
        self.snapshots.get(reserve).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn commit(
        &self,
        reserve: Address,
        liquidity_index: U256,
        variable_borrow_index: U256,
        block_number: u64,
    ) {
        self.snapshots.insert(
            reserve,
            ReserveIndices {
                reserve,
                liquidity_index,
                variable_borrow_index,
                block_number,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wad_math::RAY;

    fn ray_plus_bps(bps: u64) -> U256 {
        RAY + RAY * U256::from(bps) / U256::from(10_000u64)
    }

    #[test]
    fn test_first_observation_triggers() {
        let tracker = ReserveIndexTracker::new(2);
        let reserve = Address::repeat_byte(1);

        let decision = tracker.should_recheck(reserve, RAY, RAY, 100);
        assert!(decision.should);
        assert_eq!(decision.reason, "first_observation");
        assert!(tracker.get(&reserve).is_some());
    }

    #[test]
    fn test_small_move_gated() {
        let tracker = ReserveIndexTracker::new(2);
        let reserve = Address::repeat_byte(1);
        tracker.should_recheck(reserve, RAY, RAY, 100);

        // 1 bps move on either index stays below the 2 bps threshold.
        let decision = tracker.should_recheck(reserve, ray_plus_bps(1), RAY, 101);
        assert!(!decision.should);
        assert_eq!(decision.reason, "below_threshold");
        assert_eq!(decision.max_delta_bps, 1);

        // Snapshot unchanged: the gate compares against the last recompute.
        assert_eq!(tracker.get(&reserve).unwrap().liquidity_index, RAY);
    }

    #[test]
    fn test_threshold_move_triggers_and_commits() {
        let tracker = ReserveIndexTracker::new(2);
        let reserve = Address::repeat_byte(1);
        tracker.should_recheck(reserve, RAY, RAY, 100);

        // 3 bps on the borrow index triggers (max of the two deltas).
        let decision = tracker.should_recheck(reserve, RAY, ray_plus_bps(3), 105);
        assert!(decision.should);
        assert_eq!(decision.reason, "index_moved");
        assert_eq!(decision.max_delta_bps, 3);

        let snapshot = tracker.get(&reserve).unwrap();
        assert_eq!(snapshot.variable_borrow_index, ray_plus_bps(3));
        assert_eq!(snapshot.block_number, 105);
    }

    #[test]
    fn test_exact_threshold_triggers() {
        let tracker = ReserveIndexTracker::new(2);
        let reserve = Address::repeat_byte(1);
        tracker.should_recheck(reserve, RAY, RAY, 100);

        let decision = tracker.should_recheck(reserve, ray_plus_bps(2), RAY, 101);
        assert!(decision.should);
    }
}
