//! Pre-simulated liquidation plan cache.
//!
//! Plans are precomputed for at-risk users so the hot path can skip asset
//! selection and sizing. Keyed by `(user, debtAsset, collateralAsset,
//! blockTag)` with a TTL measured in blocks; both reads and writes maintain
//! LRU order.

use alloy::primitives::{Address, U256};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;

/// A precomputed liquidation plan.
#[derive(Debug, Clone)]
pub struct LiquidationPlan {
    pub user: Address,
    pub debt_asset: Address,
    pub collateral_asset: Address,
    /// Block the plan was computed against.
    pub block_tag: u64,
    pub repay_amount: U256,
    pub expected_collateral: U256,
    pub estimated_profit_usd: f64,
    pub created_at_ms: u64,
    /// Prices the plan was computed with, for invalidation heuristics.
    pub price_snapshot: SmallVec<[(Address, U256); 4]>,
}

type PlanKey = (Address, Address, Address, u64);

struct Slot {
    plan: LiquidationPlan,
    last_used: u64,
}

/// LRU plan cache with block TTL.
pub struct PreSimCache {
    slots: Mutex<(HashMap<PlanKey, Slot>, u64)>,
    capacity: usize,
    ttl_blocks: u64,
}

impl PreSimCache {
    pub fn new(capacity: usize, ttl_blocks: u64) -> Self {
        Self {
            slots: Mutex::new((HashMap::new(), 0)),
            capacity: capacity.max(1),
            ttl_blocks,
        }
    }

    /// Insert a plan, evicting the least recently used entry at capacity.
    pub fn set(&self, plan: LiquidationPlan) {
        let key = (
            plan.user,
            plan.debt_asset,
            plan.collateral_asset,
            plan.block_tag,
        );
        let mut guard = self.slots.lock();
        let (map, clock) = &mut *guard;
        *clock += 1;

        if map.len() >= self.capacity && !map.contains_key(&key) {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| *k)
            {
                map.remove(&oldest);
            }
        }
        map.insert(
            key,
            Slot {
                plan,
                last_used: *clock,
            },
        );
    }

    /// Fetch an unexpired plan. A hit at `current_block` requires
    /// `current_block <= block_tag + ttl_blocks`; expired entries are
    /// dropped on access.
    pub fn get(
        &self,
        user: Address,
        debt_asset: Address,
        collateral_asset: Address,
        block_tag: u64,
        current_block: u64,
    ) -> Option<LiquidationPlan> {
        let key = (user, debt_asset, collateral_asset, block_tag);
        let mut guard = self.slots.lock();
        let (map, clock) = &mut *guard;

        let slot = map.get_mut(&key)?;
        if current_block > slot.plan.block_tag + self.ttl_blocks {
            map.remove(&key);
            metrics::increment_counter!("presim_expired_total");
            return None;
        }
        *clock += 1;
        slot.last_used = *clock;
        metrics::increment_counter!("presim_hits_total");
        Some(slot.plan.clone())
    }

    /// Drop every plan whose TTL has lapsed at `current_block`.
    pub fn prune_expired(&self, current_block: u64) -> usize {
        let mut guard = self.slots.lock();
        let before = guard.0.len();
        guard
            .0
            .retain(|_, slot| current_block <= slot.plan.block_tag + self.ttl_blocks);
        before - guard.0.len()
    }

    /// Drop all plans for a user (position changed).
    pub fn invalidate_user(&self, user: &Address) {
        let mut guard = self.slots.lock();
        guard.0.retain(|key, _| &key.0 != user);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn plan(user_byte: u8, block_tag: u64) -> LiquidationPlan {
        LiquidationPlan {
            user: Address::repeat_byte(user_byte),
            debt_asset: Address::repeat_byte(0xD0),
            collateral_asset: Address::repeat_byte(0xC0),
            block_tag,
            repay_amount: U256::from(1_000u64),
            expected_collateral: U256::from(1_050u64),
            estimated_profit_usd: 12.5,
            created_at_ms: 0,
            price_snapshot: smallvec![],
        }
    }

    fn get(cache: &PreSimCache, user_byte: u8, block_tag: u64, current: u64) -> Option<LiquidationPlan> {
        cache.get(
            Address::repeat_byte(user_byte),
            Address::repeat_byte(0xD0),
            Address::repeat_byte(0xC0),
            block_tag,
            current,
        )
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = PreSimCache::new(16, 3);
        cache.set(plan(1, 100));

        assert!(get(&cache, 1, 100, 100).is_some());
        assert!(get(&cache, 1, 100, 103).is_some());
    }

    #[test]
    fn test_expiry_past_ttl() {
        let cache = PreSimCache::new(16, 3);
        cache.set(plan(1, 100));

        assert!(get(&cache, 1, 100, 104).is_none());
        // Expired entries are removed on access.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = PreSimCache::new(2, 10);
        cache.set(plan(1, 100));
        cache.set(plan(2, 100));
        // Touch user 1 so user 2 becomes LRU.
        assert!(get(&cache, 1, 100, 100).is_some());

        cache.set(plan(3, 100));
        assert_eq!(cache.len(), 2);
        assert!(get(&cache, 1, 100, 100).is_some());
        assert!(get(&cache, 2, 100, 100).is_none());
        assert!(get(&cache, 3, 100, 100).is_some());
    }

    #[test]
    fn test_prune_expired() {
        let cache = PreSimCache::new(16, 3);
        cache.set(plan(1, 100));
        cache.set(plan(2, 105));

        let pruned = cache.prune_expired(106);
        assert_eq!(pruned, 1);
        assert_eq!(cache.len(), 1);
        assert!(get(&cache, 2, 105, 106).is_some());
    }

    #[test]
    fn test_invalidate_user() {
        let cache = PreSimCache::new(16, 3);
        cache.set(plan(1, 100));
        cache.set(plan(2, 100));

        cache.invalidate_user(&Address::repeat_byte(1));
        assert!(get(&cache, 1, 100, 100).is_none());
        assert!(get(&cache, 2, 100, 100).is_some());
    }
}
