//! Bounded candidate set of borrowers worth monitoring.
//!
//! Every address seen in a pool event or seed lands here. The set is
//! capacity-bounded; when full, eviction prefers entries that look healthy
//! (last HF above the healthy threshold) with the oldest touch time, and
//! falls back to the globally oldest touch when nothing qualifies.

use alloy::primitives::Address;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

/// HF above which an entry is considered healthy enough to evict first.
const HEALTHY_HF: f64 = 1.1;

/// One monitored borrower.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub address: Address,
    /// Last computed health factor, if any.
    pub last_hf: Option<f64>,
    /// Unix millis of the last HF recompute.
    pub last_check_ts_ms: u64,
    /// Unix millis of the last event touch.
    pub touched_at_ts_ms: u64,
}

/// Bounded borrower index with touch/refresh bookkeeping.
pub struct CandidateManager {
    entries: DashMap<Address, Candidate>,
    /// Serializes admissions so the capacity bound holds exactly.
    admission: Mutex<()>,
    max_candidates: usize,
}

impl CandidateManager {
    pub fn new(max_candidates: usize) -> Self {
        Self {
            entries: DashMap::new(),
            admission: Mutex::new(()),
            max_candidates: max_candidates.max(1),
        }
    }

    /// Add a new candidate (or touch an existing one). Returns true when a
    /// new entry was created.
    pub fn add(&self, address: Address, now_ms: u64) -> bool {
        if let Some(mut existing) = self.entries.get_mut(&address) {
            existing.touched_at_ts_ms = now_ms;
            return false;
        }

        let _admission = self.admission.lock();
        if self.entries.contains_key(&address) {
            return false;
        }
        if self.entries.len() >= self.max_candidates {
            self.evict_one();
        }
        self.entries.insert(
            address,
            Candidate {
                address,
                last_hf: None,
                last_check_ts_ms: 0,
                touched_at_ts_ms: now_ms,
            },
        );
        true
    }

    /// Refresh the touch timestamp of an existing entry.
    pub fn touch(&self, address: &Address, now_ms: u64) {
        if let Some(mut entry) = self.entries.get_mut(address) {
            entry.touched_at_ts_ms = now_ms;
        }
    }

    /// Record a health factor recompute result.
    pub fn update_hf(&self, address: &Address, hf: f64, now_ms: u64) {
        if let Some(mut entry) = self.entries.get_mut(address) {
            entry.last_hf = Some(hf);
            entry.last_check_ts_ms = now_ms;
        }
    }

    pub fn get(&self, address: &Address) -> Option<Candidate> {
        self.entries.get(address).map(|e| e.clone())
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    /// Remove a known-safe or liquidated borrower.
    pub fn remove(&self, address: &Address) {
        self.entries.remove(address);
    }

    /// Entries whose last HF check is older than `threshold_ms`.
    pub fn get_stale(&self, threshold_ms: u64, now_ms: u64) -> Vec<Candidate> {
        self.entries
            .iter()
            .filter(|e| now_ms.saturating_sub(e.last_check_ts_ms) > threshold_ms)
            .map(|e| e.clone())
            .collect()
    }

    /// All tracked addresses.
    pub fn addresses(&self) -> Vec<Address> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_candidates
    }

    /// Evict exactly one entry. Healthy entries (HF above the threshold)
    /// with the oldest touch go first; otherwise the globally oldest touch.
    fn evict_one(&self) {
        let healthy_victim = self
            .entries
            .iter()
            .filter(|e| e.last_hf.map(|hf| hf > HEALTHY_HF).unwrap_or(false))
            .min_by_key(|e| e.touched_at_ts_ms)
            .map(|e| *e.key());

        let victim = healthy_victim.or_else(|| {
            self.entries
                .iter()
                .min_by_key(|e| e.touched_at_ts_ms)
                .map(|e| *e.key())
        });

        if let Some(address) = victim {
            debug!(user = %address, "Evicting candidate");
            self.entries.remove(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn test_capacity_bound_holds() {
        let manager = CandidateManager::new(3);
        for i in 1..=10u8 {
            manager.add(addr(i), i as u64);
            assert!(manager.len() <= 3);
        }
        assert_eq!(manager.len(), 3);
    }

    #[test]
    fn test_healthy_oldest_evicted_first() {
        let manager = CandidateManager::new(3);
        manager.add(addr(1), 100);
        manager.add(addr(2), 200);
        manager.add(addr(3), 300);

        // addr(2) is healthy, addr(1) and addr(3) risky.
        manager.update_hf(&addr(1), 1.01, 400);
        manager.update_hf(&addr(2), 1.5, 400);
        manager.update_hf(&addr(3), 1.05, 400);

        manager.add(addr(4), 500);
        assert!(!manager.contains(&addr(2)));
        assert!(manager.contains(&addr(1)));
        assert!(manager.contains(&addr(3)));
        assert!(manager.contains(&addr(4)));
    }

    #[test]
    fn test_fallback_to_globally_oldest() {
        let manager = CandidateManager::new(2);
        manager.add(addr(1), 100);
        manager.add(addr(2), 200);
        manager.update_hf(&addr(1), 1.02, 300);
        manager.update_hf(&addr(2), 1.05, 300);

        // Nobody is healthy: oldest touch (addr 1) goes.
        manager.add(addr(3), 400);
        assert!(!manager.contains(&addr(1)));
        assert!(manager.contains(&addr(2)));
        assert!(manager.contains(&addr(3)));
    }

    #[test]
    fn test_touch_refreshes_eviction_order() {
        let manager = CandidateManager::new(2);
        manager.add(addr(1), 100);
        manager.add(addr(2), 200);

        // Touching addr(1) makes addr(2) the oldest.
        manager.touch(&addr(1), 300);
        manager.add(addr(3), 400);
        assert!(manager.contains(&addr(1)));
        assert!(!manager.contains(&addr(2)));
    }

    #[test]
    fn test_add_existing_touches() {
        let manager = CandidateManager::new(4);
        assert!(manager.add(addr(1), 100));
        assert!(!manager.add(addr(1), 500));
        assert_eq!(manager.get(&addr(1)).unwrap().touched_at_ts_ms, 500);
    }

    #[test]
    fn test_get_stale() {
        let manager = CandidateManager::new(4);
        manager.add(addr(1), 100);
        manager.add(addr(2), 100);
        manager.update_hf(&addr(1), 1.2, 1_000);

        // addr(2) has never been checked, addr(1) checked at t=1000.
        let stale = manager.get_stale(500, 2_000);
        assert_eq!(stale.len(), 2);

        let stale = manager.get_stale(1_500, 2_000);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].address, addr(2));
    }
}
