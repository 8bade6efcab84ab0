//! Hot/warm partition over monitored borrowers.
//!
//! Hot entries sit at `hf <= hot_threshold`, warm entries between the hot
//! and warm thresholds; anything healthier is cold and not tracked here.
//! Both sets are capacity bounded and evict their highest-HF entry when
//! full, so the most at-risk positions always survive.

use alloy::primitives::Address;
use anyhow::{bail, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// What prompted the most recent update of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Event,
    Head,
    Price,
}

/// Membership tier after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

/// One tracked entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HotSetEntry {
    pub address: Address,
    pub hf: f64,
    pub last_updated_ts_ms: u64,
    pub last_block: u64,
    pub total_collateral_usd: f64,
    pub total_debt_usd: f64,
    pub trigger_kind: TriggerKind,
}

struct Sets {
    hot: HashMap<Address, HotSetEntry>,
    warm: HashMap<Address, HotSetEntry>,
}

/// Hot/warm tracker with threshold classification.
pub struct HotSetTracker {
    sets: RwLock<Sets>,
    hot_threshold: f64,
    warm_threshold: f64,
    max_hot: usize,
    max_warm: usize,
}

impl HotSetTracker {
    /// Construction rejects inverted thresholds.
    pub fn new(
        hot_threshold: f64,
        warm_threshold: f64,
        max_hot: usize,
        max_warm: usize,
    ) -> Result<Self> {
        if hot_threshold >= warm_threshold {
            bail!(
                "hot threshold {hot_threshold} must be below warm threshold {warm_threshold}"
            );
        }
        Ok(Self {
            sets: RwLock::new(Sets {
                hot: HashMap::new(),
                warm: HashMap::new(),
            }),
            hot_threshold,
            warm_threshold,
            max_hot: max_hot.max(1),
            max_warm: max_warm.max(1),
        })
    }

    /// Classify an HF against the thresholds.
    pub fn classify(&self, hf: f64) -> Tier {
        if hf <= self.hot_threshold {
            Tier::Hot
        } else if hf <= self.warm_threshold {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }

    /// Insert or move an entry per its health factor. Cold entries are
    /// dropped from both sets. Returns the resulting tier.
    pub fn update(&self, entry: HotSetEntry) -> Tier {
        let tier = self.classify(entry.hf);
        let mut sets = self.sets.write();
        sets.hot.remove(&entry.address);
        sets.warm.remove(&entry.address);

        match tier {
            Tier::Hot => insert_bounded(&mut sets.hot, entry, self.max_hot),
            Tier::Warm => insert_bounded(&mut sets.warm, entry, self.max_warm),
            Tier::Cold => {}
        }
        tier
    }

    pub fn remove(&self, address: &Address) {
        let mut sets = self.sets.write();
        sets.hot.remove(address);
        sets.warm.remove(address);
    }

    pub fn get(&self, address: &Address) -> Option<HotSetEntry> {
        let sets = self.sets.read();
        sets.hot
            .get(address)
            .or_else(|| sets.warm.get(address))
            .cloned()
    }

    pub fn contains(&self, address: &Address) -> bool {
        let sets = self.sets.read();
        sets.hot.contains_key(address) || sets.warm.contains_key(address)
    }

    /// Hot entries sorted ascending by HF (most liquidatable first).
    pub fn get_hot_set(&self) -> Vec<HotSetEntry> {
        let mut entries: Vec<_> = self.sets.read().hot.values().cloned().collect();
        entries.sort_by(|a, b| a.hf.partial_cmp(&b.hf).unwrap_or(std::cmp::Ordering::Equal));
        entries
    }

    /// Warm entries sorted ascending by HF.
    pub fn get_warm_set(&self) -> Vec<HotSetEntry> {
        let mut entries: Vec<_> = self.sets.read().warm.values().cloned().collect();
        entries.sort_by(|a, b| a.hf.partial_cmp(&b.hf).unwrap_or(std::cmp::Ordering::Equal));
        entries
    }

    /// The k lowest-HF entries across both sets.
    pub fn get_top_k(&self, k: usize) -> Vec<HotSetEntry> {
        let mut entries = self.get_hot_set();
        entries.extend(self.get_warm_set());
        entries.sort_by(|a, b| a.hf.partial_cmp(&b.hf).unwrap_or(std::cmp::Ordering::Equal));
        entries.truncate(k);
        entries
    }

    /// Lowest HF currently tracked, if any.
    pub fn min_hf(&self) -> Option<f64> {
        let sets = self.sets.read();
        sets.hot
            .values()
            .chain(sets.warm.values())
            .map(|e| e.hf)
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn hot_len(&self) -> usize {
        self.sets.read().hot.len()
    }

    pub fn warm_len(&self) -> usize {
        self.sets.read().warm.len()
    }

    pub fn hot_threshold(&self) -> f64 {
        self.hot_threshold
    }

    pub fn warm_threshold(&self) -> f64 {
        self.warm_threshold
    }
}

/// Insert with the highest-HF-evicts rule. An incoming entry with the
/// highest HF of a full set is itself the eviction victim and is dropped.
fn insert_bounded(set: &mut HashMap<Address, HotSetEntry>, entry: HotSetEntry, capacity: usize) {
    if set.len() < capacity {
        set.insert(entry.address, entry);
        return;
    }

    let highest = set
        .values()
        .max_by(|a, b| a.hf.partial_cmp(&b.hf).unwrap_or(std::cmp::Ordering::Equal))
        .map(|e| (e.address, e.hf));

    if let Some((victim, max_hf)) = highest {
        if entry.hf < max_hf {
            set.remove(&victim);
            set.insert(entry.address, entry);
        }
    }
}
