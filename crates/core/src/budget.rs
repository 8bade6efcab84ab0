//! RPC budget enforcement and fallback scope decisions.
//!
//! Health factor reads cost money. The budget tracker enforces per-tick,
//! per-minute, hourly-USD and per-asset caps, and can downsample a
//! candidate list to the riskiest prefix that still fits. The fallback
//! orchestrator decides how wide each evaluation opportunity should sweep
//! based on provider health and recent price shocks.

use alloy::primitives::Address;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Why an evaluation was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDenial {
    PerTickCap,
    PerMinuteRate,
    HourlyBudget,
    PerAssetCap,
}

impl BudgetDenial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerTickCap => "per_tick_cap",
            Self::PerMinuteRate => "per_minute_rate",
            Self::HourlyBudget => "hourly_budget",
            Self::PerAssetCap => "per_asset_cap",
        }
    }
}

/// Gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetVerdict {
    pub allowed: bool,
    pub reason: Option<BudgetDenial>,
}

impl BudgetVerdict {
    fn ok() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: BudgetDenial) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Budget axes configuration.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub max_users_per_tick: usize,
    pub max_ticks_per_minute: u32,
    pub hourly_budget_usd: f64,
    pub cost_per_hf_read_usd: f64,
    pub max_users_per_asset_signal: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_users_per_tick: 200,
            max_ticks_per_minute: 120,
            hourly_budget_usd: 5.0,
            cost_per_hf_read_usd: 0.000_2,
            max_users_per_asset_signal: 80,
        }
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    tick_users: usize,
    minute_start_ms: u64,
    ticks_this_minute: u32,
    hour_start_ms: u64,
    hour_usd_spent: f64,
    asset_users: HashMap<Address, usize>,
}

/// A candidate with its risk ordering inputs.
#[derive(Debug, Clone)]
pub struct RiskRanked {
    pub address: Address,
    pub hf: f64,
    pub debt_usd: f64,
}

/// Windowed budget tracker.
pub struct PredictiveBudgetTracker {
    config: BudgetConfig,
    state: Mutex<BudgetState>,
}

impl PredictiveBudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BudgetState::default()),
        }
    }

    /// Begin a tick: resets per-tick and per-asset counters, and rolls the
    /// minute and hour windows on boundary crossings.
    pub fn start_tick(&self, now_ms: u64) {
        let mut state = self.state.lock();
        state.tick_users = 0;
        state.asset_users.clear();

        if now_ms.saturating_sub(state.minute_start_ms) >= 60_000 {
            state.minute_start_ms = now_ms;
            state.ticks_this_minute = 0;
        }
        if now_ms.saturating_sub(state.hour_start_ms) >= 3_600_000 {
            state.hour_start_ms = now_ms;
            state.hour_usd_spent = 0.0;
        }
        state.ticks_this_minute += 1;
    }

    /// Can `n` more users be evaluated this tick, optionally against a
    /// per-asset signal cap?
    pub fn can_evaluate_users(&self, n: usize, asset: Option<Address>) -> BudgetVerdict {
        let state = self.state.lock();

        if state.tick_users + n > self.config.max_users_per_tick {
            return BudgetVerdict::denied(BudgetDenial::PerTickCap);
        }
        if state.ticks_this_minute > self.config.max_ticks_per_minute {
            return BudgetVerdict::denied(BudgetDenial::PerMinuteRate);
        }
        let projected = state.hour_usd_spent + n as f64 * self.config.cost_per_hf_read_usd;
        if projected > self.config.hourly_budget_usd {
            return BudgetVerdict::denied(BudgetDenial::HourlyBudget);
        }
        if let Some(asset) = asset {
            let used = state.asset_users.get(&asset).copied().unwrap_or(0);
            if used + n > self.config.max_users_per_asset_signal {
                return BudgetVerdict::denied(BudgetDenial::PerAssetCap);
            }
        }
        BudgetVerdict::ok()
    }

    /// Record that `n` users were actually evaluated.
    pub fn record_evaluated(&self, n: usize, asset: Option<Address>) {
        let mut state = self.state.lock();
        state.tick_users += n;
        state.hour_usd_spent += n as f64 * self.config.cost_per_hf_read_usd;
        if let Some(asset) = asset {
            *state.asset_users.entry(asset).or_insert(0) += n;
        }
    }

    /// Largest admissible count right now for the given asset.
    pub fn remaining(&self, asset: Option<Address>) -> usize {
        let state = self.state.lock();
        if state.ticks_this_minute > self.config.max_ticks_per_minute {
            return 0;
        }
        let tick_room = self
            .config
            .max_users_per_tick
            .saturating_sub(state.tick_users);
        let usd_room = (self.config.hourly_budget_usd - state.hour_usd_spent)
            .max(0.0);
        let hourly_room = if self.config.cost_per_hf_read_usd > 0.0 {
            (usd_room / self.config.cost_per_hf_read_usd) as usize
        } else {
            usize::MAX
        };
        let asset_room = match asset {
            Some(asset) => self
                .config
                .max_users_per_asset_signal
                .saturating_sub(state.asset_users.get(&asset).copied().unwrap_or(0)),
            None => usize::MAX,
        };
        tick_room.min(hourly_room).min(asset_room)
    }

    /// Sort by risk (ascending HF, then descending debt) and keep the
    /// largest prefix the budget admits.
    pub fn downsample_to_fit(
        &self,
        mut list: Vec<RiskRanked>,
        asset: Option<Address>,
    ) -> Vec<RiskRanked> {
        list.sort_by(|a, b| {
            a.hf.partial_cmp(&b.hf)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.debt_usd
                        .partial_cmp(&a.debt_usd)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        let fit = self.remaining(asset);
        if list.len() > fit {
            metrics::increment_counter!("budget_downsamples_total");
            debug!(requested = list.len(), kept = fit, "Downsampling evaluation set");
            list.truncate(fit);
        }
        list
    }
}

/// Evaluation scope for one opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeDecision {
    /// No extra work.
    Passive,
    /// Only users within the near-band of HF 1.0.
    NearBandOnly { max_users: usize },
    /// Sweep wide, optionally still filtered to the near-band.
    Broadened {
        max_users: usize,
        near_band_only: bool,
    },
}

/// Fallback orchestrator configuration.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Price drop in bps that counts as a shock.
    pub shock_bps: u64,
    /// How long a shock keeps scope broadened, in ms.
    pub shock_window_ms: u64,
    /// In calm conditions, restrict evaluation to near-band users.
    pub near_only: bool,
    /// Whether broadened sweeps still filter to the near-band.
    pub broaden_near_band: bool,
    pub max_users_per_tick: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            shock_bps: 100,
            shock_window_ms: 60_000,
            near_only: true,
            broaden_near_band: false,
            max_users_per_tick: 200,
        }
    }
}

/// Decides evaluation scope from provider health and price shocks.
pub struct FallbackOrchestrator {
    config: FallbackConfig,
    shocks: Mutex<VecDeque<(u64, u64)>>,
    provider_healthy: AtomicBool,
}

impl FallbackOrchestrator {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            shocks: Mutex::new(VecDeque::new()),
            provider_healthy: AtomicBool::new(true),
        }
    }

    pub fn set_provider_health(&self, healthy: bool) {
        self.provider_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn provider_healthy(&self) -> bool {
        self.provider_healthy.load(Ordering::Relaxed)
    }

    /// Record an observed price drop.
    pub fn record_price_drop(&self, drop_bps: u64, now_ms: u64) {
        let mut shocks = self.shocks.lock();
        shocks.push_back((now_ms, drop_bps));
        while shocks.len() > 256 {
            shocks.pop_front();
        }
    }

    /// Whether a qualifying shock happened inside the window.
    pub fn recent_shock(&self, now_ms: u64) -> bool {
        let shocks = self.shocks.lock();
        shocks.iter().any(|(ts, drop)| {
            *drop >= self.config.shock_bps
                && now_ms.saturating_sub(*ts) <= self.config.shock_window_ms
        })
    }

    /// Scope for the current evaluation opportunity.
    pub fn decide(&self, now_ms: u64) -> ScopeDecision {
        if !self.provider_healthy() || self.recent_shock(now_ms) {
            return ScopeDecision::Broadened {
                max_users: self.config.max_users_per_tick,
                near_band_only: self.config.broaden_near_band,
            };
        }
        if self.config.near_only {
            return ScopeDecision::NearBandOnly {
                max_users: self.config.max_users_per_tick,
            };
        }
        ScopeDecision::Passive
    }
}

/// Users within `band_bps` of HF 1.0 (from above or already below).
pub fn near_band(users: &[RiskRanked], band_bps: u64) -> Vec<RiskRanked> {
    let ceiling = 1.0 + band_bps as f64 / 10_000.0;
    users
        .iter()
        .filter(|u| u.hf <= ceiling)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(byte: u8, hf: f64, debt: f64) -> RiskRanked {
        RiskRanked {
            address: Address::repeat_byte(byte),
            hf,
            debt_usd: debt,
        }
    }

    #[test]
    fn test_per_tick_cap() {
        let tracker = PredictiveBudgetTracker::new(BudgetConfig {
            max_users_per_tick: 10,
            ..Default::default()
        });
        tracker.start_tick(0);

        assert!(tracker.can_evaluate_users(10, None).allowed);
        tracker.record_evaluated(8, None);

        let verdict = tracker.can_evaluate_users(5, None);
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, Some(BudgetDenial::PerTickCap));

        // New tick resets the counter.
        tracker.start_tick(1_000);
        assert!(tracker.can_evaluate_users(5, None).allowed);
    }

    #[test]
    fn test_per_minute_rate() {
        let tracker = PredictiveBudgetTracker::new(BudgetConfig {
            max_ticks_per_minute: 2,
            ..Default::default()
        });
        tracker.start_tick(0);
        tracker.start_tick(100);
        tracker.start_tick(200); // third tick in the same minute

        let verdict = tracker.can_evaluate_users(1, None);
        assert_eq!(verdict.reason, Some(BudgetDenial::PerMinuteRate));

        // Minute boundary resets the rate.
        tracker.start_tick(61_000);
        assert!(tracker.can_evaluate_users(1, None).allowed);
    }

    #[test]
    fn test_hourly_budget() {
        let tracker = PredictiveBudgetTracker::new(BudgetConfig {
            hourly_budget_usd: 0.001,
            cost_per_hf_read_usd: 0.000_2,
            ..Default::default()
        });
        tracker.start_tick(0);

        // 5 reads fit exactly; 6 do not.
        assert!(tracker.can_evaluate_users(5, None).allowed);
        let verdict = tracker.can_evaluate_users(6, None);
        assert_eq!(verdict.reason, Some(BudgetDenial::HourlyBudget));

        tracker.record_evaluated(5, None);
        let verdict = tracker.can_evaluate_users(1, None);
        assert_eq!(verdict.reason, Some(BudgetDenial::HourlyBudget));
    }

    #[test]
    fn test_per_asset_cap() {
        let asset = Address::repeat_byte(7);
        let tracker = PredictiveBudgetTracker::new(BudgetConfig {
            max_users_per_asset_signal: 3,
            ..Default::default()
        });
        tracker.start_tick(0);
        tracker.record_evaluated(2, Some(asset));

        assert!(tracker.can_evaluate_users(1, Some(asset)).allowed);
        let verdict = tracker.can_evaluate_users(2, Some(asset));
        assert_eq!(verdict.reason, Some(BudgetDenial::PerAssetCap));

        // Other assets are unaffected.
        assert!(tracker
            .can_evaluate_users(3, Some(Address::repeat_byte(8)))
            .allowed);
    }

    #[test]
    fn test_downsample_orders_by_risk() {
        let tracker = PredictiveBudgetTracker::new(BudgetConfig {
            max_users_per_tick: 2,
            ..Default::default()
        });
        tracker.start_tick(0);

        let kept = tracker.downsample_to_fit(
            vec![
                ranked(1, 1.08, 100.0),
                ranked(2, 1.01, 50.0),
                ranked(3, 1.01, 500.0),
                ranked(4, 1.20, 9_000.0),
            ],
            None,
        );

        // Lowest HF first, larger debt breaking the tie.
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].address, Address::repeat_byte(3));
        assert_eq!(kept[1].address, Address::repeat_byte(2));
    }

    #[test]
    fn test_fallback_scope_decisions() {
        let orchestrator = FallbackOrchestrator::new(FallbackConfig {
            shock_bps: 100,
            shock_window_ms: 60_000,
            near_only: true,
            broaden_near_band: false,
            max_users_per_tick: 50,
        });

        // Calm and healthy: near-band only.
        assert_eq!(
            orchestrator.decide(1_000_000),
            ScopeDecision::NearBandOnly { max_users: 50 }
        );

        // Qualifying shock broadens scope.
        orchestrator.record_price_drop(150, 1_000_000);
        assert_eq!(
            orchestrator.decide(1_030_000),
            ScopeDecision::Broadened {
                max_users: 50,
                near_band_only: false
            }
        );

        // The shock ages out of the window.
        assert_eq!(
            orchestrator.decide(1_061_000),
            ScopeDecision::NearBandOnly { max_users: 50 }
        );

        // Unhealthy provider broadens regardless.
        orchestrator.set_provider_health(false);
        assert!(matches!(
            orchestrator.decide(2_000_000),
            ScopeDecision::Broadened { .. }
        ));
    }

    #[test]
    fn test_small_drop_is_not_a_shock() {
        let orchestrator = FallbackOrchestrator::new(FallbackConfig::default());
        orchestrator.record_price_drop(50, 1_000);
        assert!(!orchestrator.recent_shock(2_000));
    }

    #[test]
    fn test_near_band_filter() {
        let users = vec![
            ranked(1, 0.99, 10.0),
            ranked(2, 1.004, 10.0),
            ranked(3, 1.02, 10.0),
        ];
        let near = near_band(&users, 50);
        assert_eq!(near.len(), 2);
    }
}
