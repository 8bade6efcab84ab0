//! Bot configuration.
//!
//! A frozen `BotConfig` is assembled once at startup from environment
//! variables (with TOML profile support) and installed into a process-wide
//! `OnceLock`. Nothing in the core mutates configuration after that.

pub mod env;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Close-factor execution mode: how much of the chosen debt reserve a
/// single liquidation call repays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CloseFactorMode {
    /// Repay 50% of the debt reserve.
    #[default]
    Half,
    /// Submit max debtToCover; the pool clamps to its close factor.
    Full,
}

impl FromStr for CloseFactorMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "half" | "50" => Ok(Self::Half),
            "full" | "100" => Ok(Self::Full),
            _ => Err(()),
        }
    }
}

/// Signing key selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    RoundRobin,
    Deterministic,
}

impl FromStr for KeyStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" | "round_robin" | "rr" => Ok(Self::RoundRobin),
            "deterministic" | "det" => Ok(Self::Deterministic),
            _ => Err(()),
        }
    }
}

/// Tip priority mode (no implicit promotion between modes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TipMode {
    Safe,
    #[default]
    Mid,
    Fast,
}

impl FromStr for TipMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "mid" => Ok(Self::Mid),
            "fast" => Ok(Self::Fast),
            _ => Err(()),
        }
    }
}

/// Private relay mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    #[default]
    Disabled,
    Protect,
    Bundle,
}

impl FromStr for RelayMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "protect" => Ok(Self::Protect),
            "bundle" => Ok(Self::Bundle),
            _ => Err(()),
        }
    }
}

/// Fallback path when the relay fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelayFallback {
    #[default]
    Race,
    Direct,
}

impl FromStr for RelayFallback {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "race" => Ok(Self::Race),
            "direct" => Ok(Self::Direct),
            _ => Err(()),
        }
    }
}

/// Watch-set sizing and tier thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub max_candidates: usize,
    pub hot_hf_threshold: f64,
    pub warm_hf_threshold: f64,
    pub max_hot: usize,
    pub max_warm: usize,
    /// Candidates unchecked for longer than this are revisited.
    pub stale_check_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_candidates: 5_000,
            hot_hf_threshold: 1.02,
            warm_hf_threshold: 1.10,
            max_hot: 256,
            max_warm: 1_024,
            stale_check_ms: 60_000,
        }
    }
}

/// Health factor engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HfConfig {
    pub batch_size: usize,
    pub chunk_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub stable_cache_ttl_secs: u64,
    /// Reserve index move (bps) that forces position rechecks.
    pub index_recheck_bps: u64,
}

impl Default for HfConfig {
    fn default() -> Self {
        Self {
            batch_size: 110,
            chunk_timeout_ms: 1_500,
            cache_ttl_secs: 2,
            stable_cache_ttl_secs: 20,
            index_recheck_bps: 2,
        }
    }
}

/// Event ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub backfill_enabled: bool,
    pub backfill_blocks: u64,
    pub chunk_size: u64,
    pub max_logs: usize,
    pub backfill_timeout_secs: u64,
    pub coalesce_window_ms: u64,
    pub coalesce_max_batch: usize,
    pub dedupe_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            backfill_enabled: true,
            backfill_blocks: 5_000,
            chunk_size: 1_000,
            max_logs: 50_000,
            backfill_timeout_secs: 60,
            coalesce_window_ms: 80,
            coalesce_max_batch: 32,
            dedupe_capacity: 16_384,
        }
    }
}

/// Price oracle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSettings {
    pub freshness_window_secs: u64,
    pub refresh_index_bps: u64,
    pub dev_stub_prices: bool,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            freshness_window_secs: 90,
            refresh_index_bps: 10,
            dev_stub_prices: false,
        }
    }
}

/// RPC budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSettings {
    pub max_users_per_tick: usize,
    pub max_ticks_per_minute: u32,
    pub hourly_budget_usd: f64,
    pub cost_per_hf_read_usd: f64,
    pub max_users_per_asset_signal: usize,
}

impl Default for BudgetSettings {
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

/// Fallback orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSettings {
    pub shock_bps: u64,
    pub near_only: bool,
    pub broaden_near_band: bool,
    pub near_band_bps: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            shock_bps: 100,
            near_only: true,
            broaden_near_band: false,
            near_band_bps: 300,
        }
    }
}

/// Execution gating and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub enabled: bool,
    pub close_factor_mode: CloseFactorMode,
    pub tip_mode: TipMode,
    pub min_debt_usd: f64,
    pub min_repay_usd: f64,
    pub min_profit_usd: f64,
    pub dust_usd: f64,
    pub gas_price_cap_gwei: f64,
    pub daily_loss_limit_usd: f64,
    pub fee_bps: u16,
    pub gas_cost_usd: f64,
    pub gas_limit: u64,
    pub max_slippage_pct: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            close_factor_mode: CloseFactorMode::Half,
            tip_mode: TipMode::Mid,
            min_debt_usd: 25.0,
            min_repay_usd: 10.0,
            min_profit_usd: 1.0,
            dust_usd: 0.10,
            gas_price_cap_gwei: 5.0,
            daily_loss_limit_usd: 100.0,
            fee_bps: 0,
            gas_cost_usd: 0.05,
            gas_limit: 900_000,
            max_slippage_pct: 0.5,
        }
    }
}

/// Submission path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitConfig {
    pub key_strategy: KeyStrategy,
    pub relay_mode: RelayMode,
    pub relay_fallback: RelayFallback,
    pub private_submit_timeout_ms: u64,
    pub race_timeout_ms: u64,
    pub bump_first_ms: u64,
    pub bump_second_ms: u64,
    pub bump_pct: u32,
    pub max_bumps: u32,
    pub inflight_ttl_ms: u64,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            key_strategy: KeyStrategy::RoundRobin,
            relay_mode: RelayMode::Disabled,
            relay_fallback: RelayFallback::Race,
            private_submit_timeout_ms: 800,
            race_timeout_ms: 1_200,
            bump_first_ms: 1_500,
            bump_second_ms: 3_000,
            bump_pct: 15,
            max_bumps: 2,
            inflight_ttl_ms: 20_000,
        }
    }
}

/// Plan and template cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub presim_capacity: usize,
    pub presim_ttl_blocks: u64,
    pub template_capacity: usize,
    pub template_refresh_blocks: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            presim_capacity: 512,
            presim_ttl_blocks: 4,
            template_capacity: 64,
            template_refresh_blocks: 600,
        }
    }
}

/// Decision trace and miss classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    pub max_users: usize,
    pub ring_size: usize,
    pub trace_ttl_secs: u64,
    pub miss_window_ms: u64,
    pub head_lag_blocks: u64,
    pub hf_transient_blocks: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_users: 2_048,
            ring_size: 8,
            trace_ttl_secs: 1_800,
            miss_window_ms: 300_000,
            head_lag_blocks: 2,
            hf_transient_blocks: 3,
        }
    }
}

/// Pipeline sizing and price-trigger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub decision_workers: usize,
    pub queue_capacity: usize,
    /// Ingestion pauses while the queue sits above this depth.
    pub queue_high: usize,
    pub emergency_scan_max_users: usize,
    pub price_debounce_ms: u64,
    pub price_drop_bps: u64,
    /// Per-symbol overrides of the drop threshold.
    pub price_drop_overrides: HashMap<String, u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decision_workers: 4,
            queue_capacity: 1_024,
            queue_high: 768,
            emergency_scan_max_users: 120,
            price_debounce_ms: 500,
            price_drop_bps: 60,
            price_drop_overrides: HashMap::new(),
        }
    }
}

/// The frozen top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_profile_name")]
    pub profile: String,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub hf: HfConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub fallback: FallbackSettings,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub submit: SubmitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            watch: WatchConfig::default(),
            hf: HfConfig::default(),
            ingest: IngestConfig::default(),
            oracle: OracleSettings::default(),
            budget: BudgetSettings::default(),
            fallback: FallbackSettings::default(),
            execution: ExecutionConfig::default(),
            submit: SubmitConfig::default(),
            cache: CacheConfig::default(),
            trace: TraceConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load from a TOML profile file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Assemble from environment variables over the defaults.
    pub fn from_env() -> Self {
        use env::*;

        let defaults = Self::default();
        let mut config = defaults.clone();
        config.profile = optional_string("BOT_PROFILE").unwrap_or_else(default_profile_name);

        config.watch = WatchConfig {
            max_candidates: parse_usize_clamped("MAX_CANDIDATES", defaults.watch.max_candidates, 16, 200_000),
            hot_hf_threshold: parse_f64("HOT_HF_THRESHOLD", defaults.watch.hot_hf_threshold),
            warm_hf_threshold: parse_f64("WARM_HF_THRESHOLD", defaults.watch.warm_hf_threshold),
            max_hot: parse_usize_clamped("MAX_HOT", defaults.watch.max_hot, 4, 10_000),
            max_warm: parse_usize_clamped("MAX_WARM", defaults.watch.max_warm, 4, 50_000),
            stale_check_ms: parse_u64_clamped("STALE_CHECK_MS", defaults.watch.stale_check_ms, 1_000, 3_600_000),
        };

        config.hf = HfConfig {
            batch_size: parse_usize_clamped("HF_BATCH_SIZE", defaults.hf.batch_size, 10, 500),
            chunk_timeout_ms: parse_u64_clamped("HF_CHUNK_TIMEOUT_MS", defaults.hf.chunk_timeout_ms, 100, 30_000),
            cache_ttl_secs: parse_u64_clamped("HF_CACHE_TTL_SECS", defaults.hf.cache_ttl_secs, 1, 600),
            stable_cache_ttl_secs: parse_u64_clamped("HF_STABLE_CACHE_TTL_SECS", defaults.hf.stable_cache_ttl_secs, 1, 3_600),
            index_recheck_bps: parse_u64_clamped("INDEX_RECHECK_BPS", defaults.hf.index_recheck_bps, 1, 10_000),
        };

        config.ingest = IngestConfig {
            backfill_enabled: parse_bool("BACKFILL_ENABLED", defaults.ingest.backfill_enabled),
            backfill_blocks: parse_u64_clamped("BACKFILL_BLOCKS", defaults.ingest.backfill_blocks, 100, 500_000),
            chunk_size: parse_u64_clamped("BACKFILL_CHUNK_SIZE", defaults.ingest.chunk_size, 50, 10_000),
            max_logs: parse_usize_clamped("BACKFILL_MAX_LOGS", defaults.ingest.max_logs, 100, 1_000_000),
            backfill_timeout_secs: parse_u64_clamped("BACKFILL_TIMEOUT_SECS", defaults.ingest.backfill_timeout_secs, 5, 600),
            coalesce_window_ms: parse_u64_clamped("COALESCE_WINDOW_MS", defaults.ingest.coalesce_window_ms, 40, 120),
            coalesce_max_batch: parse_usize_clamped("COALESCE_MAX_BATCH", defaults.ingest.coalesce_max_batch, 1, 1_024),
            dedupe_capacity: parse_usize_clamped("DEDUPE_CAPACITY", defaults.ingest.dedupe_capacity, 1_024, 1_000_000),
        };

        config.oracle = OracleSettings {
            freshness_window_secs: parse_u64_clamped("PRICE_FRESHNESS_SECS", defaults.oracle.freshness_window_secs, 5, 3_600),
            refresh_index_bps: parse_u64_clamped("REFRESH_INDEX_BPS", defaults.oracle.refresh_index_bps, 1, 10_000),
            dev_stub_prices: parse_bool("DEV_STUB_PRICES", defaults.oracle.dev_stub_prices),
        };

        config.budget = BudgetSettings {
            max_users_per_tick: parse_usize_clamped("MAX_USERS_PER_TICK", defaults.budget.max_users_per_tick, 1, 10_000),
            max_ticks_per_minute: parse_u64_clamped("MAX_TICKS_PER_MINUTE", defaults.budget.max_ticks_per_minute as u64, 1, 6_000) as u32,
            hourly_budget_usd: parse_f64("HOURLY_BUDGET_USD", defaults.budget.hourly_budget_usd),
            cost_per_hf_read_usd: parse_f64("COST_PER_HF_READ_USD", defaults.budget.cost_per_hf_read_usd),
            max_users_per_asset_signal: parse_usize_clamped("MAX_USERS_PER_ASSET_SIGNAL", defaults.budget.max_users_per_asset_signal, 1, 10_000),
        };

        config.fallback = FallbackSettings {
            shock_bps: parse_u64_clamped("SHOCK_BPS", defaults.fallback.shock_bps, 1, 10_000),
            near_only: parse_bool("NEAR_ONLY", defaults.fallback.near_only),
            broaden_near_band: parse_bool("BROADEN_NEAR_BAND", defaults.fallback.broaden_near_band),
            near_band_bps: parse_u64_clamped("NEAR_BAND_BPS", defaults.fallback.near_band_bps, 10, 5_000),
        };

        config.execution = ExecutionConfig {
            enabled: parse_bool("EXECUTION_ENABLED", defaults.execution.enabled),
            close_factor_mode: parse_enum("CLOSE_FACTOR_MODE", defaults.execution.close_factor_mode),
            tip_mode: parse_enum("TIP_STRATEGY", defaults.execution.tip_mode),
            min_debt_usd: parse_f64("MIN_DEBT_USD", defaults.execution.min_debt_usd),
            min_repay_usd: parse_f64("MIN_REPAY_USD", defaults.execution.min_repay_usd),
            min_profit_usd: parse_f64("MIN_PROFIT_USD", defaults.execution.min_profit_usd),
            dust_usd: parse_f64("DUST_USD", defaults.execution.dust_usd),
            gas_price_cap_gwei: parse_f64("GAS_PRICE_CAP_GWEI", defaults.execution.gas_price_cap_gwei),
            daily_loss_limit_usd: parse_f64("DAILY_LOSS_LIMIT_USD", defaults.execution.daily_loss_limit_usd),
            fee_bps: parse_u64_clamped("FEE_BPS", defaults.execution.fee_bps as u64, 0, 5_000) as u16,
            gas_cost_usd: parse_f64("GAS_COST_USD", defaults.execution.gas_cost_usd),
            gas_limit: parse_u64_clamped("GAS_LIMIT", defaults.execution.gas_limit, 100_000, 10_000_000),
            max_slippage_pct: parse_f64("MAX_SLIPPAGE_PCT", defaults.execution.max_slippage_pct),
        };

        config.submit = SubmitConfig {
            key_strategy: parse_enum("KEY_SELECTION", defaults.submit.key_strategy),
            relay_mode: parse_enum("PRIVATE_TX_MODE", defaults.submit.relay_mode),
            relay_fallback: parse_enum("PRIVATE_FALLBACK", defaults.submit.relay_fallback),
            private_submit_timeout_ms: parse_u64_clamped("PRIVATE_SUBMIT_TIMEOUT_MS", defaults.submit.private_submit_timeout_ms, 100, 10_000),
            race_timeout_ms: parse_u64_clamped("RACE_TIMEOUT_MS", defaults.submit.race_timeout_ms, 100, 10_000),
            bump_first_ms: parse_u64_clamped("BUMP_FIRST_MS", defaults.submit.bump_first_ms, 200, 60_000),
            bump_second_ms: parse_u64_clamped("BUMP_SECOND_MS", defaults.submit.bump_second_ms, 200, 120_000),
            bump_pct: parse_u64_clamped("BUMP_PCT", defaults.submit.bump_pct as u64, 5, 200) as u32,
            max_bumps: parse_u64_clamped("MAX_BUMPS", defaults.submit.max_bumps as u64, 0, 10) as u32,
            inflight_ttl_ms: parse_u64_clamped("INFLIGHT_TTL_MS", defaults.submit.inflight_ttl_ms, 1_000, 300_000),
        };

        config.cache = CacheConfig {
            presim_capacity: parse_usize_clamped("PRESIM_CAPACITY", defaults.cache.presim_capacity, 8, 100_000),
            presim_ttl_blocks: parse_u64_clamped("PRESIM_TTL_BLOCKS", defaults.cache.presim_ttl_blocks, 1, 1_000),
            template_capacity: parse_usize_clamped("TEMPLATE_CAPACITY", defaults.cache.template_capacity, 4, 10_000),
            template_refresh_blocks: parse_u64_clamped("TEMPLATE_REFRESH_BLOCKS", defaults.cache.template_refresh_blocks, 10, 100_000),
        };

        config.trace = TraceConfig {
            max_users: parse_usize_clamped("TRACE_MAX_USERS", defaults.trace.max_users, 16, 100_000),
            ring_size: parse_usize_clamped("TRACE_RING_SIZE", defaults.trace.ring_size, 1, 256),
            trace_ttl_secs: parse_u64_clamped("TRACE_TTL_SECS", defaults.trace.trace_ttl_secs, 60, 86_400),
            miss_window_ms: parse_u64_clamped("MISS_WINDOW_MS", defaults.trace.miss_window_ms, 1_000, 3_600_000),
            head_lag_blocks: parse_u64_clamped("HEAD_LAG_BLOCKS", defaults.trace.head_lag_blocks, 1, 100),
            hf_transient_blocks: parse_u64_clamped("HF_TRANSIENT_BLOCKS", defaults.trace.hf_transient_blocks, 1, 100),
        };

        config.pipeline = PipelineConfig {
            decision_workers: parse_usize_clamped("DECISION_WORKERS", defaults.pipeline.decision_workers, 1, 64),
            queue_capacity: parse_usize_clamped("QUEUE_CAPACITY", defaults.pipeline.queue_capacity, 16, 100_000),
            queue_high: parse_usize_clamped("QUEUE_HIGH", defaults.pipeline.queue_high, 8, 100_000),
            emergency_scan_max_users: parse_usize_clamped("EMERGENCY_SCAN_MAX_USERS", defaults.pipeline.emergency_scan_max_users, 1, 10_000),
            price_debounce_ms: parse_u64_clamped("PRICE_DEBOUNCE_MS", defaults.pipeline.price_debounce_ms, 50, 60_000),
            price_drop_bps: parse_u64_clamped("PRICE_DROP_BPS", defaults.pipeline.price_drop_bps, 1, 10_000),
            price_drop_overrides: parse_pairs_u64("PRICE_DROP_BPS_OVERRIDES").into_iter().collect(),
        };

        config
    }

    /// Per-symbol price drop threshold, falling back to the global value.
    pub fn price_drop_bps_for(&self, symbol: &str) -> u64 {
        self.pipeline
            .price_drop_overrides
            .get(symbol)
            .copied()
            .unwrap_or(self.pipeline.price_drop_bps)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.hf.chunk_timeout_ms)
    }

    pub fn backfill_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.backfill_timeout_secs)
    }

    /// Log the operative thresholds at startup.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Bot configuration loaded");
        tracing::info!(
            max_candidates = self.watch.max_candidates,
            hot_hf = self.watch.hot_hf_threshold,
            warm_hf = self.watch.warm_hf_threshold,
            max_hot = self.watch.max_hot,
            max_warm = self.watch.max_warm,
            "Watch-set thresholds"
        );
        tracing::info!(
            enabled = self.execution.enabled,
            close_factor = ?self.execution.close_factor_mode,
            tip = ?self.execution.tip_mode,
            min_debt = self.execution.min_debt_usd,
            min_profit = self.execution.min_profit_usd,
            dust = self.execution.dust_usd,
            "Execution thresholds"
        );
        tracing::info!(
            relay = ?self.submit.relay_mode,
            fallback = ?self.submit.relay_fallback,
            keys = ?self.submit.key_strategy,
            bump_pct = self.submit.bump_pct,
            max_bumps = self.submit.max_bumps,
            "Submission settings"
        );
    }
}

static GLOBAL_CONFIG: OnceLock<BotConfig> = OnceLock::new();

/// Install the process-wide configuration (first call wins).
pub fn init_config(config: BotConfig) {
    let _ = GLOBAL_CONFIG.set(config);
}

/// Fetch the process-wide configuration, initializing from env if needed.
pub fn config() -> &'static BotConfig {
    GLOBAL_CONFIG.get_or_init(BotConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_coherent() {
        let config = BotConfig::default();
        assert!(config.watch.hot_hf_threshold < config.watch.warm_hf_threshold);
        assert!(config.pipeline.queue_high < config.pipeline.queue_capacity);
        assert_eq!(config.execution.close_factor_mode, CloseFactorMode::Half);
    }

    #[test]
    fn test_enum_parsing_with_fallback() {
        assert_eq!("full".parse::<CloseFactorMode>(), Ok(CloseFactorMode::Full));
        assert!("quarter".parse::<CloseFactorMode>().is_err());
        assert_eq!("rr".parse::<KeyStrategy>(), Ok(KeyStrategy::RoundRobin));
        assert_eq!("protect".parse::<RelayMode>(), Ok(RelayMode::Protect));
        assert_eq!("direct".parse::<RelayFallback>(), Ok(RelayFallback::Direct));
        assert_eq!("fast".parse::<TipMode>(), Ok(TipMode::Fast));
    }

    #[test]
    fn test_price_drop_overrides() {
        let mut config = BotConfig::default();
        config.pipeline.price_drop_bps = 60;
        config
            .pipeline
            .price_drop_overrides
            .insert("cbETH".to_string(), 120);

        assert_eq!(config.price_drop_bps_for("cbETH"), 120);
        assert_eq!(config.price_drop_bps_for("WETH"), 60);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = BotConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: BotConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.watch.max_candidates, config.watch.max_candidates);
        assert_eq!(parsed.execution.tip_mode, config.execution.tip_mode);
    }
}
