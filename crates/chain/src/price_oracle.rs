//! Canonical token price lookup with alias/ratio feeds and a hot cache.
//!
//! Prices come from Chainlink-style aggregators. Ratio tokens (e.g. an LST
//! priced against its base asset) multiply the base USD price by a ratio
//! feed; alias symbols resolve to a canonical symbol before lookup. A price
//! is fresh while its age is within the freshness window and available when
//! fresh and positive.

use alloy::primitives::{Address, I256, U256};
use alloy::providers::ProviderBuilder;
use anyhow::Result;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::contracts::IAggregatorV3;
use crate::provider::EndpointManager;

/// How a price point was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PriceSource {
    /// Direct USD aggregator.
    OracleUsd,
    /// Base price multiplied by a ratio feed.
    OracleRatio,
    /// Resolved through the alias map.
    Alias,
    /// Development stub (oracle not ready).
    Stub,
}

/// A cached price observation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub price_usd: f64,
    /// Raw aggregator answer.
    pub answer: U256,
    /// Aggregator decimals.
    pub decimals: u8,
    /// Unix seconds of the observation.
    pub ts: u64,
    /// Head block the refresh ran against.
    pub block: u64,
    pub source: PriceSource,
}

impl PricePoint {
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.ts)
    }
}

/// Typed price lookup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PriceError {
    #[error("stale price for {symbol}: {age_secs}s old")]
    Stale { symbol: String, age_secs: u64 },
    #[error("no price known for {symbol}")]
    Missing { symbol: String },
    #[error("non-positive price for {symbol}")]
    Invalid { symbol: String },
}

/// Oracle readiness state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Cold,
    Warming,
    Ready,
}

/// One configured price feed.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub symbol: String,
    pub aggregator: Address,
    /// For ratio feeds, the symbol whose USD price the ratio multiplies.
    pub ratio_base: Option<String>,
}

/// Oracle configuration.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Maximum price age before it stops being fresh.
    pub freshness_window: Duration,
    /// Drift in bps between hot and authoritative that forces a refresh.
    pub refresh_index_bps: u64,
    /// Serve 1.0 stub prices while not ready (development only).
    pub dev_stub_prices: bool,
    /// Alias symbol -> canonical symbol.
    pub aliases: HashMap<String, String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(90),
            refresh_index_bps: 10,
            dev_stub_prices: false,
            aliases: HashMap::new(),
        }
    }
}

/// Outcome summary of a deferred-queue flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub resolved: usize,
    pub failed: usize,
    pub still_deferred: usize,
}

/// Price oracle with hot cache and readiness gating.
pub struct PriceOracle {
    endpoints: Arc<EndpointManager>,
    config: OracleConfig,
    feeds: HashMap<String, FeedConfig>,
    hot: DashMap<String, PricePoint>,
    readiness: RwLock<Readiness>,
    /// Symbols requested before the oracle was ready.
    pending: DashSet<String>,
}

impl PriceOracle {
    pub fn new(
        endpoints: Arc<EndpointManager>,
        config: OracleConfig,
        feeds: Vec<FeedConfig>,
    ) -> Self {
        let feeds = feeds
            .into_iter()
            .map(|f| (f.symbol.clone(), f))
            .collect();
        Self {
            endpoints,
            config,
            feeds,
            hot: DashMap::new(),
            readiness: RwLock::new(Readiness::Cold),
            pending: DashSet::new(),
        }
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.read()
    }

    /// Resolve an alias to its canonical symbol.
    pub fn normalize_symbol<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.config
            .aliases
            .get(symbol)
            .map(|s| s.as_str())
            .unwrap_or(symbol)
    }

    /// Look up the current price for a symbol.
    ///
    /// While not ready: stub prices in dev mode, otherwise the request is
    /// recorded for revaluation and `Missing` is returned.
    pub fn get_price(&self, symbol: &str) -> Result<PricePoint, PriceError> {
        let aliased = self.config.aliases.contains_key(symbol);
        let canonical = self.normalize_symbol(symbol).to_string();

        if self.readiness() != Readiness::Ready {
            if self.config.dev_stub_prices {
                return Ok(PricePoint {
                    symbol: canonical,
                    price_usd: 1.0,
                    answer: U256::from(100_000_000u64),
                    decimals: 8,
                    ts: now_secs(),
                    block: self.endpoints.last_head(),
                    source: PriceSource::Stub,
                });
            }
            self.pending.insert(canonical.clone());
            metrics::increment_counter!("price_deferred_total");
            return Err(PriceError::Missing { symbol: canonical });
        }

        let mut point = self.resolve(&canonical)?;
        if aliased {
            point.source = PriceSource::Alias;
        }
        Ok(point)
    }

    /// Bulk lookup. Each symbol resolves independently.
    pub fn get_prices(
        &self,
        symbols: &[&str],
    ) -> HashMap<String, Result<PricePoint, PriceError>> {
        symbols
            .iter()
            .map(|s| (s.to_string(), self.get_price(s)))
            .collect()
    }

    /// Re-evaluate every deferred request against the hot cache.
    ///
    /// Called when readiness flips to `Ready`; each deferred symbol either
    /// resolves, fails permanently (invalid), or stays deferred (still
    /// missing).
    pub fn flush_pending_and_revalue(&self) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let deferred: Vec<String> = self.pending.iter().map(|s| s.clone()).collect();

        for symbol in deferred {
            match self.resolve(&symbol) {
                Ok(point) => {
                    debug!(symbol = %symbol, price = point.price_usd, "Deferred price resolved");
                    self.pending.remove(&symbol);
                    outcome.resolved += 1;
                }
                Err(PriceError::Missing { .. }) => {
                    outcome.still_deferred += 1;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Deferred price failed");
                    self.pending.remove(&symbol);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Refresh every feed from chain and stamp results with `block`.
    ///
    /// The first completed refresh moves the oracle `Cold -> Warming ->
    /// Ready` and drains the deferred queue.
    #[instrument(skip(self), fields(block = block))]
    pub async fn refresh_all(&self, block: u64) -> Result<()> {
        {
            let mut readiness = self.readiness.write();
            if *readiness == Readiness::Cold {
                *readiness = Readiness::Warming;
            }
        }

        let provider = ProviderBuilder::new().on_http(self.endpoints.http_url().parse()?);
        let mut refreshed = 0usize;

        for feed in self.feeds.values() {
            let aggregator = IAggregatorV3::new(feed.aggregator, &provider);
            let round = match aggregator.latestRoundData().call().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(symbol = %feed.symbol, error = %e, "latestRoundData failed");
                    continue;
                }
            };
            let decimals = match aggregator.decimals().call().await {
                Ok(d) => d._0,
                Err(_) => 8,
            };

            if round.answer <= I256::ZERO {
                warn!(symbol = %feed.symbol, "Aggregator returned non-positive answer");
                continue;
            }
            let answer = round.answer.into_raw();
            let price_usd = normalize_chainlink_price(answer, decimals);
            let ts = round.updatedAt.to::<u64>();

            let point = PricePoint {
                symbol: feed.symbol.clone(),
                price_usd,
                answer,
                decimals,
                ts,
                block,
                source: if feed.ratio_base.is_some() {
                    PriceSource::OracleRatio
                } else {
                    PriceSource::OracleUsd
                },
            };
            self.store(point);
            refreshed += 1;
        }

        let all_present = self
            .feeds
            .keys()
            .all(|symbol| self.hot.contains_key(symbol));
        if all_present && refreshed > 0 {
            let became_ready = {
                let mut readiness = self.readiness.write();
                let flip = *readiness != Readiness::Ready;
                *readiness = Readiness::Ready;
                flip
            };
            if became_ready {
                info!(feeds = self.feeds.len(), "Price oracle ready");
                let flushed = self.flush_pending_and_revalue();
                info!(
                    resolved = flushed.resolved,
                    failed = flushed.failed,
                    deferred = flushed.still_deferred,
                    "Deferred price queue drained"
                );
            }
        }
        Ok(())
    }

    /// Re-read one feed and replace the hot entry when drift between the
    /// hot and authoritative price is at least `refresh_index_bps`.
    pub async fn refresh_if_drifted(&self, symbol: &str) -> Result<bool> {
        let canonical = self.normalize_symbol(symbol).to_string();
        let Some(feed) = self.feeds.get(&canonical) else {
            return Ok(false);
        };
        let Some(hot) = self.hot.get(&canonical).map(|p| p.clone()) else {
            return Ok(false);
        };

        let provider = ProviderBuilder::new().on_http(self.endpoints.http_url().parse()?);
        let aggregator = IAggregatorV3::new(feed.aggregator, &provider);
        let round = aggregator.latestRoundData().call().await?;
        if round.answer <= I256::ZERO {
            return Ok(false);
        }
        let fresh = round.answer.into_raw();

        let drift = delta_bps(hot.answer, fresh);
        if drift < self.config.refresh_index_bps {
            return Ok(false);
        }

        metrics::increment_counter!("price_hot_refreshes_total");
        debug!(symbol = %canonical, drift_bps = drift, "Hot price drifted, refreshing");
        self.store(PricePoint {
            symbol: canonical,
            price_usd: normalize_chainlink_price(fresh, hot.decimals),
            answer: fresh,
            decimals: hot.decimals,
            ts: round.updatedAt.to::<u64>(),
            block: self.endpoints.last_head(),
            source: hot.source,
        });
        Ok(true)
    }

    /// Insert a price point directly (used by tests and replay tooling).
    pub fn store(&self, point: PricePoint) {
        self.hot.insert(point.symbol.clone(), point);
    }

    /// Force the readiness state (used by tests and replay tooling).
    pub fn set_readiness(&self, state: Readiness) {
        *self.readiness.write() = state;
    }

    /// Number of symbols currently cached.
    pub fn cached_count(&self) -> usize {
        self.hot.len()
    }

    fn resolve(&self, canonical: &str) -> Result<PricePoint, PriceError> {
        let Some(point) = self.hot.get(canonical).map(|p| p.clone()) else {
            metrics::increment_counter!("price_cache_misses_total");
            return Err(PriceError::Missing {
                symbol: canonical.to_string(),
            });
        };
        metrics::increment_counter!("price_cache_hits_total");

        let now = now_secs();
        let age = point.age_secs(now);
        if age > self.config.freshness_window.as_secs() {
            metrics::increment_counter!("price_stale_total");
            return Err(PriceError::Stale {
                symbol: canonical.to_string(),
                age_secs: age,
            });
        }
        if point.price_usd <= 0.0 {
            return Err(PriceError::Invalid {
                symbol: canonical.to_string(),
            });
        }

        // Ratio feeds carry the raw ratio; multiply by the base USD price.
        if let Some(feed) = self.feeds.get(canonical) {
            if let Some(base_symbol) = &feed.ratio_base {
                let base = self.resolve(base_symbol)?;
                return Ok(PricePoint {
                    symbol: canonical.to_string(),
                    price_usd: base.price_usd * point.price_usd,
                    answer: point.answer,
                    decimals: point.decimals,
                    ts: point.ts.min(base.ts),
                    block: point.block.max(base.block),
                    source: PriceSource::OracleRatio,
                });
            }
        }
        Ok(point)
    }
}

/// Normalize a Chainlink answer to a USD float.
///
/// Inverse: `answer = round(price * 10^decimals)` within one ulp.
pub fn normalize_chainlink_price(answer: U256, decimals: u8) -> f64 {
    let raw: u128 = if answer <= U256::from(u128::MAX) {
        answer.to()
    } else {
        u128::MAX
    };
    raw as f64 / 10f64.powi(decimals as i32)
}

/// Absolute difference between two answers in basis points of the old value.
pub fn delta_bps(old: U256, new: U256) -> u64 {
    if old.is_zero() {
        return u64::MAX;
    }
    let diff = if new > old { new - old } else { old - new };
    (diff * U256::from(10_000u64) / old).to::<u64>()
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle_with(feeds: Vec<FeedConfig>, config: OracleConfig) -> PriceOracle {
        PriceOracle::new(Arc::new(EndpointManager::for_tests()), config, feeds)
    }

    fn point(symbol: &str, price: f64, ts: u64) -> PricePoint {
        PricePoint {
            symbol: symbol.to_string(),
            price_usd: price,
            answer: U256::from((price * 1e8) as u64),
            decimals: 8,
            ts,
            block: 100,
            source: PriceSource::OracleUsd,
        }
    }

    #[test]
    fn test_alias_resolution() {
        let mut aliases = HashMap::new();
        aliases.insert("USDbC".to_string(), "USDC".to_string());
        let oracle = oracle_with(
            vec![FeedConfig {
                symbol: "USDC".to_string(),
                aggregator: Address::ZERO,
                ratio_base: None,
            }],
            OracleConfig {
                aliases,
                ..Default::default()
            },
        );
        oracle.set_readiness(Readiness::Ready);
        oracle.store(point("USDC", 1.0, now_secs()));

        let resolved = oracle.get_price("USDbC").unwrap();
        assert_eq!(resolved.symbol, "USDC");
        assert_eq!(resolved.source, PriceSource::Alias);
    }

    #[test]
    fn test_ratio_price() {
        let oracle = oracle_with(
            vec![
                FeedConfig {
                    symbol: "WETH".to_string(),
                    aggregator: Address::ZERO,
                    ratio_base: None,
                },
                FeedConfig {
                    symbol: "wstETH".to_string(),
                    aggregator: Address::ZERO,
                    ratio_base: Some("WETH".to_string()),
                },
            ],
            OracleConfig::default(),
        );
        oracle.set_readiness(Readiness::Ready);
        oracle.store(point("WETH", 2000.0, now_secs()));
        // Ratio feed holds the raw ratio, 1.15 wstETH/ETH.
        oracle.store(point("wstETH", 1.15, now_secs()));

        let resolved = oracle.get_price("wstETH").unwrap();
        assert!((resolved.price_usd - 2300.0).abs() < 1e-6);
        assert_eq!(resolved.source, PriceSource::OracleRatio);
    }

    #[test]
    fn test_stale_price_fails_even_if_cached() {
        let oracle = oracle_with(
            vec![FeedConfig {
                symbol: "WETH".to_string(),
                aggregator: Address::ZERO,
                ratio_base: None,
            }],
            OracleConfig {
                freshness_window: Duration::from_secs(60),
                ..Default::default()
            },
        );
        oracle.set_readiness(Readiness::Ready);
        oracle.store(point("WETH", 2000.0, now_secs() - 120));

        match oracle.get_price("WETH") {
            Err(PriceError::Stale { age_secs, .. }) => assert!(age_secs >= 120),
            other => panic!("expected stale error, got {other:?}"),
        }
    }

    #[test]
    fn test_deferred_until_ready() {
        let oracle = oracle_with(
            vec![FeedConfig {
                symbol: "WETH".to_string(),
                aggregator: Address::ZERO,
                ratio_base: None,
            }],
            OracleConfig::default(),
        );

        // Cold oracle: request is recorded and Missing returned.
        assert!(matches!(
            oracle.get_price("WETH"),
            Err(PriceError::Missing { .. })
        ));

        oracle.store(point("WETH", 2000.0, now_secs()));
        oracle.set_readiness(Readiness::Ready);

        let outcome = oracle.flush_pending_and_revalue();
        assert_eq!(outcome.resolved, 1);
        assert_eq!(outcome.still_deferred, 0);
        assert!(oracle.get_price("WETH").is_ok());
    }

    #[test]
    fn test_stub_prices_in_dev_mode() {
        let oracle = oracle_with(
            vec![],
            OracleConfig {
                dev_stub_prices: true,
                ..Default::default()
            },
        );
        let stub = oracle.get_price("ANY").unwrap();
        assert_eq!(stub.source, PriceSource::Stub);
        assert!((stub.price_usd - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_roundtrip() {
        let price = normalize_chainlink_price(U256::from(250_000_000_000u64), 8);
        assert!((price - 2500.0).abs() < 1e-9);
        let back = (price * 1e8).round() as u64;
        assert_eq!(back, 250_000_000_000);
    }

    #[test]
    fn test_delta_bps() {
        let old = U256::from(100_000_000u64);
        let new = U256::from(100_300_000u64);
        assert_eq!(delta_bps(old, new), 30);
        assert_eq!(delta_bps(new, old), 29); // relative to the larger base
        assert_eq!(delta_bps(U256::ZERO, new), u64::MAX);
    }
}
