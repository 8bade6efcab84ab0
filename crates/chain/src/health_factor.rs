//! Batched health factor computation via Multicall3.
//!
//! Wraps `getUserAccountData` calls at explicit block tags, chunked so a
//! single slow or failing user never blocks the rest of a batch. Results are
//! cached with a short TTL (longer for stablecoin-only users) and in-flight
//! reads are de-duplicated.

use alloy::eips::BlockId;
use alloy::primitives::{Address, U256};
use alloy::providers::ProviderBuilder;
use alloy::sol_types::SolCall;
use anyhow::{Context, Result};
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::contracts::{
    encode_get_user_account_data, IMulticall3, IPool, IPoolDataProvider, MULTICALL3_ADDRESS,
};
use crate::provider::EndpointManager;

/// WAD (1e18) as U256.
const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Base-currency decimals of the pool oracle (USD, 8 decimals).
const BASE_DECIMALS: f64 = 1e8;

/// Debt below this many base units is treated as no debt at all.
const DUST_EPSILON_BASE: u64 = 100;

/// Decoded `getUserAccountData` result.
///
/// Base-currency amounts are kept as raw U256 for decisioning; USD floats
/// are derived on demand for display only.
#[derive(Debug, Clone)]
pub struct AccountData {
    pub total_collateral_base: U256,
    pub total_debt_base: U256,
    pub current_liquidation_threshold: U256,
    pub ltv: U256,
    pub health_factor: U256,
}

impl AccountData {
    /// Health factor as f64 (wad-scaled on chain).
    pub fn hf(&self) -> f64 {
        if self.total_debt_base < U256::from(DUST_EPSILON_BASE) {
            return f64::INFINITY;
        }
        wad_to_f64(self.health_factor)
    }

    /// Liquidatable iff HF strictly below 1.0. Exactly 1.0 is healthy.
    pub fn is_liquidatable(&self) -> bool {
        self.total_debt_base >= U256::from(DUST_EPSILON_BASE) && self.health_factor < WAD
    }

    /// Collateral in USD for display.
    pub fn collateral_usd(&self) -> f64 {
        base_to_f64(self.total_collateral_base)
    }

    /// Debt in USD for display.
    pub fn debt_usd(&self) -> f64 {
        base_to_f64(self.total_debt_base)
    }
}

/// Per-reserve user position entry from the data provider.
#[derive(Debug, Clone)]
pub struct ReserveAmount {
    pub asset: Address,
    pub amount: U256,
    pub usage_as_collateral: bool,
}

/// Per-reserve breakdown of a user position.
#[derive(Debug, Clone, Default)]
pub struct UserPosition {
    pub collaterals: Vec<ReserveAmount>,
    pub debts: Vec<ReserveAmount>,
}

/// Result of a batched account data read.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub accounts: HashMap<Address, AccountData>,
    pub failures: Vec<(Address, String)>,
}

impl BatchResult {
    /// Users with HF strictly below 1.0.
    pub fn filter_liquidatable(&self) -> HashMap<Address, AccountData> {
        self.accounts
            .iter()
            .filter(|(_, data)| data.is_liquidatable())
            .map(|(user, data)| (*user, data.clone()))
            .collect()
    }
}

struct CachedAccount {
    data: AccountData,
    block: u64,
    fetched: Instant,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct HfEngineConfig {
    /// Users per multicall chunk.
    pub batch_size: usize,
    /// Hard deadline per chunk.
    pub chunk_timeout: Duration,
    /// Cache TTL for regular users.
    pub cache_ttl: Duration,
    /// Cache TTL for stablecoin-only users.
    pub stable_cache_ttl: Duration,
}

impl Default for HfEngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 110,
            chunk_timeout: Duration::from_millis(1_500),
            cache_ttl: Duration::from_secs(2),
            stable_cache_ttl: Duration::from_secs(20),
        }
    }
}

/// Batched health factor engine.
pub struct HealthFactorEngine {
    endpoints: Arc<EndpointManager>,
    multicall_address: Address,
    config: HfEngineConfig,
    cache: DashMap<Address, CachedAccount>,
    /// Users whose entire position is stablecoin-priced (longer TTL).
    stable_users: DashSet<Address>,
    /// Per-user fetch locks for single-flight de-duplication.
    fetch_locks: DashMap<Address, Arc<tokio::sync::Mutex<()>>>,
}

impl HealthFactorEngine {
    pub fn new(endpoints: Arc<EndpointManager>, config: HfEngineConfig) -> Self {
        Self {
            endpoints,
            multicall_address: MULTICALL3_ADDRESS,
            config,
            cache: DashMap::new(),
            stable_users: DashSet::new(),
            fetch_locks: DashMap::new(),
        }
    }

    /// Override the Multicall3 address (non-standard deployments).
    pub fn with_multicall(mut self, address: Address) -> Self {
        self.multicall_address = address;
        self
    }

    /// Mark or unmark a user as stablecoin-only.
    pub fn mark_stable(&self, user: Address, stable: bool) {
        if stable {
            self.stable_users.insert(user);
        } else {
            self.stable_users.remove(&user);
        }
    }

    /// Health factor for a single user, read-through cached.
    ///
    /// Returns `None` when the user has no position or the read failed.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn get_health_factor(&self, user: Address, block_tag: Option<u64>) -> Option<f64> {
        if let Some(cached) = self.cached(&user, block_tag) {
            metrics::increment_counter!("hf_cache_hits_total");
            return Some(cached.hf());
        }
        metrics::increment_counter!("hf_cache_misses_total");

        // Single-flight: the first caller fetches, the rest await the lock
        // and then hit the refreshed cache.
        let lock = self
            .fetch_locks
            .entry(user)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(cached) = self.cached(&user, block_tag) {
            return Some(cached.hf());
        }

        let result = self.batch(&[user], block_tag).await;
        self.fetch_locks.remove(&user);
        match result {
            Ok(batch) => batch.accounts.get(&user).map(|d| d.hf()),
            Err(e) => {
                warn!(user = %user, error = %e, "Health factor read failed");
                None
            }
        }
    }

    /// Account data for a single user (cached), full struct.
    pub async fn get_account_data(
        &self,
        user: Address,
        block_tag: Option<u64>,
    ) -> Option<AccountData> {
        if let Some(cached) = self.cached(&user, block_tag) {
            return Some(cached);
        }
        let batch = self.batch(&[user], block_tag).await.ok()?;
        batch.accounts.get(&user).cloned()
    }

    /// Batched account data read at an explicit block tag.
    ///
    /// Chunked at `batch_size`; individual call failures land in
    /// `failures` and never abort the batch.
    #[instrument(skip(self, users), fields(count = users.len(), block = ?block_tag))]
    pub async fn batch(&self, users: &[Address], block_tag: Option<u64>) -> Result<BatchResult> {
        let mut result = BatchResult::default();
        let block = match block_tag {
            Some(b) => b,
            None => self.endpoints.last_head(),
        };

        for chunk in users.chunks(self.config.batch_size.max(1)) {
            match timeout(
                self.config.chunk_timeout,
                self.fetch_chunk(chunk, block_tag),
            )
            .await
            {
                Ok(Ok(chunk_result)) => {
                    for (user, outcome) in chunk_result {
                        match outcome {
                            Ok(data) => {
                                self.cache.insert(
                                    user,
                                    CachedAccount {
                                        data: data.clone(),
                                        block,
                                        fetched: Instant::now(),
                                    },
                                );
                                result.accounts.insert(user, data);
                            }
                            Err(reason) => {
                                metrics::increment_counter!("hf_batch_failures_total");
                                result.failures.push((user, reason));
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, chunk = chunk.len(), "Multicall chunk failed");
                    for user in chunk {
                        result.failures.push((*user, e.to_string()));
                    }
                }
                Err(_) => {
                    warn!(chunk = chunk.len(), "Multicall chunk timed out");
                    for user in chunk {
                        result.failures.push((*user, "chunk timeout".to_string()));
                    }
                }
            }
        }

        debug!(
            ok = result.accounts.len(),
            failed = result.failures.len(),
            "Batch account data complete"
        );
        Ok(result)
    }

    /// Per-reserve position breakdown via the data provider, one multicall.
    pub async fn read_user_reserves(
        &self,
        user: Address,
        assets: &[Address],
        block_tag: Option<u64>,
    ) -> Result<UserPosition> {
        let provider = ProviderBuilder::new().on_http(self.endpoints.http_url().parse()?);
        let multicall = IMulticall3::new(self.multicall_address, &provider);
        let data_provider = self.endpoints.data_provider_address();

        let calls: Vec<IMulticall3::Call3> = assets
            .iter()
            .map(|asset| IMulticall3::Call3 {
                target: data_provider,
                allowFailure: true,
                callData: IPoolDataProvider::getUserReserveDataCall {
                    asset: *asset,
                    user,
                }
                .abi_encode()
                .into(),
            })
            .collect();

        let mut builder = multicall.aggregate3(calls);
        if let Some(block) = block_tag {
            builder = builder.block(BlockId::number(block));
        }
        let response = builder.call().await.context("data provider multicall")?;

        let mut position = UserPosition::default();
        for (asset, ret) in assets.iter().zip(response.returnData.into_iter()) {
            if !ret.success {
                continue;
            }
            let Ok(decoded) =
                IPoolDataProvider::getUserReserveDataCall::abi_decode_returns(&ret.returnData, true)
            else {
                continue;
            };

            if decoded.currentATokenBalance > U256::ZERO {
                position.collaterals.push(ReserveAmount {
                    asset: *asset,
                    amount: decoded.currentATokenBalance,
                    usage_as_collateral: decoded.usageAsCollateralEnabled,
                });
            }
            let debt = decoded.currentStableDebt + decoded.currentVariableDebt;
            if debt > U256::ZERO {
                position.debts.push(ReserveAmount {
                    asset: *asset,
                    amount: debt,
                    usage_as_collateral: false,
                });
            }
        }
        Ok(position)
    }

    /// Drop cached entries older than the given block.
    pub fn invalidate_before(&self, block: u64) {
        self.cache.retain(|_, entry| entry.block >= block);
    }

    /// Drop a single user's cached entry.
    pub fn invalidate_user(&self, user: &Address) {
        self.cache.remove(user);
    }

    fn cached(&self, user: &Address, block_tag: Option<u64>) -> Option<AccountData> {
        let entry = self.cache.get(user)?;
        if let Some(block) = block_tag {
            if entry.block < block {
                return None;
            }
        }
        let ttl = if self.stable_users.contains(user) {
            self.config.stable_cache_ttl
        } else {
            self.config.cache_ttl
        };
        if entry.fetched.elapsed() > ttl {
            return None;
        }
        Some(entry.data.clone())
    }

    async fn fetch_chunk(
        &self,
        users: &[Address],
        block_tag: Option<u64>,
    ) -> Result<Vec<(Address, std::result::Result<AccountData, String>)>> {
        let provider = ProviderBuilder::new().on_http(self.endpoints.http_url().parse()?);
        let multicall = IMulticall3::new(self.multicall_address, &provider);
        let pool = self.endpoints.pool_address();

        let calls: Vec<IMulticall3::Call3> = users
            .iter()
            .map(|user| IMulticall3::Call3 {
                target: pool,
                allowFailure: true,
                callData: encode_get_user_account_data(*user),
            })
            .collect();

        let mut builder = multicall.aggregate3(calls);
        if let Some(block) = block_tag {
            builder = builder.block(BlockId::number(block));
        }
        let response = builder.call().await.context("account data multicall")?;

        let mut out = Vec::with_capacity(users.len());
        for (user, ret) in users.iter().zip(response.returnData.into_iter()) {
            if !ret.success {
                out.push((*user, Err("call reverted".to_string())));
                continue;
            }
            match IPool::getUserAccountDataCall::abi_decode_returns(&ret.returnData, true) {
                Ok(decoded) => out.push((
                    *user,
                    Ok(AccountData {
                        total_collateral_base: decoded.totalCollateralBase,
                        total_debt_base: decoded.totalDebtBase,
                        current_liquidation_threshold: decoded.currentLiquidationThreshold,
                        ltv: decoded.ltv,
                        health_factor: decoded.healthFactor,
                    }),
                )),
                Err(e) => out.push((*user, Err(format!("decode: {e}")))),
            }
        }
        Ok(out)
    }
}

/// Health factor from per-reserve USD values.
///
/// `collaterals` are `(value_usd_wad, liquidation_threshold_bps)` pairs;
/// `debts` are USD wad values. Debt under the dust epsilon yields infinity,
/// never NaN.
pub fn health_factor_from_reserves(collaterals: &[(U256, u16)], debts: &[U256]) -> f64 {
    let mut weighted = U256::ZERO;
    for (value, lt_bps) in collaterals {
        weighted += value * U256::from(*lt_bps) / U256::from(10_000u64);
    }
    let total_debt: U256 = debts.iter().fold(U256::ZERO, |acc, d| acc + d);

    // Dust epsilon in wad terms (1e-10 USD).
    if total_debt < U256::from(100_000_000u64) {
        return f64::INFINITY;
    }
    wad_to_f64(weighted * WAD / total_debt)
}

fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let limbs = wad.as_limbs();
        let high = limbs[1] as f64 * (u64::MAX as f64 + 1.0);
        (high + limbs[0] as f64) / 1e18
    }
}

fn base_to_f64(base: U256) -> f64 {
    if base <= U256::from(u128::MAX) {
        let value: u128 = base.to();
        value as f64 / BASE_DECIMALS
    } else {
        f64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(hf_wad: u128, debt_base: u64) -> AccountData {
        AccountData {
            total_collateral_base: U256::from(1_000_000_000u64),
            total_debt_base: U256::from(debt_base),
            current_liquidation_threshold: U256::from(8000u64),
            ltv: U256::from(7500u64),
            health_factor: U256::from(hf_wad),
        }
    }

    #[test]
    fn test_hf_boundary_not_liquidatable() {
        // Exactly 1.0 is healthy.
        let data = account(1_000_000_000_000_000_000, 500_000_000);
        assert!(!data.is_liquidatable());
        assert!((data.hf() - 1.0).abs() < 1e-9);

        let below = account(999_999_999_999_999_999, 500_000_000);
        assert!(below.is_liquidatable());
    }

    #[test]
    fn test_zero_debt_is_infinite_hf() {
        let data = account(0, 0);
        assert!(data.hf().is_infinite());
        assert!(!data.hf().is_nan());
        assert!(!data.is_liquidatable());
    }

    #[test]
    fn test_health_factor_from_reserves() {
        let wad = |usd: u64| U256::from(usd) * WAD;

        // 1000 USD collateral at 80% LT, 500 USD debt: HF = 1.6
        let hf = health_factor_from_reserves(&[(wad(1000), 8000)], &[wad(500)]);
        assert!((hf - 1.6).abs() < 1e-9);

        // No debt: infinity, not NaN.
        let hf = health_factor_from_reserves(&[(wad(1000), 8000)], &[]);
        assert!(hf.is_infinite());
        assert!(!hf.is_nan());
    }

    #[test]
    fn test_display_conversions() {
        let data = account(2_000_000_000_000_000_000, 100_050_000_000);
        // 1000.50 USD debt at 8 decimals
        assert!((data.debt_usd() - 1000.5).abs() < 1e-6);
        assert!((data.collateral_usd() - 10.0).abs() < 1e-6);
    }
}
