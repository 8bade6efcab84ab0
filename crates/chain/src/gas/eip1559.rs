//! EIP-1559 gas pricing strategy.

use super::{GasParams, GasStrategy, TipStrategy};
use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// EIP-1559 pricing with a base-fee buffer and a configured tip strategy.
#[derive(Debug)]
pub struct Eip1559GasStrategy {
    /// Default priority fee (tip) in wei, before the tip strategy scales it.
    default_priority_fee: u128,
    /// Multiplier for max_fee relative to base_fee.
    max_fee_multiplier: f64,
    /// Hard cap on max_fee_per_gas in wei.
    max_fee_cap: u128,
    /// Tip priority mode.
    tip: TipStrategy,
    /// Cached base fee from the last fetch.
    cached_base_fee: AtomicU64,
    /// Cached priority fee from the last fetch.
    cached_priority_fee: AtomicU64,
}

impl Eip1559GasStrategy {
    pub fn new(default_priority_fee: u128, max_fee_multiplier: f64, tip: TipStrategy) -> Self {
        Self {
            default_priority_fee,
            max_fee_multiplier,
            max_fee_cap: 500_000_000_000,
            tip,
            cached_base_fee: AtomicU64::new(50_000_000), // 0.05 gwei, fast L2 territory
            cached_priority_fee: AtomicU64::new(default_priority_fee as u64),
        }
    }

    pub fn with_max_fee_cap(mut self, cap: u128) -> Self {
        self.max_fee_cap = cap;
        self
    }

    pub fn cached_base_fee(&self) -> u128 {
        self.cached_base_fee.load(Ordering::Relaxed) as u128
    }

    pub fn cached_priority_fee(&self) -> u128 {
        self.cached_priority_fee.load(Ordering::Relaxed) as u128
    }

    pub fn update_cache(&self, base_fee: u128, priority_fee: u128) {
        self.cached_base_fee
            .store(base_fee as u64, Ordering::Relaxed);
        self.cached_priority_fee
            .store(priority_fee as u64, Ordering::Relaxed);
    }

    fn tipped_priority(&self, priority_fee: u128) -> u128 {
        priority_fee * self.tip.tip_pct() as u128 / 100
    }

    fn calculate_max_fee(&self, base_fee: u128, priority_fee: u128) -> u128 {
        let max_fee = ((base_fee as f64) * self.max_fee_multiplier) as u128 + priority_fee;
        max_fee.min(self.max_fee_cap)
    }
}

#[async_trait]
impl GasStrategy for Eip1559GasStrategy {
    async fn fetch_params(&self, rpc_url: &str) -> Result<GasParams> {
        use alloy::providers::{Provider, ProviderBuilder};

        let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);
        let block = provider
            .get_block_by_number(alloy::eips::BlockNumberOrTag::Latest)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no latest block"))?;

        let base_fee = block
            .header
            .base_fee_per_gas
            .map(|b| b as u128)
            .unwrap_or(50_000_000);

        let suggested = provider
            .get_max_priority_fee_per_gas()
            .await
            .unwrap_or(self.default_priority_fee);
        let priority_fee = self.tipped_priority(suggested);

        self.update_cache(base_fee, priority_fee);

        Ok(GasParams::Eip1559 {
            max_fee_per_gas: self.calculate_max_fee(base_fee, priority_fee),
            max_priority_fee_per_gas: priority_fee,
            base_fee,
        })
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams) {
        match params {
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                ..
            } => {
                tx.set_max_fee_per_gas(*max_fee_per_gas);
                tx.set_max_priority_fee_per_gas(*max_priority_fee_per_gas);
            }
            GasParams::Legacy { gas_price } => {
                tx.set_max_fee_per_gas(*gas_price);
                tx.set_max_priority_fee_per_gas(self.default_priority_fee.min(*gas_price));
            }
        }
    }

    fn strategy_name(&self) -> &'static str {
        "EIP-1559"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    #[test]
    fn test_max_fee_calculation() {
        let strategy = Eip1559GasStrategy::new(100_000_000, 2.0, TipStrategy::Safe);
        // base 1 gwei, priority 0.1 gwei: max = 2 + 0.1 gwei
        let max_fee = strategy.calculate_max_fee(1_000_000_000, 100_000_000);
        assert_eq!(max_fee, 2_100_000_000);
    }

    #[test]
    fn test_max_fee_cap() {
        let strategy = Eip1559GasStrategy::new(100_000_000, 10.0, TipStrategy::Safe)
            .with_max_fee_cap(3_000_000_000);
        let max_fee = strategy.calculate_max_fee(1_000_000_000, 100_000_000);
        assert_eq!(max_fee, 3_000_000_000);
    }

    #[test]
    fn test_tip_strategy_scales_priority() {
        let safe = Eip1559GasStrategy::new(100, 2.0, TipStrategy::Safe);
        let fast = Eip1559GasStrategy::new(100, 2.0, TipStrategy::Fast);
        assert_eq!(safe.tipped_priority(100), 100);
        assert_eq!(fast.tipped_priority(100), 160);
    }

    #[test]
    fn test_apply_gas() {
        let strategy = Eip1559GasStrategy::new(100_000_000, 2.0, TipStrategy::Mid);
        let mut tx = TransactionRequest::default().with_to(Address::ZERO);

        let params = GasParams::Eip1559 {
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 125_000_000,
            base_fee: 900_000_000,
        };
        strategy.apply_gas(&mut tx, &params);

        assert_eq!(tx.max_fee_per_gas, Some(2_000_000_000));
        assert_eq!(tx.max_priority_fee_per_gas, Some(125_000_000));
    }

    #[test]
    fn test_cache_update() {
        let strategy = Eip1559GasStrategy::new(100_000_000, 2.0, TipStrategy::Mid);
        strategy.update_cache(40_000_000, 150_000_000);
        assert_eq!(strategy.cached_base_fee(), 40_000_000);
        assert_eq!(strategy.cached_priority_fee(), 150_000_000);
    }
}
