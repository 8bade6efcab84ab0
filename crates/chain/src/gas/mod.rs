//! Gas pricing and the replace-by-fee ladder.
//!
//! Submissions are priced as EIP-1559 quotes scaled by the configured tip
//! strategy; the burst manager layers timed fee bumps on top for
//! transactions that linger in the mempool.

mod burst;
mod eip1559;

pub use burst::{GasBurstConfig, GasBurstManager, TrackedAttemptTx};
pub use eip1559::Eip1559GasStrategy;

use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Relative priority of the tip we attach to submissions.
///
/// This is a plain configured mode; reverted attempts do not promote the
/// strategy (the revert classifier quarantines the position instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TipStrategy {
    Safe,
    #[default]
    Mid,
    Fast,
}

impl TipStrategy {
    /// Priority fee multiplier in percent.
    pub fn tip_pct(&self) -> u64 {
        match self {
            Self::Safe => 100,
            Self::Mid => 125,
            Self::Fast => 160,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Mid => "mid",
            Self::Fast => "fast",
        }
    }
}

/// Per-gas pricing attached to one submission.
///
/// The bot quotes two-dimensional EIP-1559 fees everywhere it originates
/// transactions. The single-price form exists because the bump ladder must
/// be able to re-price whatever shape it is tracking: a legacy replacement
/// bumps `gas_price` directly, a 1559 replacement scales both fee fields.
#[derive(Debug, Clone)]
pub enum GasParams {
    /// Pre-1559 single price.
    Legacy { gas_price: u128 },
    /// Base-fee quote plus tip, capped at the max fee.
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
        base_fee: u128,
    },
}

impl GasParams {
    /// What we are offering per unit of gas: the cap check and cost
    /// estimates price against the most we could pay, so a 1559 quote
    /// bids its max fee.
    pub fn bid_per_gas(&self) -> u128 {
        match self {
            GasParams::Legacy { gas_price } => *gas_price,
            GasParams::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// The bid in gwei, for logs and decision traces.
    pub fn bid_gwei(&self) -> f64 {
        self.bid_per_gas() as f64 / 1e9
    }

    /// Fee-bumped copy: every price field scaled by `1 + bump_pct/100`.
    /// The observed base fee is a measurement, not a bid, and is left
    /// untouched.
    pub fn bumped(&self, bump_pct: u32) -> GasParams {
        let scale = |fee: u128| fee * (100 + bump_pct as u128) / 100;
        match self {
            GasParams::Legacy { gas_price } => GasParams::Legacy {
                gas_price: scale(*gas_price),
            },
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                base_fee,
            } => GasParams::Eip1559 {
                max_fee_per_gas: scale(*max_fee_per_gas),
                max_priority_fee_per_gas: scale(*max_priority_fee_per_gas),
                base_fee: *base_fee,
            },
        }
    }

    /// Write these fees into a transaction request.
    pub fn apply(&self, tx: &mut TransactionRequest) {
        match self {
            GasParams::Legacy { gas_price } => {
                tx.set_gas_price(*gas_price);
            }
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                ..
            } => {
                tx.set_max_fee_per_gas(*max_fee_per_gas);
                tx.set_max_priority_fee_per_gas(*max_priority_fee_per_gas);
            }
        }
    }
}

/// Trait for gas pricing strategies.
#[async_trait]
pub trait GasStrategy: Send + Sync + Debug {
    /// Query current gas parameters from the given RPC URL.
    async fn fetch_params(&self, rpc_url: &str) -> Result<GasParams>;

    /// Apply gas parameters to a transaction request.
    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams);

    /// Strategy name for logging.
    fn strategy_name(&self) -> &'static str;
}

/// Build the submission gas strategy from execution config: an EIP-1559
/// quote with the configured tip mode, capped at the gas price ceiling.
pub fn create_gas_strategy(
    max_gas_price_gwei: f64,
    priority_fee_gwei: f64,
    tip: TipStrategy,
) -> Box<dyn GasStrategy> {
    Box::new(
        Eip1559GasStrategy::new((priority_fee_gwei * 1e9) as u128, 2.0, tip)
            .with_max_fee_cap((max_gas_price_gwei * 1e9) as u128),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    #[test]
    fn test_bump_raises_the_bid() {
        let quote = GasParams::Eip1559 {
            max_fee_per_gas: 200_000_000,
            max_priority_fee_per_gas: 50_000_000,
            base_fee: 90_000_000,
        };
        assert_eq!(quote.bid_per_gas(), 200_000_000);

        let replacement = quote.bumped(15);
        // Both bid dimensions grow by 15%; the measured base fee does not.
        assert_eq!(replacement.bid_per_gas(), 230_000_000);
        match replacement {
            GasParams::Eip1559 {
                max_priority_fee_per_gas,
                base_fee,
                ..
            } => {
                assert_eq!(max_priority_fee_per_gas, 57_500_000);
                assert_eq!(base_fee, 90_000_000);
            }
            _ => panic!("replacement changed shape"),
        }
    }

    #[test]
    fn test_legacy_replacement_bumps_single_price() {
        // A legacy-shaped tracked tx has one price knob; the ladder turns
        // that knob and the bid follows it.
        let tracked = GasParams::Legacy { gas_price: 200 };
        let replacement = tracked.bumped(50);
        match replacement {
            GasParams::Legacy { gas_price } => assert_eq!(gas_price, 300),
            _ => panic!("replacement changed shape"),
        }
        assert_eq!(tracked.bumped(50).bid_per_gas(), 300);
    }

    #[test]
    fn test_apply_writes_fee_fields() {
        let mut tx = TransactionRequest::default().with_to(Address::ZERO);
        GasParams::Eip1559 {
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 125_000_000,
            base_fee: 900_000_000,
        }
        .apply(&mut tx);
        assert_eq!(tx.max_fee_per_gas, Some(2_000_000_000));
        assert_eq!(tx.max_priority_fee_per_gas, Some(125_000_000));

        let mut tx = TransactionRequest::default().with_to(Address::ZERO);
        GasParams::Legacy { gas_price: 700 }.apply(&mut tx);
        assert_eq!(tx.gas_price, Some(700));
    }

    #[test]
    fn test_bid_gwei_for_traces() {
        let quote = GasParams::Eip1559 {
            max_fee_per_gas: 1_500_000_000,
            max_priority_fee_per_gas: 100_000_000,
            base_fee: 700_000_000,
        };
        assert!((quote.bid_gwei() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_create_gas_strategy_is_1559() {
        let strategy = create_gas_strategy(5.0, 0.05, TipStrategy::Fast);
        assert_eq!(strategy.strategy_name(), "EIP-1559");
    }

    #[test]
    fn test_tip_strategy_ordering() {
        assert!(TipStrategy::Safe.tip_pct() < TipStrategy::Mid.tip_pct());
        assert!(TipStrategy::Mid.tip_pct() < TipStrategy::Fast.tip_pct());
    }
}
