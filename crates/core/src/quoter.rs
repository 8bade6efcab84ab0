//! Swap quote seam.
//!
//! Aggregator HTTP clients live outside this crate; planning only needs a
//! quote for "collateral in, debt asset out" to size slippage. The static
//! quoter stands in for development and tests.

use alloy::primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;

use crate::wad_math::apply_bps_down;

/// A swap quote for a fixed input amount.
#[derive(Debug, Clone)]
pub struct SwapQuote {
    pub amount_out: U256,
    pub expected_out_usd: Option<f64>,
}

/// Quote source seam implemented by external aggregator clients.
#[async_trait]
pub trait SwapQuoter: Send + Sync {
    async fn quote(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Result<SwapQuote>;
}

/// Fixed-haircut quoter: output equals input minus a configured number of
/// basis points. Development and test double.
pub struct StaticQuoter {
    haircut_bps: u16,
}

impl StaticQuoter {
    pub fn new(haircut_bps: u16) -> Self {
        Self { haircut_bps }
    }
}

#[async_trait]
impl SwapQuoter for StaticQuoter {
    async fn quote(
        &self,
        _token_in: Address,
        _token_out: Address,
        amount_in: U256,
    ) -> Result<SwapQuote> {
        Ok(SwapQuote {
            amount_out: apply_bps_down(amount_in, self.haircut_bps),
            expected_out_usd: None,
        })
    }
}
