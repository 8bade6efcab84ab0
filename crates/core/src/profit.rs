//! Canonical profit arithmetic.
//!
//! Two flavors: post-event reconciliation of an observed liquidation
//! (the event's collateral amount already includes the bonus, which is
//! never re-applied), and the integer pre-trade estimate used by the risk
//! gate before submission.

use alloy::primitives::{I256, U256};

use crate::wad_math::{base_to_f64, bps_of, signed_sub};

/// Post-event reconciliation breakdown, in display USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfitBreakdown {
    pub gross_usd: f64,
    pub fees_usd: f64,
    pub gas_cost_usd: f64,
    pub net_usd: f64,
}

/// Integer pre-trade estimate in base-currency units (8 decimals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfitEstimate {
    pub gross_base: U256,
    pub fees_base: U256,
    pub gas_cost_base: U256,
    pub net_base: I256,
}

impl ProfitEstimate {
    /// Net profit as display USD.
    pub fn net_usd(&self) -> f64 {
        if self.net_base >= I256::ZERO {
            base_to_f64(self.net_base.into_raw())
        } else {
            -base_to_f64((-self.net_base).into_raw())
        }
    }

    pub fn is_profitable(&self, min_net_base: U256) -> bool {
        self.net_base >= I256::try_from(min_net_base).unwrap_or(I256::MAX)
    }
}

/// Profit calculator with the protocol/executor fee configured in bps.
pub struct ProfitCalculator {
    fee_bps: u16,
}

impl ProfitCalculator {
    pub fn new(fee_bps: u16) -> Self {
        Self { fee_bps }
    }

    pub fn fee_bps(&self) -> u16 {
        self.fee_bps
    }

    /// Reconcile an observed liquidation.
    ///
    /// `collateral_value_usd` is the seized collateral at event prices,
    /// `principal_value_usd` the debt actually covered. The spread already
    /// contains the liquidation bonus, so gross equals the raw spread.
    /// `net = gross - fees - gas` holds identically.
    pub fn reconcile(
        &self,
        collateral_value_usd: f64,
        principal_value_usd: f64,
        gas_cost_usd: f64,
    ) -> ProfitBreakdown {
        let raw_spread = collateral_value_usd - principal_value_usd;
        let gross_usd = raw_spread;
        let fees_usd = gross_usd * self.fee_bps as f64 / 10_000.0;
        let net_usd = gross_usd - fees_usd - gas_cost_usd;
        ProfitBreakdown {
            gross_usd,
            fees_usd,
            gas_cost_usd,
            net_usd,
        }
    }

    /// Pre-trade estimate on base-currency integers.
    ///
    /// Gross is the nominal bonus on the debt we would repay; fees and gas
    /// come off before the gate compares against its minimum.
    pub fn estimate(
        &self,
        repay_base: U256,
        bonus_bps: u16,
        gas_cost_base: U256,
    ) -> ProfitEstimate {
        let gross_base = bps_of(repay_base, bonus_bps);
        let fees_base = bps_of(gross_base, self.fee_bps);
        let net_base = signed_sub(gross_base, fees_base + gas_cost_base);
        ProfitEstimate {
            gross_base,
            fees_base,
            gas_cost_base,
            net_base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wad_math::usd_to_base;

    #[test]
    fn test_reconcile_closed_form() {
        let calc = ProfitCalculator::new(100); // 1% fee
        let breakdown = calc.reconcile(1_050.0, 1_000.0, 0.25);

        assert!((breakdown.gross_usd - 50.0).abs() < 1e-9);
        assert!((breakdown.fees_usd - 0.50).abs() < 1e-9);
        // net = gross - fees - gas, identically.
        assert!(
            (breakdown.net_usd - (breakdown.gross_usd - breakdown.fees_usd - breakdown.gas_cost_usd))
                .abs()
                < 1e-12
        );
        assert!((breakdown.net_usd - 49.25).abs() < 1e-9);
    }

    #[test]
    fn test_reconcile_negative_spread() {
        let calc = ProfitCalculator::new(100);
        let breakdown = calc.reconcile(990.0, 1_000.0, 0.10);
        assert!(breakdown.net_usd < 0.0);
        assert!(
            (breakdown.net_usd - (breakdown.gross_usd - breakdown.fees_usd - breakdown.gas_cost_usd))
                .abs()
                < 1e-12
        );
    }

    #[test]
    fn test_bonus_not_reapplied_in_reconciliation() {
        // The event spread IS the bonus; reconciliation must not multiply
        // it up again. A 5% bonus on $1000 covered debt shows up as a $50
        // spread and gross of exactly $50.
        let calc = ProfitCalculator::new(0);
        let breakdown = calc.reconcile(1_050.0, 1_000.0, 0.0);
        assert!((breakdown.gross_usd - 50.0).abs() < 1e-9);
        assert!((breakdown.net_usd - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_integer_path() {
        let calc = ProfitCalculator::new(100); // 1% fee
        // Repay $1000, 5% bonus, $0.25 gas.
        let estimate = calc.estimate(usd_to_base(1_000.0), 500, usd_to_base(0.25));

        assert_eq!(estimate.gross_base, usd_to_base(50.0));
        assert_eq!(estimate.fees_base, usd_to_base(0.50));
        assert!((estimate.net_usd() - 49.25).abs() < 1e-9);
        assert!(estimate.is_profitable(usd_to_base(1.0)));
        assert!(!estimate.is_profitable(usd_to_base(100.0)));
    }

    #[test]
    fn test_estimate_can_go_negative() {
        let calc = ProfitCalculator::new(0);
        // Tiny repay, big gas.
        let estimate = calc.estimate(usd_to_base(10.0), 500, usd_to_base(5.0));
        assert!(estimate.net_base < I256::ZERO);
        assert!(estimate.net_usd() < 0.0);
        assert!(!estimate.is_profitable(U256::ZERO));
    }
}
