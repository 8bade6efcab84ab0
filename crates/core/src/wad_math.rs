//! Fixed-point U256 arithmetic for position and price math.
//!
//! All amount math runs on big integers with explicit decimal conversion.
//! Floats are derived once for display after the integer comparisons are
//! final.

use alloy::primitives::{I256, U256};

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic.
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// RAY constant: 1e27 for 27-decimal reserve index arithmetic.
pub const RAY: U256 = U256::from_limbs([0x9fd0803ce8000000, 0x33b2e3c, 0, 0]);

/// Basis points denominator (10000 = 100%).
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000u64, 0, 0, 0]);

/// Base-currency decimals of the pool oracle (USD with 8 decimals).
pub const BASE_CURRENCY_DECIMALS: u8 = 8;

/// Pre-computed powers of 10 for fast decimal conversion.
const POW10: [u128; 39] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
    100_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000_000,
];

/// Fast power of 10 lookup (up to 10^38).
#[inline(always)]
pub fn pow10(exp: u8) -> U256 {
    if exp < 39 {
        U256::from(POW10[exp as usize])
    } else {
        U256::from(10u64).pow(U256::from(exp))
    }
}

/// USD value in base-currency units (8 decimals) from a token amount and an
/// oracle price.
///
/// `compute_usd_base(1_000_500_000, 6, 100_000_000, 8)` is 1000.50 USD,
/// i.e. `100_050_000_000` base units.
#[inline(always)]
pub fn compute_usd_base(amount: U256, decimals: u8, price: U256, price_decimals: u8) -> U256 {
    if amount.is_zero() || price.is_zero() {
        return U256::ZERO;
    }
    // Normalize the price to base decimals, then divide out token decimals.
    let scaled_price = if price_decimals <= BASE_CURRENCY_DECIMALS {
        price * pow10(BASE_CURRENCY_DECIMALS - price_decimals)
    } else {
        price / pow10(price_decimals - BASE_CURRENCY_DECIMALS)
    };
    amount * scaled_price / pow10(decimals)
}

/// USD value as f64, for display only.
#[inline(always)]
pub fn compute_usd(amount: U256, decimals: u8, price: U256, price_decimals: u8) -> f64 {
    base_to_f64(compute_usd_base(amount, decimals, price, price_decimals))
}

/// Convert base-currency units (8 decimals) to f64 for display.
#[inline(always)]
pub fn base_to_f64(base: U256) -> f64 {
    if base <= U256::from(u128::MAX) {
        let value: u128 = base.to();
        value as f64 / 1e8
    } else {
        f64::MAX
    }
}

/// Convert a USD float threshold to base-currency units once, at config
/// load time, so gates never compare floats.
#[inline(always)]
pub fn usd_to_base(usd: f64) -> U256 {
    if usd <= 0.0 {
        return U256::ZERO;
    }
    U256::from((usd * 1e8).round() as u128)
}

/// Token amount equivalent to a base-currency value at the given price.
/// Inverse of [`compute_usd_base`] up to integer truncation.
#[inline(always)]
pub fn amount_from_usd_base(
    usd_base: U256,
    decimals: u8,
    price: U256,
    price_decimals: u8,
) -> U256 {
    if usd_base.is_zero() || price.is_zero() {
        return U256::ZERO;
    }
    let scaled_price = if price_decimals <= BASE_CURRENCY_DECIMALS {
        price * pow10(BASE_CURRENCY_DECIMALS - price_decimals)
    } else {
        price / pow10(price_decimals - BASE_CURRENCY_DECIMALS)
    };
    if scaled_price.is_zero() {
        return U256::ZERO;
    }
    usd_base * pow10(decimals) / scaled_price
}

/// Convert WAD (18 decimals) to f64. Display only.
#[inline(always)]
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let limbs = wad.as_limbs();
        let high = limbs[1] as f64 * (u64::MAX as f64 + 1.0);
        (high + limbs[0] as f64) / 1e18
    }
}

/// Signed delta in basis points, rounded to nearest:
/// `round((new - old) / old * 10_000)`.
///
/// Returns `i64::MAX` when there is no prior value to compare against.
#[inline(always)]
pub fn delta_bps(old: U256, new: U256) -> i64 {
    if old.is_zero() {
        return i64::MAX;
    }
    let (diff, negative) = if new >= old {
        (new - old, false)
    } else {
        (old - new, true)
    };
    // Round-to-nearest: add old/2 before the division.
    let bps = (diff * BPS_DENOMINATOR + old / U256::from(2u64)) / old;
    let bps = bps.min(U256::from(i64::MAX as u64)).to::<i64>();
    if negative {
        -bps
    } else {
        bps
    }
}

/// Reduce a value by basis points: `value * (10000 - bps) / 10000`.
#[inline(always)]
pub fn apply_bps_down(value: U256, bps: u16) -> U256 {
    let factor = U256::from(10_000u16.saturating_sub(bps));
    value * factor / BPS_DENOMINATOR
}

/// Increase a value by basis points: `value * (10000 + bps) / 10000`.
#[inline(always)]
pub fn apply_bps_up(value: U256, bps: u16) -> U256 {
    let factor = U256::from(10_000u32 + bps as u32);
    value * factor / BPS_DENOMINATOR
}

/// Fraction of a value in basis points: `value * bps / 10000`.
#[inline(always)]
pub fn bps_of(value: U256, bps: u16) -> U256 {
    value * U256::from(bps) / BPS_DENOMINATOR
}

/// Signed subtraction into I256 for profit arithmetic on base units.
#[inline(always)]
pub fn signed_sub(a: U256, b: U256) -> I256 {
    if a >= b {
        I256::try_from(a - b).unwrap_or(I256::MAX)
    } else {
        -I256::try_from(b - a).unwrap_or(I256::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_usd_stable() {
        // 1000.50 USDC (6 decimals) at $1.00 (8-decimal price)
        let usd = compute_usd(
            U256::from(1_000_500_000u64),
            6,
            U256::from(100_000_000u64),
            8,
        );
        assert!((usd - 1000.50).abs() < 1e-9);
    }

    #[test]
    fn test_compute_usd_eth() {
        // 1.5 ETH (18 decimals) at $2500 (8-decimal price)
        let usd = compute_usd(
            U256::from(1_500_000_000_000_000_000u128),
            18,
            U256::from(250_000_000_000u64),
            8,
        );
        assert!((usd - 3750.00).abs() < 1e-9);
    }

    #[test]
    fn test_compute_usd_base_integer() {
        let base = compute_usd_base(
            U256::from(1_000_500_000u64),
            6,
            U256::from(100_000_000u64),
            8,
        );
        assert_eq!(base, U256::from(100_050_000_000u64));
    }

    #[test]
    fn test_compute_usd_nonstandard_price_decimals() {
        // 2.0 tokens (18 dec) priced at $3 with 18-decimal price feed.
        let usd = compute_usd(
            U256::from(2_000_000_000_000_000_000u128),
            18,
            U256::from(3_000_000_000_000_000_000u128),
            18,
        );
        assert!((usd - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_delta_bps_small_index_move() {
        // 1e18 -> 1.0003e18 is 3 bps.
        let old = U256::from(1_000_000_000_000_000_000u128);
        let new = U256::from(1_000_300_000_000_000_000u128);
        let delta = delta_bps(old, new);
        assert!((2..=4).contains(&delta));
        assert_eq!(delta, 3);
    }

    #[test]
    fn test_delta_bps_signed_and_rounded() {
        let old = U256::from(10_000u64);
        assert_eq!(delta_bps(old, U256::from(11_000u64)), 1000);
        assert_eq!(delta_bps(old, U256::from(9_000u64)), -1000);
        // 10_000 -> 10_004.9 rounds to 5 bps
        assert_eq!(delta_bps(U256::from(100_000u64), U256::from(100_045u64)), 5); // 4.5 rounds up
        assert_eq!(delta_bps(old, old), 0);
        assert_eq!(delta_bps(U256::ZERO, old), i64::MAX);
    }

    #[test]
    fn test_apply_bps() {
        let value = U256::from(1000u64);
        assert_eq!(apply_bps_down(value, 100), U256::from(990u64));
        assert_eq!(apply_bps_up(value, 2000), U256::from(1200u64));
        assert_eq!(bps_of(value, 500), U256::from(50u64));
    }

    #[test]
    fn test_usd_to_base_roundtrip() {
        assert_eq!(usd_to_base(1000.50), U256::from(100_050_000_000u64));
        assert_eq!(usd_to_base(0.0), U256::ZERO);
        assert_eq!(usd_to_base(-5.0), U256::ZERO);
        assert!((base_to_f64(usd_to_base(123.45)) - 123.45).abs() < 1e-9);
    }

    #[test]
    fn test_amount_from_usd_base_inverts() {
        // $3750 of an 18-decimal token at $2500 is 1.5 tokens.
        let amount = amount_from_usd_base(
            usd_to_base(3750.0),
            18,
            U256::from(250_000_000_000u64),
            8,
        );
        assert_eq!(amount, U256::from(1_500_000_000_000_000_000u128));
    }

    #[test]
    fn test_signed_sub() {
        let a = U256::from(100u64);
        let b = U256::from(40u64);
        assert_eq!(signed_sub(a, b), I256::try_from(60u64).unwrap());
        assert_eq!(signed_sub(b, a), I256::try_from(-60i64).unwrap());
    }

    #[test]
    fn test_ray_constant() {
        assert_eq!(RAY, pow10(27));
    }

    #[test]
    fn test_pow10_lookup() {
        assert_eq!(pow10(0), U256::from(1u64));
        assert_eq!(pow10(8), U256::from(100_000_000u64));
        assert_eq!(pow10(18), U256::from(1_000_000_000_000_000_000u64));
    }
}
