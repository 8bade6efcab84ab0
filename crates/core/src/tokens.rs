//! Token metadata registry.
//!
//! Symbol, decimals and stablecoin classification per reserve token, plus
//! the canonical USD conversion used everywhere amounts meet prices.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::wad_math;

/// Default liquidation bonus when a token has no override (5%).
const DEFAULT_BONUS_BPS: u16 = 500;

/// Normalize an address string to lowercase 0x-prefixed hex.
///
/// Addresses compare by value everywhere in the bot; this is only for
/// serialization boundaries (env vars, dumps, KV keys). Idempotent.
pub fn normalize_address(input: &str) -> Option<String> {
    let parsed: Address = input.trim().parse().ok()?;
    Some(format!("0x{parsed:x}"))
}

/// Static metadata for one reserve token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
    /// USD-pegged tokens get longer cache TTLs and looser recheck gating.
    pub stablecoin: bool,
    /// Liquidation bonus in basis points.
    pub liquidation_bonus_bps: u16,
}

/// Registry of known reserve tokens, indexed both ways.
pub struct TokenRegistry {
    by_address: HashMap<Address, TokenInfo>,
    by_symbol: HashMap<String, Address>,
}

impl TokenRegistry {
    pub fn new(tokens: Vec<TokenInfo>) -> Self {
        let mut by_address = HashMap::new();
        let mut by_symbol = HashMap::new();
        for token in tokens {
            by_symbol.insert(token.symbol.clone(), token.address);
            by_address.insert(token.address, token);
        }
        Self {
            by_address,
            by_symbol,
        }
    }

    pub fn get(&self, address: &Address) -> Option<&TokenInfo> {
        self.by_address.get(address)
    }

    pub fn get_by_symbol(&self, symbol: &str) -> Option<&TokenInfo> {
        self.by_symbol
            .get(symbol)
            .and_then(|addr| self.by_address.get(addr))
    }

    pub fn symbol(&self, address: &Address) -> Option<&str> {
        self.get(address).map(|t| t.symbol.as_str())
    }

    /// Decimals for a token, defaulting to 18 for unknown tokens.
    pub fn decimals(&self, address: &Address) -> u8 {
        self.get(address).map(|t| t.decimals).unwrap_or(18)
    }

    pub fn is_stablecoin(&self, address: &Address) -> bool {
        self.get(address).map(|t| t.stablecoin).unwrap_or(false)
    }

    pub fn liquidation_bonus_bps(&self, address: &Address) -> u16 {
        self.get(address)
            .map(|t| t.liquidation_bonus_bps)
            .unwrap_or(DEFAULT_BONUS_BPS)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.by_address.keys().copied().collect()
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.by_address.values().map(|t| t.symbol.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// USD value of a raw token amount in base units (8 decimals), using
    /// this token's decimals. Integer-exact; used by gating.
    pub fn usd_base(&self, address: &Address, amount: U256, price: U256, price_decimals: u8) -> U256 {
        wad_math::compute_usd_base(amount, self.decimals(address), price, price_decimals)
    }

    /// USD value as f64 for display.
    pub fn usd_value(&self, address: &Address, amount: U256, price: U256, price_decimals: u8) -> f64 {
        wad_math::compute_usd(amount, self.decimals(address), price, price_decimals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TokenRegistry {
        TokenRegistry::new(vec![
            TokenInfo {
                symbol: "USDC".to_string(),
                address: Address::repeat_byte(1),
                decimals: 6,
                stablecoin: true,
                liquidation_bonus_bps: 450,
            },
            TokenInfo {
                symbol: "WETH".to_string(),
                address: Address::repeat_byte(2),
                decimals: 18,
                stablecoin: false,
                liquidation_bonus_bps: 500,
            },
        ])
    }

    #[test]
    fn test_lookup_both_ways() {
        let registry = registry();
        assert_eq!(registry.symbol(&Address::repeat_byte(1)), Some("USDC"));
        assert_eq!(
            registry.get_by_symbol("WETH").unwrap().address,
            Address::repeat_byte(2)
        );
        assert!(registry.get(&Address::repeat_byte(9)).is_none());
    }

    #[test]
    fn test_stablecoin_classification() {
        let registry = registry();
        assert!(registry.is_stablecoin(&Address::repeat_byte(1)));
        assert!(!registry.is_stablecoin(&Address::repeat_byte(2)));
        // Unknown tokens are not stablecoins.
        assert!(!registry.is_stablecoin(&Address::repeat_byte(9)));
    }

    #[test]
    fn test_usd_math_through_registry() {
        let registry = registry();
        let usdc = Address::repeat_byte(1);

        // 1000.50 USDC at $1.00
        let usd = registry.usd_value(
            &usdc,
            U256::from(1_000_500_000u64),
            U256::from(100_000_000u64),
            8,
        );
        assert!((usd - 1000.50).abs() < 1e-9);

        let base = registry.usd_base(
            &usdc,
            U256::from(1_000_500_000u64),
            U256::from(100_000_000u64),
            8,
        );
        assert_eq!(base, U256::from(100_050_000_000u64));
    }

    #[test]
    fn test_normalize_address_idempotent() {
        let mixed = "0x4200000000000000000000000000000000000006";
        let upper = "0x4200000000000000000000000000000000000006".to_uppercase();
        let upper = upper.replace("0X", "0x");

        let once = normalize_address(&upper).unwrap();
        let twice = normalize_address(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, mixed);
        assert!(normalize_address("not an address").is_none());
    }

    #[test]
    fn test_defaults_for_unknown_token() {
        let registry = registry();
        let unknown = Address::repeat_byte(9);
        assert_eq!(registry.decimals(&unknown), 18);
        assert_eq!(registry.liquidation_bonus_bps(&unknown), DEFAULT_BONUS_BPS);
    }
}
