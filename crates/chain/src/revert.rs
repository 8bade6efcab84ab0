//! Revert selector classification for failed liquidation transactions.
//!
//! The first four bytes of revert data identify the custom error that fired.
//! Selectors are matched against a known table covering our executor, the
//! pool and common OpenZeppelin errors; everything else is `Unknown`.

use alloy::primitives::keccak256;

/// Origin of a classified revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertCategory {
    /// Our deployed executor contract.
    Executor,
    /// The lending pool itself.
    Aave,
    /// Common library errors (OpenZeppelin pausable etc).
    Common,
    /// Selector not in the table.
    Unknown,
}

impl RevertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executor => "executor",
            Self::Aave => "aave",
            Self::Common => "common",
            Self::Unknown => "unknown",
        }
    }
}

/// Classified revert reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRevert {
    /// Error name as declared in the contract ABI.
    pub name: &'static str,
    /// Short code used in traces and metrics labels.
    pub short_code: &'static str,
    /// Where the error originated.
    pub category: RevertCategory,
    /// Whether the position should be retried soon. Almost always false;
    /// a revert means the state we simulated against is gone.
    pub retryable: bool,
}

struct SelectorEntry {
    selector: [u8; 4],
    name: &'static str,
    short_code: &'static str,
    category: RevertCategory,
}

fn selector_of(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn known_selectors() -> Vec<SelectorEntry> {
    vec![
        // Executor ABI constant: InsufficientOutput from the deployed
        // executor artifact (swap output below the repay requirement).
        SelectorEntry {
            selector: [0xb6, 0x29, 0xb0, 0xe4],
            name: "InsufficientOutput",
            short_code: "dust_too_small",
            category: RevertCategory::Executor,
        },
        SelectorEntry {
            selector: selector_of("UserNotLiquidatable()"),
            name: "UserNotLiquidatable",
            short_code: "user_not_liquidatable",
            category: RevertCategory::Executor,
        },
        SelectorEntry {
            selector: selector_of("ContractPaused()"),
            name: "ContractPaused",
            short_code: "executor_paused",
            category: RevertCategory::Executor,
        },
        SelectorEntry {
            selector: selector_of("HealthFactorNotBelowThreshold()"),
            name: "HealthFactorNotBelowThreshold",
            short_code: "hf_not_below_threshold",
            category: RevertCategory::Aave,
        },
        SelectorEntry {
            selector: selector_of("InsufficientLiquidity()"),
            name: "InsufficientLiquidity",
            short_code: "no_liquidity",
            category: RevertCategory::Aave,
        },
        SelectorEntry {
            selector: selector_of("ReservePaused()"),
            name: "ReservePaused",
            short_code: "reserve_paused",
            category: RevertCategory::Aave,
        },
        SelectorEntry {
            selector: selector_of("ReserveInactive()"),
            name: "ReserveInactive",
            short_code: "reserve_inactive",
            category: RevertCategory::Aave,
        },
        SelectorEntry {
            selector: selector_of("CollateralCannotBeLiquidated()"),
            name: "CollateralCannotBeLiquidated",
            short_code: "collateral_not_liquidatable",
            category: RevertCategory::Aave,
        },
        SelectorEntry {
            selector: selector_of("SpecifiedCurrencyNotBorrowedByUser()"),
            name: "SpecifiedCurrencyNotBorrowedByUser",
            short_code: "debt_not_borrowed",
            category: RevertCategory::Aave,
        },
        SelectorEntry {
            selector: selector_of("EnforcedPause()"),
            name: "EnforcedPause",
            short_code: "paused",
            category: RevertCategory::Common,
        },
    ]
}

/// Revert classifier with a precomputed selector table.
pub struct RevertClassifier {
    table: Vec<SelectorEntry>,
}

impl RevertClassifier {
    pub fn new() -> Self {
        Self {
            table: known_selectors(),
        }
    }

    /// Classify raw revert data. `data` is the full revert payload; only the
    /// first four bytes are inspected.
    pub fn classify(&self, data: &[u8]) -> ClassifiedRevert {
        if data.len() < 4 {
            return ClassifiedRevert {
                name: "EmptyRevert",
                short_code: "empty_revert",
                category: RevertCategory::Unknown,
                retryable: false,
            };
        }

        let selector = [data[0], data[1], data[2], data[3]];
        for entry in &self.table {
            if entry.selector == selector {
                return ClassifiedRevert {
                    name: entry.name,
                    short_code: entry.short_code,
                    category: entry.category,
                    retryable: false,
                };
            }
        }

        ClassifiedRevert {
            name: "Unknown",
            short_code: "unknown_revert",
            category: RevertCategory::Unknown,
            retryable: false,
        }
    }

    /// Classify from a hex string (with or without 0x prefix).
    pub fn classify_hex(&self, data: &str) -> ClassifiedRevert {
        let stripped = data.trim_start_matches("0x");
        match hex::decode(stripped) {
            Ok(bytes) => self.classify(&bytes),
            Err(_) => ClassifiedRevert {
                name: "Undecodable",
                short_code: "undecodable_revert",
                category: RevertCategory::Unknown,
                retryable: false,
            },
        }
    }
}

impl Default for RevertClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_insufficient_output() {
        let classifier = RevertClassifier::new();
        let revert = classifier.classify(&[0xb6, 0x29, 0xb0, 0xe4, 0x00, 0x00]);
        assert_eq!(revert.name, "InsufficientOutput");
        assert_eq!(revert.short_code, "dust_too_small");
        assert_eq!(revert.category, RevertCategory::Executor);
        assert!(!revert.retryable);
    }

    #[test]
    fn test_known_pool_error() {
        let classifier = RevertClassifier::new();
        let selector = selector_of("HealthFactorNotBelowThreshold()");
        let revert = classifier.classify(&selector);
        assert_eq!(revert.short_code, "hf_not_below_threshold");
        assert_eq!(revert.category, RevertCategory::Aave);
    }

    #[test]
    fn test_unknown_selector() {
        let classifier = RevertClassifier::new();
        let revert = classifier.classify(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(revert.category, RevertCategory::Unknown);
        assert_eq!(revert.short_code, "unknown_revert");
    }

    #[test]
    fn test_short_data() {
        let classifier = RevertClassifier::new();
        let revert = classifier.classify(&[0x01]);
        assert_eq!(revert.short_code, "empty_revert");
    }

    #[test]
    fn test_classify_hex() {
        let classifier = RevertClassifier::new();
        let revert = classifier.classify_hex("0xb629b0e4");
        assert_eq!(revert.name, "InsufficientOutput");
        let garbage = classifier.classify_hex("zz");
        assert_eq!(garbage.short_code, "undecodable_revert");
    }
}
