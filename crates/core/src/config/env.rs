//! Typed environment variable parsing.
//!
//! Booleans accept `{true,false,1,0,yes,no}` case-insensitively. Integers
//! clamp into an explicit `[min, max]` range. Enums validate against their
//! closed set and fall back to the default on unknown values. Required
//! variables that are missing or unparseable are startup-fatal with a
//! message naming the variable.

use anyhow::{anyhow, Result};
use std::str::FromStr;
use tracing::warn;

/// Parse a boolean, accepting the documented token set.
pub fn parse_bool(name: &str, default: bool) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        other => {
            warn!(var = name, value = other, "Unparseable boolean, using default");
            default
        }
    }
}

/// Parse an integer and clamp it into `[min, max]`.
pub fn parse_u64_clamped(name: &str, default: u64, min: u64, max: u64) -> u64 {
    let value = match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = %raw, "Unparseable integer, using default");
                default
            }
        },
        Err(_) => default,
    };
    value.clamp(min, max)
}

/// Parse a usize and clamp it into `[min, max]`.
pub fn parse_usize_clamped(name: &str, default: usize, min: usize, max: usize) -> usize {
    parse_u64_clamped(name, default as u64, min as u64, max as u64) as usize
}

/// Parse an f64, falling back to the default on garbage.
pub fn parse_f64(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => {
                warn!(var = name, value = %raw, "Unparseable float, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse an enum through `FromStr`; unknown values fall back to default.
pub fn parse_enum<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = %raw, "Unknown enum value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// A required string; missing values are fatal with the variable name.
pub fn require_string(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow!("missing required env var: {name}"))
}

/// Optional string, `None` when unset or empty.
pub fn optional_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

/// Comma-separated list, empty when unset.
pub fn parse_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// `KEY:VALUE` pairs separated by commas, e.g. `WETH:80,cbETH:120`.
pub fn parse_pairs_u64(name: &str) -> Vec<(String, u64)> {
    parse_list(name)
        .into_iter()
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let parsed = value.trim().parse::<u64>().ok()?;
            Some((key.trim().to_string(), parsed))
        })
        .collect()
}
