//! Diagnostic JSON dumps and their verification.
//!
//! Hot-set snapshots are written atomically (temp file then rename) so a
//! crash never leaves a torn dump. `verify` re-derives each entry's health
//! factor from its stored reserves and checks it against the recorded
//! value within a tolerance.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::hot_set::{HotSetEntry, TriggerKind};
use crate::risk_gate::SkipReason;

/// Current dump schema version.
pub const DUMP_SCHEMA_VERSION: u32 = 2;

/// One collateral reserve line inside a dump entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpCollateral {
    pub value_usd: f64,
    pub liquidation_threshold_bps: u16,
}

/// One debt reserve line inside a dump entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpDebt {
    pub value_usd: f64,
}

/// Per-reserve breakdown enabling HF re-derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpReserves {
    pub collaterals: Vec<DumpCollateral>,
    pub debts: Vec<DumpDebt>,
}

/// One dumped watch-set entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpEntry {
    pub address: Address,
    pub last_hf: f64,
    pub block: u64,
    pub trigger_kind: TriggerKind,
    pub total_collateral_usd: f64,
    pub total_debt_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserves: Option<DumpReserves>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_skip_reason: Option<SkipReason>,
}

/// Hot-set snapshot dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotSetDump {
    pub schema_version: u32,
    pub timestamp: String,
    pub mode: String,
    pub count: usize,
    pub threshold: f64,
    pub entries: Vec<DumpEntry>,
}

impl HotSetDump {
    /// Snapshot the given entries under a mode label.
    pub fn from_entries(
        mode: &str,
        threshold: f64,
        entries: Vec<(HotSetEntry, Option<DumpReserves>, Option<SkipReason>)>,
    ) -> Self {
        let entries: Vec<DumpEntry> = entries
            .into_iter()
            .map(|(entry, reserves, last_skip_reason)| DumpEntry {
                address: entry.address,
                last_hf: entry.hf,
                block: entry.last_block,
                trigger_kind: entry.trigger_kind,
                total_collateral_usd: entry.total_collateral_usd,
                total_debt_usd: entry.total_debt_usd,
                reserves,
                last_skip_reason,
            })
            .collect();
        Self {
            schema_version: DUMP_SCHEMA_VERSION,
            timestamp: Utc::now().to_rfc3339(),
            mode: mode.to_string(),
            count: entries.len(),
            threshold,
            entries,
        }
    }

    /// Atomic write: serialize to `<path>.tmp`, then rename over `path`.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self).context("serialize dump")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, payload).with_context(|| format!("write {tmp:?}"))?;
        std::fs::rename(&tmp, path).with_context(|| format!("rename to {path:?}"))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let payload = std::fs::read(path).with_context(|| format!("read {path:?}"))?;
        serde_json::from_slice(&payload).context("parse dump")
    }
}

/// Re-derivation verdict for one entry.
#[derive(Debug, Clone)]
pub struct VerifyFailure {
    pub address: Address,
    pub recorded_hf: f64,
    pub derived_hf: f64,
    pub deviation_pct: f64,
}

/// Outcome of a dump verification.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub passed: usize,
    /// Entries with no stored reserves cannot be re-derived.
    pub skipped: usize,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Re-derive HF from stored reserves for every entry and compare against
/// the recorded value within `tolerance_pct`.
pub fn verify_dump(dump: &HotSetDump, tolerance_pct: f64) -> VerifyReport {
    let mut report = VerifyReport::default();

    for entry in &dump.entries {
        let Some(reserves) = &entry.reserves else {
            report.skipped += 1;
            continue;
        };
        report.checked += 1;

        let weighted: f64 = reserves
            .collaterals
            .iter()
            .map(|c| c.value_usd * c.liquidation_threshold_bps as f64 / 10_000.0)
            .sum();
        let total_debt: f64 = reserves.debts.iter().map(|d| d.value_usd).sum();
        let derived_hf = if total_debt <= 0.0 {
            f64::INFINITY
        } else {
            weighted / total_debt
        };

        let deviation_pct = if entry.last_hf.is_finite() && entry.last_hf != 0.0 {
            ((derived_hf - entry.last_hf) / entry.last_hf).abs() * 100.0
        } else if derived_hf.is_infinite() && entry.last_hf.is_infinite() {
            0.0
        } else {
            f64::INFINITY
        };

        if deviation_pct <= tolerance_pct {
            report.passed += 1;
        } else {
            report.failures.push(VerifyFailure {
                address: entry.address,
                recorded_hf: entry.last_hf,
                derived_hf,
                deviation_pct,
            });
        }
    }
    report
}

/// Serializable process status snapshot for the external status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub subscription_healthy: bool,
    pub ws_silence_ms: u64,
    pub hot_count: usize,
    pub warm_count: usize,
    pub candidate_count: usize,
    pub min_hf: Option<f64>,
    pub last_block: u64,
    pub head_lag_blocks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8, hf: f64, reserves: Option<DumpReserves>) -> DumpEntry {
        DumpEntry {
            address: Address::repeat_byte(byte),
            last_hf: hf,
            block: 1000,
            trigger_kind: TriggerKind::Head,
            total_collateral_usd: 1_000.0,
            total_debt_usd: 500.0,
            reserves,
            last_skip_reason: None,
        }
    }

    fn reserves(collateral_usd: f64, lt_bps: u16, debt_usd: f64) -> DumpReserves {
        DumpReserves {
            collaterals: vec![DumpCollateral {
                value_usd: collateral_usd,
                liquidation_threshold_bps: lt_bps,
            }],
            debts: vec![DumpDebt { value_usd: debt_usd }],
        }
    }

    #[test]
    fn test_verify_rederives_within_tolerance() {
        // HF = 1000 * 0.8 / 500 = 1.6
        let dump = HotSetDump {
            schema_version: DUMP_SCHEMA_VERSION,
            timestamp: Utc::now().to_rfc3339(),
            mode: "hot".to_string(),
            count: 1,
            threshold: 1.02,
            entries: vec![entry(1, 1.6, Some(reserves(1_000.0, 8000, 500.0)))],
        };

        let report = verify_dump(&dump, 5.0);
        assert_eq!(report.checked, 1);
        assert_eq!(report.passed, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn test_verify_flags_deviation() {
        // Recorded 1.0 vs derived 1.6: far outside 5%.
        let dump = HotSetDump {
            schema_version: DUMP_SCHEMA_VERSION,
            timestamp: Utc::now().to_rfc3339(),
            mode: "hot".to_string(),
            count: 1,
            threshold: 1.02,
            entries: vec![entry(1, 1.0, Some(reserves(1_000.0, 8000, 500.0)))],
        };

        let report = verify_dump(&dump, 5.0);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert!((failure.derived_hf - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_entries_without_reserves_skipped() {
        let dump = HotSetDump {
            schema_version: DUMP_SCHEMA_VERSION,
            timestamp: Utc::now().to_rfc3339(),
            mode: "hot".to_string(),
            count: 1,
            threshold: 1.02,
            entries: vec![entry(1, 1.2, None)],
        };
        let report = verify_dump(&dump, 5.0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.checked, 0);
    }

    #[test]
    fn test_atomic_write_roundtrip() {
        let dir = std::env::temp_dir().join("sentinel-dump-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hotset.json");

        let dump = HotSetDump {
            schema_version: DUMP_SCHEMA_VERSION,
            timestamp: Utc::now().to_rfc3339(),
            mode: "hot".to_string(),
            count: 1,
            threshold: 1.02,
            entries: vec![entry(1, 1.6, Some(reserves(1_000.0, 8000, 500.0)))],
        };

        dump.write_atomic(&path).unwrap();
        let loaded = HotSetDump::load(&path).unwrap();
        assert_eq!(loaded.schema_version, DUMP_SCHEMA_VERSION);
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].address, Address::repeat_byte(1));

        // No temp file left behind.
        assert!(!path.with_extension("tmp").exists());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_zero_debt_derives_infinite() {
        let dump = HotSetDump {
            schema_version: DUMP_SCHEMA_VERSION,
            timestamp: Utc::now().to_rfc3339(),
            mode: "hot".to_string(),
            count: 1,
            threshold: 1.02,
            entries: vec![entry(
                1,
                f64::INFINITY,
                Some(DumpReserves {
                    collaterals: vec![DumpCollateral {
                        value_usd: 100.0,
                        liquidation_threshold_bps: 8000,
                    }],
                    debts: vec![],
                }),
            )],
        };
        let report = verify_dump(&dump, 5.0);
        assert_eq!(report.passed, 1);
    }
}
