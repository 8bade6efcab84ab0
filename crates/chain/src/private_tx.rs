//! Private relay submission with public fallback.
//!
//! In `Protect` mode the signed transaction goes to the private RPC so it
//! never touches the public mempool; `Bundle` wraps it in a single-tx
//! bundle. When the relay fails or times out, the configured fallback path
//! (public write race or direct broadcast) takes over and the outcome is
//! flagged `fallback_used`.

use alloy::primitives::B256;
use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::provider::EndpointManager;
use crate::write_racer::{raw_tx_hash, WriteRacer};

/// Relay mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivateMode {
    #[default]
    Disabled,
    /// eth_sendRawTransaction against the private RPC.
    Protect,
    /// Single-transaction eth_sendBundle.
    Bundle,
}

/// What to do when the relay fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    #[default]
    Race,
    Direct,
}

/// Which path actually carried the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitPath {
    Private,
    PublicRace,
    PublicDirect,
}

impl SubmitPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::PublicRace => "public_race",
            Self::PublicDirect => "public_direct",
        }
    }
}

/// Submission outcome.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub tx_hash: B256,
    pub path: SubmitPath,
    pub fallback_used: bool,
}

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct PrivateTxConfig {
    pub mode: PrivateMode,
    pub fallback: FallbackMode,
    /// Hard deadline for the private submit.
    pub submit_timeout: Duration,
}

impl Default for PrivateTxConfig {
    fn default() -> Self {
        Self {
            mode: PrivateMode::Disabled,
            fallback: FallbackMode::Race,
            submit_timeout: Duration::from_millis(800),
        }
    }
}

/// Private relay sender with public fallback.
pub struct PrivateTxSender {
    client: reqwest::Client,
    endpoints: Arc<EndpointManager>,
    racer: Arc<WriteRacer>,
    config: PrivateTxConfig,
}

impl PrivateTxSender {
    pub fn new(
        endpoints: Arc<EndpointManager>,
        racer: Arc<WriteRacer>,
        config: PrivateTxConfig,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
            racer,
            config,
        }
    }

    pub fn mode(&self) -> PrivateMode {
        self.config.mode
    }

    /// Submit a signed transaction, observing the configured mode.
    pub async fn submit(&self, raw: &[u8]) -> Result<SubmitOutcome> {
        if self.config.mode == PrivateMode::Disabled || self.endpoints.private_url().is_none() {
            return self.public_path(raw, false).await;
        }

        match tokio::time::timeout(self.config.submit_timeout, self.private_submit(raw)).await {
            Ok(Ok(tx_hash)) => {
                metrics::increment_counter!("private_submits_total", "outcome" => "accepted");
                info!(tx_hash = %tx_hash, "Private relay accepted transaction");
                Ok(SubmitOutcome {
                    tx_hash,
                    path: SubmitPath::Private,
                    fallback_used: false,
                })
            }
            Ok(Err(e)) => {
                metrics::increment_counter!("private_submits_total", "outcome" => "rejected");
                warn!(error = %e, "Private relay rejected transaction, falling back");
                self.public_path(raw, true).await
            }
            Err(_) => {
                metrics::increment_counter!("private_submits_total", "outcome" => "timeout");
                warn!(
                    timeout_ms = self.config.submit_timeout.as_millis() as u64,
                    "Private relay timed out, falling back"
                );
                self.public_path(raw, true).await
            }
        }
    }

    async fn private_submit(&self, raw: &[u8]) -> Result<B256> {
        let url = self
            .endpoints
            .private_url()
            .ok_or_else(|| anyhow!("private relay not configured"))?;

        let payload = match self.config.mode {
            PrivateMode::Protect => json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_sendRawTransaction",
                "params": [format!("0x{}", hex::encode(raw))],
            }),
            PrivateMode::Bundle => json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_sendBundle",
                "params": [{
                    "txs": [format!("0x{}", hex::encode(raw))],
                    "blockNumber": format!("0x{:x}", self.endpoints.last_head() + 1),
                }],
            }),
            PrivateMode::Disabled => return Err(anyhow!("private mode disabled")),
        };

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("private relay request")?
            .json::<serde_json::Value>()
            .await
            .context("private relay response")?;

        if let Some(error) = response.get("error") {
            return Err(anyhow!("relay error: {error}"));
        }

        // Protect returns the tx hash; bundle APIs return a bundle id, so
        // the tx hash is derived from the raw envelope either way.
        match self.config.mode {
            PrivateMode::Protect => response
                .get("result")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| anyhow!("relay returned no hash")),
            _ => Ok(raw_tx_hash(raw)),
        }
    }

    async fn public_path(&self, raw: &[u8], fallback_used: bool) -> Result<SubmitOutcome> {
        if fallback_used {
            metrics::increment_counter!("private_fallbacks_total");
        }
        match self.config.fallback {
            FallbackMode::Race if self.racer.endpoint_count() > 0 => {
                let win = self.racer.race(raw).await?;
                Ok(SubmitOutcome {
                    tx_hash: win.tx_hash,
                    path: SubmitPath::PublicRace,
                    fallback_used,
                })
            }
            _ => {
                let tx_hash = self.endpoints.send_raw_transaction(raw).await?;
                Ok(SubmitOutcome {
                    tx_hash,
                    path: SubmitPath::PublicDirect,
                    fallback_used,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_disabled() {
        let config = PrivateTxConfig::default();
        assert_eq!(config.mode, PrivateMode::Disabled);
        assert_eq!(config.fallback, FallbackMode::Race);
    }

    #[test]
    fn test_submit_path_labels() {
        assert_eq!(SubmitPath::Private.as_str(), "private");
        assert_eq!(SubmitPath::PublicRace.as_str(), "public_race");
        assert_eq!(SubmitPath::PublicDirect.as_str(), "public_direct");
    }
}
