//! RPC endpoint management for HTTP, WebSocket and send paths.
//! Uses Alloy providers for type-safe RPC interactions.

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionReceipt;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Endpoint manager for the bot's RPC connections.
///
/// Holds the URL set (read, send, websocket, optional private relay) and the
/// pool/data-provider addresses every chain component needs. Providers are
/// built per call from the stored URLs, which keeps the struct `Clone` and
/// avoids holding sockets across reconnects.
pub struct EndpointManager {
    /// HTTP URL for reads (eth_call, eth_getLogs, receipts)
    http_url: String,
    /// HTTP URL for transaction submission
    send_url: String,
    /// Additional public submission endpoints for write racing
    race_urls: Vec<String>,
    /// Optional private relay URL
    private_url: Option<String>,
    /// WebSocket URL for subscriptions
    ws_url: String,
    /// Pool contract address
    pool_address: Address,
    /// Protocol data provider address
    data_provider_address: Address,
    /// Last observed head block (updated by the head follower)
    last_head: AtomicU64,
    /// Unix millis of the last successful roundtrip
    last_roundtrip_ms: AtomicU64,
}

impl EndpointManager {
    /// Create a new endpoint manager and verify the read endpoint.
    pub async fn new(
        http_url: &str,
        send_url: &str,
        race_urls: Vec<String>,
        private_url: Option<String>,
        ws_url: &str,
        pool_address: Address,
        data_provider_address: Address,
    ) -> Result<Self> {
        info!(
            http = http_url,
            send = send_url,
            race_endpoints = race_urls.len(),
            private = private_url.is_some(),
            ws = ws_url,
            "Initializing endpoint manager"
        );

        let provider = ProviderBuilder::new().on_http(http_url.parse()?);
        let block = provider.get_block_number().await?;
        info!(block = block, "Read endpoint verified");

        let manager = Self {
            http_url: http_url.to_string(),
            send_url: send_url.to_string(),
            race_urls,
            private_url,
            ws_url: ws_url.to_string(),
            pool_address,
            data_provider_address,
            last_head: AtomicU64::new(block),
            last_roundtrip_ms: AtomicU64::new(now_ms()),
        };
        Ok(manager)
    }

    pub fn http_url(&self) -> &str {
        &self.http_url
    }

    pub fn send_url(&self) -> &str {
        &self.send_url
    }

    pub fn race_urls(&self) -> &[String] {
        &self.race_urls
    }

    pub fn private_url(&self) -> Option<&str> {
        self.private_url.as_deref()
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn pool_address(&self) -> Address {
        self.pool_address
    }

    pub fn data_provider_address(&self) -> Address {
        self.data_provider_address
    }

    /// Record a head block observed on the subscription.
    pub fn record_head(&self, block: u64) {
        let prev = self.last_head.load(Ordering::Relaxed);
        if block > prev {
            self.last_head.store(block, Ordering::Relaxed);
        }
        self.last_roundtrip_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Last head block seen on any path.
    pub fn last_head(&self) -> u64 {
        self.last_head.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last successful message or roundtrip.
    pub fn silence_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_roundtrip_ms.load(Ordering::Relaxed))
    }

    /// Current block number via the read endpoint.
    pub async fn block_number(&self) -> Result<u64> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        let started = Instant::now();
        let block = provider.get_block_number().await?;
        debug!(
            block = block,
            rtt_ms = started.elapsed().as_millis() as u64,
            "blockNumber roundtrip"
        );
        self.last_roundtrip_ms.store(now_ms(), Ordering::Relaxed);
        self.record_head(block);
        Ok(block)
    }

    /// Chain ID via the read endpoint.
    pub async fn chain_id(&self) -> Result<u64> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        Ok(provider.get_chain_id().await?)
    }

    /// Fetch a transaction receipt, `None` while pending.
    pub async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TransactionReceipt>> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        Ok(provider.get_transaction_receipt(tx_hash).await?)
    }

    /// Broadcast a raw signed transaction on the send endpoint.
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256> {
        let provider = ProviderBuilder::new().on_http(self.send_url.parse()?);
        let pending = provider.send_raw_transaction(raw).await?;
        Ok(*pending.tx_hash())
    }

    /// Health check: the endpoint answers and the head is advancing.
    ///
    /// `max_silence_ms` bounds the time since the last message before the
    /// endpoint is considered unhealthy even if the roundtrip succeeds.
    pub async fn health_check(&self, max_silence_ms: u64) -> bool {
        match self.block_number().await {
            Ok(block) => {
                let silent = self.silence_ms() > max_silence_ms;
                if silent {
                    warn!(block = block, silence_ms = self.silence_ms(), "Endpoint silent too long");
                }
                block > 0 && !silent
            }
            Err(e) => {
                warn!(error = %e, "Health check roundtrip failed");
                false
            }
        }
    }
}

impl EndpointManager {
    /// Bare manager for unit tests that never dial the network.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            http_url: "http://localhost:8545".to_string(),
            send_url: "http://localhost:8545".to_string(),
            race_urls: vec![],
            private_url: None,
            ws_url: "ws://localhost:8546".to_string(),
            pool_address: Address::ZERO,
            data_provider_address: Address::ZERO,
            last_head: AtomicU64::new(0),
            last_roundtrip_ms: AtomicU64::new(0),
        }
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_endpoint_manager_creation() {
        let manager = EndpointManager::new(
            "https://mainnet.base.org",
            "https://mainnet.base.org",
            vec![],
            None,
            "wss://mainnet.base.org",
            Address::ZERO,
            Address::ZERO,
        )
        .await;

        assert!(manager.is_ok());
    }

    #[test]
    fn test_head_tracking_is_monotonic() {
        let manager = EndpointManager {
            http_url: String::new(),
            send_url: String::new(),
            race_urls: vec![],
            private_url: None,
            ws_url: String::new(),
            pool_address: Address::ZERO,
            data_provider_address: Address::ZERO,
            last_head: AtomicU64::new(100),
            last_roundtrip_ms: AtomicU64::new(0),
        };

        manager.record_head(105);
        assert_eq!(manager.last_head(), 105);

        // A reorged lower head does not move the counter backwards.
        manager.record_head(103);
        assert_eq!(manager.last_head(), 105);
    }
}
