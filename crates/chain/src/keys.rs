//! Multi-key signing and per-key nonce management.
//!
//! Several signing keys spread submissions across sender accounts so
//! same-nonce races against ourselves cannot happen. Key material is loaded
//! once at startup and never logged; only derived addresses appear in logs.

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{keccak256, Address};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::provider::EndpointManager;

/// Key selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySelection {
    /// Atomic increment modulo key count.
    RoundRobin,
    /// keccak256 of the lowercase user address, stable across processes.
    Deterministic,
}

#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out; `None` until first chain sync.
    next: Option<u64>,
    /// Reserved but not yet completed nonces.
    in_flight: usize,
}

struct SigningKey {
    address: Address,
    wallet: EthereumWallet,
    nonce: Mutex<NonceState>,
}

/// Pool of signing keys with per-key nonce tracking.
pub struct MultiKeyManager {
    keys: Vec<SigningKey>,
    strategy: KeySelection,
    cursor: AtomicUsize,
}

impl MultiKeyManager {
    /// Parse private keys (with or without 0x prefix). Key bytes are moved
    /// into wallets and never retained as strings.
    pub fn from_private_keys(private_keys: &[String], strategy: KeySelection) -> Result<Self> {
        anyhow::ensure!(!private_keys.is_empty(), "at least one signing key required");

        let mut keys = Vec::with_capacity(private_keys.len());
        for raw in private_keys {
            let signer: PrivateKeySigner = raw
                .trim_start_matches("0x")
                .parse()
                .context("invalid signing key")?;
            let address = signer.address();
            keys.push(SigningKey {
                address,
                wallet: EthereumWallet::from(signer),
                nonce: Mutex::new(NonceState::default()),
            });
        }

        info!(
            count = keys.len(),
            strategy = ?strategy,
            addresses = ?keys.iter().map(|k| k.address).collect::<Vec<_>>(),
            "Key manager initialized"
        );

        Ok(Self {
            keys,
            strategy,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sender address of a key.
    pub fn address(&self, index: usize) -> Address {
        self.keys[index].address
    }

    /// All sender addresses (used by the miss classifier to recognise our
    /// own liquidations).
    pub fn addresses(&self) -> Vec<Address> {
        self.keys.iter().map(|k| k.address).collect()
    }

    /// Pick a key index for a user per the configured strategy.
    pub fn select_key(&self, user: Address) -> usize {
        match self.strategy {
            KeySelection::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len()
            }
            KeySelection::Deterministic => {
                // Hash of the 0x-prefixed lowercase hex string, so the
                // mapping agrees across processes and languages.
                let text = format!("0x{}", hex::encode(user.as_slice()));
                let hash = keccak256(text.as_bytes());
                let mut word = [0u8; 8];
                word.copy_from_slice(&hash[0..8]);
                (u64::from_be_bytes(word) % self.keys.len() as u64) as usize
            }
        }
    }

    /// Reserve the next nonce for a key. Syncs from chain on first use.
    pub async fn acquire_nonce(
        &self,
        index: usize,
        endpoints: &Arc<EndpointManager>,
    ) -> Result<u64> {
        let key = &self.keys[index];
        let mut state = key.nonce.lock().await;

        if state.next.is_none() {
            let provider = ProviderBuilder::new().on_http(endpoints.http_url().parse()?);
            let chain_nonce = provider.get_transaction_count(key.address).await?;
            debug!(key = %key.address, nonce = chain_nonce, "Nonce synced from chain");
            state.next = Some(chain_nonce);
        }

        let nonce = state.next.unwrap_or(0);
        state.next = Some(nonce + 1);
        state.in_flight += 1;
        Ok(nonce)
    }

    /// Mark a reserved nonce as settled (mined, replaced, or abandoned).
    pub async fn complete(&self, index: usize) {
        let mut state = self.keys[index].nonce.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Reserved-but-unsettled count for a key.
    pub async fn in_flight(&self, index: usize) -> usize {
        self.keys[index].nonce.lock().await.in_flight
    }

    /// Force a chain resync of a key's nonce.
    pub async fn resync(&self, index: usize, endpoints: &Arc<EndpointManager>) -> Result<u64> {
        let key = &self.keys[index];
        let provider = ProviderBuilder::new().on_http(endpoints.http_url().parse()?);
        let chain_nonce = provider.get_transaction_count(key.address).await?;

        let mut state = key.nonce.lock().await;
        state.next = Some(chain_nonce);
        debug!(key = %key.address, nonce = chain_nonce, "Nonce resynced");
        Ok(chain_nonce)
    }

    /// Seed a key's nonce without touching the chain (tests, replay).
    pub async fn seed_nonce(&self, index: usize, nonce: u64) {
        let mut state = self.keys[index].nonce.lock().await;
        state.next = Some(nonce);
    }

    /// Inspect a broadcast error and resync when the chain disagrees about
    /// our nonce.
    pub async fn handle_broadcast_error(
        &self,
        index: usize,
        error_text: &str,
        endpoints: &Arc<EndpointManager>,
    ) {
        let lowered = error_text.to_lowercase();
        if lowered.contains("already known") || lowered.contains("nonce too low") {
            warn!(key = %self.keys[index].address, error = %error_text, "Nonce mismatch, resyncing");
            if let Err(e) = self.resync(index, endpoints).await {
                warn!(error = %e, "Nonce resync failed");
            }
        }
    }

    /// Sign a fully-populated transaction request, returning raw 2718 bytes
    /// ready for `eth_sendRawTransaction`.
    pub async fn sign(&self, index: usize, tx: TransactionRequest) -> Result<Vec<u8>> {
        let envelope = tx
            .build(&self.keys[index].wallet)
            .await
            .context("transaction signing failed")?;
        Ok(envelope.encoded_2718())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::network::TransactionBuilder;
    use alloy::primitives::U256;

    // Well-known anvil development keys.
    const KEY_A: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_B: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn manager(strategy: KeySelection) -> MultiKeyManager {
        MultiKeyManager::from_private_keys(
            &[KEY_A.to_string(), KEY_B.to_string()],
            strategy,
        )
        .unwrap()
    }

    #[test]
    fn test_round_robin_cycles() {
        let keys = manager(KeySelection::RoundRobin);
        let user = Address::repeat_byte(1);
        let a = keys.select_key(user);
        let b = keys.select_key(user);
        let c = keys.select_key(user);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_deterministic_is_stable() {
        let keys = manager(KeySelection::Deterministic);
        let user = Address::repeat_byte(0xAB);
        let first = keys.select_key(user);
        for _ in 0..10 {
            assert_eq!(keys.select_key(user), first);
        }
        assert!(first < keys.len());
    }

    #[tokio::test]
    async fn test_nonce_reservation() {
        let keys = manager(KeySelection::RoundRobin);
        keys.seed_nonce(0, 42).await;

        let endpoints = Arc::new(EndpointManager::for_tests());
        let first = keys.acquire_nonce(0, &endpoints).await.unwrap();
        let second = keys.acquire_nonce(0, &endpoints).await.unwrap();
        assert_eq!(first, 42);
        assert_eq!(second, 43);
        assert_eq!(keys.in_flight(0).await, 2);

        keys.complete(0).await;
        assert_eq!(keys.in_flight(0).await, 1);
    }

    #[tokio::test]
    async fn test_signing_produces_raw_bytes() {
        let keys = manager(KeySelection::RoundRobin);
        let tx = TransactionRequest::default()
            .with_to(Address::repeat_byte(9))
            .with_value(U256::from(1u64))
            .with_nonce(0)
            .with_gas_limit(21_000)
            .with_max_fee_per_gas(1_000_000_000)
            .with_max_priority_fee_per_gas(100_000_000)
            .with_chain_id(8453);

        let raw = keys.sign(0, tx).await.unwrap();
        assert!(!raw.is_empty());
    }

    #[test]
    fn test_keys_expose_addresses_not_material() {
        let keys = manager(KeySelection::RoundRobin);
        assert_eq!(
            format!("{:?}", keys.address(0)).to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        assert_eq!(keys.addresses().len(), 2);
    }
}
