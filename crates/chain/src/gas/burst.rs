//! Timed replace-by-fee ladder for submitted transactions.
//!
//! Every submitted attempt is tracked; if it is still unmined at the first
//! and second checkpoints the fees are bumped, the transaction re-signed
//! with the same key and nonce, and rebroadcast. The ladder stops on
//! confirmation, after `max_bumps` attempts, or when the attempt is
//! untracked by its owner (cancellation).

use alloy::primitives::{Address, B256};
use alloy::rpc::types::TransactionRequest;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::GasParams;
use crate::keys::MultiKeyManager;
use crate::provider::EndpointManager;

/// Burst manager configuration.
#[derive(Debug, Clone)]
pub struct GasBurstConfig {
    /// Delay before the first bump checkpoint.
    pub first_delay: Duration,
    /// Delay before the second and later checkpoints.
    pub second_delay: Duration,
    /// Fee bump per stage in percent.
    pub bump_pct: u32,
    /// Maximum bump attempts.
    pub max_bumps: u32,
}

impl Default for GasBurstConfig {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_millis(1_500),
            second_delay: Duration::from_millis(3_000),
            bump_pct: 15,
            max_bumps: 2,
        }
    }
}

impl GasBurstConfig {
    /// Checkpoint delay for a 1-based stage.
    pub fn delay_for_stage(&self, stage: u32) -> Duration {
        if stage <= 1 {
            self.first_delay
        } else {
            self.second_delay
        }
    }
}

/// A submitted transaction handed to the ladder.
#[derive(Debug, Clone)]
pub struct TrackedAttemptTx {
    pub user: Address,
    pub tx_hash: B256,
    pub nonce: u64,
    pub key_index: usize,
    /// Fully populated request (to, input, nonce, gas limit, chain id);
    /// fee fields are overwritten per bump.
    pub base_tx: TransactionRequest,
    pub gas: GasParams,
}

/// RBF ladder manager.
pub struct GasBurstManager {
    endpoints: Arc<EndpointManager>,
    keys: Arc<MultiKeyManager>,
    config: GasBurstConfig,
    /// Currently tracked tx hashes. Removal cancels further bumps.
    tracked: DashMap<B256, Address>,
}

impl GasBurstManager {
    pub fn new(
        endpoints: Arc<EndpointManager>,
        keys: Arc<MultiKeyManager>,
        config: GasBurstConfig,
    ) -> Self {
        Self {
            endpoints,
            keys,
            config,
            tracked: DashMap::new(),
        }
    }

    /// Whether a hash is still on the ladder.
    pub fn is_tracked(&self, tx_hash: &B256) -> bool {
        self.tracked.contains_key(tx_hash)
    }

    /// Remove a hash from the ladder; pending checkpoints become no-ops.
    pub fn untrack(&self, tx_hash: &B256) {
        self.tracked.remove(tx_hash);
    }

    /// Begin monitoring a submitted transaction.
    ///
    /// Returns the ladder task handle; aborting it also stops the ladder,
    /// but the cooperative path is `untrack`.
    pub fn track_transaction(self: Arc<Self>, attempt: TrackedAttemptTx) -> JoinHandle<()> {
        self.tracked.insert(attempt.tx_hash, attempt.user);
        tokio::spawn(async move {
            self.run_ladder(attempt).await;
        })
    }

    async fn run_ladder(&self, attempt: TrackedAttemptTx) {
        let mut current_hash = attempt.tx_hash;
        let mut gas = attempt.gas.clone();

        for stage in 1..=self.config.max_bumps {
            tokio::time::sleep(self.config.delay_for_stage(stage)).await;

            if !self.tracked.contains_key(&current_hash) {
                skip("not_tracked");
                return;
            }

            match self.endpoints.transaction_receipt(current_hash).await {
                Ok(Some(receipt)) => {
                    skip("already_mined");
                    debug!(
                        tx_hash = %current_hash,
                        block = receipt.block_number.unwrap_or(0),
                        "Transaction mined before bump"
                    );
                    self.tracked.remove(&current_hash);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(tx_hash = %current_hash, error = %e, "Receipt check failed, retrying next stage");
                    continue;
                }
            }

            gas = gas.bumped(self.config.bump_pct);
            let mut tx = attempt.base_tx.clone();
            gas.apply(&mut tx);

            let raw = match self.keys.sign(attempt.key_index, tx).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(user = %attempt.user, error = %e, "Bump re-sign failed");
                    skip("broadcast_failed");
                    self.tracked.remove(&current_hash);
                    return;
                }
            };

            match self.endpoints.send_raw_transaction(&raw).await {
                Ok(new_hash) => {
                    metrics::increment_counter!(
                        "gas_bumps_total",
                        "stage" => stage.to_string()
                    );
                    info!(
                        user = %attempt.user,
                        nonce = attempt.nonce,
                        stage = stage,
                        old = %current_hash,
                        new = %new_hash,
                        bid_per_gas = gas.bid_per_gas(),
                        "Replacement transaction broadcast"
                    );
                    self.tracked.remove(&current_hash);
                    self.tracked.insert(new_hash, attempt.user);
                    current_hash = new_hash;
                }
                Err(e) => {
                    self.keys
                        .handle_broadcast_error(attempt.key_index, &e.to_string(), &self.endpoints)
                        .await;
                    warn!(user = %attempt.user, error = %e, "Bump broadcast failed");
                    skip("broadcast_failed");
                    self.tracked.remove(&current_hash);
                    return;
                }
            }
        }

        skip("max_bumps");
        self.tracked.remove(&current_hash);
        debug!(user = %attempt.user, "Bump ladder exhausted");
    }
}

fn skip(reason: &'static str) {
    metrics::increment_counter!("gas_bumps_skipped_total", "reason" => reason);
}
