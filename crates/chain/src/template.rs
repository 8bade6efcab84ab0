//! Calldata skeleton cache for liquidation calls.
//!
//! Encoding the pool's `liquidationCall` is deterministic apart from the
//! borrower and the repay amount, so skeletons are pre-encoded per
//! `(debtToken, collateralToken)` pair with placeholders and patched at
//! fixed byte offsets when a transaction is actually built.

use alloy::primitives::{Address, Bytes, U256};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use crate::contracts::{
    encode_liquidation_call, LIQUIDATION_REPAY_OFFSET, LIQUIDATION_USER_OFFSET,
};

/// Pre-encoded liquidation calldata skeleton.
#[derive(Debug, Clone)]
pub struct CalldataTemplate {
    pub debt_token: Address,
    pub collateral_token: Address,
    /// Encoded call with a zero user and zero repay amount.
    pub buffer: Vec<u8>,
    /// Offset of the 32-byte big-endian repay word.
    pub repay_offset: usize,
    pub created_block: u64,
}

impl CalldataTemplate {
    fn build(debt_token: Address, collateral_token: Address, block: u64) -> Self {
        let buffer = encode_liquidation_call(
            collateral_token,
            debt_token,
            Address::ZERO,
            U256::ZERO,
            false,
        )
        .to_vec();
        Self {
            debt_token,
            collateral_token,
            buffer,
            repay_offset: LIQUIDATION_REPAY_OFFSET,
            created_block: block,
        }
    }

    /// Age in blocks relative to `current_block`.
    pub fn block_age(&self, current_block: u64) -> u64 {
        current_block.saturating_sub(self.created_block)
    }
}

/// Patch a template with the real borrower and repay amount.
///
/// The returned buffer has the same length as the template, the 4-byte
/// selector untouched, the user overlaid into its address slot and the
/// repay amount written big-endian at the recorded offset.
pub fn patch_user_and_repay(template: &CalldataTemplate, user: Address, repay_wei: U256) -> Bytes {
    let mut buffer = template.buffer.clone();
    buffer[LIQUIDATION_USER_OFFSET..LIQUIDATION_USER_OFFSET + 20]
        .copy_from_slice(user.as_slice());
    let repay_bytes: [u8; 32] = repay_wei.to_be_bytes::<32>();
    buffer[template.repay_offset..template.repay_offset + 32].copy_from_slice(&repay_bytes);
    Bytes::from(buffer)
}

struct CacheSlot {
    template: CalldataTemplate,
    last_used: u64,
}

/// LRU cache of calldata templates keyed by `(debtToken, collateralToken)`.
pub struct TemplateCache {
    slots: Mutex<(HashMap<(Address, Address), CacheSlot>, u64)>,
    capacity: usize,
    /// Templates older than this many blocks are rebuilt on access.
    refresh_blocks: u64,
}

impl TemplateCache {
    pub fn new(capacity: usize, refresh_blocks: u64) -> Self {
        Self {
            slots: Mutex::new((HashMap::new(), 0)),
            capacity: capacity.max(1),
            refresh_blocks: refresh_blocks.max(1),
        }
    }

    /// Fetch a template, rebuilding when missing or stale.
    pub fn get_template(
        &self,
        debt_token: Address,
        collateral_token: Address,
        current_block: u64,
    ) -> CalldataTemplate {
        let key = (debt_token, collateral_token);
        let mut guard = self.slots.lock();
        let (map, clock) = &mut *guard;
        *clock += 1;
        let tick = *clock;

        if let Some(slot) = map.get_mut(&key) {
            if slot.template.block_age(current_block) < self.refresh_blocks {
                slot.last_used = tick;
                metrics::increment_counter!("template_cache_hits_total");
                return slot.template.clone();
            }
            debug!(
                debt = %debt_token,
                collateral = %collateral_token,
                age = slot.template.block_age(current_block),
                "Template stale, rebuilding"
            );
        }

        metrics::increment_counter!("template_cache_misses_total");
        let template = CalldataTemplate::build(debt_token, collateral_token, current_block);

        if map.len() >= self.capacity && !map.contains_key(&key) {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| *k)
            {
                map.remove(&oldest);
            }
        }
        map.insert(
            key,
            CacheSlot {
                template: template.clone(),
                last_used: tick,
            },
        );
        template
    }

    pub fn len(&self) -> usize {
        self.slots.lock().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
