//! Single-writer coordination per borrower.
//!
//! At most one attempt per user may be in flight. The lock is an in-memory
//! TTL entry, optionally mirrored to Redis with `SET NX PX` so multiple
//! processes sharing keys cannot double-fire. A separate bounded set makes
//! `(user, block)` decisions idempotent across the three pipelines.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

/// Cross-process lock mirror over Redis.
pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("redis url")?;
        let manager = client
            .get_tokio_connection_manager()
            .await
            .context("redis connect")?;
        Ok(Self { manager })
    }

    /// `SET lock:{user} 1 NX PX ttl`; true when the lock was taken.
    pub async fn try_lock(&self, user: &Address, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("lock:{user:#x}"))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn unlock(&self, user: &Address) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(format!("lock:{user:#x}"))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Mirror a serialized decision trace with a TTL.
    pub async fn put_trace(&self, user: &Address, payload: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SETEX")
            .arg(format!("trace:{user:#x}"))
            .arg(ttl_secs)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Per-user in-flight locks with TTL and optional Redis mirror.
pub struct InFlightLocks {
    /// user -> expiry unix millis
    local: DashMap<Address, u64>,
    ttl_ms: u64,
    kv: Option<RedisKv>,
}

impl InFlightLocks {
    pub fn new(ttl_ms: u64, kv: Option<RedisKv>) -> Self {
        Self {
            local: DashMap::new(),
            ttl_ms,
            kv,
        }
    }

    /// Try to take the user's lock. Expired local entries are reclaimed.
    /// A Redis failure degrades to local-only locking rather than
    /// blocking execution.
    pub async fn try_acquire(&self, user: Address, now_ms: u64) -> bool {
        let acquired_local = {
            let mut entry = self.local.entry(user).or_insert(0);
            if *entry > now_ms {
                false
            } else {
                *entry = now_ms + self.ttl_ms;
                true
            }
        };
        if !acquired_local {
            return false;
        }

        if let Some(kv) = &self.kv {
            match kv.try_lock(&user, self.ttl_ms).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(user = %user, "Remote in-flight lock held elsewhere");
                    self.local.remove(&user);
                    return false;
                }
                Err(e) => {
                    warn!(user = %user, error = %e, "Redis lock failed, proceeding local-only");
                }
            }
        }
        true
    }

    /// Release the lock after the attempt reaches a terminal state.
    pub async fn release(&self, user: Address) {
        self.local.remove(&user);
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.unlock(&user).await {
                warn!(user = %user, error = %e, "Redis unlock failed");
            }
        }
    }

    /// Whether the user currently holds an unexpired lock.
    pub fn is_locked(&self, user: &Address, now_ms: u64) -> bool {
        self.local
            .get(user)
            .map(|expiry| *expiry > now_ms)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }
}

/// Bounded memory of `(user, block)` pairs that already produced a
/// decision. The first mark wins; later pipelines see a duplicate.
pub struct AttemptedBlocks {
    inner: Mutex<(HashSet<(Address, u64)>, VecDeque<(Address, u64)>)>,
    capacity: usize,
}

impl AttemptedBlocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Record a decision for `(user, block)`. Returns false when one
    /// already exists.
    pub fn mark(&self, user: Address, block: u64) -> bool {
        let mut guard = self.inner.lock();
        let (set, order) = &mut *guard;
        if !set.insert((user, block)) {
            return false;
        }
        if order.len() >= self.capacity {
            if let Some(evicted) = order.pop_front() {
                set.remove(&evicted);
            }
        }
        order.push_back((user, block));
        true
    }

    pub fn contains(&self, user: &Address, block: u64) -> bool {
        self.inner.lock().0.contains(&(*user, block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_exclusivity_and_ttl() {
        let locks = InFlightLocks::new(1_000, None);
        let user = Address::repeat_byte(1);

        assert!(locks.try_acquire(user, 10_000).await);
        assert!(!locks.try_acquire(user, 10_500).await);
        assert!(locks.is_locked(&user, 10_500));

        // TTL expiry frees the lock without an explicit release.
        assert!(locks.try_acquire(user, 11_001).await);
    }

    #[tokio::test]
    async fn test_release_frees_lock() {
        let locks = InFlightLocks::new(60_000, None);
        let user = Address::repeat_byte(2);

        assert!(locks.try_acquire(user, 1_000).await);
        locks.release(user).await;
        assert!(locks.try_acquire(user, 1_001).await);
    }

    #[tokio::test]
    async fn test_locks_are_per_user() {
        let locks = InFlightLocks::new(60_000, None);
        assert!(locks.try_acquire(Address::repeat_byte(1), 0).await);
        assert!(locks.try_acquire(Address::repeat_byte(2), 0).await);
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_attempted_blocks_dedupe() {
        let attempted = AttemptedBlocks::new(8);
        let user = Address::repeat_byte(1);

        assert!(attempted.mark(user, 100));
        assert!(!attempted.mark(user, 100));
        assert!(attempted.mark(user, 101));
        assert!(attempted.contains(&user, 100));
    }

    #[test]
    fn test_attempted_blocks_bounded() {
        let attempted = AttemptedBlocks::new(2);
        let user = Address::repeat_byte(1);
        attempted.mark(user, 1);
        attempted.mark(user, 2);
        attempted.mark(user, 3);
        // Oldest pair evicted, re-markable.
        assert!(attempted.mark(user, 1));
    }
}
