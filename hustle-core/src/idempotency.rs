//! Two-tier idempotency guard for gateway events
//!
//! A bounded in-process set of recently seen event ids sits in front of
//! the authoritative conflict-ignore insert into
//! `processed_stripe_events`. The cache may lag the store but never
//! leads it; across restarts only the store counts. Store failures fail
//! open: reprocessing an idempotent pipeline beats losing an event.

use std::collections::{HashSet, VecDeque};

use tokio::sync::Mutex;
use tracing::warn;

use crate::store::EscrowStore;

struct CacheInner {
    order: VecDeque<String>,
    set: HashSet<String>,
}

/// Process-wide deduplication of external events by event id
pub struct IdempotencyGuard {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl IdempotencyGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                order: VecDeque::new(),
                set: HashSet::new(),
            }),
        }
    }

    /// Fast-path check against the in-process cache only
    pub async fn cached(&self, event_id: &str) -> bool {
        self.inner.lock().await.set.contains(event_id)
    }

    /// Record an event id in the cache, evicting the oldest beyond capacity
    pub async fn record(&self, event_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.set.contains(event_id) {
            return;
        }
        inner.order.push_back(event_id.to_string());
        inner.set.insert(event_id.to_string());
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.set.remove(&evicted);
            }
        }
    }

    /// Full contract: returns true iff the event has been processed
    /// before. Consults the cache, then claims ownership in the store
    /// in its own committed transaction. Callers must short-circuit on
    /// true. Store errors fail open (returns false) because downstream
    /// processing is itself idempotent.
    pub async fn seen(
        &self,
        store: &dyn EscrowStore,
        event_id: &str,
        event_type: &str,
    ) -> bool {
        if self.cached(event_id).await {
            return true;
        }

        let owned = async {
            let mut tx = store.begin().await?;
            let owned = tx.append_event(event_id, event_type).await?;
            tx.commit().await?;
            Ok::<bool, crate::CoreError>(owned)
        }
        .await;

        match owned {
            Ok(owned) => {
                self.record(event_id).await;
                !owned
            }
            Err(err) => {
                warn!(event_id, error = %err, "idempotency check failed open");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::store::{MemoryStore, ProfileSummary, StoreTx, WalletSummary};
    use crate::CoreResult;
    use async_trait::async_trait;
    use uuid::Uuid;

    #[tokio::test]
    async fn cache_is_bounded_fifo() {
        let guard = IdempotencyGuard::new(2);
        guard.record("evt_1").await;
        guard.record("evt_2").await;
        guard.record("evt_3").await;

        assert!(!guard.cached("evt_1").await); // evicted
        assert!(guard.cached("evt_2").await);
        assert!(guard.cached("evt_3").await);
    }

    #[tokio::test]
    async fn first_seen_claims_ownership() {
        let store = MemoryStore::new();
        let guard = IdempotencyGuard::new(16);

        assert!(!guard.seen(&store, "evt_1", "payment_intent.succeeded").await);
        assert!(guard.seen(&store, "evt_1", "payment_intent.succeeded").await);

        // A fresh guard (restart) still defers to the store
        let cold = IdempotencyGuard::new(16);
        assert!(cold.seen(&store, "evt_1", "payment_intent.succeeded").await);
    }

    struct BrokenStore;

    #[async_trait]
    impl crate::store::EscrowStore for BrokenStore {
        async fn begin(&self) -> CoreResult<Box<dyn StoreTx>> {
            Err(CoreError::storage("connection refused"))
        }
        async fn wallet_summary(&self, _user_id: Uuid) -> CoreResult<WalletSummary> {
            Err(CoreError::storage("connection refused"))
        }
        async fn profile_summary(&self, _user_id: Uuid) -> CoreResult<ProfileSummary> {
            Err(CoreError::storage("connection refused"))
        }
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let guard = IdempotencyGuard::new(16);
        // Prefers "process again" over "lose an event"
        assert!(!guard.seen(&BrokenStore, "evt_1", "transfer.created").await);
        assert!(!guard.seen(&BrokenStore, "evt_1", "transfer.created").await);
    }
}
