//! Per-provider connection quota tracking.
//!
//! Every upstream session holds exactly one [`QuotaSlot`] for its lifetime.
//! Acquisition is a single compare-and-increment, so two racing requests can
//! never both observe free capacity once a provider is saturated. Acquisition
//! is non-blocking: a provider at capacity yields an immediate rejection and
//! the orchestrator moves on to the next candidate source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

/// Concurrent-connection counter of one provider.
#[derive(Debug)]
pub struct ProviderQuota {
    provider_id: String,
    active: AtomicU32,
    max: u32,
}

impl ProviderQuota {
    pub fn new(provider_id: impl Into<String>, max: u32) -> Arc<Self> {
        Arc::new(Self {
            provider_id: provider_id.into(),
            active: AtomicU32::new(0),
            max,
        })
    }

    /// Compare-and-increment. `None` means the provider is at capacity.
    pub fn try_acquire(self: &Arc<Self>) -> Option<QuotaSlot> {
        let acquired = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max).then_some(active + 1)
            });

        match acquired {
            Ok(previous) => {
                debug!(
                    provider = %self.provider_id,
                    active = previous + 1,
                    max = self.max,
                    "quota slot acquired"
                );
                Some(QuotaSlot {
                    quota: Arc::clone(self),
                    released: false,
                })
            }
            Err(_) => None,
        }
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u32 {
        self.max
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn release(&self) {
        let previous = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                active.checked_sub(1)
            });

        match previous {
            Ok(previous) => {
                debug!(
                    provider = %self.provider_id,
                    active = previous - 1,
                    "quota slot released"
                );
            }
            Err(_) => {
                // A release without a matching acquire would corrupt the
                // counter; clamp at zero and make noise instead.
                debug_assert!(false, "quota release without matching acquire");
                warn!(
                    provider = %self.provider_id,
                    "quota release without matching acquire, counter left at zero"
                );
            }
        }
    }
}

/// RAII guard for one unit of a provider's capacity.
///
/// Released exactly once: either explicitly via [`QuotaSlot::release`] or on
/// drop, which also covers panic and cancellation paths in the session task.
/// Double release is unrepresentable, `release` consumes the slot.
#[derive(Debug)]
pub struct QuotaSlot {
    quota: Arc<ProviderQuota>,
    released: bool,
}

impl QuotaSlot {
    pub fn provider_id(&self) -> &str {
        self.quota.provider_id()
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            debug_assert!(false, "quota slot released twice");
            warn!(
                provider = %self.quota.provider_id,
                "quota slot released twice, ignoring"
            );
            return;
        }
        self.released = true;
        self.quota.release();
    }
}

impl Drop for QuotaSlot {
    fn drop(&mut self) {
        if !self.released {
            self.release_inner();
        }
    }
}

/// Quota counters for all configured providers, keyed by provider id.
///
/// Counters survive catalog reloads: [`QuotaRegistry::sync`] adds counters
/// for new providers and retires removed ones without resetting the counts
/// of providers that stay, so capacity held by in-flight sessions remains
/// accounted for.
#[derive(Debug, Default)]
pub struct QuotaRegistry {
    quotas: RwLock<HashMap<String, Arc<ProviderQuota>>>,
}

impl QuotaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, provider_id: &str) -> Option<QuotaSlot> {
        let quotas = self.quotas.read().unwrap_or_else(|e| e.into_inner());
        quotas.get(provider_id)?.try_acquire()
    }

    pub fn active(&self, provider_id: &str) -> Option<u32> {
        let quotas = self.quotas.read().unwrap_or_else(|e| e.into_inner());
        quotas.get(provider_id).map(|q| q.active())
    }

    /// Per-provider `(active, capacity)` snapshot for observability.
    pub fn counts(&self) -> HashMap<String, (u32, u32)> {
        let quotas = self.quotas.read().unwrap_or_else(|e| e.into_inner());
        quotas
            .iter()
            .map(|(id, q)| (id.clone(), (q.active(), q.capacity())))
            .collect()
    }

    /// Align the registry with a new provider set.
    pub fn sync<'a>(&self, providers: impl IntoIterator<Item = (&'a str, u32)>) {
        let mut quotas = self.quotas.write().unwrap_or_else(|e| e.into_inner());
        let mut keep: HashMap<String, Arc<ProviderQuota>> = HashMap::new();

        for (id, max) in providers {
            match quotas.remove(id) {
                Some(existing) if existing.capacity() == max => {
                    keep.insert(id.to_string(), existing);
                }
                _ => {
                    // Capacity changed or provider is new. Existing slots keep
                    // decrementing their old (now orphaned) counter on drop.
                    keep.insert(id.to_string(), ProviderQuota::new(id, max));
                }
            }
        }

        *quotas = keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_up_to_capacity_then_reject() {
        let quota = ProviderQuota::new("p1", 2);

        let s1 = quota.try_acquire().unwrap();
        let s2 = quota.try_acquire().unwrap();
        assert!(quota.try_acquire().is_none());
        assert_eq!(quota.active(), 2);

        s1.release();
        assert_eq!(quota.active(), 1);

        let s3 = quota.try_acquire().unwrap();
        assert!(quota.try_acquire().is_none());

        drop(s2);
        drop(s3);
        assert_eq!(quota.active(), 0);
    }

    #[test]
    fn drop_releases_once() {
        let quota = ProviderQuota::new("p1", 1);
        {
            let _slot = quota.try_acquire().unwrap();
            assert_eq!(quota.active(), 1);
        }
        assert_eq!(quota.active(), 0);
    }

    #[tokio::test]
    async fn concurrent_acquire_never_exceeds_capacity() {
        let quota = ProviderQuota::new("p1", 8);
        let mut handles = Vec::new();

        for _ in 0..64 {
            let quota = Arc::clone(&quota);
            handles.push(tokio::spawn(async move {
                let mut acquired = 0u32;
                for _ in 0..50 {
                    if let Some(slot) = quota.try_acquire() {
                        assert!(quota.active() <= 8);
                        acquired += 1;
                        tokio::task::yield_now().await;
                        slot.release();
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
                acquired
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        // every slot released exactly once
        assert_eq!(quota.active(), 0);
    }

    #[test]
    fn registry_sync_keeps_live_counters() {
        let registry = QuotaRegistry::new();
        registry.sync([("p1", 2), ("p2", 1)]);

        let slot = registry.try_acquire("p1").unwrap();
        assert_eq!(registry.active("p1"), Some(1));

        // p1 unchanged, p2 removed, p3 added
        registry.sync([("p1", 2), ("p3", 4)]);

        assert_eq!(registry.active("p1"), Some(1));
        assert_eq!(registry.active("p2"), None);
        assert_eq!(registry.active("p3"), Some(0));

        drop(slot);
        assert_eq!(registry.active("p1"), Some(0));
    }

    #[test]
    fn registry_rejects_unknown_provider() {
        let registry = QuotaRegistry::new();
        registry.sync([("p1", 1)]);
        assert!(registry.try_acquire("nope").is_none());
    }
}
