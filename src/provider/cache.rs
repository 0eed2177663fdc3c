//! Per-provider instance cache with a refresh cooldown.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, MutexGuard};

use super::ProviderError;
use crate::clock::Clock;
use crate::instance::Instance;

/// Instances known to one provider and the time they were last refreshed.
#[derive(Debug, Default)]
pub struct CacheState {
    instances: BTreeMap<String, Arc<dyn Instance>>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl CacheState {
    /// Returns `true` when the last refresh is younger than `cooldown`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, cooldown: TimeDelta) -> bool {
        self.refreshed_at
            .is_some_and(|refreshed| now.signed_duration_since(refreshed) < cooldown)
    }

    /// Looks up an instance by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Instance>> {
        self.instances.get(name).map(Arc::clone)
    }

    /// Snapshot of every cached instance, ordered by name.
    #[must_use]
    pub fn instances(&self) -> Vec<Arc<dyn Instance>> {
        self.instances.values().map(Arc::clone).collect()
    }

    /// Replaces the cached set with `discovered`.
    ///
    /// An instance whose name and address are unchanged keeps its existing
    /// handle so its offline count survives the refresh.
    pub fn replace(&mut self, discovered: Vec<Arc<dyn Instance>>, now: DateTime<Utc>) {
        let mut next = BTreeMap::new();
        for instance in discovered {
            let name = instance.name().to_owned();
            let kept = self
                .instances
                .remove(&name)
                .filter(|existing| existing.ip_address() == instance.ip_address())
                .unwrap_or(instance);
            next.insert(name, kept);
        }
        self.instances = next;
        self.refreshed_at = Some(now);
    }
}

/// Cache of instances guarded by an async lock, so at most one inventory
/// query per provider runs at a time.
#[derive(Debug)]
pub struct InstanceCache {
    cooldown: TimeDelta,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl InstanceCache {
    /// Creates an empty cache that refreshes at most once per `cooldown`.
    #[must_use]
    pub fn new(cooldown: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            cooldown,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Locks the cache, running `discover` first when `force` is set or the
    /// cooldown has elapsed.
    ///
    /// # Errors
    ///
    /// Propagates the discovery error; the cached set is left untouched.
    pub async fn refreshed<F, Fut>(
        &self,
        force: bool,
        discover: F,
    ) -> Result<MutexGuard<'_, CacheState>, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Arc<dyn Instance>>, ProviderError>>,
    {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        if force || !state.is_fresh(now, self.cooldown) {
            let discovered = discover().await?;
            tracing::debug!(count = discovered.len(), "instance cache refreshed");
            state.replace(discovered, self.clock.now());
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::FakeClock;
    use crate::test_support::ScriptedInstance;

    fn discovered(names: &[&str]) -> Vec<Arc<dyn Instance>> {
        names
            .iter()
            .map(|name| Arc::new(ScriptedInstance::new(name)) as Arc<dyn Instance>)
            .collect()
    }

    #[tokio::test]
    async fn refresh_is_skipped_within_cooldown() {
        let clock = Arc::new(FakeClock::default());
        let cache = InstanceCache::new(TimeDelta::seconds(5), clock.clone());
        let calls = AtomicUsize::new(0);
        let discover = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(discovered(&["monkey-a"]))
        };

        drop(cache.refreshed(false, discover).await.unwrap_or_else(|err| panic!("{err}")));
        drop(cache.refreshed(false, discover).await.unwrap_or_else(|err| panic!("{err}")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance_secs(6);
        drop(cache.refreshed(false, discover).await.unwrap_or_else(|err| panic!("{err}")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(cache.refreshed(true, discover).await.unwrap_or_else(|err| panic!("{err}")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unchanged_instances_keep_their_handle() {
        let clock = Arc::new(FakeClock::default());
        let cache = InstanceCache::new(TimeDelta::zero(), clock);
        let first = cache
            .refreshed(true, || async { Ok(discovered(&["monkey-a", "monkey-b"])) })
            .await
            .unwrap_or_else(|err| panic!("{err}"))
            .get("monkey-a")
            .unwrap_or_else(|| panic!("monkey-a missing"));

        let state = cache
            .refreshed(true, || async { Ok(discovered(&["monkey-a"])) })
            .await
            .unwrap_or_else(|err| panic!("{err}"));
        let second = state.get("monkey-a").unwrap_or_else(|| panic!("monkey-a missing"));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(state.get("monkey-b").is_none());
    }

    #[tokio::test]
    async fn failed_discovery_keeps_previous_set() {
        let clock = Arc::new(FakeClock::default());
        let cache = InstanceCache::new(TimeDelta::seconds(60), clock);
        drop(
            cache
                .refreshed(true, || async { Ok(discovered(&["monkey-a"])) })
                .await
                .unwrap_or_else(|err| panic!("{err}")),
        );

        let err = cache
            .refreshed(true, || async {
                Err(ProviderError::Inventory(String::from("offline")))
            })
            .await
            .err();
        assert_eq!(err, Some(ProviderError::Inventory(String::from("offline"))));

        let state = cache
            .refreshed(false, || async { Ok(Vec::new()) })
            .await
            .unwrap_or_else(|err| panic!("{err}"));
        assert!(state.get("monkey-a").is_some());
    }
}
