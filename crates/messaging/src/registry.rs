//! Owns teardown tokens for live subscriptions and registrations.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, Teardown>>,
}

/// Set of teardown tokens, disposed in insertion order at shutdown. Each
/// token removes itself from the set and runs its teardown exactly once.
/// Tokens reference the registry by id, so there is no ownership cycle.
#[derive(Default)]
pub struct HandleRegistry {
    inner: Arc<RegistryInner>,
}

/// Token for one registered teardown.
pub struct RegistryHandle {
    id: u64,
    registry: Weak<RegistryInner>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a teardown and returns its token.
    pub fn create(&self, teardown: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static) -> RegistryHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .entries
            .lock()
            .expect("handle registry poisoned")
            .insert(id, Box::new(teardown));

        RegistryHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .expect("handle registry poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner
            .entries
            .lock()
            .expect("handle registry poisoned")
            .is_empty()
    }

    /// Disposes every registered teardown, oldest first. Each disposal
    /// mutates the set, so the head is refetched every iteration.
    pub async fn dispose_all(&self) {
        loop {
            let entry = self
                .inner
                .entries
                .lock()
                .expect("handle registry poisoned")
                .pop_first();
            match entry {
                Some((_, teardown)) => teardown().await,
                None => break,
            }
        }
    }
}

impl RegistryHandle {
    /// Removes the token from the registry and runs its teardown.
    /// Idempotent, also after the registry itself is gone.
    pub async fn dispose(&self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let teardown = inner
            .entries
            .lock()
            .expect("handle registry poisoned")
            .remove(&self.id);
        if let Some(teardown) = teardown {
            teardown().await;
        }
    }
}

impl Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn counting_teardown(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let registry = HandleRegistry::new();
        let torn = Arc::new(AtomicUsize::new(0));

        let handle = registry.create(counting_teardown(&torn));
        handle.dispose().await;
        handle.dispose().await;

        assert_eq!(torn.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn dispose_all_runs_in_insertion_order() {
        let registry = HandleRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            registry.create(move || {
                order.lock().unwrap().push(label);
                Box::pin(async {})
            });
        }

        registry.dispose_all().await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn disposed_token_survives_dispose_all() {
        let registry = HandleRegistry::new();
        let torn = Arc::new(AtomicUsize::new(0));

        let handle = registry.create(counting_teardown(&torn));
        registry.dispose_all().await;
        handle.dispose().await;

        assert_eq!(torn.load(Ordering::SeqCst), 1);
    }
}
