//! Registry of outstanding requests, correlated by `(kind, number)`.
//!
//! Both overlays instantiate this with their own kind enum and pending-entry
//! type. An entry lives from the moment a request is issued until either the
//! matching response pops it or its timeout task fires — never both. After
//! `shutdown`, entries are dropped; awaiting callers observe their closed
//! completion channel and resolve with the kind's sentinel.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Consumes an entry whose timeout fired.
pub trait Expire: Send + 'static {
    fn expire(self);
}

pub struct RequestCache<K, P> {
    entries: Mutex<HashMap<(K, u32), P>>,
    shut: AtomicBool,
}

impl<K, P> RequestCache<K, P>
where
    K: Copy + Eq + Hash + Send + 'static,
    P: Expire,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            shut: AtomicBool::new(false),
        }
    }

    /// Register a pending entry under a number unique within `kind`.
    ///
    /// After shutdown the entry is dropped immediately, which resolves any
    /// completion channel it holds as closed.
    pub async fn add(&self, kind: K, pending: P) -> u32 {
        let mut entries = self.entries.lock().await;
        let mut number: u32 = rand::random();
        if self.shut.load(Ordering::SeqCst) {
            return number;
        }
        while entries.contains_key(&(kind, number)) {
            number = rand::random();
        }
        entries.insert((kind, number), pending);
        number
    }

    pub async fn has(&self, kind: K, number: u32) -> bool {
        self.entries.lock().await.contains_key(&(kind, number))
    }

    /// Remove and return the entry, if still pending.
    pub async fn pop(&self, kind: K, number: u32) -> Option<P> {
        self.entries.lock().await.remove(&(kind, number))
    }

    /// Drop every pending entry. In-flight timeout tasks become no-ops.
    pub async fn shutdown(&self) {
        self.shut.store(true, Ordering::SeqCst);
        self.entries.lock().await.clear();
    }
}

/// Arm the timeout for a registered entry: after `delay`, pop it and run its
/// expiry action. A fired timer whose entry was already popped does nothing.
pub fn spawn_timeout<K, P>(
    cache: Arc<RequestCache<K, P>>,
    kind: K,
    number: u32,
    delay: Duration,
) where
    K: Copy + Eq + Hash + Send + Sync + 'static,
    P: Expire + Sync,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(pending) = cache.pop(kind, number).await {
            pending.expire();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Probe,
    }

    struct Pending(oneshot::Sender<bool>);

    impl Expire for Pending {
        fn expire(self) {
            self.0.send(false).ok();
        }
    }

    #[tokio::test]
    async fn pop_wins_over_timeout() {
        let cache = Arc::new(RequestCache::new());
        let (tx, rx) = oneshot::channel();
        let number = cache.add(Kind::Probe, Pending(tx)).await;
        spawn_timeout(cache.clone(), Kind::Probe, number, Duration::from_secs(5));

        assert!(cache.has(Kind::Probe, number).await);
        let pending = cache.pop(Kind::Probe, number).await.unwrap();
        pending.0.send(true).ok();
        assert_eq!(rx.await, Ok(true));
        assert!(!cache.has(Kind::Probe, number).await);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires_entry() {
        let cache = Arc::new(RequestCache::new());
        let (tx, rx) = oneshot::channel();
        let number = cache.add(Kind::Probe, Pending(tx)).await;
        spawn_timeout(cache.clone(), Kind::Probe, number, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(rx.await, Ok(false));
        assert!(!cache.has(Kind::Probe, number).await);
    }

    #[tokio::test]
    async fn shutdown_drops_entries() {
        let cache: Arc<RequestCache<Kind, Pending>> = Arc::new(RequestCache::new());
        let (tx, rx) = oneshot::channel();
        let number = cache.add(Kind::Probe, Pending(tx)).await;
        cache.shutdown().await;
        assert!(!cache.has(Kind::Probe, number).await);
        assert!(rx.await.is_err());

        // New entries after shutdown are dropped immediately.
        let (tx, rx) = oneshot::channel();
        cache.add(Kind::Probe, Pending(tx)).await;
        assert!(rx.await.is_err());
    }
}
