//! In-process membership store
//!
//! A complete `MembershipStore` backed by concurrent maps. Used by the
//! test suites and by embedded single-process deployments; also the
//! reference for how a real coordination backend is expected to behave
//! (ephemeral entries per session, one-shot watches, session bounce).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use quern_common::{QuernError, Result};

use crate::store::{ChildWatch, Lease, MembershipStore, SessionEvent};

struct StoreInner {
    /// full path -> payload
    entries: DashMap<String, String>,
    /// full path -> owning session id
    ephemeral: DashMap<String, u64>,
    /// parent path -> pending one-shot watches
    watches: DashMap<String, Vec<ChildWatch>>,
    /// parent path -> child version, bumped on every child change
    versions: DashMap<String, i64>,
    session: AtomicU64,
    session_tx: broadcast::Sender<SessionEvent>,
    /// Serializes child listings (with their watch arming) against child
    /// changes, so no change can land between a listing and its watch.
    list_arm: Mutex<()>,
}

impl StoreInner {
    fn bump_and_fire(&self, parent: &str) {
        let pending = {
            let _guard = self.list_arm.lock();
            *self.versions.entry(parent.to_string()).or_insert(0) += 1;
            self.watches
                .remove(parent)
                .map(|(_, watches)| watches)
                .unwrap_or_default()
        };
        for watch in pending {
            watch();
        }
    }
}

/// In-memory `MembershipStore`.
#[derive(Clone)]
pub struct MemoryMembershipStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryMembershipStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMembershipStore {
    pub fn new() -> Self {
        let (session_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                ephemeral: DashMap::new(),
                watches: DashMap::new(),
                versions: DashMap::new(),
                session: AtomicU64::new(1),
                session_tx,
                list_arm: Mutex::new(()),
            }),
        }
    }

    /// Simulate a coordination session bounce: every ephemeral entry of
    /// the current session vanishes, affected watches fire, and
    /// subscribers observe `Expired` followed by `Reconnected`.
    pub fn expire_session(&self) {
        let old = self.inner.session.fetch_add(1, Ordering::SeqCst);
        let expired: Vec<String> = self
            .inner
            .ephemeral
            .iter()
            .filter(|e| *e.value() <= old)
            .map(|e| e.key().clone())
            .collect();

        let mut parents = HashSet::new();
        for path in expired {
            self.inner.entries.remove(&path);
            self.inner.ephemeral.remove(&path);
            if let Some((parent, _)) = path.rsplit_once('/') {
                parents.insert(parent.to_string());
            }
        }

        debug!(parents = parents.len(), "membership session expired");
        let _ = self.inner.session_tx.send(SessionEvent::Expired);
        for parent in parents {
            self.inner.bump_and_fire(&parent);
        }
        let _ = self.inner.session_tx.send(SessionEvent::Reconnected);
    }

    /// Deliver a spurious child event at `path`. Coordination services
    /// may fire watches without an observable change; refresh logic has
    /// to treat that as a no-op.
    pub fn trigger_watches(&self, path: &str) {
        let pending = {
            let _guard = self.inner.list_arm.lock();
            self.inner
                .watches
                .remove(path)
                .map(|(_, watches)| watches)
                .unwrap_or_default()
        };
        for watch in pending {
            watch();
        }
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entries.len()
    }
}

#[async_trait]
impl MembershipStore for MemoryMembershipStore {
    async fn register(&self, path: &str, payload: &str) -> Result<Lease> {
        if self.inner.entries.contains_key(path) {
            return Err(QuernError::Store(format!("entry already exists: {path}")));
        }
        let session = self.inner.session.load(Ordering::SeqCst);
        self.inner
            .entries
            .insert(path.to_string(), payload.to_string());
        self.inner.ephemeral.insert(path.to_string(), session);
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.inner.bump_and_fire(parent);
        }
        debug!(%path, "registered ephemeral membership entry");

        let inner = self.inner.clone();
        let owned = path.to_string();
        Ok(Lease::new(
            path,
            Box::new(move || {
                if inner.entries.remove(&owned).is_some() {
                    inner.ephemeral.remove(&owned);
                    if let Some((parent, _)) = owned.rsplit_once('/') {
                        inner.bump_and_fire(parent);
                    }
                }
            }),
        ))
    }

    async fn get_children(
        &self,
        path: &str,
        watch: Option<ChildWatch>,
    ) -> Result<(Vec<String>, i64)> {
        let prefix = format!("{path}/");
        // Listing and arming happen under the same lock that child
        // changes take, keeping the watch atomic with the read.
        let _guard = self.inner.list_arm.lock();
        let mut ids: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter_map(|e| {
                e.key()
                    .strip_prefix(&prefix)
                    .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();

        let version = self.inner.versions.get(path).map(|v| *v).unwrap_or(0);
        if let Some(watch) = watch {
            self.inner
                .watches
                .entry(path.to_string())
                .or_default()
                .push(watch);
        }
        Ok((ids, version))
    }

    async fn get_entry(&self, path: &str) -> Result<Option<String>> {
        Ok(self.inner.entries.get(path).map(|e| e.value().clone()))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Notify;
    use tokio::time::timeout;

    use super::*;

    #[test]
    fn test_store_handles_are_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MemoryMembershipStore>();
        assert_send_sync::<Lease>();
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let store = MemoryMembershipStore::new();
        let _a = store.register("/c/main/nodes/a", "h1:9000").await.unwrap();
        let _b = store.register("/c/main/nodes/b", "h2:9000").await.unwrap();

        let (ids, version) = store.get_children("/c/main/nodes", None).await.unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(version, 2);

        let payload = store.get_entry("/c/main/nodes/a").await.unwrap();
        assert_eq!(payload.as_deref(), Some("h1:9000"));
    }

    #[tokio::test]
    async fn test_duplicate_register_fails() {
        let store = MemoryMembershipStore::new();
        let _a = store.register("/c/main/nodes/a", "h1:9000").await.unwrap();
        assert!(store.register("/c/main/nodes/a", "h1:9000").await.is_err());
    }

    #[tokio::test]
    async fn test_watch_is_one_shot() {
        let store = MemoryMembershipStore::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        store
            .get_children("/c/main/nodes", Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .await
            .unwrap();

        let _a = store.register("/c/main/nodes/a", "h1:9000").await.unwrap();
        let _b = store.register("/c/main/nodes/b", "h2:9000").await.unwrap();

        // Only the first change fires; the watch was not re-armed.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lease_drop_revokes() {
        let store = MemoryMembershipStore::new();
        let lease = store.register("/c/main/nodes/a", "h1:9000").await.unwrap();
        assert_eq!(lease.path(), "/c/main/nodes/a");
        drop(lease);

        let (ids, _) = store.get_children("/c/main/nodes", None).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_change_lost_between_listing_and_arming() {
        let store = MemoryMembershipStore::new();

        // Writer registers entries while the reader lists with a watch.
        // Any change landing after a listing must fire the watch armed by
        // that listing; a lost change would leave the reader waiting.
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut leases = Vec::new();
                for i in 0..100 {
                    let path = format!("/c/main/nodes/n{i}");
                    leases.push(store.register(&path, "h1:9000").await.unwrap());
                }
                leases
            })
        };

        loop {
            let notify = Arc::new(Notify::new());
            let armed = notify.clone();
            let (ids, _) = store
                .get_children("/c/main/nodes", Some(Box::new(move || armed.notify_one())))
                .await
                .unwrap();
            if ids.len() == 100 {
                break;
            }
            timeout(Duration::from_secs(5), notify.notified())
                .await
                .expect("membership changed without firing the armed watch");
        }

        let _leases = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_expiry_drops_ephemerals_and_notifies() {
        let store = MemoryMembershipStore::new();
        let mut events = store.session_events();
        let _a = store.register("/c/main/nodes/a", "h1:9000").await.unwrap();

        store.expire_session();

        assert_eq!(store.entry_count(), 0);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Expired);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Reconnected);

        // A new session can reuse the path.
        let _a = store.register("/c/main/nodes/a", "h1:9000").await.unwrap();
        let (ids, _) = store.get_children("/c/main/nodes", None).await.unwrap();
        assert_eq!(ids, vec!["a".to_string()]);
    }
}
