//! Membership store capability
//!
//! A narrow abstraction over a ZooKeeper-like coordination service:
//! ephemeral entries tied to the session, child listings with one-shot
//! watches, and session-lifecycle events. Any compliant backend can
//! implement it; `MemoryMembershipStore` is the in-process one.
//!
//! Path convention: `<prefix>/<cluster>/nodes/<node_id>`, payload is a
//! serialized `NodeInfo`.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;

use quern_common::Result;

/// One-shot child-change notification. A watch fires at most once; every
/// `get_children` call that wants further notifications must pass a new
/// one, re-armed atomically with the read.
pub type ChildWatch = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Session lifecycle, observed by every discovery consumer.
///
/// `Expired` means all ephemeral entries of this session are gone;
/// `Reconnected` means a fresh session exists and subscribers must fully
/// resubscribe (re-register, re-list, re-watch). Stale watch tokens from
/// the old session must not be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Expired,
    Reconnected,
}

/// Handle to an ephemeral registration. Dropping the lease revokes the
/// entry; losing the session revokes it implicitly.
pub struct Lease {
    path: String,
    revoke: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Lease {
    pub fn new(path: impl Into<String>, revoke: Box<dyn FnOnce() + Send + Sync>) -> Self {
        Self {
            path: path.into(),
            revoke: Some(revoke),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(revoke) = self.revoke.take() {
            revoke();
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("path", &self.path).finish()
    }
}

/// Coordination-store capability consumed by `ClusterDiscovery`.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Create an ephemeral entry at `path`. The entry disappears when the
    /// returned lease is dropped or the session is lost.
    async fn register(&self, path: &str, payload: &str) -> Result<Lease>;

    /// List the direct children of `path` together with the path's child
    /// version. When `watch` is passed it is armed atomically with the
    /// read and fires once on the next child change.
    async fn get_children(
        &self,
        path: &str,
        watch: Option<ChildWatch>,
    ) -> Result<(Vec<String>, i64)>;

    /// Fetch one entry's payload, `None` if it does not exist.
    async fn get_entry(&self, path: &str) -> Result<Option<String>>;

    /// Subscribe to session lifecycle events.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
