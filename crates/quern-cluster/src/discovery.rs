//! Cluster discovery service
//!
//! Each node registers an ephemeral entry under its clusters' roots and
//! watches those roots for child changes. A single background task owns
//! all mutable per-cluster state; watch callbacks never touch the store,
//! they only flip the cluster's dirty flag and wake the task. Consumers
//! read immutable, versioned snapshots published through watch channels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quern_common::{QuernError, Result};

use crate::node_info::NodeInfo;
use crate::store::{ChildWatch, Lease, MembershipStore, SessionEvent};

/// Backoff before retrying a failed refresh.
const REFRESH_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Immutable, versioned materialization of one cluster's membership.
/// Re-created on every refresh and handed to consumers as `Arc` copies;
/// the version only ever increases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub name: String,
    pub coordination_root: String,
    /// node id -> address record
    pub nodes: HashMap<String, NodeInfo>,
    pub version: u64,
}

impl ClusterSnapshot {
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> =
            self.nodes.values().map(|n| n.address.clone()).collect();
        addresses.sort();
        addresses
    }
}

/// Cluster discovery configuration
#[derive(Clone, Debug)]
pub struct ClusterDiscoveryConfig {
    /// Root path prefix in the coordination store
    pub config_prefix: String,
    /// This node's client-facing address, published to peers
    pub node_address: String,
    /// Names of the clusters this node tracks and joins
    pub clusters: Vec<String>,
}

impl Default for ClusterDiscoveryConfig {
    fn default() -> Self {
        Self {
            config_prefix: "/quern/discovery".to_string(),
            node_address: "127.0.0.1:9000".to_string(),
            clusters: Vec::new(),
        }
    }
}

impl ClusterDiscoveryConfig {
    /// Read the discovery section from an application config.
    pub fn from_config(config: &config::Config) -> Self {
        let mut cfg = Self::default();
        if let Ok(prefix) = config.get_string("quern.discovery.prefix") {
            cfg.config_prefix = prefix;
        }
        if let Ok(address) = config.get_string("quern.discovery.node-address") {
            cfg.node_address = address;
        }
        if let Ok(list) = config.get_string("quern.discovery.clusters") {
            cfg.clusters = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        cfg
    }
}

fn cluster_root(prefix: &str, cluster: &str) -> String {
    format!("{}/{}/nodes", prefix.trim_end_matches('/'), cluster)
}

/// Concurrent dirty set shared between watch callbacks and the refresh
/// task. Callbacks only insert a name and wake the task; the task drains
/// the set and does all store I/O itself.
struct UpdateFlags {
    dirty: DashSet<String>,
    notify: Notify,
}

impl UpdateFlags {
    fn new() -> Self {
        Self {
            dirty: DashSet::new(),
            notify: Notify::new(),
        }
    }

    fn set(&self, cluster: &str) {
        self.dirty.insert(cluster.to_string());
        self.notify.notify_one();
    }

    fn wake(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }

    fn drain(&self) -> Vec<String> {
        let names: Vec<String> = self.dirty.iter().map(|n| n.clone()).collect();
        for name in &names {
            self.dirty.remove(name);
        }
        names
    }
}

/// Mutable per-cluster state, owned exclusively by the refresh task.
struct ClusterState {
    name: String,
    root: String,
    /// Last successfully fetched child-id set, compared on every refresh.
    last_ids: HashSet<String>,
    version: u64,
    publish: watch::Sender<Option<Arc<ClusterSnapshot>>>,
}

/// Discovers which nodes currently belong to each tracked cluster.
pub struct ClusterDiscovery {
    store: Arc<dyn MembershipStore>,
    config: ClusterDiscoveryConfig,
    node_id: String,
    flags: Arc<UpdateFlags>,
    leases: Arc<DashMap<String, Lease>>,
    receivers: HashMap<String, watch::Receiver<Option<Arc<ClusterSnapshot>>>>,
    /// Task-owned state, handed over on `start`.
    task_state: parking_lot::Mutex<Option<HashMap<String, ClusterState>>>,
    started: AtomicBool,
    stop: Arc<AtomicBool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ClusterDiscovery {
    pub fn new(store: Arc<dyn MembershipStore>, config: ClusterDiscoveryConfig) -> Self {
        let mut receivers = HashMap::new();
        let mut clusters = HashMap::new();
        for name in &config.clusters {
            let (tx, rx) = watch::channel(None);
            receivers.insert(name.clone(), rx);
            clusters.insert(
                name.clone(),
                ClusterState {
                    name: name.clone(),
                    root: cluster_root(&config.config_prefix, name),
                    last_ids: HashSet::new(),
                    version: 0,
                    publish: tx,
                },
            );
        }

        Self {
            store,
            config,
            node_id: uuid::Uuid::new_v4().to_string(),
            flags: Arc::new(UpdateFlags::new()),
            leases: Arc::new(DashMap::new()),
            receivers,
            task_state: parking_lot::Mutex::new(Some(clusters)),
            started: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// This node's membership entry id, stable for the service lifetime.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Begin the background refresh task. Starting twice is an error.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QuernError::IllegalState(
                "cluster discovery already started".to_string(),
            ));
        }
        let clusters = self
            .task_state
            .lock()
            .take()
            .ok_or_else(|| QuernError::IllegalState("cluster state already taken".to_string()))?;

        info!(
            clusters = clusters.len(),
            node_id = %self.node_id,
            "starting cluster discovery"
        );

        let handle = tokio::spawn(run_main_task(
            self.store.clone(),
            self.flags.clone(),
            self.stop.clone(),
            self.leases.clone(),
            self.node_id.clone(),
            self.config.node_address.clone(),
            clusters,
        ));
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Write this node's ephemeral membership entry under `cluster`'s
    /// root. Done automatically on start for every tracked cluster; the
    /// entry vanishes with the session, no explicit deregistration.
    pub async fn register_self(&self, cluster: &str) -> Result<()> {
        if !self.receivers.contains_key(cluster) {
            return Err(QuernError::ClusterNotFound(cluster.to_string()));
        }
        let root = cluster_root(&self.config.config_prefix, cluster);
        // Revoke any previous registration first so the path is free.
        self.leases.remove(cluster);
        let lease = register_node(
            self.store.as_ref(),
            &root,
            &self.node_id,
            &self.config.node_address,
        )
        .await?;
        self.leases.insert(cluster.to_string(), lease);
        Ok(())
    }

    /// Latest published snapshot for a tracked cluster. Awaits the first
    /// publication if the cluster has not been refreshed yet; fails
    /// immediately for a name that is not tracked.
    pub async fn get_cluster(&self, name: &str) -> Result<Arc<ClusterSnapshot>> {
        let Some(rx) = self.receivers.get(name) else {
            return Err(QuernError::ClusterNotFound(name.to_string()));
        };
        let mut rx = rx.clone();
        let guard = rx.wait_for(|snapshot| snapshot.is_some()).await.map_err(|_| {
            QuernError::IllegalState(format!(
                "cluster discovery stopped before the first snapshot of '{name}'"
            ))
        })?;
        match guard.as_ref() {
            Some(snapshot) => Ok(snapshot.clone()),
            None => Err(QuernError::IllegalState(format!(
                "no snapshot published for '{name}'"
            ))),
        }
    }

    /// Subscribe to snapshot publications for a tracked cluster.
    pub fn subscribe(
        &self,
        name: &str,
    ) -> Result<watch::Receiver<Option<Arc<ClusterSnapshot>>>> {
        self.receivers
            .get(name)
            .cloned()
            .ok_or_else(|| QuernError::ClusterNotFound(name.to_string()))
    }

    /// Stop the refresh task and join it. Published snapshots stay
    /// readable; this node's entries expire with the session.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.flags.wake();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("cluster discovery stopped");
    }
}

impl Drop for ClusterDiscovery {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

async fn register_node(
    store: &dyn MembershipStore,
    root: &str,
    node_id: &str,
    address: &str,
) -> Result<Lease> {
    let path = format!("{root}/{node_id}");
    let payload = NodeInfo::new(address).serialize();
    let lease = store.register(&path, &payload).await?;
    debug!(%path, %address, "registered self in cluster");
    Ok(lease)
}

/// Wait for the next session event; pends forever once the store side of
/// the channel is gone.
async fn next_session_event(
    rx: &mut Option<broadcast::Receiver<SessionEvent>>,
) -> SessionEvent {
    loop {
        match rx {
            Some(receiver) => match receiver.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lagged behind session events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    *rx = None;
                }
            },
            None => return std::future::pending().await,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_main_task(
    store: Arc<dyn MembershipStore>,
    flags: Arc<UpdateFlags>,
    stop: Arc<AtomicBool>,
    leases: Arc<DashMap<String, Lease>>,
    node_id: String,
    node_address: String,
    mut clusters: HashMap<String, ClusterState>,
) {
    let mut session_rx = Some(store.session_events());

    // Initial registration and refresh of every tracked cluster.
    for (name, state) in clusters.iter_mut() {
        match register_node(store.as_ref(), &state.root, &node_id, &node_address).await {
            Ok(lease) => {
                leases.insert(name.clone(), lease);
            }
            Err(err) => {
                warn!(cluster = %name, error = %err, "initial registration failed, will retry");
                flags.set(name);
            }
        }
        if let Err(err) = refresh_cluster(store.as_ref(), &flags, state).await {
            warn!(cluster = %name, error = %err, "initial refresh failed, will retry");
            flags.set(name);
        }
    }

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = flags.notified() => {}
            event = next_session_event(&mut session_rx) => match event {
                SessionEvent::Expired => {
                    warn!("coordination session expired, membership entries are gone until resubscribe");
                }
                SessionEvent::Reconnected => {
                    info!("coordination session re-established, resubscribing all clusters");
                    for (name, state) in clusters.iter_mut() {
                        // Drop the stale lease, then re-register and re-list
                        // with a fresh watch. Old watch tokens are not trusted.
                        leases.remove(name);
                        match register_node(store.as_ref(), &state.root, &node_id, &node_address).await {
                            Ok(lease) => {
                                leases.insert(name.clone(), lease);
                            }
                            Err(err) => {
                                warn!(cluster = %name, error = %err, "re-registration failed, will retry");
                            }
                        }
                        flags.set(&state.name);
                    }
                }
            }
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }

        for name in flags.drain() {
            let Some(state) = clusters.get_mut(&name) else {
                continue;
            };
            // A missing lease means an earlier registration attempt
            // failed; retry it on the same dirty-flag path as refreshes.
            if !leases.contains_key(&name) {
                match register_node(store.as_ref(), &state.root, &node_id, &node_address)
                    .await
                {
                    Ok(lease) => {
                        leases.insert(name.clone(), lease);
                    }
                    Err(err) => {
                        warn!(cluster = %name, error = %err, "registration retry failed");
                        schedule_retry(&flags, &name);
                        continue;
                    }
                }
            }
            match refresh_cluster(store.as_ref(), &flags, state).await {
                Ok(_updated) => {}
                Err(err) => {
                    warn!(cluster = %name, error = %err, "cluster refresh failed, will retry");
                    schedule_retry(&flags, &name);
                }
            }
        }
    }
    debug!("cluster discovery task exited");
}

/// Re-flag `cluster` once the backoff elapses, off the refresh task, so
/// one failing cluster does not stall refreshes of the others.
fn schedule_retry(flags: &Arc<UpdateFlags>, cluster: &str) {
    let flags = flags.clone();
    let cluster = cluster.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(REFRESH_RETRY_BACKOFF).await;
        flags.set(&cluster);
    });
}

/// Refresh one cluster: list children with a freshly armed watch, compare
/// the id set with the last known one, and publish a new snapshot only
/// when membership actually changed. Returns whether a publication
/// happened.
async fn refresh_cluster(
    store: &dyn MembershipStore,
    flags: &Arc<UpdateFlags>,
    state: &mut ClusterState,
) -> Result<bool> {
    let name = state.name.clone();
    let callback_flags = flags.clone();
    let watch: ChildWatch = Box::new(move || callback_flags.set(&name));

    let (ids, _child_version) = store.get_children(&state.root, Some(watch)).await?;
    let id_set: HashSet<String> = ids.iter().cloned().collect();
    if id_set == state.last_ids {
        debug!(cluster = %state.name, "no update needed");
        return Ok(false);
    }

    let mut nodes = HashMap::with_capacity(ids.len());
    for id in &ids {
        let path = format!("{}/{}", state.root, id);
        match store.get_entry(&path).await? {
            Some(payload) => match NodeInfo::parse(&payload) {
                Some(info) => {
                    nodes.insert(id.clone(), info);
                }
                None => {
                    warn!(cluster = %state.name, %path, "skipping malformed membership entry");
                }
            },
            None => {
                debug!(cluster = %state.name, %path, "membership entry vanished during refresh");
            }
        }
    }

    state.last_ids = id_set;
    state.version += 1;
    let snapshot = Arc::new(ClusterSnapshot {
        name: state.name.clone(),
        coordination_root: state.root.clone(),
        nodes,
        version: state.version,
    });
    info!(
        cluster = %state.name,
        nodes = snapshot.nodes.len(),
        version = snapshot.version,
        "published cluster snapshot"
    );
    let _ = state.publish.send(Some(snapshot));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_root() {
        assert_eq!(cluster_root("/quern/discovery", "main"), "/quern/discovery/main/nodes");
        assert_eq!(cluster_root("/quern/discovery/", "main"), "/quern/discovery/main/nodes");
    }

    #[test]
    fn test_update_flags_set_and_drain() {
        let flags = UpdateFlags::new();
        flags.set("a");
        flags.set("b");
        flags.set("a");

        let mut drained = flags.drain();
        drained.sort();
        assert_eq!(drained, vec!["a".to_string(), "b".to_string()]);
        assert!(flags.drain().is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let cfg = ClusterDiscoveryConfig::default();
        assert_eq!(cfg.config_prefix, "/quern/discovery");
        assert!(cfg.clusters.is_empty());
    }

    #[test]
    fn test_config_from_config() {
        let raw = config::Config::builder()
            .set_default("quern.discovery.prefix", "/qa/disc")
            .unwrap()
            .set_default("quern.discovery.node-address", "10.0.0.5:9000")
            .unwrap()
            .set_default("quern.discovery.clusters", "main, analytics ,")
            .unwrap()
            .build()
            .unwrap();

        let cfg = ClusterDiscoveryConfig::from_config(&raw);
        assert_eq!(cfg.config_prefix, "/qa/disc");
        assert_eq!(cfg.node_address, "10.0.0.5:9000");
        assert_eq!(cfg.clusters, vec!["main".to_string(), "analytics".to_string()]);
    }

    #[test]
    fn test_snapshot_addresses_sorted() {
        let mut nodes = HashMap::new();
        nodes.insert("b".to_string(), NodeInfo::new("h2:9000"));
        nodes.insert("a".to_string(), NodeInfo::new("h1:9000"));
        let snapshot = ClusterSnapshot {
            name: "main".to_string(),
            coordination_root: "/quern/discovery/main/nodes".to_string(),
            nodes,
            version: 1,
        };
        assert_eq!(snapshot.addresses(), vec!["h1:9000".to_string(), "h2:9000".to_string()]);
    }
}
