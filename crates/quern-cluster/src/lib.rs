//! Quern Cluster - membership discovery over a coordination store
//!
//! This crate provides:
//! - `NodeInfo`: the membership record codec (`host:port` payloads)
//! - `MembershipStore`: a capability trait over any ZooKeeper-like
//!   coordination backend (ephemeral entries, one-shot child watches)
//! - `MemoryMembershipStore`: a complete in-process store implementation
//! - `ClusterDiscovery`: the background service that keeps a versioned,
//!   immutable snapshot of every tracked cluster's membership

pub mod discovery;
pub mod memory_store;
pub mod node_info;
pub mod store;

pub use discovery::{ClusterDiscovery, ClusterDiscoveryConfig, ClusterSnapshot};
pub use memory_store::MemoryMembershipStore;
pub use node_info::NodeInfo;
pub use store::{ChildWatch, Lease, MembershipStore, SessionEvent};
