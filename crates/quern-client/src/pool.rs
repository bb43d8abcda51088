//! Connection pool capability
//!
//! Connection establishment and retry belong to the pool; the replica
//! set only pulls entries from it. `StaticConnectionPool` serves fixed
//! deployments and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::connection::{Connection, ConnectionEntry, Settings};
use crate::error::{ClientError, Result};

/// Source of established replica connections.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Pull one connection.
    async fn get(&self, settings: &Settings) -> Result<ConnectionEntry>;

    /// Pull up to `settings.max_parallel_replicas` connections, or every
    /// currently available one when `get_all` is set.
    async fn get_many(&self, settings: &Settings, get_all: bool) -> Result<Vec<ConnectionEntry>>;
}

/// A pool over a fixed list of already-established connections, handed
/// out round-robin.
pub struct StaticConnectionPool {
    connections: Vec<ConnectionEntry>,
    next: AtomicUsize,
}

impl StaticConnectionPool {
    pub fn new(connections: Vec<Arc<dyn Connection>>) -> Self {
        Self {
            connections,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl ConnectionPool for StaticConnectionPool {
    async fn get(&self, _settings: &Settings) -> Result<ConnectionEntry> {
        if self.connections.is_empty() {
            return Err(ClientError::NoActiveReplicas);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        Ok(self.connections[index].clone())
    }

    async fn get_many(&self, settings: &Settings, get_all: bool) -> Result<Vec<ConnectionEntry>> {
        if self.connections.is_empty() {
            return Err(ClientError::NoActiveReplicas);
        }
        if get_all {
            return Ok(self.connections.clone());
        }
        let wanted = (settings.max_parallel_replicas.max(1) as usize).min(self.connections.len());
        let start = self.next.fetch_add(wanted, Ordering::Relaxed);
        Ok((0..wanted)
            .map(|i| self.connections[(start + i) % self.connections.len()].clone())
            .collect())
    }
}
