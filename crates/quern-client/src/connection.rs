//! Replica connection capability
//!
//! An established, authenticated connection to one replica. The wire
//! encoding and handshake live behind this trait; the multiplexer only
//! needs sends, a cancel-safe receive, and a stable identity to key its
//! replica registry with.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::packet::{ExternalTableData, Packet};

/// How far the server should process the query before returning data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryProcessingStage {
    FetchColumns,
    WithMergeableState,
    #[default]
    Complete,
}

/// Per-query execution settings carried to every replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// How many replicas to pull from the pool for one query.
    pub max_parallel_replicas: u64,
    /// Total replicas executing this query; assigned on broadcast.
    pub parallel_replicas_count: u64,
    /// This replica's slot among them; assigned on broadcast.
    pub parallel_replica_offset: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel_replicas: 1,
            parallel_replicas_count: 0,
            parallel_replica_offset: 0,
        }
    }
}

/// One established replica connection.
///
/// `receive_packet` must be cancel-safe: the multiplexer races receives
/// across replicas and drops the losing futures, so an implementation
/// must not lose a packet to a dropped future. Delivering packets through
/// an internal channel (the read loop feeding an mpsc) satisfies this.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable identity, unique within one replica set. Used as the
    /// multiplexing key.
    fn id(&self) -> u64;

    /// The replica's `host:port` address, for diagnostics.
    fn address(&self) -> String;

    async fn send_query(
        &self,
        query: &str,
        query_id: &str,
        stage: QueryProcessingStage,
        settings: &Settings,
        with_pending_data: bool,
    ) -> Result<()>;

    /// Send external table payloads; pending data flushed after the query.
    async fn send_external_tables(&self, data: &[ExternalTableData]) -> Result<()>;

    /// Ask the replica to cancel the running query. Fire and forget; the
    /// replica is expected to eventually answer with `EndOfStream`.
    async fn send_cancel(&self) -> Result<()>;

    /// Wait for and return the next packet.
    async fn receive_packet(&self) -> Result<Packet>;

    /// Force-close the connection. Unblocks a pending `receive_packet`
    /// with a transport error. Idempotent.
    fn disconnect(&self);
}

/// Shared handle to a pooled connection.
pub type ConnectionEntry = Arc<dyn Connection>;
