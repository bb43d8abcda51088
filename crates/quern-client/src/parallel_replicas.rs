//! Parallel replica set
//!
//! Runs one query over a fixed set of replica connections from a single
//! driver task, while a second task may cancel at any time. The replica
//! registry never grows or shrinks after construction; a replica's
//! liveness only ever flips Active -> Invalidated, exactly once, which is
//! what makes the size/activity/address accessors lock-free. The small
//! run-state mutex guards only the sent/cancelled/extra-info flags and is
//! never held across I/O: an in-flight receive is unblocked by what
//! cancellation does to the connections, not by lock contention.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::{ConnectionEntry, QueryProcessingStage, Settings};
use crate::error::{ClientError, Result};
use crate::packet::{BlockExtraInfo, ExternalTableData, Packet, ServerException};
use crate::pool::ConnectionPool;
use crate::throttler::Throttler;

struct ReplicaSlot {
    connection: ConnectionEntry,
    active: AtomicBool,
}

#[derive(Default)]
struct RunState {
    sent_query: bool,
    cancelled: bool,
    current_replica: Option<u64>,
    block_extra_info: Option<BlockExtraInfo>,
}

/// One query, many replicas: broadcast sends, multiplexed receive.
pub struct ParallelReplicas {
    settings: Settings,
    /// Fixed at construction; index is the slot id, `connection.id()`
    /// the stable multiplexing key.
    replicas: Vec<ReplicaSlot>,
    active_count: AtomicUsize,
    throttler: Option<Arc<dyn Throttler>>,
    append_extra_info: bool,
    supports_parallel_execution: bool,
    state: Mutex<RunState>,
    /// Rotates the polling order across receives so no always-ready
    /// replica can starve the others.
    next_offset: AtomicUsize,
}

impl ParallelReplicas {
    /// Degenerate single-replica set over a pre-established connection.
    pub fn new(
        connection: ConnectionEntry,
        settings: Settings,
        throttler: Option<Arc<dyn Throttler>>,
    ) -> Self {
        let replicas = vec![ReplicaSlot {
            connection,
            active: AtomicBool::new(true),
        }];
        Self {
            settings,
            active_count: AtomicUsize::new(replicas.len()),
            replicas,
            throttler,
            append_extra_info: false,
            supports_parallel_execution: false,
            state: Mutex::new(RunState::default()),
            next_offset: AtomicUsize::new(0),
        }
    }

    /// Pull replicas from a pool: one by default, every currently
    /// available connection when `get_all_replicas` is set.
    pub async fn from_pool(
        pool: &dyn ConnectionPool,
        settings: Settings,
        throttler: Option<Arc<dyn Throttler>>,
        append_extra_info: bool,
        get_all_replicas: bool,
    ) -> Result<Self> {
        let entries = if get_all_replicas || settings.max_parallel_replicas > 1 {
            pool.get_many(&settings, get_all_replicas).await?
        } else {
            vec![pool.get(&settings).await?]
        };
        if entries.is_empty() {
            return Err(ClientError::NoActiveReplicas);
        }

        let mut seen = HashSet::new();
        let mut replicas = Vec::with_capacity(entries.len());
        for connection in entries {
            if !seen.insert(connection.id()) {
                return Err(ClientError::DuplicateReplica(connection.id()));
            }
            replicas.push(ReplicaSlot {
                connection,
                active: AtomicBool::new(true),
            });
        }

        debug!(replicas = replicas.len(), "built parallel replica set");
        Ok(Self {
            settings,
            active_count: AtomicUsize::new(replicas.len()),
            supports_parallel_execution: replicas.len() > 1,
            replicas,
            throttler,
            append_extra_info,
            state: Mutex::new(RunState::default()),
            next_offset: AtomicUsize::new(0),
        })
    }

    /// Number of registered replicas, Active or Invalidated. Lock-free:
    /// the registry is fixed after construction.
    pub fn size(&self) -> usize {
        self.replicas.len()
    }

    /// Number of still-Active replicas.
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    pub fn has_active_replicas(&self) -> bool {
        self.active_count() > 0
    }

    /// Delimited listing of every registered replica's address. Lock-free
    /// for the same reason as `size`.
    pub fn dump_addresses(&self) -> String {
        self.replicas
            .iter()
            .map(|slot| slot.connection.address())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The replica the most recent packet was read from.
    pub fn current_replica(&self) -> Option<u64> {
        self.state.lock().current_replica
    }

    fn invalidate(&self, index: usize) {
        let slot = &self.replicas[index];
        if slot.active.swap(false, Ordering::AcqRel) {
            self.active_count.fetch_sub(1, Ordering::AcqRel);
            debug!(replica = %slot.connection.address(), "replica invalidated");
        }
    }

    fn active_indices(&self) -> Vec<usize> {
        (0..self.replicas.len())
            .filter(|&i| self.replicas[i].active.load(Ordering::Acquire))
            .collect()
    }

    /// Broadcast external table payloads to every Active replica. A
    /// failing replica is invalidated; delivery to the others continues.
    pub async fn send_external_tables_data(&self, data: &[ExternalTableData]) -> Result<()> {
        {
            let state = self.state.lock();
            if !state.sent_query {
                return Err(ClientError::QueryNotSent);
            }
        }
        for index in self.active_indices() {
            let slot = &self.replicas[index];
            if let Err(err) = slot.connection.send_external_tables(data).await {
                warn!(
                    replica = %slot.connection.address(),
                    error = %err,
                    "external tables send failed"
                );
                self.invalidate(index);
            }
        }
        if !self.has_active_replicas() {
            return Err(ClientError::NoActiveReplicas);
        }
        Ok(())
    }

    /// Broadcast the query. Succeeds if at least one replica accepted it;
    /// replicas that failed the send are invalidated.
    pub async fn send_query(
        &self,
        query: &str,
        query_id: &str,
        stage: QueryProcessingStage,
        with_pending_data: bool,
    ) -> Result<()> {
        {
            let state = self.state.lock();
            if state.sent_query {
                return Err(ClientError::QueryAlreadySent);
            }
        }

        let mut offset = 0u64;
        for index in self.active_indices() {
            let slot = &self.replicas[index];
            let mut settings = self.settings.clone();
            if self.supports_parallel_execution {
                settings.parallel_replicas_count = self.replicas.len() as u64;
                settings.parallel_replica_offset = offset;
            }
            match slot
                .connection
                .send_query(query, query_id, stage, &settings, with_pending_data)
                .await
            {
                Ok(()) => offset += 1,
                Err(err) => {
                    warn!(
                        replica = %slot.connection.address(),
                        error = %err,
                        "query send failed"
                    );
                    self.invalidate(index);
                }
            }
        }

        if !self.has_active_replicas() {
            return Err(ClientError::NoActiveReplicas);
        }
        self.state.lock().sent_query = true;
        Ok(())
    }

    /// Wait across all Active replicas and read one packet from the
    /// first ready one. `Exception`, `EndOfStream` or a transport failure
    /// invalidates the replica that produced it; transport failures keep
    /// the wait going on the survivors. Once no Active replica remains
    /// the call fails definitively instead of blocking.
    pub async fn receive_packet(&self) -> Result<Packet> {
        {
            let state = self.state.lock();
            if !state.sent_query {
                return Err(ClientError::QueryNotSent);
            }
        }
        self.receive_packet_unchecked().await
    }

    async fn receive_packet_unchecked(&self) -> Result<Packet> {
        loop {
            let active = self.active_indices();
            if active.is_empty() {
                return Err(ClientError::NoActiveReplicas);
            }

            // Rotate the polling order: select_all breaks readiness ties
            // by list position.
            let start = self.next_offset.fetch_add(1, Ordering::Relaxed) % active.len();
            let order: Vec<usize> = active[start..]
                .iter()
                .chain(active[..start].iter())
                .copied()
                .collect();

            let waits: Vec<_> = order
                .iter()
                .map(|&index| {
                    let connection = &self.replicas[index].connection;
                    Box::pin(async move { (index, connection.receive_packet().await) })
                })
                .collect();
            let ((index, result), _, _) = futures::future::select_all(waits).await;

            match result {
                Ok(packet) => {
                    match &packet {
                        Packet::Exception(_) | Packet::EndOfStream => self.invalidate(index),
                        Packet::Data { block, extra_info } => {
                            if let Some(throttler) = &self.throttler {
                                throttler.account(block.bytes);
                            }
                            if self.append_extra_info {
                                self.state.lock().block_extra_info = extra_info.clone();
                            }
                        }
                        _ => {}
                    }
                    self.state.lock().current_replica =
                        Some(self.replicas[index].connection.id());
                    return Ok(packet);
                }
                Err(err) => {
                    warn!(
                        replica = %self.replicas[index].connection.address(),
                        error = %err,
                        "replica read failed"
                    );
                    self.invalidate(index);
                    // Keep waiting on the survivors; the empty-set check
                    // at the top of the loop surfaces the hard failure.
                }
            }
        }
    }

    /// Extra info captured from the most recent data packet.
    pub fn get_block_extra_info(&self) -> Result<Option<BlockExtraInfo>> {
        if !self.append_extra_info {
            return Err(ClientError::ExtraInfoNotRequested);
        }
        Ok(self.state.lock().block_extra_info.clone())
    }

    /// Ask every Active replica to cancel the query, without waiting for
    /// acknowledgement. Callable from a task other than the driver;
    /// idempotent; a no-op before the query was sent.
    pub async fn send_cancel(&self) -> Result<()> {
        let targets: Vec<usize> = {
            let mut state = self.state.lock();
            if !state.sent_query || state.cancelled {
                return Ok(());
            }
            state.cancelled = true;
            self.active_indices()
        };

        for index in targets {
            let slot = &self.replicas[index];
            if let Err(err) = slot.connection.send_cancel().await {
                warn!(
                    replica = %slot.connection.address(),
                    error = %err,
                    "cancel send failed"
                );
                self.invalidate(index);
            }
        }
        Ok(())
    }

    /// Read and discard packets until every replica answered
    /// `EndOfStream` or `Exception`. Returns `EndOfStream` unless an
    /// exception was observed, in which case the last one wins.
    pub async fn drain(&self) -> Result<Packet> {
        {
            let state = self.state.lock();
            if !state.cancelled {
                return Err(ClientError::NotCancelled);
            }
        }

        let mut last_exception: Option<ServerException> = None;
        while self.has_active_replicas() {
            match self.receive_packet_unchecked().await {
                Ok(Packet::Exception(exception)) => last_exception = Some(exception),
                Ok(_) => {}
                Err(_) => break,
            }
        }

        Ok(match last_exception {
            Some(exception) => Packet::Exception(exception),
            None => Packet::EndOfStream,
        })
    }

    /// Force-close every still-Active replica connection. Idempotent and
    /// safe at any point in the lifecycle.
    pub fn disconnect(&self) {
        for index in self.active_indices() {
            self.replicas[index].connection.disconnect();
            self.invalidate(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::connection::Connection;

    /// A connection that never produces anything; enough to exercise the
    /// registry accessors.
    struct InertConnection {
        id: u64,
        address: String,
    }

    #[async_trait]
    impl Connection for InertConnection {
        fn id(&self) -> u64 {
            self.id
        }

        fn address(&self) -> String {
            self.address.clone()
        }

        async fn send_query(
            &self,
            _query: &str,
            _query_id: &str,
            _stage: QueryProcessingStage,
            _settings: &Settings,
            _with_pending_data: bool,
        ) -> Result<()> {
            Ok(())
        }

        async fn send_external_tables(&self, _data: &[ExternalTableData]) -> Result<()> {
            Ok(())
        }

        async fn send_cancel(&self) -> Result<()> {
            Ok(())
        }

        async fn receive_packet(&self) -> Result<Packet> {
            std::future::pending().await
        }

        fn disconnect(&self) {}
    }

    fn inert(id: u64) -> ConnectionEntry {
        Arc::new(InertConnection {
            id,
            address: format!("10.0.0.{id}:9000"),
        })
    }

    #[test]
    fn test_single_replica_set() {
        let set = ParallelReplicas::new(inert(1), Settings::default(), None);
        assert_eq!(set.size(), 1);
        assert_eq!(set.active_count(), 1);
        assert!(set.has_active_replicas());
        assert_eq!(set.dump_addresses(), "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_from_pool_all_replicas() {
        let pool =
            crate::pool::StaticConnectionPool::new(vec![inert(1), inert(2), inert(3)]);
        let set = ParallelReplicas::from_pool(&pool, Settings::default(), None, false, true)
            .await
            .unwrap();
        assert_eq!(set.size(), 3);
        assert_eq!(
            set.dump_addresses(),
            "10.0.0.1:9000; 10.0.0.2:9000; 10.0.0.3:9000"
        );
    }

    #[tokio::test]
    async fn test_from_pool_duplicate_id_rejected() {
        let pool = crate::pool::StaticConnectionPool::new(vec![inert(7), inert(7)]);
        let result =
            ParallelReplicas::from_pool(&pool, Settings::default(), None, false, true).await;
        assert!(matches!(result, Err(ClientError::DuplicateReplica(7))));
    }

    #[tokio::test]
    async fn test_receive_before_send_fails() {
        let set = ParallelReplicas::new(inert(1), Settings::default(), None);
        assert!(matches!(
            set.receive_packet().await,
            Err(ClientError::QueryNotSent)
        ));
    }

    #[tokio::test]
    async fn test_extra_info_not_requested() {
        let set = ParallelReplicas::new(inert(1), Settings::default(), None);
        assert!(matches!(
            set.get_block_extra_info(),
            Err(ClientError::ExtraInfoNotRequested)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let set = ParallelReplicas::new(inert(1), Settings::default(), None);
        set.disconnect();
        assert_eq!(set.active_count(), 0);
        set.disconnect();
        assert_eq!(set.active_count(), 0);
        assert_eq!(set.size(), 1);
    }
}
