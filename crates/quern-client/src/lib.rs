//! Quern Client - replica connections and parallel query execution
//!
//! This crate provides:
//! - The `Packet` wire model consumed by the query executor
//! - `Connection` / `ConnectionPool` traits over established replica
//!   connections, plus a fixed-list pool
//! - `ParallelReplicas`: one query fanned out over a set of replica
//!   connections, with multiplexed receive, per-replica failure
//!   absorption and cross-task cancellation

pub mod connection;
pub mod error;
pub mod packet;
pub mod parallel_replicas;
pub mod pool;
pub mod throttler;

pub use connection::{Connection, ConnectionEntry, QueryProcessingStage, Settings};
pub use error::{ClientError, Result};
pub use packet::{Block, BlockExtraInfo, ExternalTableData, Packet, Progress, ProfileInfo, ServerException};
pub use parallel_replicas::ParallelReplicas;
pub use pool::{ConnectionPool, StaticConnectionPool};
pub use throttler::{CountingThrottler, Throttler};
