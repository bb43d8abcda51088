//! Query execution wire model
//!
//! The units a replica connection produces while running one query. This
//! core only routes and accounts for them; merging block contents is the
//! executor's job, so `Block` carries accounting only.

use serde::{Deserialize, Serialize};

use quern_common::parse_host_port;

/// One block of result data, reduced to its accounting dimensions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub rows: u64,
    pub bytes: u64,
}

impl Block {
    pub fn new(rows: u64, bytes: u64) -> Self {
        Self { rows, bytes }
    }
}

/// Auxiliary metadata attached to a returned data block, identifying the
/// replica it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockExtraInfo {
    pub host: String,
    pub resolved_address: String,
    pub port: u16,
    pub user: String,
}

impl BlockExtraInfo {
    /// Build extra info from a replica's `host:port` address.
    pub fn from_address(address: &str, user: impl Into<String>) -> Option<Self> {
        let (host, port) = parse_host_port(address)?;
        Some(Self {
            host,
            resolved_address: address.to_string(),
            port,
            user: user.into(),
        })
    }
}

/// Execution progress reported by a replica.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
}

/// Final profiling counters for one replica's part of the query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
}

/// A server-side failure forwarded through the stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerException {
    pub code: i32,
    pub message: String,
}

impl ServerException {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ServerException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server exception (code {}): {}", self.code, self.message)
    }
}

/// One unit of the client/server query protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Data {
        block: Block,
        extra_info: Option<BlockExtraInfo>,
    },
    Progress(Progress),
    ProfileInfo(ProfileInfo),
    EndOfStream,
    Exception(ServerException),
}

impl Packet {
    /// Whether this packet terminates the replica's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Packet::EndOfStream | Packet::Exception(_))
    }
}

/// External table payload broadcast to replicas before execution starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTableData {
    pub name: String,
    pub block: Block,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_info_from_address() {
        let info = BlockExtraInfo::from_address("10.0.0.1:9000", "default").unwrap();
        assert_eq!(info.host, "10.0.0.1");
        assert_eq!(info.port, 9000);
        assert_eq!(info.resolved_address, "10.0.0.1:9000");

        assert!(BlockExtraInfo::from_address("garbage", "default").is_none());
    }

    #[test]
    fn test_terminal_packets() {
        assert!(Packet::EndOfStream.is_terminal());
        assert!(Packet::Exception(ServerException::new(1, "boom")).is_terminal());
        assert!(!Packet::Progress(Progress::default()).is_terminal());
        assert!(
            !Packet::Data {
                block: Block::new(1, 8),
                extra_info: None
            }
            .is_terminal()
        );
    }
}
