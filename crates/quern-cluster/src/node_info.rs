//! Membership record codec
//!
//! One coordination-store entry per cluster node, with the node's
//! client-facing address as the payload.

use serde::{Deserialize, Serialize};

use quern_common::parse_host_port;

/// One membership record: the `host:port` address of a cluster node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: String,
}

impl NodeInfo {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Parse a store payload. Returns `None` for malformed payloads
    /// instead of failing; callers skip such entries.
    pub fn parse(data: &str) -> Option<Self> {
        parse_host_port(data)?;
        Some(Self {
            address: data.to_string(),
        })
    }

    /// The raw payload written to the coordination store.
    pub fn serialize(&self) -> String {
        self.address.clone()
    }

    pub fn host(&self) -> Option<String> {
        parse_host_port(&self.address).map(|(host, _)| host)
    }

    pub fn port(&self) -> Option<u16> {
        parse_host_port(&self.address).map(|(_, port)| port)
    }
}
