//! Client error types
//!
//! Per-replica faults (`ReplicaUnreachable`) are absorbed by
//! `ParallelReplicas` while at least one replica survives; only
//! `NoActiveReplicas` is fatal to the running query.

/// Error type for replica connection and query multiplexing operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("replica {address} unreachable: {reason}")]
    ReplicaUnreachable { address: String, reason: String },

    #[error("no replicas left to read from")]
    NoActiveReplicas,

    #[error("query already sent")]
    QueryAlreadySent,

    #[error("cannot receive packets: query was not sent")]
    QueryNotSent,

    #[error("drain requires cancellation to be in progress")]
    NotCancelled,

    #[error("block extra info was not requested")]
    ExtraInfoNotRequested,

    #[error("duplicate replica id {0}")]
    DuplicateReplica(u64),

    #[error("connection closed")]
    Disconnected,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn unreachable(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::ReplicaUnreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClientError::NoActiveReplicas;
        assert_eq!(err.to_string(), "no replicas left to read from");

        let err = ClientError::unreachable("10.0.0.1:9000", "broken pipe");
        assert_eq!(
            err.to_string(),
            "replica 10.0.0.1:9000 unreachable: broken pipe"
        );

        let err = ClientError::QueryNotSent;
        assert_eq!(err.to_string(), "cannot receive packets: query was not sent");
    }
}
