//! Quern Common - shared error types and utilities
//!
//! This crate provides:
//! - `QuernError`: application-wide error enum and `Result` alias
//! - Address parsing helpers shared by the cluster and client crates

pub mod error;
pub mod utils;

pub use error::{QuernError, Result};
pub use utils::parse_host_port;
