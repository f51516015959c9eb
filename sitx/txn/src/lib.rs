//! Common transaction infrastructure for the sitx transaction engine.
//!
//! This crate provides the timestamp scheme, the timestamp authority and the
//! transaction record shared by the registry and the storage-facing engine.

pub mod error;
pub mod timestamp;
pub mod transaction;

pub use error::TimestampError;
// Re-export commonly used types
pub use timestamp::{Timestamp, TimestampAuthority, TxnId};
pub use transaction::{IsolationLevel, TxnRecord, TxnState};
