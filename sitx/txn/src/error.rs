use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimestampError {
    #[error("expected commit-ts, but got txn-id ({0})")]
    WrongDomainCommit(u64),

    #[error("commit-ts overflow, reached {0}")]
    CommitTsOverflow(u64),

    #[error("timestamp allocation timed out after {0:?}")]
    AllocationTimeout(Duration),
}
