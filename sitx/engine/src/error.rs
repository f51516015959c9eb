use sitx_common::types::RowKey;
use sitx_txn::error::TimestampError;
use sitx_txn::timestamp::TxnId;
use thiserror::Error;

pub type SiResult<T> = Result<T, SiError>;

#[derive(Error, Debug)]
pub enum SiError {
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Write-Write conflict on row {row}: txn {ours:?} vs txn {theirs:?}")]
    WriteConflict { ours: TxnId, theirs: TxnId, row: RowKey },
    #[error("Transaction {0:?} exceeded its keep-alive timeout")]
    Timeout(TxnId),
    #[error("Unknown transaction: {0:?}")]
    UnknownTransaction(TxnId),
    #[error("Invalid state for transaction {id:?}: {reason}")]
    InvalidState { id: TxnId, reason: String },
    #[error("Timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry storage unavailable: {0}")]
    Unavailable(String),
    #[error("Corrupt record for transaction {0:?}")]
    CorruptRecord(TxnId),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Row {0} already carries a version from txn {1:?}")]
    VersionExists(RowKey, TxnId),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
