//! Write-write conflict detection.
//!
//! A write is checked against every prior writer of the same row that is
//! still active or committed after the candidate began. Relatives in the
//! transaction tree may overwrite each other; additive transactions under
//! the same direct parent tolerate each other; everything else conflicts.
//! A prior writer whose heartbeat has expired is rolled back on the spot
//! and loses the row.

use sitx_common::types::RowKey;
use sitx_txn::timestamp::TxnId;
use sitx_txn::transaction::TxnRecord;
use tracing::warn;

use crate::error::{SiError, SiResult, TransactionError};
use crate::registry::{TransactionRegistry, TxnRelation};
use crate::store::CellVersion;

/// Decide whether `writer` may write `row` given the row's existing
/// versions. Returns `Ok(())` to allow the write, or
/// [`TransactionError::WriteConflict`] naming both transactions.
pub fn check_write(
    registry: &TransactionRegistry,
    writer: &TxnRecord,
    row: &RowKey,
    prior: &[CellVersion],
) -> SiResult<()> {
    for version in prior {
        let theirs = version.writer();
        if theirs == writer.id {
            continue;
        }

        // A resolved stamp below our begin point is ordinary committed
        // history; overwriting it is the normal case and needs no registry
        // lookup.
        if version.is_resolved() && version.stamp() <= writer.begin_ts {
            continue;
        }

        let Some(other) = registry.lookup(theirs)? else {
            if registry.ignore_missing_txn() {
                continue;
            }
            return Err(TransactionError::UnknownTransaction(theirs).into());
        };

        match registry.relation(writer, &other)? {
            // A transaction may always overwrite data written by itself,
            // its ancestors or its own sub-transactions.
            TxnRelation::Same | TxnRelation::FirstIsAncestor | TxnRelation::SecondIsAncestor => {
                continue;
            }
            TxnRelation::Unrelated => {}
        }

        if TransactionRegistry::additive_siblings(writer, &other) {
            continue;
        }

        if other.is_active() {
            if registry.is_timed_out(&other) {
                warn!(
                    abandoned = other.id.raw(),
                    winner = writer.id.raw(),
                    "rolling back abandoned transaction losing a write conflict"
                );
                match registry.rollback(other.id) {
                    Ok(_) => continue,
                    // Lost the race: the writer resolved itself meanwhile,
                    // re-check below with its fresh state.
                    Err(SiError::Transaction(TransactionError::InvalidState { .. })) => {}
                    Err(e) => return Err(e),
                }
                let Some(fresh) = registry.lookup(theirs)? else {
                    continue;
                };
                if fresh.is_committed() && committed_after(registry, &fresh, writer)? {
                    return Err(conflict(writer, theirs, row));
                }
                continue;
            }
            return Err(conflict(writer, theirs, row));
        }

        if other.is_committed() {
            if committed_after(registry, &other, writer)? {
                return Err(conflict(writer, theirs, row));
            }
            continue;
        }

        // Rolled back or errored: its write is dead.
    }
    Ok(())
}

/// Whether `other` committed after `writer` began.
fn committed_after(
    registry: &TransactionRegistry,
    other: &TxnRecord,
    writer: &TxnRecord,
) -> SiResult<bool> {
    // Prefer the chain-wide timestamp when it is already resolved; a locally
    // committed transaction under a still-active chain is treated by its
    // local commit point.
    let commit_ts = registry
        .global_commit_ts(other)?
        .or(other.commit_ts);
    Ok(commit_ts.is_none_or(|ts| ts > writer.begin_ts))
}

fn conflict(writer: &TxnRecord, theirs: TxnId, row: &RowKey) -> SiError {
    TransactionError::WriteConflict {
        ours: writer.id,
        theirs,
        row: row.clone(),
    }
    .into()
}
