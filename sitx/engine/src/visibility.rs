//! Snapshot-isolation visibility rules.
//!
//! Evaluated per cell version encountered during a read. A resolved stamp
//! below the reader's begin point is the fast path and needs no registry
//! lookup; everything else consults the writer's record. Additive
//! transactions outside each other's ancestor chain are mutually blind even
//! after commit, so parallel bulk writers never observe each other's rows
//! mid-stream.

use sitx_txn::transaction::{TxnRecord, TxnState};

use crate::error::{SiResult, TransactionError};
use crate::registry::{TransactionRegistry, TxnRelation};
use crate::store::CellVersion;

/// Whether `version` is visible to `reader`.
pub fn is_visible(
    registry: &TransactionRegistry,
    reader: &TxnRecord,
    version: &CellVersion,
) -> SiResult<bool> {
    let writer_id = version.writer();

    // A transaction always sees its own writes.
    if writer_id == reader.id {
        return Ok(true);
    }

    // Rolled-forward stamp below the snapshot cut: visible without touching
    // the registry. Additive readers skip this path; the writer could be an
    // additive relative they must stay blind to.
    if version.is_resolved() && !reader.additive && version.stamp() < reader.begin_ts {
        return Ok(true);
    }

    let Some(writer) = registry.lookup(writer_id)? else {
        if registry.ignore_missing_txn() {
            return Ok(false);
        }
        return Err(TransactionError::UnknownTransaction(writer_id).into());
    };

    if matches!(writer.state, TxnState::RolledBack | TxnState::Error) {
        return Ok(false);
    }

    match registry.relation(reader, &writer)? {
        TxnRelation::Same => Ok(true),
        // The writer is an ancestor: a child works inside its parent's
        // uncommitted state, so active and committed ancestors are both
        // visible.
        TxnRelation::SecondIsAncestor => Ok(true),
        // The writer is a descendant: visible once it has committed back
        // into the chain.
        TxnRelation::FirstIsAncestor => Ok(writer.is_committed()),
        TxnRelation::Unrelated => {
            if reader.additive && writer.additive {
                return Ok(false);
            }
            if !writer.is_committed() {
                return Ok(false);
            }
            // Classic snapshot cut at the reader's begin point, against the
            // chain-wide commit timestamp.
            match registry.global_commit_ts(&writer)? {
                Some(global) => Ok(global < reader.begin_ts),
                None => Ok(false),
            }
        }
    }
}

/// The winning version of a row for `reader`: versions are scanned most
/// recent writer first, and the first visible one wins. `None` means the
/// reader sees no version at all; a visible tombstone is returned as-is.
pub fn visible_version(
    registry: &TransactionRegistry,
    reader: &TxnRecord,
    versions: &[CellVersion],
) -> SiResult<Option<CellVersion>> {
    for version in versions {
        if is_visible(registry, reader, version)? {
            return Ok(Some(version.clone()));
        }
    }
    Ok(None)
}
