mod common;

use common::*;
use sitx_engine::{SiError, TransactionError};

// ========== SELF-VISIBILITY ==========

#[test]
fn test_transaction_sees_its_own_uncommitted_writes() {
    let engine = create_test_engine();
    let txn = engine.begin().unwrap();

    engine.write(txn.id, &row("k1"), value("v1")).unwrap();
    assert_eq!(engine.read(txn.id, &row("k1")).unwrap(), Some(value("v1")));

    // Overwrite within the same transaction.
    engine.write(txn.id, &row("k1"), value("v2")).unwrap();
    assert_eq!(engine.read(txn.id, &row("k1")).unwrap(), Some(value("v2")));
}

#[test]
fn test_uncommitted_writes_invisible_to_others() {
    let engine = create_test_engine();
    let writer = engine.begin().unwrap();
    let reader = engine.begin().unwrap();

    engine.write(writer.id, &row("k1"), value("v1")).unwrap();
    assert_eq!(engine.read(reader.id, &row("k1")).unwrap(), None);
}

// ========== SNAPSHOT CUT ==========

#[test]
fn test_reader_begun_after_commit_sees_the_write() {
    let engine = create_test_engine();
    let writer = engine.begin().unwrap();
    engine.write(writer.id, &row("k1"), value("v1")).unwrap();
    engine.commit(writer.id).unwrap();

    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(reader.id, &row("k1")).unwrap(), Some(value("v1")));
}

#[test]
fn test_reader_begun_before_commit_never_sees_the_write() {
    let engine = create_test_engine();
    let writer = engine.begin().unwrap();
    engine.write(writer.id, &row("k1"), value("v1")).unwrap();

    let reader = engine.begin().unwrap();
    engine.commit(writer.id).unwrap();

    // The commit happened after the reader's begin point; repeated reads
    // stay on the same snapshot.
    assert_eq!(engine.read(reader.id, &row("k1")).unwrap(), None);
    assert_eq!(engine.read(reader.id, &row("k1")).unwrap(), None);
}

#[test]
fn test_overwrite_resolves_to_most_recent_visible_version() {
    let engine = create_test_engine();
    let t1 = engine.begin().unwrap();
    engine.write(t1.id, &row("k1"), value("old")).unwrap();
    engine.commit(t1.id).unwrap();

    let t2 = engine.begin().unwrap();
    engine.write(t2.id, &row("k1"), value("new")).unwrap();
    engine.commit(t2.id).unwrap();

    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(reader.id, &row("k1")).unwrap(), Some(value("new")));
}

// ========== ROLLBACK ==========

#[test]
fn test_rolled_back_writes_visible_to_no_one() {
    let engine = create_test_engine();
    let writer = engine.begin().unwrap();
    engine.write(writer.id, &row("k1"), value("v1")).unwrap();
    engine.rollback(writer.id).unwrap();

    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(reader.id, &row("k1")).unwrap(), None);

    // Including the writer itself: the handle is dead after rollback.
    assert!(matches!(
        engine.read(writer.id, &row("k1")).unwrap_err(),
        SiError::Transaction(TransactionError::InvalidState { .. })
    ));
}

#[test]
fn test_parent_rollback_kills_committed_child_writes() {
    let engine = create_test_engine();
    let root = engine.begin().unwrap();
    let child = engine.begin_child(root.id, false).unwrap();
    engine.write(child.id, &row("k1"), value("v1")).unwrap();
    engine.commit(child.id).unwrap();

    engine.rollback(root.id).unwrap();

    // The child committed locally, but its chain never did.
    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(reader.id, &row("k1")).unwrap(), None);
}

// ========== PARENT / CHILD CHAINS ==========

#[test]
fn test_child_sees_active_parent_writes() {
    let engine = create_test_engine();
    let parent = engine.begin().unwrap();
    engine.write(parent.id, &row("k1"), value("v1")).unwrap();

    let child = engine.begin_child(parent.id, false).unwrap();
    assert_eq!(engine.read(child.id, &row("k1")).unwrap(), Some(value("v1")));
}

#[test]
fn test_parent_sees_child_writes_only_after_child_commit() {
    let engine = create_test_engine();
    let parent = engine.begin().unwrap();
    let child = engine.begin_child(parent.id, false).unwrap();
    engine.write(child.id, &row("k1"), value("v1")).unwrap();

    assert_eq!(engine.read(parent.id, &row("k1")).unwrap(), None);
    engine.commit(child.id).unwrap();
    assert_eq!(engine.read(parent.id, &row("k1")).unwrap(), Some(value("v1")));
}

#[test]
fn test_chain_commit_makes_writes_visible_at_root_commit_time() {
    let engine = create_test_engine();
    let root = engine.begin().unwrap();
    let child = engine.begin_child(root.id, false).unwrap();
    engine.write(child.id, &row("k1"), value("v1")).unwrap();
    engine.commit(child.id).unwrap();

    // Unrelated reader while the root is still active: invisible.
    let early = engine.begin().unwrap();
    assert_eq!(engine.read(early.id, &row("k1")).unwrap(), None);

    engine.commit(root.id).unwrap();
    let late = engine.begin().unwrap();
    assert_eq!(engine.read(late.id, &row("k1")).unwrap(), Some(value("v1")));
    // The early reader began before the chain's global commit point.
    assert_eq!(engine.read(early.id, &row("k1")).unwrap(), None);
}

#[test]
fn test_insert_then_delete_across_sibling_children() {
    let engine = create_test_engine();
    let parent = engine.begin().unwrap();

    let inserter = engine.begin_child(parent.id, false).unwrap();
    engine.write(inserter.id, &row("k1"), value("v1")).unwrap();
    engine.commit(inserter.id).unwrap();
    assert_eq!(engine.read(parent.id, &row("k1")).unwrap(), Some(value("v1")));

    let deleter = engine.begin_child(parent.id, false).unwrap();
    engine.delete(deleter.id, &row("k1")).unwrap();
    engine.commit(deleter.id).unwrap();

    // The tombstone from the second child wins in the parent's view.
    assert_eq!(engine.read(parent.id, &row("k1")).unwrap(), None);
}

// ========== SCANS ==========

#[test]
fn test_scan_skips_rolled_back_sibling_rows() {
    let engine = create_test_engine();
    let root = engine.begin().unwrap();

    // First additive child inserts "scott10", then rolls back.
    let aborted = engine.begin_child(root.id, true).unwrap();
    engine.write(aborted.id, &row("scott10"), value("age=30")).unwrap();
    engine.rollback(aborted.id).unwrap();

    // Its sibling inserts "scott11" and commits.
    let committed = engine.begin_child(root.id, true).unwrap();
    engine.write(committed.id, &row("scott11"), value("age=29")).unwrap();
    engine.commit(committed.id).unwrap();

    let rows = engine
        .scan(root.id, &row("scott10"), &row("scott12"))
        .unwrap();
    assert_eq!(rows, vec![(row("scott11"), value("age=29"))]);
}

#[test]
fn test_scan_respects_reader_snapshot() {
    let engine = create_test_engine();
    let t1 = engine.begin().unwrap();
    engine.write(t1.id, &row("a"), value("1")).unwrap();
    engine.commit(t1.id).unwrap();

    let reader = engine.begin().unwrap();

    let t2 = engine.begin().unwrap();
    engine.write(t2.id, &row("b"), value("2")).unwrap();
    engine.commit(t2.id).unwrap();

    // Only the row committed before the reader began is visible.
    let rows = engine.scan(reader.id, &row("a"), &row("z")).unwrap();
    assert_eq!(rows, vec![(row("a"), value("1"))]);
}
