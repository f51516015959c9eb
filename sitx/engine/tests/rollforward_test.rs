mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::*;
use sitx_common::types::RowKey;
use sitx_engine::SiEngine;

fn wait_until_resolved(engine: &SiEngine, key: &RowKey) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let versions = engine.store().row_versions(key);
        if !versions.is_empty() && versions.iter().all(|v| v.is_resolved()) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ========== STAGED ROLLFORWARD ==========

#[test]
fn test_commit_rolls_forward_written_cells() {
    let engine = create_test_engine();
    let txn = engine.begin().unwrap();
    engine.write(txn.id, &row("k1"), value("v1")).unwrap();

    // In flight: still stamped with the writer id.
    assert!(!engine.store().row_versions(&row("k1"))[0].is_resolved());

    let commit_ts = engine.commit(txn.id).unwrap();
    assert!(wait_until_resolved(&engine, &row("k1")));
    assert_eq!(engine.store().row_versions(&row("k1"))[0].stamp(), commit_ts);
}

#[test]
fn test_chain_commit_rolls_forward_to_root_timestamp() {
    let engine = create_test_engine();
    let root = engine.begin().unwrap();
    let child = engine.begin_child(root.id, false).unwrap();
    engine.write(child.id, &row("k1"), value("v1")).unwrap();

    // Child alone cannot resolve; the chain is still open. This lands the
    // row in the slow lane until the root commits.
    engine.commit(child.id).unwrap();
    let root_commit = engine.commit(root.id).unwrap();

    assert!(wait_until_resolved(&engine, &row("k1")));
    let version = &engine.store().row_versions(&row("k1"))[0];
    assert_eq!(version.stamp(), root_commit);
    assert_eq!(version.writer(), child.id);
}

// ========== LAZY READ RESOLUTION ==========

#[test]
fn test_read_submits_unresolved_cells_for_resolution() {
    let engine = create_test_engine();
    let writer = engine.begin().unwrap();
    engine.write(writer.id, &row("k1"), value("v1")).unwrap();
    // Commit through the registry directly: nothing enqueued to the ladder,
    // so only the read path can trigger resolution.
    engine.registry().commit(writer.id).unwrap();

    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(reader.id, &row("k1")).unwrap(), Some(value("v1")));
    assert!(wait_until_resolved(&engine, &row("k1")));
}

#[test]
fn test_read_resolution_purges_rolled_back_cells() {
    let engine = create_test_engine();
    let writer = engine.begin().unwrap();
    engine.write(writer.id, &row("k1"), value("v1")).unwrap();
    engine.registry().rollback(writer.id).unwrap();

    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(reader.id, &row("k1")).unwrap(), None);

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if engine.store().row_versions(&row("k1")).is_empty() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("rolled-back version was never purged");
}

// ========== EAGER (COMPACTION-TIME) RESOLUTION ==========

#[test]
fn test_compaction_resolves_committed_and_purges_dead() {
    let engine = create_test_engine();

    let committed = engine.begin().unwrap();
    engine.write(committed.id, &row("live"), value("v")).unwrap();
    engine.registry().commit(committed.id).unwrap();

    let dead = engine.begin().unwrap();
    engine.write(dead.id, &row("dead"), value("v")).unwrap();
    engine.registry().rollback(dead.id).unwrap();

    let stats = engine.compact(Duration::from_secs(1)).unwrap();
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.purged, 1);

    assert!(engine.store().row_versions(&row("live"))[0].is_resolved());
    assert!(engine.store().row_versions(&row("dead")).is_empty());
}

#[test]
fn test_rollforward_is_idempotent_and_preserves_visibility() {
    let engine = create_test_engine();
    let writer = engine.begin().unwrap();
    engine.write(writer.id, &row("k1"), value("v1")).unwrap();

    // Snapshot taken before the writer commits.
    let before = engine.begin().unwrap();
    engine.registry().commit(writer.id).unwrap();

    let first = engine.compact(Duration::from_secs(1)).unwrap();
    assert_eq!(first.resolved, 1);
    let stamped = engine.store().row_versions(&row("k1"))[0].clone();

    // Resolving an already-resolved cell is a no-op.
    let second = engine.compact(Duration::from_secs(1)).unwrap();
    assert_eq!(second.resolved, 0);
    assert_eq!(engine.store().row_versions(&row("k1"))[0], stamped);

    // Resolution changed lookup cost, not outcomes: a reader begun before
    // the commit still does not see the write, a later one does.
    assert_eq!(engine.read(before.id, &row("k1")).unwrap(), None);
    let after = engine.begin().unwrap();
    assert_eq!(engine.read(after.id, &row("k1")).unwrap(), Some(value("v1")));
}

#[test]
fn test_explicit_resolution_handoff() {
    let engine = create_test_engine();
    let writer = engine.begin().unwrap();
    engine.write(writer.id, &row("k1"), value("v1")).unwrap();
    engine.registry().commit(writer.id).unwrap();

    engine.submit_for_resolution(&[row("k1")], writer.id);
    assert!(wait_until_resolved(&engine, &row("k1")));
}
