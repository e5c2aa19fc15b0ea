//! Crate-level tests: transaction scenarios over real maps and handlers.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use kestrel_common::config::StoreConfig;
use kestrel_common::datum::Datum;
use kestrel_common::error::{KestrelError, TxnError};

use crate::engine::TransactionEngine;
use crate::redo::RedoWriter;
use crate::transaction::TxnState;
use crate::undo::UndoLog;

fn engine() -> Arc<TransactionEngine> {
    TransactionEngine::new(StoreConfig::in_memory(), None).unwrap()
}

fn engine_with(config: StoreConfig) -> Arc<TransactionEngine> {
    TransactionEngine::new(config, None).unwrap()
}

fn int(k: i64) -> Datum {
    Datum::Int(k)
}

fn text(s: &str) -> Datum {
    Datum::Text(s.into())
}

fn snapshot(map: &crate::tmap::TransactionMap) -> Vec<(Datum, Datum)> {
    map.cursor(None, None).collect()
}

/// Vacant-cell purges land asynchronously on the handler pool.
fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_put_get_within_transaction() {
    let engine = engine();
    let txn = engine.begin();
    let map = engine.open_transaction_map("t1", &txn).unwrap();
    map.put(int(1), text("a")).unwrap();
    assert_eq!(map.get(&int(1)), Some(text("a")));

    // Another transaction cannot see the uncommitted write.
    let other = engine.begin();
    let other_map = engine.open_transaction_map("t1", &other).unwrap();
    assert_eq!(other_map.get(&int(1)), None);

    txn.commit().unwrap();
    assert_eq!(other_map.get(&int(1)), Some(text("a")));
    other.commit().unwrap();
}

#[test]
fn test_remove_then_get_is_absent() {
    let engine = engine();
    let txn = engine.begin();
    let map = engine.open_transaction_map("t2", &txn).unwrap();
    map.put(int(1), text("a")).unwrap();
    txn.commit().unwrap();

    let txn = engine.begin();
    let map = engine.open_transaction_map("t2", &txn).unwrap();
    assert_eq!(map.remove(int(1)).unwrap(), Some(text("a")));
    assert_eq!(map.get(&int(1)), None);
    txn.commit().unwrap();

    let txn = engine.begin();
    let map = engine.open_transaction_map("t2", &txn).unwrap();
    assert_eq!(map.get(&int(1)), None);
    // The committed remove physically purges the cell.
    assert!(wait_until(2000, || map.raw_map().size() == 0));
    txn.rollback().unwrap();
}

#[test]
fn test_rollback_restores_pre_transaction_state() {
    let engine = engine();
    let setup = engine.begin();
    let map = engine.open_transaction_map("t3", &setup).unwrap();
    for k in 1..=10 {
        map.put(int(k), text(&format!("v{k}"))).unwrap();
    }
    setup.commit().unwrap();

    let txn = engine.begin();
    let map = engine.open_transaction_map("t3", &txn).unwrap();
    let before = snapshot(&map);

    for k in 1..=10 {
        map.put(int(k), text("dirty")).unwrap();
    }
    map.put(int(99), text("extra")).unwrap();
    map.remove(int(5)).unwrap();
    txn.rollback().unwrap();

    let check = engine.begin();
    let map = engine.open_transaction_map("t3", &check).unwrap();
    assert_eq!(snapshot(&map), before);
    assert!(wait_until(2000, || map.raw_map().size() == 10));
    check.rollback().unwrap();
}

#[test]
fn test_savepoint_rollback_scenario() {
    // put(1,a); savepoint s; put(1,b); put(2,c); rollback to s; commit.
    let engine = engine();
    let txn = engine.begin();
    let map = engine.open_transaction_map("t4", &txn).unwrap();
    map.put(int(1), text("a")).unwrap();
    txn.add_savepoint("s");
    map.put(int(1), text("b")).unwrap();
    map.put(int(2), text("c")).unwrap();
    txn.rollback_to_savepoint("s").unwrap();
    txn.commit().unwrap();

    let check = engine.begin();
    let map = engine.open_transaction_map("t4", &check).unwrap();
    assert_eq!(map.get(&int(1)), Some(text("a")));
    assert_eq!(map.get(&int(2)), None);
    check.rollback().unwrap();
}

#[test]
fn test_savepoint_rollback_is_idempotent() {
    let engine = engine();
    let txn = engine.begin();
    let map = engine.open_transaction_map("t5", &txn).unwrap();
    map.put(int(1), text("base")).unwrap();
    txn.add_savepoint("s");
    map.put(int(2), text("x")).unwrap();
    map.put(int(3), text("y")).unwrap();
    txn.rollback_to_savepoint("s").unwrap();
    txn.rollback_to_savepoint("s").unwrap();
    assert_eq!(txn.undo_log_len(), 1);
    txn.commit().unwrap();

    let check = engine.begin();
    let map = engine.open_transaction_map("t5", &check).unwrap();
    assert_eq!(map.get(&int(1)), Some(text("base")));
    assert_eq!(map.get(&int(2)), None);
    assert_eq!(map.get(&int(3)), None);
    check.rollback().unwrap();
}

#[test]
fn test_unknown_savepoint_is_an_error() {
    let engine = engine();
    let txn = engine.begin();
    assert!(matches!(
        txn.rollback_to_savepoint("nope"),
        Err(KestrelError::Txn(TxnError::UnknownSavepoint(_)))
    ));
    txn.rollback().unwrap();
}

#[test]
fn test_row_lock_wait_and_wake() {
    // S3: A writes key 42 uncommitted; B blocks in Waiting; A commits;
    // B completes and its undo log holds the new value.
    let engine = engine();
    let a = engine.begin();
    let map_a = engine.open_transaction_map("t6", &a).unwrap();
    map_a.put(int(42), text("from-a")).unwrap();

    let b = engine.begin();
    let b_id = b.id();
    let engine2 = Arc::clone(&engine);
    let b2 = Arc::clone(&b);
    let waiter = std::thread::spawn(move || {
        let map_b = engine2.open_transaction_map("t6", &b2).unwrap();
        map_b.put(int(42), text("from-b")).unwrap();
        assert_eq!(map_b.get(&int(42)), Some(text("from-b")));
        assert_eq!(b2.undo_log_len(), 1);
    });

    // B must reach Waiting before A commits.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while engine
        .get_transaction(b_id)
        .map(|t| t.state())
        .unwrap_or(TxnState::Closed)
        != TxnState::Waiting
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(engine.get_transaction(b_id).unwrap().state(), TxnState::Waiting);

    a.commit().unwrap();
    waiter.join().unwrap();

    b.commit().unwrap();
    let check = engine.begin();
    let map = engine.open_transaction_map("t6", &check).unwrap();
    assert_eq!(map.get(&int(42)), Some(text("from-b")));
    check.rollback().unwrap();
}

#[test]
fn test_waiters_wake_in_fifo_order() {
    let engine = engine();
    let a = engine.begin();
    let map_a = engine.open_transaction_map("t7", &a).unwrap();
    map_a.put(int(1), text("a")).unwrap();

    let order: Arc<parking_lot::Mutex<Vec<u64>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for tag in 1..=3u64 {
        let engine = Arc::clone(&engine);
        let order = Arc::clone(&order);
        let txn = engine.begin();
        handles.push(std::thread::spawn(move || {
            let map = engine.open_transaction_map("t7", &txn).unwrap();
            map.put(int(1), text(&format!("w{tag}"))).unwrap();
            order.lock().push(tag);
            txn.commit().unwrap();
        }));
        // Stagger arrivals so the queue order is deterministic.
        std::thread::sleep(Duration::from_millis(30));
    }

    a.commit().unwrap();
    for h in handles {
        h.join().unwrap();
    }
    // Waiters woke one at a time; each saw the lock of the previous.
    assert_eq!(order.lock().len(), 3);
}

#[test]
fn test_deadlock_detected_and_detecting_txn_aborts() {
    let engine = engine();
    let a = engine.begin();
    let b = engine.begin();
    let map_a = engine.open_transaction_map("t8", &a).unwrap();
    let map_b = engine.open_transaction_map("t8", &b).unwrap();

    map_a.put(int(1), text("a1")).unwrap();
    map_b.put(int(2), text("b2")).unwrap();

    // A blocks on key 2 (held by B).
    let engine2 = Arc::clone(&engine);
    let a2 = Arc::clone(&a);
    let blocked = std::thread::spawn(move || {
        let map = engine2.open_transaction_map("t8", &a2).unwrap();
        map.put(int(2), text("a2")).unwrap();
        a2.commit().unwrap();
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while a.state() != TxnState::Waiting && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }

    // B now writes key 1 (held by A): a cycle, so B aborts fatally.
    let result = map_b.put(int(1), text("b1"));
    assert!(matches!(
        result,
        Err(KestrelError::Txn(TxnError::Deadlock(_, _)))
    ));
    assert_eq!(b.state(), TxnState::Closed);

    // B's abort released key 2, so A completes.
    blocked.join().unwrap();
}

#[test]
fn test_lock_wait_timeout_aborts_waiter() {
    let engine = engine_with(StoreConfig {
        in_memory: true,
        lock_timeout_ms: 50,
        ..Default::default()
    });
    let a = engine.begin();
    let map_a = engine.open_transaction_map("t9", &a).unwrap();
    map_a.put(int(1), text("a")).unwrap();

    let b = engine.begin();
    let map_b = engine.open_transaction_map("t9", &b).unwrap();
    let result = map_b.put(int(1), text("b"));
    assert!(matches!(
        result,
        Err(KestrelError::Txn(TxnError::LockTimeout(_)))
    ));
    assert_eq!(b.state(), TxnState::Closed);
    a.commit().unwrap();
}

#[test]
fn test_put_if_absent_semantics() {
    let engine = engine();
    let txn = engine.begin();
    let map = engine.open_transaction_map("t10", &txn).unwrap();
    assert_eq!(map.put_if_absent(int(1), text("v1")).unwrap(), None);
    assert_eq!(
        map.put_if_absent(int(1), text("v2")).unwrap(),
        Some(text("v1"))
    );
    assert_eq!(map.get(&int(1)), Some(text("v1")));
    txn.commit().unwrap();
}

#[test]
fn test_lock_row_blocks_writers() {
    let engine = engine();
    let setup = engine.begin();
    let map = engine.open_transaction_map("t11", &setup).unwrap();
    map.put(int(1), text("v")).unwrap();
    setup.commit().unwrap();

    let reader = engine.begin();
    let map_r = engine.open_transaction_map("t11", &reader).unwrap();
    map_r.lock_row(int(1)).unwrap();
    assert_eq!(map_r.get(&int(1)), Some(text("v")));

    let writer = engine.begin();
    let w_id = writer.id();
    let engine2 = Arc::clone(&engine);
    let w2 = Arc::clone(&writer);
    let t = std::thread::spawn(move || {
        let map_w = engine2.open_transaction_map("t11", &w2).unwrap();
        map_w.put(int(1), text("w")).unwrap();
        w2.commit().unwrap();
    });
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while engine
        .get_transaction(w_id)
        .map(|t| t.state())
        .unwrap_or(TxnState::Closed)
        != TxnState::Waiting
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(2));
    }
    // FOR UPDATE held the row; releasing it lets the writer through.
    reader.commit().unwrap();
    t.join().unwrap();
}

#[test]
fn test_append_through_transaction() {
    let engine = engine();
    let txn = engine.begin();
    let map = engine.open_transaction_map("t12", &txn).unwrap();
    let k1 = map.append(text("a")).unwrap();
    let k2 = map.append(text("b")).unwrap();
    assert_eq!(k1, int(1));
    assert_eq!(k2, int(2));
    txn.rollback().unwrap();

    // Aborted appends leave no visible rows.
    let check = engine.begin();
    let map = engine.open_transaction_map("t12", &check).unwrap();
    assert_eq!(map.count_visible(), 0);
    check.rollback().unwrap();
}

#[test]
fn test_commit_persists_redo_before_acknowledge() {
    let dir = TempDir::new().unwrap();
    let engine = TransactionEngine::new(
        StoreConfig::default(),
        Some(dir.path().to_path_buf()),
    )
    .unwrap();
    let txn = engine.begin();
    let map = engine.open_transaction_map("t13", &txn).unwrap();
    map.put(int(1), text("durable")).unwrap();
    map.put(int(2), text("also")).unwrap();
    txn.commit().unwrap();

    let buffers = RedoWriter::read_all(&dir.path().join("redo")).unwrap();
    assert_eq!(buffers.len(), 1);
    let entries = UndoLog::parse_redo_buffer(&buffers[0].1);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].map_name, "t13");
    assert_eq!(entries[0].value, Some(text("durable")));
}

#[test]
fn test_committed_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = TransactionEngine::new(
            StoreConfig::default(),
            Some(dir.path().to_path_buf()),
        )
        .unwrap();
        let txn = engine.begin();
        let map = engine.open_transaction_map("t14", &txn).unwrap();
        for k in 1..=50 {
            map.put(int(k), text(&format!("v{k}"))).unwrap();
        }
        txn.commit().unwrap();
        engine.save_all().unwrap();
        engine.close();
    }
    let engine = TransactionEngine::new(
        StoreConfig::default(),
        Some(dir.path().to_path_buf()),
    )
    .unwrap();
    let txn = engine.begin();
    let map = engine.open_transaction_map("t14", &txn).unwrap();
    assert_eq!(map.get(&int(25)), Some(text("v25")));
    assert_eq!(map.count_visible(), 50);
    txn.rollback().unwrap();
}

#[test]
fn test_read_uncommitted_visibility_predicate() {
    let engine = engine();
    let writer = engine.begin();
    let map_w = engine.open_transaction_map("t15", &writer).unwrap();
    map_w.put(int(1), text("staged")).unwrap();

    let reader = engine.begin();
    let map_r = engine.open_transaction_map("t15", &reader).unwrap();
    // Default read-committed view.
    assert_eq!(map_r.get(&int(1)), None);
    // A read-uncommitted predicate sees the staged value.
    let dirty = map_r.get_with(&int(1), |cell| cell.read(cell.owner()));
    assert_eq!(dirty, Some(text("staged")));
    writer.rollback().unwrap();
    reader.rollback().unwrap();
}

#[test]
fn test_commit_async_runs_task_after_commit() {
    let engine = engine();
    let txn = engine.begin();
    let map = engine.open_transaction_map("t16", &txn).unwrap();
    map.put(int(1), text("async")).unwrap();

    let listener = kestrel_storage::SyncListener::new();
    let handler = listener.handler();
    txn.commit_async(Box::new(move |result| {
        handler(match result {
            Ok(()) => kestrel_common::types::AsyncResult::succeeded(true),
            Err(e) => kestrel_common::types::AsyncResult::failed(e),
        });
    }));
    let result = listener.await_result();
    assert_eq!(result.into_result().unwrap(), Some(true));
    assert_eq!(txn.state(), TxnState::Closed);
}

#[test]
fn test_transaction_states() {
    let engine = engine();
    let txn = engine.begin();
    assert_eq!(txn.state(), TxnState::Open);
    txn.commit().unwrap();
    assert_eq!(txn.state(), TxnState::Closed);
    // Committing a closed transaction is rejected.
    assert!(txn.commit().is_err());
    // Rolling back a closed transaction is a no-op.
    assert!(txn.rollback().is_ok());
}
