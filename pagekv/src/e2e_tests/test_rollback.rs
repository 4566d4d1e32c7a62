//! Rollback discards staged changes and hands pages back to the allocator.

use crate::e2e_tests::helpers::{TestDb, assert_pages_accounted, key};
use crate::storage::{TransactionError, TxState};

#[test]
fn test_rollback_pages_are_reused() {
    let t = TestDb::new(10);
    t.create("c");
    let before = t.db.stats().unwrap();

    let mut tx = t.db.write_tx().unwrap();
    let mut c = tx.get_collection(b"c").unwrap().unwrap();
    for i in 0..300 {
        c.put(key(i).as_bytes(), b"some value").unwrap();
    }
    tx.rollback().unwrap();

    let after = t.db.stats().unwrap();
    assert_eq!(after.tx_id, before.tx_id);
    assert!(after.free_pages > before.free_pages);
    assert_pages_accounted(&t.db);

    // The next commit allocates from the pages the rollback returned.
    t.put("c", "k", "v");
    assert_eq!(t.db.stats().unwrap().max_page, after.max_page);
    assert_pages_accounted(&t.db);
}

#[test]
fn test_dropped_write_tx_rolls_back() {
    let t = TestDb::new(11);
    t.create("c");
    {
        let mut tx = t.db.write_tx().unwrap();
        tx.get_collection(b"c")
            .unwrap()
            .unwrap()
            .put(b"k", b"v")
            .unwrap();
    }
    assert_eq!(t.get("c", "k"), None);
    assert_pages_accounted(&t.db);

    // The writer lock was released by the drop.
    t.put("c", "k", "v");
    assert_eq!(t.get("c", "k").as_deref(), Some("v"));
}

#[test]
fn test_finalized_tx_fails_fast() {
    let t = TestDb::new(12);
    t.create("c");

    let mut tx = t.db.write_tx().unwrap();
    tx.rollback().unwrap();
    assert_eq!(tx.state(), TxState::RolledBack);
    assert!(matches!(tx.commit(), Err(TransactionError::TransactionClosed)));
    assert!(matches!(
        tx.get_collection(b"c"),
        Err(TransactionError::TransactionClosed)
    ));
    assert!(matches!(
        tx.create_collection(b"d"),
        Err(TransactionError::TransactionClosed)
    ));
    drop(tx);

    let mut tx = t.db.write_tx().unwrap();
    tx.commit().unwrap();
    assert_eq!(tx.state(), TxState::Committed);
    assert!(matches!(tx.commit(), Err(TransactionError::TransactionClosed)));
    assert!(matches!(tx.rollback(), Err(TransactionError::TransactionClosed)));
}

#[test]
fn test_read_tx_commit_and_rollback_end_snapshot() {
    let t = TestDb::new(13);
    let mut a = t.db.read_tx().unwrap();
    let mut b = t.db.read_tx().unwrap();
    assert_eq!(t.db.stats().unwrap().open_readers, 2);

    a.commit().unwrap();
    b.rollback().unwrap();
    assert_eq!(t.db.stats().unwrap().open_readers, 0);
    assert!(matches!(a.commit(), Err(TransactionError::TransactionClosed)));
}
