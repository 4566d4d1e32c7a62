//! Creating, listing and deleting collections.

use crate::e2e_tests::helpers::{TestDb, assert_pages_accounted, key};
use crate::storage::TransactionError;

#[test]
fn test_collections_are_independent() {
    let t = TestDb::new(40);
    t.create("users");
    t.create("orders");
    t.put("users", "1", "alice");
    t.put("orders", "1", "book");

    assert_eq!(t.get("users", "1").as_deref(), Some("alice"));
    assert_eq!(t.get("orders", "1").as_deref(), Some("book"));

    let mut tx = t.db.read_tx().unwrap();
    assert_eq!(
        tx.collections().unwrap(),
        vec![b"orders".to_vec(), b"users".to_vec()]
    );
    assert!(tx.get_collection(b"missing").unwrap().is_none());
}

#[test]
fn test_create_existing_collection_fails() {
    let t = TestDb::new(41);
    t.create("users");

    let mut tx = t.db.write_tx().unwrap();
    assert!(matches!(
        tx.create_collection(b"users"),
        Err(TransactionError::CollectionExists(name)) if name == "users"
    ));
    assert!(matches!(
        tx.delete_collection(b"nope"),
        Err(TransactionError::CollectionNotFound(_))
    ));
    assert!(matches!(
        tx.create_collection(b""),
        Err(TransactionError::EmptyKey)
    ));
}

#[test]
fn test_read_tx_cannot_change_collections() {
    let t = TestDb::new(42);
    t.create("users");

    let mut tx = t.db.read_tx().unwrap();
    assert!(matches!(
        tx.create_collection(b"other"),
        Err(TransactionError::WriteInsideReadTx)
    ));
    assert!(matches!(
        tx.delete_collection(b"users"),
        Err(TransactionError::WriteInsideReadTx)
    ));
}

#[test]
fn test_delete_collection_frees_its_tree() {
    let t = TestDb::new(43);
    t.create("keep");
    t.create("big");
    t.put("keep", "k", "v");
    t.db.update(|tx| {
        let mut c = tx.get_collection(b"big")?.unwrap();
        for i in 0..400 {
            c.put(key(i).as_bytes(), &[1; 50])?;
        }
        Ok(())
    })
    .unwrap();
    let before = t.db.stats().unwrap();

    t.db.update(|tx| tx.delete_collection(b"big")).unwrap();
    assert_pages_accounted(&t.db);

    // The next writer sees the big tree's pages as free.
    let tx = t.db.write_tx().unwrap();
    let after = t.db.stats().unwrap();
    assert!(after.free_pages > before.free_pages + 20);
    drop(tx);

    assert_eq!(t.get("big", "k"), None);
    assert_eq!(t.get("keep", "k").as_deref(), Some("v"));
    let mut tx = t.db.read_tx().unwrap();
    assert_eq!(tx.collections().unwrap(), vec![b"keep".to_vec()]);
}

#[test]
fn test_delete_and_recreate_in_one_tx() {
    let t = TestDb::new(44);
    t.create("c");
    t.put("c", "old", "1");

    t.db.update(|tx| {
        tx.delete_collection(b"c")?;
        tx.create_collection(b"c")?.put(b"new", b"2")
    })
    .unwrap();

    assert_eq!(t.get("c", "old"), None);
    assert_eq!(t.get("c", "new").as_deref(), Some("2"));
    assert_pages_accounted(&t.db);
}

#[test]
fn test_many_collections_split_root_collection() {
    let t = TestDb::new(45);
    t.db.update(|tx| {
        for i in 0..300 {
            tx.create_collection(key(i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    let t = t.reopen();
    let mut tx = t.db.read_tx().unwrap();
    let names = tx.collections().unwrap();
    assert_eq!(names.len(), 300);
    assert!(!tx.get_node(tx.root()).unwrap().is_leaf());
    assert!(tx.get_collection(key(150).as_bytes()).unwrap().is_some());
    drop(tx);
    assert_pages_accounted(&t.db);
}
