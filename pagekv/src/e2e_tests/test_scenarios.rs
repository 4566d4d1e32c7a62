//! The basic lifecycle: commit, rollback and snapshot reads.

use crate::e2e_tests::helpers::{TestDb, get};

#[test]
fn test_commit_then_read() {
    let t = TestDb::new(1);

    let mut tx = t.db.write_tx().unwrap();
    let mut users = tx.create_collection(b"users").unwrap();
    users.put(b"alice", b"1").unwrap();
    tx.commit().unwrap();

    let mut tx = t.db.read_tx().unwrap();
    let users = tx.get_collection(b"users").unwrap().unwrap();
    let item = users.find(b"alice").unwrap().unwrap();
    assert_eq!(item.value, b"1");
}

#[test]
fn test_rollback_is_invisible() {
    let t = TestDb::new(2);
    t.create("users");

    let mut tx = t.db.write_tx().unwrap();
    tx.get_collection(b"users")
        .unwrap()
        .unwrap()
        .put(b"k", b"v1")
        .unwrap();
    tx.rollback().unwrap();

    assert_eq!(t.get("users", "k"), None);
}

#[test]
fn test_reader_keeps_snapshot_across_commit() {
    let t = TestDb::new(3);
    t.create("users");
    t.put("users", "k", "v1");

    let mut writer = t.db.write_tx().unwrap();
    writer
        .get_collection(b"users")
        .unwrap()
        .unwrap()
        .put(b"k", b"v2")
        .unwrap();

    // Begins before the writer commits.
    let mut reader = t.db.read_tx().unwrap();
    assert_eq!(get(&mut reader, "users", "k").as_deref(), Some("v1"));

    writer.commit().unwrap();
    assert_eq!(get(&mut reader, "users", "k").as_deref(), Some("v1"));
    drop(reader);

    assert_eq!(t.get("users", "k").as_deref(), Some("v2"));
}

#[test]
fn test_writer_reads_own_writes() {
    let t = TestDb::new(4);
    t.create("users");

    let mut tx = t.db.write_tx().unwrap();
    let mut users = tx.get_collection(b"users").unwrap().unwrap();
    users.put(b"k", b"staged").unwrap();
    assert_eq!(users.get(b"k").unwrap(), Some(b"staged".to_vec()));
    drop(users);

    // A different read transaction does not see the staged value.
    assert_eq!(t.get("users", "k"), None);
    tx.commit().unwrap();
    assert_eq!(t.get("users", "k").as_deref(), Some("staged"));
}
