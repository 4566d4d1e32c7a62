//! Committed data survives reopening, on disk and in memory.

use tempfile::tempdir;

use crate::config::Options;
use crate::e2e_tests::helpers::{TestDb, assert_pages_accounted, get, key};
use crate::storage::Database;

#[test]
fn test_file_reopen_keeps_every_commit() {
    let dir = tempdir().expect("create temp dir");
    let path = dir.path().join("durable.db");

    {
        let db = Database::open(&path, Options::default()).unwrap();
        db.update(|tx| tx.create_collection(b"numbers").map(|_| ()))
            .unwrap();
        for batch in 0..10u32 {
            db.update(|tx| {
                let mut c = tx.get_collection(b"numbers")?.unwrap();
                for i in batch * 100..(batch + 1) * 100 {
                    c.put(key(i).as_bytes(), &i.to_le_bytes())?;
                }
                Ok(())
            })
            .unwrap();
        }
        db.close().unwrap();
    }

    let db = Database::open(&path, Options::default()).unwrap();
    assert_eq!(db.stats().unwrap().tx_id, 11);
    let mut tx = db.read_tx().unwrap();
    let c = tx.get_collection(b"numbers").unwrap().unwrap();
    let items = c.items().unwrap();
    assert_eq!(items.len(), 1000);
    for (i, item) in (0..1000u32).zip(&items) {
        assert_eq!(item.key, key(i).as_bytes());
        assert_eq!(item.value, i.to_le_bytes());
    }
}

#[test]
fn test_uncommitted_writes_lost_on_reopen() {
    let dir = tempdir().expect("create temp dir");
    let path = dir.path().join("uncommitted.db");

    {
        let db = Database::open(&path, Options::default()).unwrap();
        db.update(|tx| tx.create_collection(b"c")?.put(b"kept", b"1"))
            .unwrap();

        let mut tx = db.write_tx().unwrap();
        tx.get_collection(b"c")
            .unwrap()
            .unwrap()
            .put(b"lost", b"2")
            .unwrap();
        drop(tx);
    }

    let db = Database::open(&path, Options::default()).unwrap();
    let mut tx = db.read_tx().unwrap();
    assert_eq!(get(&mut tx, "c", "kept").as_deref(), Some("1"));
    assert_eq!(get(&mut tx, "c", "lost"), None);
}

#[test]
fn test_memory_reopen_reloads_freelist() {
    let t = TestDb::new(5);
    t.create("c");
    for i in 0..200 {
        t.put("c", &key(i), "x");
    }
    let before = t.db.stats().unwrap();
    assert_pages_accounted(&t.db);

    let t = t.reopen();
    let after = t.db.stats().unwrap();
    assert_eq!(after.tx_id, before.tx_id);
    assert_eq!(after.root, before.root);
    assert_eq!(after.max_page, before.max_page);
    // No reader survives a reopen, so pending pages come back free.
    assert_eq!(after.pending_pages, 0);
    assert_eq!(
        after.free_pages,
        before.free_pages + before.pending_pages
    );
    assert_pages_accounted(&t.db);
    assert_eq!(t.get("c", &key(199)).as_deref(), Some("x"));
}

#[test]
fn test_file_grows_only_as_needed() {
    let t = TestDb::new(6);
    t.create("c");
    t.put("c", "k", "v");
    let size = t.db.stats().unwrap().max_page;

    // Rewriting the same key reuses freed pages instead of growing the file.
    for i in 0..100 {
        t.put("c", "k", &i.to_string());
    }
    assert!(t.db.stats().unwrap().max_page <= size + 4);
    assert_pages_accounted(&t.db);
}
