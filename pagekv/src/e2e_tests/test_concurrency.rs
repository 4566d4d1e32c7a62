//! One writer at a time, readers isolated on their snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::Options;
use crate::e2e_tests::helpers::{TestDb, assert_pages_accounted, get, key};
use crate::storage::page::MIN_PAGE_SIZE;
use crate::storage::{Database, MemoryStorage, Page, PageNum, Storage, StorageError};

fn read_counter(t: &TestDb) -> u64 {
    t.get("c", "counter").map_or(0, |v| v.parse().unwrap())
}

#[test]
fn test_concurrent_writers_are_serialized() {
    let t = TestDb::new(20);
    t.create("c");

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    t.db.update(|tx| {
                        let mut c = tx.get_collection(b"c")?.unwrap();
                        let current = c
                            .get(b"counter")?
                            .map_or(0, |v| String::from_utf8(v).unwrap().parse().unwrap());
                        c.put(b"counter", (current + 1u64).to_string().as_bytes())
                    })
                    .unwrap();
                }
            });
        }
    });

    // Lost updates would leave the counter short.
    assert_eq!(read_counter(&t), 100);
    assert_eq!(t.db.stats().unwrap().tx_id, 101);
    assert_pages_accounted(&t.db);
}

#[test]
fn test_readers_never_see_partial_commits() {
    let t = TestDb::new(21);
    t.create("c");
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            // Each commit writes the same value under two keys.
            for i in 0..50u32 {
                t.db.update(|tx| {
                    let mut c = tx.get_collection(b"c")?.unwrap();
                    c.put(b"a", i.to_string().as_bytes())?;
                    for j in 0..20 {
                        c.put(key(j).as_bytes(), &[0; 30])?;
                    }
                    c.put(b"b", i.to_string().as_bytes())
                })
                .unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });

        for _ in 0..2 {
            s.spawn(|| {
                let mut last = None;
                while !done.load(Ordering::SeqCst) {
                    let mut tx = t.db.read_tx().unwrap();
                    let a = get(&mut tx, "c", "a");
                    let b = get(&mut tx, "c", "b");
                    assert_eq!(a, b, "snapshot mixed two commits");
                    assert!(tx.id() >= last.unwrap_or(0), "snapshots went backwards");
                    last = Some(tx.id());
                }
            });
        }
    });
    assert_pages_accounted(&t.db);
}

#[test]
fn test_read_tx_does_not_wait_for_writer() {
    let t = TestDb::new(22);
    t.create("c");
    t.put("c", "k", "old");
    let writer_ready = Barrier::new(2);
    let reader_done = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            let mut tx = t.db.write_tx().unwrap();
            tx.get_collection(b"c")
                .unwrap()
                .unwrap()
                .put(b"k", b"new")
                .unwrap();
            writer_ready.wait();
            // Still holding the writer lock while the reader runs.
            reader_done.wait();
            tx.commit().unwrap();
        });

        s.spawn(|| {
            writer_ready.wait();
            assert_eq!(t.get("c", "k").as_deref(), Some("old"));
            reader_done.wait();
        });
    });

    assert_eq!(t.get("c", "k").as_deref(), Some("new"));
}

#[test]
fn test_old_reader_blocks_page_reuse() {
    let t = TestDb::new(23);
    t.create("c");
    for i in 0..100 {
        t.put("c", &key(i), "v1");
    }

    let mut reader = t.db.read_tx().unwrap();
    let snapshot = reader.id();

    // Rewrite everything twice while the reader is open.
    for round in ["v2", "v3"] {
        t.db.update(|tx| {
            let mut c = tx.get_collection(b"c")?.unwrap();
            for i in 0..100 {
                c.put(key(i).as_bytes(), round.as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
    }

    let stats = t.db.stats().unwrap();
    assert!(stats.pending_pages > 0);
    assert_eq!(stats.open_readers, 1);
    assert_pages_accounted(&t.db);

    // Every page of the old snapshot is still intact.
    assert_eq!(reader.id(), snapshot);
    let c = reader.get_collection(b"c").unwrap().unwrap();
    let items = c.items().unwrap();
    assert_eq!(items.len(), 100);
    assert!(items.iter().all(|item| item.value == b"v1"));
    drop(reader);

    // With the reader gone, the next write transaction frees everything pending.
    let tx = t.db.write_tx().unwrap();
    let stats = t.db.stats().unwrap();
    assert_eq!(stats.pending_pages, 0);
    drop(tx);
    assert_pages_accounted(&t.db);
}

/// Storage that, once armed, parks the next sync until the test releases it.
struct GatedSync {
    inner: MemoryStorage,
    armed: Arc<AtomicBool>,
    entered: Sender<()>,
    release: Mutex<Receiver<()>>,
}

impl Storage for GatedSync {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn read_page(&self, page_num: PageNum) -> Result<Page, StorageError> {
        self.inner.read_page(page_num)
    }

    fn write_page(&self, page_num: PageNum, page: &Page) -> Result<(), StorageError> {
        self.inner.write_page(page_num, page)
    }

    fn sync(&self) -> Result<(), StorageError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        self.inner.sync()
    }

    fn total_pages(&self) -> u64 {
        self.inner.total_pages()
    }
}

#[test]
fn test_read_tx_does_not_wait_for_commit_io() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let armed = Arc::new(AtomicBool::new(false));
    let storage = GatedSync {
        inner: MemoryStorage::new(MIN_PAGE_SIZE, 24),
        armed: Arc::clone(&armed),
        entered: entered_tx,
        release: Mutex::new(release_rx),
    };
    let db = Database::open_with_storage(Box::new(storage), Options::default()).unwrap();
    db.update(|tx| tx.create_collection(b"c")?.put(b"k", b"old"))
        .unwrap();
    let db = &db;

    armed.store(true, Ordering::SeqCst);
    thread::scope(|s| {
        let writer = s.spawn(|| {
            db.update(|tx| {
                let mut c = tx.get_collection(b"c")?.unwrap();
                for i in 0..50 {
                    c.put(key(i).as_bytes(), b"v")?;
                }
                c.put(b"k", b"new")
            })
        });

        // The commit is parked inside its first sync.
        entered_rx.recv().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        s.spawn(move || {
            let mut tx = db.read_tx().unwrap();
            let value = get(&mut tx, "c", "k");
            let open_readers = db.stats().unwrap().open_readers;
            done_tx.send((value, open_readers)).unwrap();
        });
        let read = done_rx.recv_timeout(Duration::from_secs(10));
        release_tx.send(()).unwrap();

        assert_eq!(
            read.expect("read tx blocked behind a syncing commit"),
            (Some("old".to_string()), 1)
        );
        writer.join().unwrap().unwrap();
    });

    let mut tx = db.read_tx().unwrap();
    assert_eq!(get(&mut tx, "c", "k").as_deref(), Some("new"));
}
