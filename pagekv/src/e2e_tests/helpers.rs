//! Common helpers for end-to-end tests.

use std::collections::BTreeSet;

use crate::config::Options;
use crate::storage::page::MIN_PAGE_SIZE;
use crate::storage::{Database, MemoryStorage, PageNum, Transaction};

/// A database on shared in-memory storage.
///
/// The storage handle stays with the test so it can inject faults, simulate
/// crashes and reopen the same pages.
pub struct TestDb {
    pub db: Database,
    pub storage: MemoryStorage,
}

impl TestDb {
    /// Create a fresh database with the smallest page size, so trees grow
    /// several levels with few keys.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let storage = MemoryStorage::new(MIN_PAGE_SIZE, seed);
        let db = open(&storage);
        Self { db, storage }
    }

    /// Drop the database handle and open the same storage again.
    #[must_use]
    pub fn reopen(self) -> Self {
        let Self { db, storage } = self;
        drop(db);
        let db = open(&storage);
        Self { db, storage }
    }

    /// Lose every unsynced write, then reopen.
    #[must_use]
    pub fn crash_and_reopen(self) -> Self {
        let Self { db, storage } = self;
        drop(db);
        storage.disarm();
        storage.crash();
        let db = open(&storage);
        Self { db, storage }
    }

    /// Create `collection` in its own transaction.
    pub fn create(&self, collection: &str) {
        self.db
            .update(|tx| tx.create_collection(collection.as_bytes()).map(|_| ()))
            .unwrap();
    }

    /// Put one key in its own transaction.
    pub fn put(&self, collection: &str, key: &str, value: &str) {
        self.db
            .update(|tx| {
                tx.get_collection(collection.as_bytes())?
                    .unwrap()
                    .put(key.as_bytes(), value.as_bytes())
            })
            .unwrap();
    }

    /// Read one key in its own transaction.
    #[must_use]
    pub fn get(&self, collection: &str, key: &str) -> Option<String> {
        let mut tx = self.db.read_tx().unwrap();
        get(&mut tx, collection, key)
    }
}

fn open(storage: &MemoryStorage) -> Database {
    Database::open_with_storage(Box::new(storage.clone()), Options::default())
        .expect("Failed to open test database")
}

/// Read one key through `tx`. `None` if the collection or key is missing.
pub fn get(tx: &mut Transaction<'_>, collection: &str, key: &str) -> Option<String> {
    let c = tx.get_collection(collection.as_bytes()).unwrap()?;
    c.get(key.as_bytes())
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap())
}

/// Every page reachable from the committed root: the root collection tree
/// and each collection's tree.
pub fn reachable_pages(db: &Database) -> BTreeSet<PageNum> {
    let mut tx = db.read_tx().unwrap();
    let mut pages = BTreeSet::new();
    collect_tree(&tx, tx.root(), &mut pages);

    for name in tx.collections().unwrap() {
        let root = tx.get_collection(&name).unwrap().unwrap().root();
        collect_tree(&tx, root, &mut pages);
    }
    pages
}

fn collect_tree(tx: &Transaction<'_>, page_num: PageNum, pages: &mut BTreeSet<PageNum>) {
    assert!(pages.insert(page_num), "page {page_num} reachable twice");
    let node = tx.get_node(page_num).unwrap();
    for child in node.children {
        collect_tree(tx, child, pages);
    }
}

/// Check that every page up to the allocator's high-water mark is accounted
/// for exactly once: reachable, free, pending or holding the freelist.
pub fn assert_pages_accounted(db: &Database) {
    let reachable = reachable_pages(db).len();
    let stats = db.stats().unwrap();
    let accounted = reachable + stats.free_pages + stats.pending_pages + stats.freelist_pages;
    assert_eq!(
        accounted as u64, stats.max_page,
        "pages leaked or double counted: {stats:?}, {reachable} reachable"
    );
}

/// Deterministic key for index `i`.
#[must_use]
pub fn key(i: u32) -> String {
    format!("key-{i:06}")
}
