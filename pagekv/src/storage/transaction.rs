//! Transactions.
//!
//! A transaction sees the store as of one commit (its snapshot) and stages
//! every change in memory:
//! - `dirty_nodes` is the overlay of nodes written by this transaction
//! - `pages_to_delete` holds committed pages that become garbage on commit
//! - `allocated_page_nums` holds pages taken from the allocator, returned on
//!   rollback
//!
//! # Copy-on-write
//!
//! A committed page is never written in place. The first time a write
//! transaction writes a node that lives on a committed page, `write_node`
//! moves it to a freshly allocated page and schedules the old page for
//! deletion. Tree operations re-stage every node on the path they touch, so
//! parents always point at the relocated children.
//!
//! # Commit
//!
//! 1. flush dirty nodes
//! 2. park `pages_to_delete` as pending under this commit's id
//! 3. write a new freelist chain, then sync
//! 4. write the meta page (strictly last), then sync
//! 5. publish the new root to the database handle
//!
//! A failure in steps 1-3 restores the allocator to its state when the
//! transaction began; the meta page still points at the previous commit.
//! A failure in step 4 leaves the durable state unknown, so the database
//! refuses further write transactions until it is reopened.
//!
//! Every page written in steps 1-3 is unreachable from any published root,
//! so the writes and syncs run without the shared lock and concurrent
//! readers keep going. The lock is taken only to update the allocator and
//! to publish.

use std::collections::{HashMap, HashSet};
use std::sync::{MutexGuard, PoisonError};

use crate::storage::btree::{self, Item, Node, NodeError, NodeLimits};
use crate::storage::collection::{Collection, decode_collection_root, encode_collection_root};
use crate::storage::database::{Database, Shared};
use crate::storage::freelist::Freelist;
use crate::storage::io::StorageError;
use crate::storage::meta::{Meta, TxId};
use crate::storage::node_store::{NodeStore, NodeStoreError};
use crate::storage::page::{Page, PageNum};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// A read or write transaction.
///
/// Dropping an active transaction rolls it back.
pub struct Transaction<'db> {
    db: &'db Database,
    /// Held for the whole life of a write transaction.
    writer: Option<MutexGuard<'db, ()>>,
    write: bool,
    tx_id: TxId,
    root: PageNum,
    limits: NodeLimits,
    dirty_nodes: HashMap<PageNum, Node>,
    pages_to_delete: Vec<PageNum>,
    allocated_page_nums: HashSet<PageNum>,
    /// Allocator state at begin, restored if the commit fails.
    freelist_snapshot: Option<Freelist>,
    state: TxState,
}

impl<'db> Transaction<'db> {
    /// Begin a read transaction on the last published commit.
    pub(crate) fn begin_read(db: &'db Database, shared: &mut Shared) -> Self {
        let meta = shared.meta;
        *shared.readers.entry(meta.tx_id).or_insert(0) += 1;
        tracing::debug!("begin read tx at commit {}", meta.tx_id);

        Self::new(db, None, meta.tx_id, meta.root)
    }

    /// Begin a write transaction. The caller holds the writer lock.
    pub(crate) fn begin_write(
        db: &'db Database,
        writer: MutexGuard<'db, ()>,
        shared: &mut Shared,
    ) -> Self {
        let oldest_reader = shared.readers.keys().next().copied();
        shared.freelist.release_pending(oldest_reader);

        let tx_id = shared.meta.tx_id + 1;
        tracing::debug!("begin write tx {tx_id}");

        let mut tx = Self::new(db, Some(writer), tx_id, shared.meta.root);
        tx.freelist_snapshot = Some(shared.freelist.clone());
        tx
    }

    fn new(
        db: &'db Database,
        writer: Option<MutexGuard<'db, ()>>,
        tx_id: TxId,
        root: PageNum,
    ) -> Self {
        Self {
            db,
            write: writer.is_some(),
            writer,
            tx_id,
            root,
            limits: db.store().limits(),
            dirty_nodes: HashMap::new(),
            pages_to_delete: Vec::new(),
            allocated_page_nums: HashSet::new(),
            freelist_snapshot: None,
            state: TxState::Active,
        }
    }

    /// Snapshot commit id (read) or the id this commit will publish (write).
    #[must_use]
    pub const fn id(&self) -> TxId {
        self.tx_id
    }

    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.write
    }

    #[must_use]
    pub const fn state(&self) -> TxState {
        self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    /// Root page of the root collection as seen by this transaction.
    #[must_use]
    pub const fn root(&self) -> PageNum {
        self.root
    }

    #[must_use]
    pub const fn limits(&self) -> NodeLimits {
        self.limits
    }

    fn ensure_active(&self) -> Result<(), TransactionError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TransactionError::TransactionClosed)
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), TransactionError> {
        self.ensure_active()?;
        if self.write {
            Ok(())
        } else {
            Err(TransactionError::WriteInsideReadTx)
        }
    }

    fn shared(&self) -> Result<MutexGuard<'db, Shared>, TransactionError> {
        self.db
            .lock_shared()
            .map_err(|_| TransactionError::LockPoisoned)
    }

    // Node operations

    /// Return the node at `page_num`, preferring this transaction's staged version.
    pub fn get_node(&self, page_num: PageNum) -> Result<Node, TransactionError> {
        self.ensure_active()?;
        if let Some(node) = self.dirty_nodes.get(&page_num) {
            return Ok(node.clone());
        }
        Ok(self.db.store().get_node(page_num)?)
    }

    /// Build a node on a freshly allocated page. Nothing is staged or written.
    pub fn new_node(
        &mut self,
        items: Vec<Item>,
        children: Vec<PageNum>,
    ) -> Result<Node, TransactionError> {
        self.ensure_writable()?;
        let page_num = self.allocate_page()?;
        Ok(Node::new(page_num, items, children))
    }

    /// Stage `node`, relocating it first if it sits on a committed page.
    ///
    /// Returns the page number the node is staged at.
    pub fn write_node(&mut self, mut node: Node) -> Result<PageNum, TransactionError> {
        self.ensure_writable()?;
        if !self.allocated_page_nums.contains(&node.page_num) {
            let old = node.page_num;
            node.page_num = self.allocate_page()?;
            if old != 0 {
                self.pages_to_delete.push(old);
            }
        }
        let page_num = node.page_num;
        self.dirty_nodes.insert(page_num, node);
        Ok(page_num)
    }

    /// Drop the node at `page_num` from the tree.
    ///
    /// A page allocated by this transaction goes straight back to the
    /// allocator; a committed page stays readable until commit.
    pub fn delete_node(&mut self, page_num: PageNum) -> Result<(), TransactionError> {
        self.ensure_writable()?;
        if self.allocated_page_nums.remove(&page_num) {
            self.dirty_nodes.remove(&page_num);
            self.shared()?.delete_node(page_num);
        } else {
            self.pages_to_delete.push(page_num);
        }
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<PageNum, TransactionError> {
        let page_num = self.shared()?.freelist.get_next_page();
        self.allocated_page_nums.insert(page_num);
        Ok(page_num)
    }

    // Collections

    /// Look up a collection by name.
    pub fn get_collection(
        &mut self,
        name: &[u8],
    ) -> Result<Option<Collection<'_, 'db>>, TransactionError> {
        let Some(item) = btree::find(self, self.root, name)? else {
            return Ok(None);
        };
        let root = decode_collection_root(&item)?;
        Ok(Some(Collection::new(name.to_vec(), root, self)))
    }

    /// Create a collection with an empty tree.
    pub fn create_collection(
        &mut self,
        name: &[u8],
    ) -> Result<Collection<'_, 'db>, TransactionError> {
        self.ensure_writable()?;
        self.check_item(name, 8)?;
        if btree::find(self, self.root, name)?.is_some() {
            return Err(TransactionError::CollectionExists(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }

        let leaf = self.new_node(Vec::new(), Vec::new())?;
        let root = self.write_node(leaf)?;
        self.set_collection_root(name, root)?;
        tracing::debug!(
            "created collection {:?} at page {root}",
            String::from_utf8_lossy(name)
        );
        Ok(Collection::new(name.to_vec(), root, self))
    }

    /// Delete a collection and free every page of its tree.
    pub fn delete_collection(&mut self, name: &[u8]) -> Result<(), TransactionError> {
        self.ensure_writable()?;
        let Some(item) = btree::find(self, self.root, name)? else {
            return Err(TransactionError::CollectionNotFound(
                String::from_utf8_lossy(name).into_owned(),
            ));
        };
        let root = decode_collection_root(&item)?;
        btree::free_tree(self, root)?;

        if let Some(new_root) = btree::remove(self, self.root, name)? {
            self.root = new_root;
        }
        Ok(())
    }

    /// Names of all collections, in order.
    pub fn collections(&self) -> Result<Vec<Vec<u8>>, TransactionError> {
        Ok(btree::items(self, self.root)?
            .into_iter()
            .map(|item| item.key)
            .collect())
    }

    /// Point the root collection's entry for `name` at `root`.
    pub(crate) fn set_collection_root(
        &mut self,
        name: &[u8],
        root: PageNum,
    ) -> Result<(), TransactionError> {
        let item = Item::new(name.to_vec(), encode_collection_root(root));
        self.root = btree::put(self, self.root, item)?;
        Ok(())
    }

    /// Reject empty keys and items too large to guarantee a split.
    pub(crate) fn check_item(&self, key: &[u8], value_len: usize) -> Result<(), TransactionError> {
        if key.is_empty() {
            return Err(TransactionError::EmptyKey);
        }
        if !self.limits.item_fits(key.len(), value_len) {
            return Err(TransactionError::ItemTooLarge {
                size: key.len() + value_len,
                max: self.limits.max_item_size,
            });
        }
        Ok(())
    }

    // Finalization

    /// Make this transaction's changes durable and visible.
    ///
    /// For a read transaction this only ends the snapshot. On error the
    /// transaction is rolled back and the error returned.
    pub fn commit(&mut self) -> Result<(), TransactionError> {
        self.ensure_active()?;
        if !self.write {
            self.finish(TxState::Committed);
            return Ok(());
        }

        match self.commit_write() {
            Ok(()) => {
                self.finish(TxState::Committed);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("commit of tx {} failed: {e}", self.tx_id);
                self.finish(TxState::RolledBack);
                Err(e)
            }
        }
    }

    fn commit_write(&mut self) -> Result<(), TransactionError> {
        let db = self.db;
        let store = db.store();
        let nodes_written = self.dirty_nodes.len();
        let pages_released = self.pages_to_delete.len();

        let (previous, chain) = {
            let mut shared = self.shared()?;
            if shared.needs_reopen {
                return Err(TransactionError::NeedsReopen);
            }
            let released = std::mem::take(&mut self.pages_to_delete);
            shared.freelist.free_pending(self.tx_id, released);
            let chain = shared.freelist.prepare_chain(self.tx_id, store.page_size());
            (shared.meta, chain)
        };

        let freelist_head = match self.flush(store, &chain) {
            Ok(head) => head,
            Err(e) => {
                let mut shared = self.shared()?;
                if let Some(snapshot) = self.freelist_snapshot.take() {
                    shared.freelist = snapshot;
                }
                return Err(e.into());
            }
        };

        let meta = Meta::new(store.page_size(), self.root, freelist_head, self.tx_id);
        let written = store
            .write_meta(&meta, Some(&previous))
            .and_then(|()| store.sync());
        if let Err(e) = written {
            tracing::error!(
                "meta page write for tx {} failed, database must be reopened: {e}",
                self.tx_id
            );
            self.shared()?.needs_reopen = true;
            return Err(e.into());
        }

        self.shared()?.meta = meta;
        tracing::info!(
            "committed tx {} ({nodes_written} nodes written, {pages_released} pages released)",
            self.tx_id
        );
        Ok(())
    }

    /// Steps 1 and 3 of the commit. Returns the new freelist head.
    fn flush(
        &self,
        store: &NodeStore,
        chain: &[(PageNum, Page)],
    ) -> Result<PageNum, NodeStoreError> {
        for node in self.dirty_nodes.values() {
            store.write_node(node)?;
        }
        let head = store.write_freelist(chain)?;
        store.sync()?;
        Ok(head)
    }

    /// Discard every staged change.
    pub fn rollback(&mut self) -> Result<(), TransactionError> {
        self.ensure_active()?;
        if self.write {
            let mut shared = self.shared()?;
            for page_num in self.allocated_page_nums.drain() {
                shared.delete_node(page_num);
            }
            tracing::debug!("rolled back tx {}", self.tx_id);
        }
        self.finish(TxState::RolledBack);
        Ok(())
    }

    /// Single exit path: clears staging, releases the writer lock or
    /// deregisters the reader.
    fn finish(&mut self, state: TxState) {
        self.state = state;
        self.dirty_nodes.clear();
        self.pages_to_delete.clear();
        self.allocated_page_nums.clear();
        self.freelist_snapshot = None;

        if self.write {
            drop(self.writer.take());
            return;
        }

        let mut shared = self.db.lock_shared().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = shared.readers.get_mut(&self.tx_id) {
            *count -= 1;
            if *count == 0 {
                shared.readers.remove(&self.tx_id);
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.is_active() {
            return;
        }
        if self.write {
            tracing::warn!("write tx {} dropped without commit, rolling back", self.tx_id);
        }
        if let Err(e) = self.rollback() {
            tracing::warn!("rollback of dropped tx {} failed: {e}", self.tx_id);
            self.finish(TxState::RolledBack);
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("tx_id", &self.tx_id)
            .field("write", &self.write)
            .field("root", &self.root)
            .field("state", &self.state)
            .field("dirty_nodes", &self.dirty_nodes.len())
            .finish_non_exhaustive()
    }
}

/// Errors that can occur during transaction operations.
#[derive(Debug)]
pub enum TransactionError {
    /// Page lies beyond the end of the file.
    PageNotFound(PageNum),
    /// Page bytes are not a valid node.
    Decode { page_num: PageNum, source: NodeError },
    /// Storage I/O error.
    Storage(StorageError),
    /// Other node store error (meta page, freelist).
    Store(NodeStoreError),
    /// Mutation attempted on a read transaction.
    WriteInsideReadTx,
    /// Operation on a committed or rolled back transaction.
    TransactionClosed,
    /// Collection already exists.
    CollectionExists(String),
    /// Collection does not exist.
    CollectionNotFound(String),
    /// Root collection entry is not a valid collection record.
    InvalidCollection(String),
    /// Key plus value exceed the per-item limit.
    ItemTooLarge { size: usize, max: usize },
    /// Keys must be non-empty.
    EmptyKey,
    /// Tree structure violates a B-tree invariant.
    CorruptTree(String),
    /// A previous commit failed while writing the meta page.
    NeedsReopen,
    /// A database lock was poisoned by a panicking thread.
    LockPoisoned,
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PageNotFound(p) => write!(f, "page {p} not found"),
            Self::Decode { page_num, source } => {
                write!(f, "page {page_num} is not a valid node: {source}")
            }
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::WriteInsideReadTx => write!(f, "write inside a read transaction"),
            Self::TransactionClosed => write!(f, "transaction already committed or rolled back"),
            Self::CollectionExists(name) => write!(f, "collection {name:?} already exists"),
            Self::CollectionNotFound(name) => write!(f, "collection {name:?} not found"),
            Self::InvalidCollection(msg) => write!(f, "invalid collection record: {msg}"),
            Self::ItemTooLarge { size, max } => {
                write!(f, "item of {size} bytes exceeds the limit of {max}")
            }
            Self::EmptyKey => write!(f, "key must not be empty"),
            Self::CorruptTree(msg) => write!(f, "corrupt tree: {msg}"),
            Self::NeedsReopen => write!(f, "a commit failed mid-way, reopen the database"),
            Self::LockPoisoned => write!(f, "database lock poisoned"),
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode { source, .. } => Some(source),
            Self::Storage(e) => Some(e),
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NodeStoreError> for TransactionError {
    fn from(e: NodeStoreError) -> Self {
        match e {
            NodeStoreError::Storage(StorageError::PageOutOfBounds { page_num, .. }) => {
                Self::PageNotFound(page_num)
            }
            NodeStoreError::Storage(e) => Self::Storage(e),
            NodeStoreError::Node { page_num, source } => Self::Decode { page_num, source },
            other => Self::Store(other),
        }
    }
}
