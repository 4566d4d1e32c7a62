//! High-level database interface.
//!
//! A `Database` owns the storage engine and hands out transactions:
//! any number of concurrent read transactions and one write transaction at
//! a time. Locks are always taken in the order writer, then shared.
//!
//! The shared lock only guards in-memory state and is never held across
//! page I/O. Readers fetch pages straight from the node store, so neither
//! beginning a read transaction nor reading through one waits on a commit.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{LockResult, Mutex, MutexGuard};

use crate::config::{ConfigError, Options};
use crate::storage::file::FileStorage;
use crate::storage::io::{Storage, StorageError};
use crate::storage::freelist::Freelist;
use crate::storage::meta::{Meta, TxId};
use crate::storage::node_store::{NodeStore, NodeStoreError};
use crate::storage::page::PageNum;
use crate::storage::transaction::{Transaction, TransactionError};

/// A database instance.
///
/// This is the main entry point for working with the storage engine.
/// It is `Sync`: share it by reference between threads.
pub struct Database {
    store: NodeStore,
    /// Held by the active write transaction.
    writer: Mutex<()>,
    shared: Mutex<Shared>,
}

/// State shared by every transaction of a database.
pub(crate) struct Shared {
    /// Last published commit; new transactions start from it.
    pub(crate) meta: Meta,
    /// Only the write transaction changes it.
    pub(crate) freelist: Freelist,
    /// Open read transactions, counted per snapshot commit id.
    pub(crate) readers: BTreeMap<TxId, usize>,
    /// Set when a commit failed while writing the meta page.
    pub(crate) needs_reopen: bool,
}

impl Shared {
    /// Return a page no committed root can reach to the allocator.
    pub(crate) fn delete_node(&mut self, page_num: PageNum) {
        self.freelist.release_page(page_num);
    }
}

/// Point-in-time statistics of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    pub page_size: usize,
    /// Id of the last successful commit.
    pub tx_id: TxId,
    /// Root page of the root collection.
    pub root: PageNum,
    pub total_pages: u64,
    /// Pages ready for reuse.
    pub free_pages: usize,
    /// Pages freed by commits that some reader may still see.
    pub pending_pages: usize,
    /// Pages holding the persisted freelist chain.
    pub freelist_pages: usize,
    pub max_page: PageNum,
    pub open_readers: usize,
}

impl Database {
    /// Open the database file at `path`, creating it if it does not exist.
    pub fn open(path: &Path, options: Options) -> Result<Self, DatabaseError> {
        options.validate()?;
        let storage = FileStorage::open(path, options.page_size_or_default())?;
        tracing::info!("opening database {}", path.display());
        Self::open_with_storage(Box::new(storage), options)
    }

    /// Open a database on any storage backend. Empty storage is initialized.
    pub fn open_with_storage(
        storage: Box<dyn Storage>,
        options: Options,
    ) -> Result<Self, DatabaseError> {
        options.validate()?;
        if let Some(requested) = options.page_size
            && requested != storage.page_size()
        {
            return Err(DatabaseError::PageSizeMismatch {
                requested,
                actual: storage.page_size(),
            });
        }

        let store = NodeStore::new(storage)?;
        let (meta, freelist) = store.open()?;

        Ok(Self {
            store,
            writer: Mutex::new(()),
            shared: Mutex::new(Shared {
                meta,
                freelist,
                readers: BTreeMap::new(),
                needs_reopen: false,
            }),
        })
    }

    pub(crate) fn lock_shared(&self) -> LockResult<MutexGuard<'_, Shared>> {
        self.shared.lock()
    }

    pub(crate) const fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Begin a read transaction on the last published commit.
    ///
    /// Never waits for the writer, not even while it commits.
    pub fn read_tx(&self) -> Result<Transaction<'_>, TransactionError> {
        let mut shared = self
            .lock_shared()
            .map_err(|_| TransactionError::LockPoisoned)?;
        Ok(Transaction::begin_read(self, &mut shared))
    }

    /// Begin a write transaction, blocking while another one is active.
    pub fn write_tx(&self) -> Result<Transaction<'_>, TransactionError> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| TransactionError::LockPoisoned)?;
        let mut shared = self
            .lock_shared()
            .map_err(|_| TransactionError::LockPoisoned)?;
        if shared.needs_reopen {
            return Err(TransactionError::NeedsReopen);
        }
        Ok(Transaction::begin_write(self, writer, &mut shared))
    }

    /// Run `f` in a write transaction.
    ///
    /// Commits if `f` succeeds and left the transaction open, rolls back if
    /// it fails.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, TransactionError>,
    ) -> Result<T, TransactionError> {
        let mut tx = self.write_tx()?;
        Self::run(&mut tx, f)
    }

    /// Run `f` in a read transaction.
    pub fn view<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, TransactionError>,
    ) -> Result<T, TransactionError> {
        let mut tx = self.read_tx()?;
        Self::run(&mut tx, f)
    }

    fn run<T>(
        tx: &mut Transaction<'_>,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, TransactionError>,
    ) -> Result<T, TransactionError> {
        match f(tx) {
            Ok(value) => {
                if tx.is_active() {
                    tx.commit()?;
                }
                Ok(value)
            }
            Err(e) => {
                if tx.is_active()
                    && let Err(rollback) = tx.rollback()
                {
                    tracing::warn!("rollback of tx {} failed: {rollback}", tx.id());
                }
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> Result<DatabaseStats, DatabaseError> {
        let shared = self
            .lock_shared()
            .map_err(|_| DatabaseError::LockPoisoned)?;
        let freelist = &shared.freelist;
        Ok(DatabaseStats {
            page_size: self.store.page_size(),
            tx_id: shared.meta.tx_id,
            root: shared.meta.root,
            total_pages: self.store.total_pages(),
            free_pages: freelist.free_count(),
            pending_pages: freelist.pending_count(),
            freelist_pages: freelist.chain().len(),
            max_page: freelist.max_page(),
            open_readers: shared.readers.values().sum(),
        })
    }

    /// Sync and close the database.
    pub fn close(self) -> Result<(), DatabaseError> {
        let shared = self
            .shared
            .into_inner()
            .map_err(|_| DatabaseError::LockPoisoned)?;
        self.store.sync()?;
        tracing::info!("closed database at commit {}", shared.meta.tx_id);
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Database");
        s.field("store", &self.store);
        if let Ok(shared) = self.shared.try_lock() {
            s.field("meta", &shared.meta)
                .field("readers", &shared.readers);
        }
        s.finish_non_exhaustive()
    }
}

/// Errors that can occur during database operations.
#[derive(Debug)]
pub enum DatabaseError {
    /// Invalid options.
    Config(ConfigError),
    /// File I/O error.
    Storage(StorageError),
    /// Meta page, freelist or node error while opening.
    Store(NodeStoreError),
    /// Transaction error.
    Transaction(TransactionError),
    /// `Options::page_size` differs from the page size of the existing file.
    PageSizeMismatch { requested: usize, actual: usize },
    /// A database lock was poisoned by a panicking thread.
    LockPoisoned,
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Transaction(e) => write!(f, "transaction error: {e}"),
            Self::PageSizeMismatch { requested, actual } => write!(
                f,
                "requested page size {requested} but the database uses {actual}"
            ),
            Self::LockPoisoned => write!(f, "database lock poisoned"),
        }
    }
}

impl std::error::Error for DatabaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Transaction(e) => Some(e),
            Self::PageSizeMismatch { .. } | Self::LockPoisoned => None,
        }
    }
}

impl From<ConfigError> for DatabaseError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StorageError> for DatabaseError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<NodeStoreError> for DatabaseError {
    fn from(e: NodeStoreError) -> Self {
        match e {
            NodeStoreError::Storage(e) => Self::Storage(e),
            other => Self::Store(other),
        }
    }
}

impl From<TransactionError> for DatabaseError {
    fn from(e: TransactionError) -> Self {
        Self::Transaction(e)
    }
}
