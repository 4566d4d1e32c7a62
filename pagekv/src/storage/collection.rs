//! Named collections.
//!
//! A collection is an independent B-tree. The root collection maps each
//! collection name to the root page of its tree, stored as an 8-byte
//! little-endian page number.

use crate::storage::btree::{self, Item};
use crate::storage::page::PageNum;
use crate::storage::transaction::{Transaction, TransactionError};

/// Encoded size of a root collection entry's value.
const ROOT_RECORD_SIZE: usize = 8;

/// A collection bound to a transaction.
///
/// Mutations re-stage every node on the touched path. When that moves the
/// collection's root, its entry in the root collection is updated too.
pub struct Collection<'tx, 'db> {
    name: Vec<u8>,
    root: PageNum,
    tx: &'tx mut Transaction<'db>,
}

impl<'tx, 'db> Collection<'tx, 'db> {
    pub(crate) const fn new(name: Vec<u8>, root: PageNum, tx: &'tx mut Transaction<'db>) -> Self {
        Self { name, root, tx }
    }

    #[must_use]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Root page of the collection's tree as seen by the transaction.
    #[must_use]
    pub const fn root(&self) -> PageNum {
        self.root
    }

    /// Look up `key`.
    pub fn find(&self, key: &[u8]) -> Result<Option<Item>, TransactionError> {
        btree::find(self.tx, self.root, key)
    }

    /// Look up `key` and return only its value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TransactionError> {
        Ok(self.find(key)?.map(|item| item.value))
    }

    /// Insert `key`, or overwrite its value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), TransactionError> {
        self.tx.ensure_writable()?;
        self.tx.check_item(key, value.len())?;
        let item = Item::new(key.to_vec(), value.to_vec());
        let root = btree::put(self.tx, self.root, item)?;
        self.set_root(root)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool, TransactionError> {
        self.tx.ensure_writable()?;
        match btree::remove(self.tx, self.root, key)? {
            Some(root) => {
                self.set_root(root)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All items in key order.
    pub fn items(&self) -> Result<Vec<Item>, TransactionError> {
        btree::items(self.tx, self.root)
    }

    /// Items whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Item>, TransactionError> {
        btree::scan_prefix(self.tx, self.root, prefix)
    }

    fn set_root(&mut self, root: PageNum) -> Result<(), TransactionError> {
        if root != self.root {
            self.root = root;
            self.tx.set_collection_root(&self.name, root)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Collection<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Value stored in the root collection for a collection rooted at `root`.
#[must_use]
pub fn encode_collection_root(root: PageNum) -> Vec<u8> {
    root.to_le_bytes().to_vec()
}

/// Parse a root collection entry back into its root page.
pub fn decode_collection_root(item: &Item) -> Result<PageNum, TransactionError> {
    let bytes: [u8; ROOT_RECORD_SIZE] = item.value.as_slice().try_into().map_err(|_| {
        TransactionError::InvalidCollection(format!(
            "{:?} has a {} byte record",
            String::from_utf8_lossy(&item.key),
            item.value.len()
        ))
    })?;
    match PageNum::from_le_bytes(bytes) {
        0 => Err(TransactionError::InvalidCollection(format!(
            "{:?} points at the meta page",
            String::from_utf8_lossy(&item.key)
        ))),
        root => Ok(root),
    }
}
