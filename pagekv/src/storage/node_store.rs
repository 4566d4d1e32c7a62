//! Node store: the layer between page numbers and B-tree nodes.
//!
//! Wraps the storage handle with typed reads and writes of the three kinds
//! of pages: nodes, the freelist chain and the meta page. Nodes are decoded
//! on read and encoded on write; nothing is cached here. The published meta
//! record and the allocator live with the database handle, and the staging
//! of a transaction's nodes lives in the transaction itself.

use std::sync::Arc;

use crate::storage::btree::{Node, NodeError, NodeLimits};
use crate::storage::freelist::{Freelist, FreelistError};
use crate::storage::io::{Storage, StorageError};
use crate::storage::meta::{self, Meta, MetaError};
use crate::storage::page::{META_PAGE_NUM, Page, PageNum, validate_page_size};

/// Node, freelist and meta page I/O over a shared storage handle.
///
/// Cloning is cheap and every clone uses the same storage. No method takes
/// a lock of its own beyond what the storage does per call.
#[derive(Clone)]
pub struct NodeStore {
    storage: Arc<dyn Storage>,
    limits: NodeLimits,
}

impl NodeStore {
    pub fn new(storage: Box<dyn Storage>) -> Result<Self, NodeStoreError> {
        let page_size = storage.page_size();
        validate_page_size(page_size).map_err(|e| NodeStoreError::InvalidPageSize(e.to_string()))?;
        Ok(Self {
            storage: Arc::from(storage),
            limits: NodeLimits::new(page_size),
        })
    }

    /// Load the committed state, initializing the storage first when it is
    /// empty or its initialization never reached the meta page.
    pub fn open(&self) -> Result<(Meta, Freelist), NodeStoreError> {
        if self.storage.is_empty() {
            return self.create();
        }

        let meta_page = self.storage.read_page(META_PAGE_NUM)?;
        let meta = match Meta::from_page(&meta_page) {
            Ok(meta) => meta,
            Err(e) if meta::never_committed(meta_page.as_bytes()) => {
                tracing::warn!("no meta page from a finished initialization ({e}), starting over");
                return self.create();
            }
            Err(e) => return Err(e.into()),
        };

        let freelist = Freelist::read_chain(meta.freelist, |page_num| {
            self.storage.read_page(page_num).map_err(NodeStoreError::from)
        })?;

        tracing::info!(
            "opened database at commit {} (root page {}, {} free pages)",
            meta.tx_id,
            meta.root,
            freelist.free_count()
        );
        Ok((meta, freelist))
    }

    /// Initialize the storage: an empty root collection, an empty freelist
    /// chain and a meta page for commit 0.
    fn create(&self) -> Result<(Meta, Freelist), NodeStoreError> {
        let page_size = self.page_size();
        let mut freelist = Freelist::new();
        let root = Node::empty_leaf(freelist.get_next_page());
        self.write_node(&root)?;

        let chain = freelist.prepare_chain(0, page_size);
        let freelist_head = self.write_freelist(&chain)?;
        self.sync()?;

        let meta = Meta::new(page_size, root.page_num, freelist_head, 0);
        self.write_meta(&meta, None)?;
        self.sync()?;

        tracing::info!("initialized database with {page_size} byte pages");
        Ok((meta, freelist))
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.limits.page_size
    }

    #[must_use]
    pub const fn limits(&self) -> NodeLimits {
        self.limits
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.storage.total_pages()
    }

    /// Read and decode the node stored at `page_num`.
    pub fn get_node(&self, page_num: PageNum) -> Result<Node, NodeStoreError> {
        if page_num == META_PAGE_NUM {
            return Err(NodeStoreError::Storage(StorageError::Corruption(
                "page 0 is not a node".to_string(),
            )));
        }
        let page = self.storage.read_page(page_num)?;
        Node::decode(page_num, &page).map_err(|source| NodeStoreError::Node { page_num, source })
    }

    /// Encode `node` and write it at its page number.
    pub fn write_node(&self, node: &Node) -> Result<(), NodeStoreError> {
        let page = node
            .encode(self.page_size())
            .map_err(|source| NodeStoreError::Node {
                page_num: node.page_num,
                source,
            })?;
        self.storage.write_page(node.page_num, &page)?;
        Ok(())
    }

    /// Write a chain built by `Freelist::prepare_chain`.
    ///
    /// Returns the head page of the chain.
    pub fn write_freelist(&self, chain: &[(PageNum, Page)]) -> Result<PageNum, NodeStoreError> {
        for (page_num, page) in chain {
            self.storage.write_page(*page_num, page)?;
        }
        let head = chain.first().map_or(0, |(p, _)| *p);
        tracing::debug!("wrote freelist chain of {} pages at {head}", chain.len());
        Ok(head)
    }

    /// Write page 0 with `meta` in its slot and `previous`, the record of
    /// the last published commit, kept in the other slot.
    pub fn write_meta(&self, meta: &Meta, previous: Option<&Meta>) -> Result<(), NodeStoreError> {
        self.storage.write_page(META_PAGE_NUM, &meta.to_page(previous))?;
        Ok(())
    }

    pub fn sync(&self) -> Result<(), NodeStoreError> {
        self.storage.sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("page_size", &self.limits.page_size)
            .field("total_pages", &self.total_pages())
            .finish_non_exhaustive()
    }
}

/// Errors that can occur in the node store.
#[derive(Debug)]
pub enum NodeStoreError {
    /// Storage I/O error.
    Storage(StorageError),
    /// A node failed to decode or encode.
    Node { page_num: PageNum, source: NodeError },
    /// Meta page error.
    Meta(MetaError),
    /// Freelist chain error.
    Freelist(FreelistError),
    /// Storage page size is not usable.
    InvalidPageSize(String),
}

impl std::fmt::Display for NodeStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Node { page_num, source } => write!(f, "node at page {page_num}: {source}"),
            Self::Meta(e) => write!(f, "meta page error: {e}"),
            Self::Freelist(e) => write!(f, "freelist error: {e}"),
            Self::InvalidPageSize(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for NodeStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Node { source, .. } => Some(source),
            Self::Meta(e) => Some(e),
            Self::Freelist(e) => Some(e),
            Self::InvalidPageSize(_) => None,
        }
    }
}

impl From<StorageError> for NodeStoreError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<MetaError> for NodeStoreError {
    fn from(e: MetaError) -> Self {
        Self::Meta(e)
    }
}

impl From<FreelistError> for NodeStoreError {
    fn from(e: FreelistError) -> Self {
        Self::Freelist(e)
    }
}
