//! B-tree node types and serialization.
//!
//! Every node occupies exactly one page. Branch nodes carry items as well as
//! child pointers (a classic B-tree, not a B+tree), so a key is stored once,
//! either in a leaf or in the branch that separates two subtrees.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::storage::page::{Page, PageError, PageHeader, PageNum, PageType};

/// Node layout (after the page header):
/// - `item_count`: 2 bytes
/// - branch only: `item_count + 1` child page numbers, 8 bytes each
/// - items: `key_len` (2 bytes), `value_len` (2 bytes), key, value
const ITEM_COUNT_OFFSET: usize = PageHeader::SIZE;

/// Offset where child pointers (branch) or items (leaf) start.
const DATA_OFFSET: usize = ITEM_COUNT_OFFSET + 2;

/// Size of a child pointer.
const CHILD_SIZE: usize = 8;

/// Per-item overhead: key and value lengths.
pub const ITEM_OVERHEAD: usize = 4;

/// A key/value pair stored in a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Item {
    #[must_use]
    pub const fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    /// Encoded size of this item.
    #[must_use]
    pub fn size(&self) -> usize {
        ITEM_OVERHEAD + self.key.len() + self.value.len()
    }
}

/// Fill thresholds derived from the page size.
///
/// - an item may take at most a quarter of a page, so a node that overflows
///   by one item can always be split into two halves that fit
/// - a node above `max_fill` bytes is split
/// - a non-root node below `min_fill` bytes is rebalanced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLimits {
    pub page_size: usize,
    pub max_item_size: usize,
    pub min_fill: usize,
    pub max_fill: usize,
}

impl NodeLimits {
    #[must_use]
    pub const fn new(page_size: usize) -> Self {
        Self {
            page_size,
            max_item_size: page_size / 4,
            min_fill: page_size / 4,
            max_fill: page_size * 95 / 100,
        }
    }

    /// Whether a key/value pair is small enough to store.
    #[must_use]
    pub const fn item_fits(&self, key_len: usize, value_len: usize) -> bool {
        ITEM_OVERHEAD + key_len + value_len <= self.max_item_size
    }
}

/// An in-memory B-tree node.
///
/// `children` is empty for a leaf and holds `items.len() + 1` page numbers
/// for a branch. `children[i]` holds keys below `items[i].key`;
/// `children[i + 1]` holds keys above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Page the node occupies, 0 until one is assigned.
    pub page_num: PageNum,
    pub items: Vec<Item>,
    pub children: Vec<PageNum>,
}

impl Node {
    #[must_use]
    pub const fn new(page_num: PageNum, items: Vec<Item>, children: Vec<PageNum>) -> Self {
        Self {
            page_num,
            items,
            children,
        }
    }

    /// Create an empty leaf.
    #[must_use]
    pub const fn empty_leaf(page_num: PageNum) -> Self {
        Self::new(page_num, Vec::new(), Vec::new())
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Binary search for `key`.
    ///
    /// `Ok(i)` if `items[i]` holds the key, else `Err(i)` with the insertion
    /// point, which is also the child to descend into.
    pub fn find_key(&self, key: &[u8]) -> Result<usize, usize> {
        self.items
            .binary_search_by(|item| item.key.as_slice().cmp(key))
    }

    /// Encoded size of the node in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        DATA_OFFSET
            + self.children.len() * CHILD_SIZE
            + self.items.iter().map(Item::size).sum::<usize>()
    }

    #[must_use]
    pub fn is_over_populated(&self, limits: &NodeLimits) -> bool {
        self.size() > limits.max_fill
    }

    #[must_use]
    pub fn is_under_populated(&self, limits: &NodeLimits) -> bool {
        self.size() < limits.min_fill
    }

    /// Whether the last item (and last child) can move to a sibling
    /// without leaving this node under-populated.
    #[must_use]
    pub fn can_spare_last(&self, limits: &NodeLimits) -> bool {
        self.items
            .last()
            .is_some_and(|item| self.can_spare(item, limits))
    }

    /// Whether the first item (and first child) can move to a sibling
    /// without leaving this node under-populated.
    #[must_use]
    pub fn can_spare_first(&self, limits: &NodeLimits) -> bool {
        self.items
            .first()
            .is_some_and(|item| self.can_spare(item, limits))
    }

    fn can_spare(&self, item: &Item, limits: &NodeLimits) -> bool {
        let child = if self.is_leaf() { 0 } else { CHILD_SIZE };
        self.items.len() >= 2 && self.size() - item.size() - child >= limits.min_fill
    }

    /// Index of the item to promote when splitting.
    ///
    /// Chosen so the two halves hold roughly the same number of bytes, and
    /// each half keeps at least one item. `None` if the node has fewer than
    /// three items.
    #[must_use]
    pub fn split_index(&self) -> Option<usize> {
        let len = self.items.len();
        if len < 3 {
            return None;
        }
        let total: usize = self.items.iter().map(Item::size).sum();
        let mut acc = 0;
        let mut mid = len / 2;
        for (i, item) in self.items.iter().enumerate() {
            acc += item.size();
            if acc * 2 >= total {
                mid = i;
                break;
            }
        }
        Some(mid.clamp(1, len - 2))
    }

    /// Split off everything right of `mid`.
    ///
    /// `self` keeps the left half; returns the promoted item and the right
    /// half's items and children.
    pub fn split_off(&mut self, mid: usize) -> (Item, Vec<Item>, Vec<PageNum>) {
        let right_items = self.items.split_off(mid + 1);
        let right_children = if self.is_leaf() {
            Vec::new()
        } else {
            self.children.split_off(mid + 1)
        };
        // `mid` is below len, so the left half still holds the separator.
        let separator = self.items.remove(mid);
        (separator, right_items, right_children)
    }

    /// Serialize the node into a sealed page.
    pub fn encode(&self, page_size: usize) -> Result<Page, NodeError> {
        let size = self.size();
        if size > page_size {
            return Err(NodeError::TooLarge { size, page_size });
        }
        if !self.is_leaf() && self.children.len() != self.items.len() + 1 {
            return Err(NodeError::ChildCountMismatch {
                items: self.items.len(),
                children: self.children.len(),
            });
        }

        let mut page = Page::new(page_size);
        page.write_u16(ITEM_COUNT_OFFSET, self.items.len() as u16);

        let mut offset = DATA_OFFSET;
        for child in &self.children {
            page.write_u64(offset, *child);
            offset += CHILD_SIZE;
        }
        for item in &self.items {
            page.write_u16(offset, item.key.len() as u16);
            page.write_u16(offset + 2, item.value.len() as u16);
            offset += ITEM_OVERHEAD;
            page.write_bytes(offset, &item.key);
            offset += item.key.len();
            page.write_bytes(offset, &item.value);
            offset += item.value.len();
        }

        let page_type = if self.is_leaf() {
            PageType::Leaf
        } else {
            PageType::Branch
        };
        page.seal(page_type);
        Ok(page)
    }

    /// Deserialize a node from a page, validating checksum, bounds and key order.
    pub fn decode(page_num: PageNum, page: &Page) -> Result<Self, NodeError> {
        let header = page.verify()?;
        let is_branch = match header.page_type {
            PageType::Branch => true,
            PageType::Leaf => false,
            other => return Err(NodeError::WrongPageType(other)),
        };

        let item_count = page.read_u16(ITEM_COUNT_OFFSET) as usize;
        let mut cursor = Cursor {
            page,
            offset: DATA_OFFSET,
        };

        let mut children = Vec::new();
        if is_branch {
            children.reserve(item_count + 1);
            for _ in 0..=item_count {
                let child = cursor.u64()?;
                if child == 0 {
                    return Err(NodeError::InvalidChild);
                }
                children.push(child);
            }
        }

        let mut items: Vec<Item> = Vec::with_capacity(item_count);
        for _ in 0..item_count {
            let key_len = cursor.u16()? as usize;
            let value_len = cursor.u16()? as usize;
            let key = cursor.bytes(key_len)?.to_vec();
            let value = cursor.bytes(value_len)?.to_vec();

            if let Some(prev) = items.last()
                && prev.key.as_slice().cmp(&key) != Ordering::Less
            {
                return Err(NodeError::UnsortedKeys);
            }
            items.push(Item { key, value });
        }

        Ok(Self {
            page_num,
            items,
            children,
        })
    }
}

/// Bounds-checked reader over a page.
struct Cursor<'a> {
    page: &'a Page,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], NodeError> {
        let end = self.offset + len;
        if end > self.page.size() {
            return Err(NodeError::Truncated {
                offset: self.offset,
            });
        }
        let bytes = self.page.read_bytes(self.offset, len);
        self.offset = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, NodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, NodeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Errors that can occur when encoding or decoding a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Page header or checksum is invalid.
    Page(PageError),
    /// Page is not a B-tree node.
    WrongPageType(PageType),
    /// Encoded data runs past the end of the page.
    Truncated { offset: usize },
    /// Keys are not strictly ascending.
    UnsortedKeys,
    /// Branch references page 0.
    InvalidChild,
    /// Branch child count does not match its item count.
    ChildCountMismatch { items: usize, children: usize },
    /// Node does not fit in a page.
    TooLarge { size: usize, page_size: usize },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Page(e) => write!(f, "{e}"),
            Self::WrongPageType(t) => write!(f, "expected a B-tree node, found {t:?} page"),
            Self::Truncated { offset } => write!(f, "node data truncated at offset {offset}"),
            Self::UnsortedKeys => write!(f, "node keys are not sorted"),
            Self::InvalidChild => write!(f, "branch node references page 0"),
            Self::ChildCountMismatch { items, children } => {
                write!(f, "branch has {items} items but {children} children")
            }
            Self::TooLarge { size, page_size } => {
                write!(f, "node of {size} bytes does not fit a {page_size} byte page")
            }
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PageError> for NodeError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}
