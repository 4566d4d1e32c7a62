//! B-tree implementation for the storage engine.
//!
//! Every collection, and the root collection that maps collection names to
//! tree roots, is one of these trees.
//!
//! # Structure
//!
//! The B-tree consists of:
//! - Branch nodes: store items and child page pointers, `children.len() == items.len() + 1`
//! - Leaf nodes: store items only
//!
//! Items live in both kinds of node. Nodes are sized in bytes rather than
//! item counts: a node is split above `max_fill` bytes and rebalanced below
//! `min_fill` (see [`NodeLimits`]).
//!
//! # Usage
//!
//! ```
//! use pagekv::storage::btree::{Item, Node, NodeLimits};
//!
//! let limits = NodeLimits::new(4096);
//! let leaf = Node::new(1, vec![Item::new(b"k".to_vec(), b"v".to_vec())], vec![]);
//!
//! assert!(leaf.is_leaf());
//! assert!(!leaf.is_over_populated(&limits));
//! assert_eq!(leaf.find_key(b"k"), Ok(0));
//! ```

mod node;
mod tree;

pub use node::{ITEM_OVERHEAD, Item, Node, NodeError, NodeLimits};
pub use tree::{find, free_tree, items, put, remove, scan_prefix, verify};
