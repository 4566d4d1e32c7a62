//! B-tree algorithms over a transaction's view of the store.
//!
//! Every function takes the transaction explicitly and works on owned node
//! copies. Mutations descend once, recording the path, and then rebuild it
//! bottom-up: each node on the path is fixed up (split, rotated or merged as
//! needed) and re-staged with `write_node`, which relocates committed pages.
//! The parent then repoints at whatever page the child landed on.

use crate::storage::btree::node::{Item, Node};
use crate::storage::page::PageNum;
use crate::storage::transaction::{Transaction, TransactionError};

/// A node on the descent path and the index of the child taken from it.
type Path = Vec<(Node, usize)>;

/// Look up `key` in the tree rooted at `root`.
pub fn find(
    tx: &Transaction<'_>,
    root: PageNum,
    key: &[u8],
) -> Result<Option<Item>, TransactionError> {
    let mut node = tx.get_node(root)?;
    loop {
        match node.find_key(key) {
            Ok(i) => return Ok(Some(node.items.swap_remove(i))),
            Err(_) if node.is_leaf() => return Ok(None),
            Err(i) => node = tx.get_node(node.children[i])?,
        }
    }
}

/// Insert or update `item`. Returns the (possibly new) root page.
pub fn put(tx: &mut Transaction<'_>, root: PageNum, item: Item) -> Result<PageNum, TransactionError> {
    let mut path = Path::new();
    let mut node = tx.get_node(root)?;
    loop {
        match node.find_key(&item.key) {
            Ok(i) => {
                node.items[i].value = item.value;
                break;
            }
            Err(i) if node.is_leaf() => {
                node.items.insert(i, item);
                break;
            }
            Err(i) => {
                let child = node.children[i];
                path.push((node, i));
                node = tx.get_node(child)?;
            }
        }
    }
    rebuild(tx, path, node)
}

/// Remove `key`. Returns the new root page, or `None` if the key was absent
/// (in which case nothing is staged).
pub fn remove(
    tx: &mut Transaction<'_>,
    root: PageNum,
    key: &[u8],
) -> Result<Option<PageNum>, TransactionError> {
    let mut path = Path::new();
    let mut node = tx.get_node(root)?;
    let found = loop {
        match node.find_key(key) {
            Ok(i) => break i,
            Err(_) if node.is_leaf() => return Ok(None),
            Err(i) => {
                let child = node.children[i];
                path.push((node, i));
                node = tx.get_node(child)?;
            }
        }
    };

    if node.is_leaf() {
        node.items.remove(found);
        return rebuild(tx, path, node).map(Some);
    }

    // Replace the branch item with its in-order predecessor, the last item
    // of the rightmost leaf of the left subtree.
    let depth = path.len();
    let mut leaf = tx.get_node(node.children[found])?;
    path.push((node, found));
    while !leaf.is_leaf() {
        let last = leaf.children.len() - 1;
        let child = leaf.children[last];
        path.push((leaf, last));
        leaf = tx.get_node(child)?;
    }
    let predecessor = leaf.items.pop().ok_or_else(|| {
        TransactionError::CorruptTree(format!("empty non-root leaf at page {}", leaf.page_num))
    })?;
    path[depth].0.items[found] = predecessor;
    rebuild(tx, path, leaf).map(Some)
}

/// Re-stage every node on `path`, bottom-up, starting from the modified `node`.
fn rebuild(tx: &mut Transaction<'_>, mut path: Path, node: Node) -> Result<PageNum, TransactionError> {
    let limits = tx.limits();
    let mut current = node;

    while let Some((mut parent, idx)) = path.pop() {
        if current.is_over_populated(&limits) {
            let (left, separator, right) = split(tx, current)?;
            parent.children[idx] = left;
            parent.items.insert(idx, separator);
            parent.children.insert(idx + 1, right);
        } else if current.is_under_populated(&limits) {
            rebalance(tx, &mut parent, idx, current)?;
        } else {
            parent.children[idx] = tx.write_node(current)?;
        }
        current = parent;
    }

    // `current` is the root.
    if current.is_over_populated(&limits) {
        let (left, separator, right) = split(tx, current)?;
        let root = tx.new_node(vec![separator], vec![left, right])?;
        return tx.write_node(root);
    }
    if current.items.is_empty() && !current.is_leaf() {
        let only_child = current.children[0];
        tx.delete_node(current.page_num)?;
        return Ok(only_child);
    }
    tx.write_node(current)
}

/// Split an over-populated node in two. Returns `(left, separator, right)`.
fn split(tx: &mut Transaction<'_>, mut node: Node) -> Result<(PageNum, Item, PageNum), TransactionError> {
    let Some(mid) = node.split_index() else {
        return Err(TransactionError::CorruptTree(format!(
            "node at page {} is over-populated with {} items",
            node.page_num,
            node.items.len()
        )));
    };
    let (separator, right_items, right_children) = node.split_off(mid);
    let right = tx.new_node(right_items, right_children)?;
    let left = tx.write_node(node)?;
    let right = tx.write_node(right)?;
    Ok((left, separator, right))
}

/// Fix an under-populated child of `parent` at `idx`.
///
/// Borrows an item from a sibling that can spare one, else merges with a
/// sibling if the result fits. If neither works the child is written as is.
fn rebalance(
    tx: &mut Transaction<'_>,
    parent: &mut Node,
    idx: usize,
    mut node: Node,
) -> Result<(), TransactionError> {
    let limits = tx.limits();
    let mut left = match idx.checked_sub(1) {
        Some(i) => Some(tx.get_node(parent.children[i])?),
        None => None,
    };
    let mut right = match parent.children.get(idx + 1) {
        Some(&page_num) => Some(tx.get_node(page_num)?),
        None => None,
    };

    // Rotate right: left sibling's last item moves up, separator moves down.
    if let Some(mut left) = left.take_if(|l| l.can_spare_last(&limits)) {
        let moved = left.items.pop().ok_or_else(|| corrupt(&left))?;
        let separator = std::mem::replace(&mut parent.items[idx - 1], moved);
        node.items.insert(0, separator);
        if let Some(child) = left.children.pop() {
            node.children.insert(0, child);
        }
        parent.children[idx - 1] = tx.write_node(left)?;
        parent.children[idx] = tx.write_node(node)?;
        return Ok(());
    }

    // Rotate left: right sibling's first item moves up, separator moves down.
    if let Some(mut right) = right.take_if(|r| r.can_spare_first(&limits)) {
        let moved = right.items.remove(0);
        let separator = std::mem::replace(&mut parent.items[idx], moved);
        node.items.push(separator);
        if !right.is_leaf() {
            node.children.push(right.children.remove(0));
        }
        parent.children[idx] = tx.write_node(node)?;
        parent.children[idx + 1] = tx.write_node(right)?;
        return Ok(());
    }

    // Merge into the left sibling.
    if let Some(mut left) = left {
        let merged = left.size() + parent.items[idx - 1].size() + node.size();
        if merged <= limits.max_fill {
            left.items.push(parent.items.remove(idx - 1));
            left.items.append(&mut node.items);
            left.children.append(&mut node.children);
            parent.children.remove(idx);
            parent.children[idx - 1] = tx.write_node(left)?;
            tx.delete_node(node.page_num)?;
            return Ok(());
        }
    }

    // Merge the right sibling into this node.
    if let Some(mut right) = right {
        let merged = node.size() + parent.items[idx].size() + right.size();
        if merged <= limits.max_fill {
            node.items.push(parent.items.remove(idx));
            node.items.append(&mut right.items);
            node.children.append(&mut right.children);
            parent.children.remove(idx + 1);
            parent.children[idx] = tx.write_node(node)?;
            tx.delete_node(right.page_num)?;
            return Ok(());
        }
    }

    parent.children[idx] = tx.write_node(node)?;
    Ok(())
}

fn corrupt(node: &Node) -> TransactionError {
    TransactionError::CorruptTree(format!("unexpected empty node at page {}", node.page_num))
}

/// All items of the tree, in key order.
pub fn items(tx: &Transaction<'_>, root: PageNum) -> Result<Vec<Item>, TransactionError> {
    scan_prefix(tx, root, &[])
}

/// Items whose key starts with `prefix`, in key order.
pub fn scan_prefix(
    tx: &Transaction<'_>,
    root: PageNum,
    prefix: &[u8],
) -> Result<Vec<Item>, TransactionError> {
    let mut out = Vec::new();
    scan_node(tx, root, prefix, &mut out)?;
    Ok(out)
}

/// In-order walk that skips subtrees entirely below `prefix`.
/// Returns `false` once a key past the prefix range is seen.
fn scan_node(
    tx: &Transaction<'_>,
    page_num: PageNum,
    prefix: &[u8],
    out: &mut Vec<Item>,
) -> Result<bool, TransactionError> {
    let node = tx.get_node(page_num)?;
    let leaf = node.is_leaf();
    let count = node.items.len();

    for i in 0..=count {
        let visit_child = !leaf && node.items.get(i).is_none_or(|item| item.key.as_slice() >= prefix);
        if visit_child && !scan_node(tx, node.children[i], prefix, out)? {
            return Ok(false);
        }
        if let Some(item) = node.items.get(i) {
            if item.key.starts_with(prefix) {
                out.push(item.clone());
            } else if item.key.as_slice() > prefix {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Release every page of the tree rooted at `root`.
pub fn free_tree(tx: &mut Transaction<'_>, root: PageNum) -> Result<(), TransactionError> {
    let mut stack = vec![root];
    while let Some(page_num) = stack.pop() {
        let node = tx.get_node(page_num)?;
        stack.extend_from_slice(&node.children);
        tx.delete_node(page_num)?;
    }
    Ok(())
}

/// Check the B-tree invariants of the tree rooted at `root`.
///
/// Returns the number of items. Verifies key order across nodes, child
/// counts and that every leaf sits at the same depth.
pub fn verify(tx: &Transaction<'_>, root: PageNum) -> Result<usize, TransactionError> {
    let mut leaf_depth = None;
    verify_node(tx, root, None, None, 0, &mut leaf_depth)
}

fn verify_node(
    tx: &Transaction<'_>,
    page_num: PageNum,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    depth: usize,
    leaf_depth: &mut Option<usize>,
) -> Result<usize, TransactionError> {
    let node = tx.get_node(page_num)?;
    let fail = |msg: &str| TransactionError::CorruptTree(format!("page {page_num}: {msg}"));

    for item in &node.items {
        if lower.is_some_and(|l| item.key.as_slice() <= l)
            || upper.is_some_and(|u| item.key.as_slice() >= u)
        {
            return Err(fail("key outside parent bounds"));
        }
    }

    if node.is_leaf() {
        match *leaf_depth {
            Some(d) if d != depth => return Err(fail("leaves at different depths")),
            _ => *leaf_depth = Some(depth),
        }
        return Ok(node.items.len());
    }

    if node.children.len() != node.items.len() + 1 {
        return Err(fail("child count mismatch"));
    }
    let mut count = node.items.len();
    for (i, &child) in node.children.iter().enumerate() {
        let lo = if i == 0 {
            lower
        } else {
            Some(node.items[i - 1].key.as_slice())
        };
        let hi = node.items.get(i).map_or(upper, |item| Some(item.key.as_slice()));
        count += verify_node(tx, child, lo, hi, depth + 1, leaf_depth)?;
    }
    Ok(count)
}
