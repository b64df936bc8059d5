//! Red-black tree over range start keys.
//!
//! The tree lives in the store it indexes: the root record and every node
//! are ordinary records, and nodes link to each other by key. Each
//! dereference is a keyed read through the enclosing transaction and every
//! structural change a keyed write, so a split or merge commits the tree
//! update atomically with the descriptors it indexes.


use {
    crate::{
        RangeError,
        RangeResult,
        keys::{RANGE_TREE_ROOT_KEY, range_descriptor_key, range_tree_node_key},
        metadata::{RangeDescriptor, RangeTree, RangeTreeNode},
        store::{Txn, TxnExt},
    },
    std::{
        cmp::Ordering,
        collections::{BTreeMap, BTreeSet},
    },
};

fn missing_node(key: &[u8]) -> RangeError {
    RangeError::CorruptIndex(format!("missing tree node {}", key.escape_ascii()))
}

fn corrupt(msg: impl Into<String>) -> RangeError {
    RangeError::CorruptIndex(msg.into())
}

/// Size and balance of the tree, as measured by [`RangeTreeTxn::verify`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    /// Number of nodes (live ranges).
    pub len: usize,
    /// Nodes on the longest root-to-leaf path.
    pub height: usize,
    /// Black nodes on every root-to-leaf path.
    pub black_height: usize,
}

/// Range tree operations within one transaction.
pub struct RangeTreeTxn<'t, T: Txn + ?Sized> {
    txn: &'t mut T,
}

impl<'t, T: Txn + ?Sized> RangeTreeTxn<'t, T> {
    pub fn new(txn: &'t mut T) -> Self {
        Self { txn }
    }

    /// Key of the root node, `None` for an empty tree.
    pub fn root(&mut self) -> RangeResult<Option<Vec<u8>>> {
        Ok(self
            .txn
            .get_message::<RangeTree>(RANGE_TREE_ROOT_KEY)?
            .and_then(|tree| tree.root_key))
    }

    pub fn is_empty(&mut self) -> RangeResult<bool> {
        Ok(self.root()?.is_none())
    }

    /// Reads the node indexing `key`.
    pub fn node(&mut self, key: &[u8]) -> RangeResult<Option<RangeTreeNode>> {
        self.txn.get_message(&range_tree_node_key(key))
    }

    fn expect_node(&mut self, key: &[u8]) -> RangeResult<RangeTreeNode> {
        self.node(key)?.ok_or_else(|| missing_node(key))
    }

    /// Reads the descriptor of the range starting at `start_key`.
    pub fn descriptor(&mut self, start_key: &[u8]) -> RangeResult<Option<RangeDescriptor>> {
        self.txn.get_message(&range_descriptor_key(start_key))
    }

    pub fn put_descriptor(&mut self, desc: &RangeDescriptor) -> RangeResult<()> {
        self.txn
            .put_message(&range_descriptor_key(&desc.start_key), desc)
    }

    pub fn delete_descriptor(&mut self, start_key: &[u8]) -> RangeResult<()> {
        self.txn.delete(&range_descriptor_key(start_key))
    }

    /// Returns the range containing `key`.
    ///
    /// Descends left when `key` sorts below the visited node and right
    /// otherwise, remembering the last node not above `key`: that node is the
    /// start key of the containing range.
    pub fn lookup(&mut self, key: &[u8]) -> RangeResult<RangeDescriptor> {
        let mut cursor = self.root()?;
        let mut candidate = None;
        while let Some(node_key) = cursor {
            let node = self.expect_node(&node_key)?;
            if key < node.key.as_slice() {
                cursor = node.left_key;
            } else {
                cursor = node.right_key;
                candidate = Some(node.key);
            }
        }

        let start_key = candidate.ok_or_else(|| RangeError::NotFound(key.to_vec()))?;
        let desc = self.descriptor(&start_key)?.ok_or_else(|| {
            corrupt(format!(
                "tree node {} has no range descriptor",
                start_key.escape_ascii()
            ))
        })?;
        if !desc.contains_key(key) {
            return Err(RangeError::NotFound(key.to_vec()));
        }
        Ok(desc)
    }

    /// Smallest key in the tree.
    pub fn first(&mut self) -> RangeResult<Option<Vec<u8>>> {
        match self.root()? {
            Some(root) => self.subtree_min(root).map(Some),
            None => Ok(None),
        }
    }

    fn subtree_min(&mut self, mut key: Vec<u8>) -> RangeResult<Vec<u8>> {
        while let Some(left) = self.expect_node(&key)?.left_key {
            key = left;
        }
        Ok(key)
    }

    /// Next key in order after `key`, which must be in the tree.
    pub fn successor(&mut self, key: &[u8]) -> RangeResult<Option<Vec<u8>>> {
        let node = self.expect_node(key)?;
        if let Some(right) = node.right_key {
            return self.subtree_min(right).map(Some);
        }

        let mut child = node.key;
        let mut parent = node.parent_key;
        while let Some(parent_key) = parent {
            let parent_node = self.expect_node(&parent_key)?;
            if parent_node.right_key.as_deref() != Some(child.as_slice()) {
                return Ok(Some(parent_key));
            }
            child = parent_key;
            parent = parent_node.parent_key;
        }
        Ok(None)
    }

    /// All keys in ascending order.
    pub fn keys(&mut self) -> RangeResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        let mut cursor = self.first()?;
        while let Some(key) = cursor {
            cursor = self.successor(&key)?;
            keys.push(key);
        }
        Ok(keys)
    }

    /// Descriptors of all live ranges in key order.
    pub fn ranges(&mut self) -> RangeResult<Vec<RangeDescriptor>> {
        self.keys()?
            .into_iter()
            .map(|key| {
                self.descriptor(&key)?.ok_or_else(|| {
                    corrupt(format!(
                        "tree node {} has no range descriptor",
                        key.escape_ascii()
                    ))
                })
            })
            .collect()
    }

    /// Adds a node for a new range starting at `key`.
    pub fn insert(&mut self, key: &[u8]) -> RangeResult<()> {
        let mut ops = Rebalancer::load(&mut *self.txn)?;
        ops.insert(key)?;
        ops.flush()
    }

    /// Removes the node of the range starting at `key`.
    pub fn delete(&mut self, key: &[u8]) -> RangeResult<()> {
        let mut ops = Rebalancer::load(&mut *self.txn)?;
        ops.delete(key)?;
        ops.flush()
    }

    /// Checks the red-black invariants, link symmetry and key order.
    pub fn verify(&mut self) -> RangeResult<TreeShape> {
        let Some(root) = self.root()? else {
            return Ok(TreeShape::default());
        };
        let node = self.expect_node(&root)?;
        if !node.black {
            return Err(corrupt("root is red"));
        }
        if node.parent_key.is_some() {
            return Err(corrupt("root has a parent"));
        }
        self.verify_subtree(&root, None, None)
    }

    fn verify_subtree(
        &mut self,
        key: &[u8],
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> RangeResult<TreeShape> {
        let node = self.expect_node(key)?;
        if node.key != key {
            return Err(corrupt(format!(
                "node stored at {} claims key {}",
                key.escape_ascii(),
                node.key.escape_ascii()
            )));
        }
        if lower.is_some_and(|l| key <= l) || upper.is_some_and(|u| key >= u) {
            return Err(corrupt(format!("node {} is out of order", key.escape_ascii())));
        }

        let mut shapes = [TreeShape::default(); 2];
        let children = [
            (node.left_key.as_deref(), lower, Some(key)),
            (node.right_key.as_deref(), Some(key), upper),
        ];
        for (shape, (child, lo, hi)) in shapes.iter_mut().zip(children) {
            let Some(child) = child else { continue };
            let child_node = self.expect_node(child)?;
            if child_node.parent_key.as_deref() != Some(key) {
                return Err(corrupt(format!(
                    "node {} does not link back to parent {}",
                    child.escape_ascii(),
                    key.escape_ascii()
                )));
            }
            if !node.black && !child_node.black {
                return Err(corrupt(format!(
                    "red node {} has red child {}",
                    key.escape_ascii(),
                    child.escape_ascii()
                )));
            }
            *shape = self.verify_subtree(child, lo, hi)?;
        }

        let [left, right] = shapes;
        if left.black_height != right.black_height {
            return Err(corrupt(format!(
                "unequal black height below {}",
                key.escape_ascii()
            )));
        }
        Ok(TreeShape {
            len: left.len + right.len + 1,
            height: left.height.max(right.height) + 1,
            black_height: left.black_height + usize::from(node.black),
        })
    }
}

/// Working set of one structural change.
///
/// Nodes are read through the transaction on first use, modified in place and
/// written back by [`flush`](Self::flush). The cache lives only for one
/// insert or delete.
struct Rebalancer<'a, T: Txn + ?Sized> {
    txn: &'a mut T,
    root: Option<Vec<u8>>,
    root_dirty: bool,
    nodes: BTreeMap<Vec<u8>, (RangeTreeNode, bool)>,
    deleted: BTreeSet<Vec<u8>>,
}

impl<'a, T: Txn + ?Sized> Rebalancer<'a, T> {
    fn load(txn: &'a mut T) -> RangeResult<Self> {
        let root = txn
            .get_message::<RangeTree>(RANGE_TREE_ROOT_KEY)?
            .and_then(|tree| tree.root_key);
        Ok(Self {
            txn,
            root,
            root_dirty: false,
            nodes: BTreeMap::new(),
            deleted: BTreeSet::new(),
        })
    }

    fn entry(&mut self, key: &[u8]) -> RangeResult<&mut (RangeTreeNode, bool)> {
        if !self.nodes.contains_key(key) {
            if self.deleted.contains(key) {
                return Err(missing_node(key));
            }
            let node = self
                .txn
                .get_message::<RangeTreeNode>(&range_tree_node_key(key))?
                .ok_or_else(|| missing_node(key))?;
            if node.key != key {
                return Err(missing_node(key));
            }
            self.nodes.insert(key.to_vec(), (node, false));
        }
        self.nodes.get_mut(key).ok_or_else(|| missing_node(key))
    }

    fn get(&mut self, key: &[u8]) -> RangeResult<RangeTreeNode> {
        Ok(self.entry(key)?.0.clone())
    }

    fn update(&mut self, key: &[u8], f: impl FnOnce(&mut RangeTreeNode)) -> RangeResult<()> {
        let entry = self.entry(key)?;
        f(&mut entry.0);
        entry.1 = true;
        Ok(())
    }

    fn parent(&mut self, key: &[u8]) -> RangeResult<Option<Vec<u8>>> {
        Ok(self.entry(key)?.0.parent_key.clone())
    }

    fn left(&mut self, key: &[u8]) -> RangeResult<Option<Vec<u8>>> {
        Ok(self.entry(key)?.0.left_key.clone())
    }

    fn right(&mut self, key: &[u8]) -> RangeResult<Option<Vec<u8>>> {
        Ok(self.entry(key)?.0.right_key.clone())
    }

    /// Absent nodes are black.
    fn is_black(&mut self, key: Option<&[u8]>) -> RangeResult<bool> {
        match key {
            Some(key) => Ok(self.entry(key)?.0.black),
            None => Ok(true),
        }
    }

    fn set_black(&mut self, key: &[u8], black: bool) -> RangeResult<()> {
        if self.entry(key)?.0.black == black {
            return Ok(());
        }
        self.update(key, |n| n.black = black)
    }

    fn set_parent(&mut self, key: &[u8], parent: Option<Vec<u8>>) -> RangeResult<()> {
        self.update(key, |n| n.parent_key = parent)
    }

    fn set_left(&mut self, key: &[u8], left: Option<Vec<u8>>) -> RangeResult<()> {
        self.update(key, |n| n.left_key = left)
    }

    fn set_right(&mut self, key: &[u8], right: Option<Vec<u8>>) -> RangeResult<()> {
        self.update(key, |n| n.right_key = right)
    }

    fn set_root(&mut self, root: Option<Vec<u8>>) {
        self.root = root;
        self.root_dirty = true;
    }

    fn sibling_of(&mut self, parent: &[u8], left_side: bool) -> RangeResult<Vec<u8>> {
        let sibling = if left_side {
            self.right(parent)?
        } else {
            self.left(parent)?
        };
        sibling.ok_or_else(|| {
            corrupt(format!(
                "node {} is missing a child required by its black height",
                parent.escape_ascii()
            ))
        })
    }

    /// Points the link that `parent` holds to `old` at `new` instead.
    fn replace_child(
        &mut self,
        parent: Option<&[u8]>,
        old: &[u8],
        new: Option<Vec<u8>>,
    ) -> RangeResult<()> {
        let Some(parent) = parent else {
            self.set_root(new);
            return Ok(());
        };
        if self.left(parent)?.as_deref() == Some(old) {
            self.set_left(parent, new)
        } else if self.right(parent)?.as_deref() == Some(old) {
            self.set_right(parent, new)
        } else {
            Err(corrupt(format!(
                "node {} is not a child of its parent {}",
                old.escape_ascii(),
                parent.escape_ascii()
            )))
        }
    }

    fn rotate_left(&mut self, x: &[u8]) -> RangeResult<()> {
        let y = self.right(x)?.ok_or_else(|| {
            corrupt(format!(
                "rotate left without right child at {}",
                x.escape_ascii()
            ))
        })?;
        let y_left = self.left(&y)?;
        if let Some(yl) = &y_left {
            self.set_parent(yl, Some(x.to_vec()))?;
        }
        self.set_right(x, y_left)?;

        let x_parent = self.parent(x)?;
        self.replace_child(x_parent.as_deref(), x, Some(y.clone()))?;
        self.set_parent(&y, x_parent)?;
        self.set_left(&y, Some(x.to_vec()))?;
        self.set_parent(x, Some(y))
    }

    fn rotate_right(&mut self, x: &[u8]) -> RangeResult<()> {
        let y = self.left(x)?.ok_or_else(|| {
            corrupt(format!(
                "rotate right without left child at {}",
                x.escape_ascii()
            ))
        })?;
        let y_right = self.right(&y)?;
        if let Some(yr) = &y_right {
            self.set_parent(yr, Some(x.to_vec()))?;
        }
        self.set_left(x, y_right)?;

        let x_parent = self.parent(x)?;
        self.replace_child(x_parent.as_deref(), x, Some(y.clone()))?;
        self.set_parent(&y, x_parent)?;
        self.set_right(&y, Some(x.to_vec()))?;
        self.set_parent(x, Some(y))
    }

    fn rotate(&mut self, x: &[u8], left: bool) -> RangeResult<()> {
        if left {
            self.rotate_left(x)
        } else {
            self.rotate_right(x)
        }
    }

    fn child(&mut self, key: &[u8], left: bool) -> RangeResult<Option<Vec<u8>>> {
        if left { self.left(key) } else { self.right(key) }
    }

    fn insert(&mut self, key: &[u8]) -> RangeResult<()> {
        let mut parent: Option<Vec<u8>> = None;
        let mut go_left = false;
        let mut cursor = self.root.clone();
        while let Some(node_key) = cursor {
            let node = self.get(&node_key)?;
            cursor = match key.cmp(node.key.as_slice()) {
                Ordering::Less => {
                    go_left = true;
                    node.left_key
                }
                Ordering::Greater => {
                    go_left = false;
                    node.right_key
                }
                Ordering::Equal => return Err(RangeError::DuplicateKey(key.to_vec())),
            };
            parent = Some(node_key);
        }

        // A record that the walk did not reach is a dangling node.
        if self.txn.get(&range_tree_node_key(key))?.is_some() {
            return Err(corrupt(format!(
                "unreachable tree node {}",
                key.escape_ascii()
            )));
        }

        self.deleted.remove(key);
        self.nodes.insert(
            key.to_vec(),
            (RangeTreeNode::leaf(key, parent.clone()), true),
        );
        match parent {
            None => self.set_root(Some(key.to_vec())),
            Some(p) if go_left => self.set_left(&p, Some(key.to_vec()))?,
            Some(p) => self.set_right(&p, Some(key.to_vec()))?,
        }
        self.insert_fixup(key.to_vec())
    }

    fn insert_fixup(&mut self, mut z: Vec<u8>) -> RangeResult<()> {
        while let Some(p) = self.parent(&z)? {
            if self.is_black(Some(&p))? {
                break;
            }
            // A red node is never the root.
            let g = self
                .parent(&p)?
                .ok_or_else(|| corrupt(format!("red node {} has no parent", p.escape_ascii())))?;
            let parent_is_left = self.left(&g)?.as_deref() == Some(p.as_slice());
            if let Some(uncle) = self.child(&g, !parent_is_left)? {
                if !self.is_black(Some(&uncle))? {
                    self.set_black(&p, true)?;
                    self.set_black(&uncle, true)?;
                    self.set_black(&g, false)?;
                    z = g;
                    continue;
                }
            }

            let mut p = p;
            // Inner grandchild: rotate it to the outside first.
            if self.child(&p, !parent_is_left)?.as_deref() == Some(z.as_slice()) {
                z = p;
                self.rotate(&z, parent_is_left)?;
                p = self
                    .parent(&z)?
                    .ok_or_else(|| corrupt("rotated node lost its parent"))?;
            }
            self.set_black(&p, true)?;
            self.set_black(&g, false)?;
            self.rotate(&g, !parent_is_left)?;
        }

        if let Some(root) = self.root.clone() {
            self.set_black(&root, true)?;
        }
        Ok(())
    }

    /// Replaces the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, u: &[u8], v: Option<Vec<u8>>) -> RangeResult<()> {
        let u_parent = self.parent(u)?;
        self.replace_child(u_parent.as_deref(), u, v.clone())?;
        if let Some(v) = v {
            self.set_parent(&v, u_parent)?;
        }
        Ok(())
    }

    fn subtree_min(&mut self, mut key: Vec<u8>) -> RangeResult<Vec<u8>> {
        while let Some(left) = self.left(&key)? {
            key = left;
        }
        Ok(key)
    }

    fn delete(&mut self, key: &[u8]) -> RangeResult<()> {
        let z = self.get(key)?;
        let removed_black;
        let x;
        let x_parent;

        match (z.left_key.clone(), z.right_key.clone()) {
            (None, right) => {
                removed_black = z.black;
                x = right.clone();
                x_parent = z.parent_key.clone();
                self.transplant(key, right)?;
            }
            (left, None) => {
                removed_black = z.black;
                x = left.clone();
                x_parent = z.parent_key.clone();
                self.transplant(key, left)?;
            }
            (Some(z_left), Some(z_right)) => {
                // The successor takes z's place; keys are identities, so the
                // node moves rather than its key.
                let y = self.subtree_min(z_right.clone())?;
                let y_node = self.get(&y)?;
                removed_black = y_node.black;
                x = y_node.right_key.clone();
                if y_node.parent_key.as_deref() == Some(key) {
                    x_parent = Some(y.clone());
                } else {
                    x_parent = y_node.parent_key.clone();
                    self.transplant(&y, x.clone())?;
                    self.set_right(&y, Some(z_right.clone()))?;
                    self.set_parent(&z_right, Some(y.clone()))?;
                }
                self.transplant(key, Some(y.clone()))?;
                self.set_left(&y, Some(z_left.clone()))?;
                self.set_parent(&z_left, Some(y.clone()))?;
                self.set_black(&y, z.black)?;
            }
        }

        self.nodes.remove(key);
        self.deleted.insert(key.to_vec());

        if removed_black {
            self.delete_fixup(x, x_parent)?;
        }
        Ok(())
    }

    fn delete_fixup(
        &mut self,
        mut x: Option<Vec<u8>>,
        mut parent: Option<Vec<u8>>,
    ) -> RangeResult<()> {
        while x != self.root && self.is_black(x.as_deref())? {
            let Some(p) = parent.clone() else { break };
            // With x absent, it is the left child iff p has no left child.
            let x_is_left = self.left(&p)? == x;

            let mut w = self.sibling_of(&p, x_is_left)?;
            if !self.is_black(Some(&w))? {
                self.set_black(&w, true)?;
                self.set_black(&p, false)?;
                self.rotate(&p, x_is_left)?;
                w = self.sibling_of(&p, x_is_left)?;
            }

            let near = self.child(&w, x_is_left)?;
            let far = self.child(&w, !x_is_left)?;
            if self.is_black(near.as_deref())? && self.is_black(far.as_deref())? {
                self.set_black(&w, false)?;
                parent = self.parent(&p)?;
                x = Some(p);
                continue;
            }

            if self.is_black(far.as_deref())? {
                if let Some(near) = &near {
                    self.set_black(near, true)?;
                }
                self.set_black(&w, false)?;
                self.rotate(&w, !x_is_left)?;
                w = self.sibling_of(&p, x_is_left)?;
            }

            let p_black = self.is_black(Some(&p))?;
            self.set_black(&w, p_black)?;
            self.set_black(&p, true)?;
            if let Some(far) = self.child(&w, !x_is_left)? {
                self.set_black(&far, true)?;
            }
            self.rotate(&p, x_is_left)?;
            x = self.root.clone();
            parent = None;
        }

        if let Some(x) = x {
            self.set_black(&x, true)?;
        }
        Ok(())
    }

    /// Writes every touched node and the root back to the transaction.
    fn flush(self) -> RangeResult<()> {
        for key in &self.deleted {
            self.txn.delete(&range_tree_node_key(key))?;
        }
        for (key, (node, dirty)) in &self.nodes {
            if *dirty {
                self.txn.put_message(&range_tree_node_key(key), node)?;
            }
        }
        if self.root_dirty {
            self.txn.put_message(
                RANGE_TREE_ROOT_KEY,
                &RangeTree {
                    root_key: self.root.clone(),
                },
            )?;
        }
        Ok(())
    }
}
