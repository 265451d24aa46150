//! Red-black balanced binary search tree.
//!
//! Nodes live in an index arena. Slot 0 is a black NIL sentinel so the
//! textbook insert/delete fixups can write through it without special cases.
//! Keys are assigned from a monotonically increasing counter unless an
//! explicit key is given, which gives owners (the Merkle tree) a stable
//! left-to-right leaf order.
//!
//! [`NodeId`]s are only valid until the node they name is deleted; the slot is
//! recycled by a later insertion.

use crate::error::TreeError;

/// Index of a node inside the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

const NIL: NodeId = NodeId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Left,
    Right,
}

impl Dir {
    fn flip(self) -> Self {
        match self {
            Dir::Left => Dir::Right,
            Dir::Right => Dir::Left,
        }
    }
}

#[derive(Debug, Clone)]
struct Node<T> {
    key: u64,
    data: Option<T>,
    left: NodeId,
    right: NodeId,
    parent: NodeId,
    red: bool,
}

impl<T> Node<T> {
    fn vacant() -> Self {
        Self {
            key: 0,
            data: None,
            left: NIL,
            right: NIL,
            parent: NIL,
            red: false,
        }
    }
}

/// Structure of a subtree (keys only), for comparing tree shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub key: u64,
    pub left: Option<Box<Shape>>,
    pub right: Option<Box<Shape>>,
}

impl Shape {
    /// All keys in pre-order.
    pub fn flatten(&self) -> Vec<u64> {
        let mut keys = vec![self.key];
        if let Some(left) = &self.left {
            keys.extend(left.flatten());
        }
        if let Some(right) = &self.right {
            keys.extend(right.flatten());
        }
        keys
    }
}

/// Red-black tree keyed by `u64`.
#[derive(Debug, Clone)]
pub struct RedBlackTree<T> {
    nodes: Vec<Node<T>>,
    free: Vec<NodeId>,
    root: NodeId,
    next_key: u64,
    len: usize,
}

impl<T> Default for RedBlackTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RedBlackTree<T> {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::vacant()],
            free: Vec::new(),
            root: NIL,
            next_key: 1,
            len: 0,
        }
    }

    /// Total number of nodes.
    pub fn size(&self) -> usize {
        self.len
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Root node, if any.
    pub fn root(&self) -> Option<NodeId> {
        self.some(self.root)
    }

    /// Insert with the next auto-assigned key. Returns the key.
    pub fn insert(&mut self, data: T) -> u64 {
        let key = self.next_key;
        // next_key is always above every key in the tree
        self.attach(key, data);
        key
    }

    /// Insert with an explicit key.
    pub fn insert_with_key(&mut self, data: T, key: u64) -> Result<(), TreeError> {
        if self.find(key).is_some() {
            return Err(TreeError::DuplicateKey(key));
        }
        self.attach(key, data);
        Ok(())
    }

    /// Remove the node at `key`, returning its data.
    pub fn delete(&mut self, key: u64) -> Option<T> {
        let z = self.find(key)?;
        let mut y = z;
        let mut y_red = self.n(y).red;
        let x;
        if self.n(z).left == NIL {
            x = self.n(z).right;
            self.transplant(z, x);
        } else if self.n(z).right == NIL {
            x = self.n(z).left;
            self.transplant(z, x);
        } else {
            y = self.minimum(self.n(z).right);
            y_red = self.n(y).red;
            x = self.n(y).right;
            if self.n(y).parent == z {
                self.n_mut(x).parent = y;
            } else {
                self.transplant(y, x);
                let zr = self.n(z).right;
                self.n_mut(y).right = zr;
                self.n_mut(zr).parent = y;
            }
            self.transplant(z, y);
            let zl = self.n(z).left;
            self.n_mut(y).left = zl;
            self.n_mut(zl).parent = y;
            self.n_mut(y).red = self.n(z).red;
        }
        if !y_red {
            self.delete_fixup(x);
        }
        self.n_mut(NIL).parent = NIL;

        let data = std::mem::replace(&mut self.nodes[z.0], Node::vacant()).data;
        self.free.push(z);
        self.len -= 1;
        data
    }

    /// Locate the node holding `key`.
    pub fn find(&self, key: u64) -> Option<NodeId> {
        let mut current = self.root;
        while current != NIL {
            let node = self.n(current);
            if key < node.key {
                current = node.left;
            } else if key > node.key {
                current = node.right;
            } else {
                return Some(current);
            }
        }
        None
    }

    /// Data stored at `key`.
    pub fn get(&self, key: u64) -> Option<&T> {
        self.find(key).and_then(|id| self.data(id))
    }

    /// Mutable data stored at `key`.
    pub fn get_mut(&mut self, key: u64) -> Option<&mut T> {
        let id = self.find(key)?;
        self.data_mut(id)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: u64) -> bool {
        self.find(key).is_some()
    }

    pub fn key(&self, id: NodeId) -> u64 {
        self.n(id).key
    }

    pub fn data(&self, id: NodeId) -> Option<&T> {
        self.n(id).data.as_ref()
    }

    pub fn data_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.n_mut(id).data.as_mut()
    }

    pub fn is_red(&self, id: NodeId) -> bool {
        self.n(id).red
    }

    pub fn left(&self, id: NodeId) -> Option<NodeId> {
        self.some(self.n(id).left)
    }

    pub fn right(&self, id: NodeId) -> Option<NodeId> {
        self.some(self.n(id).right)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.some(self.n(id).parent)
    }

    /// The other child of this node's parent.
    pub fn sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        if self.n(parent).left == id {
            self.right(parent)
        } else {
            self.left(parent)
        }
    }

    /// Whether `id` is its parent's left child.
    pub fn is_left_child(&self, id: NodeId) -> bool {
        match self.parent(id) {
            Some(parent) => self.n(parent).left == id,
            None => false,
        }
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.n(id).left == NIL && self.n(id).right == NIL
    }

    /// Distance from the root (root is level 0).
    pub fn level(&self, id: NodeId) -> usize {
        let mut level = 0;
        let mut node = self.n(id).parent;
        while node != NIL {
            level += 1;
            node = self.n(node).parent;
        }
        level
    }

    /// Childless nodes, left to right. O(n).
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        let mut stack = Vec::new();
        if self.root != NIL {
            stack.push(self.root);
        }
        while let Some(id) = stack.pop() {
            let node = self.n(id);
            if node.left == NIL && node.right == NIL {
                leaves.push(id);
                continue;
            }
            if node.right != NIL {
                stack.push(node.right);
            }
            if node.left != NIL {
                stack.push(node.left);
            }
        }
        leaves
    }

    /// Nodes in post-order (children before parents).
    pub fn post_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        if self.root != NIL {
            stack.push(self.root);
        }
        while let Some(id) = stack.pop() {
            out.push(id);
            let node = self.n(id);
            if node.left != NIL {
                stack.push(node.left);
            }
            if node.right != NIL {
                stack.push(node.right);
            }
        }
        out.reverse();
        out
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> Vec<u64> {
        let mut keys = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut current = self.root;
        while current != NIL || !stack.is_empty() {
            while current != NIL {
                stack.push(current);
                current = self.n(current).left;
            }
            if let Some(id) = stack.pop() {
                keys.push(self.n(id).key);
                current = self.n(id).right;
            }
        }
        keys
    }

    /// Deepest leaf level.
    pub fn depth(&self) -> usize {
        self.leaves()
            .into_iter()
            .map(|leaf| self.level(leaf))
            .max()
            .unwrap_or(0)
    }

    /// Smallest key.
    pub fn first(&self) -> Option<u64> {
        (self.root != NIL).then(|| self.n(self.minimum(self.root)).key)
    }

    /// Largest key.
    pub fn last(&self) -> Option<u64> {
        if self.root == NIL {
            return None;
        }
        let mut current = self.root;
        while self.n(current).right != NIL {
            current = self.n(current).right;
        }
        Some(self.n(current).key)
    }

    /// Key structure of the whole tree.
    pub fn to_shape(&self) -> Option<Shape> {
        self.some(self.root).map(|root| self.shape_of(root))
    }

    /// Black height if every red-black invariant holds, `None` otherwise.
    pub fn check_invariants(&self) -> Option<usize> {
        if self.n(self.root).red {
            return None;
        }
        self.black_height(self.root)
    }

    fn black_height(&self, id: NodeId) -> Option<usize> {
        if id == NIL {
            return Some(1);
        }
        let node = self.n(id);
        if node.red && (self.n(node.left).red || self.n(node.right).red) {
            return None;
        }
        for child in [node.left, node.right] {
            if child != NIL && self.n(child).parent != id {
                return None;
            }
        }
        let left = self.black_height(node.left)?;
        let right = self.black_height(node.right)?;
        if left != right {
            return None;
        }
        Some(left + usize::from(!node.red))
    }

    fn shape_of(&self, id: NodeId) -> Shape {
        let node = self.n(id);
        Shape {
            key: node.key,
            left: self.some(node.left).map(|l| Box::new(self.shape_of(l))),
            right: self.some(node.right).map(|r| Box::new(self.shape_of(r))),
        }
    }

    fn attach(&mut self, key: u64, data: T) {
        if key >= self.next_key {
            self.next_key = key + 1;
        }
        let z = self.alloc(Node {
            key,
            data: Some(data),
            left: NIL,
            right: NIL,
            parent: NIL,
            red: true,
        });

        let mut parent = NIL;
        let mut current = self.root;
        while current != NIL {
            parent = current;
            current = if key < self.n(current).key {
                self.n(current).left
            } else {
                self.n(current).right
            };
        }
        self.n_mut(z).parent = parent;
        if parent == NIL {
            self.root = z;
        } else if key < self.n(parent).key {
            self.n_mut(parent).left = z;
        } else {
            self.n_mut(parent).right = z;
        }
        self.len += 1;
        self.insert_fixup(z);
    }

    fn alloc(&mut self, node: Node<T>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = node;
                id
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while self.n(self.n(z).parent).red {
            let p = self.n(z).parent;
            let g = self.n(p).parent;
            let side = if self.n(g).left == p { Dir::Left } else { Dir::Right };
            let uncle = self.child(g, side.flip());
            if self.n(uncle).red {
                self.n_mut(p).red = false;
                self.n_mut(uncle).red = false;
                self.n_mut(g).red = true;
                z = g;
            } else {
                if z == self.child(p, side.flip()) {
                    z = p;
                    self.rotate(z, side);
                }
                let p = self.n(z).parent;
                let g = self.n(p).parent;
                self.n_mut(p).red = false;
                self.n_mut(g).red = true;
                self.rotate(g, side.flip());
            }
        }
        let root = self.root;
        self.n_mut(root).red = false;
    }

    fn delete_fixup(&mut self, mut x: NodeId) {
        while x != self.root && !self.n(x).red {
            let p = self.n(x).parent;
            let side = if self.n(p).left == x { Dir::Left } else { Dir::Right };
            let mut w = self.child(p, side.flip());
            if self.n(w).red {
                self.n_mut(w).red = false;
                self.n_mut(p).red = true;
                self.rotate(p, side);
                w = self.child(self.n(x).parent, side.flip());
            }
            if !self.n(self.n(w).left).red && !self.n(self.n(w).right).red {
                self.n_mut(w).red = true;
                x = self.n(x).parent;
            } else {
                if !self.n(self.child(w, side.flip())).red {
                    let near = self.child(w, side);
                    self.n_mut(near).red = false;
                    self.n_mut(w).red = true;
                    self.rotate(w, side.flip());
                    w = self.child(self.n(x).parent, side.flip());
                }
                let p = self.n(x).parent;
                self.n_mut(w).red = self.n(p).red;
                self.n_mut(p).red = false;
                let far = self.child(w, side.flip());
                self.n_mut(far).red = false;
                self.rotate(p, side);
                x = self.root;
            }
        }
        self.n_mut(x).red = false;
    }

    /// Rotate `x` toward `dir`; its child on the other side becomes the pivot.
    fn rotate(&mut self, x: NodeId, dir: Dir) {
        let counter = dir.flip();
        let y = self.child(x, counter);
        let inner = self.child(y, dir);
        self.set_child(x, counter, inner);
        if inner != NIL {
            self.n_mut(inner).parent = x;
        }
        let xp = self.n(x).parent;
        self.n_mut(y).parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.n(xp).left == x {
            self.n_mut(xp).left = y;
        } else {
            self.n_mut(xp).right = y;
        }
        self.set_child(y, dir, x);
        self.n_mut(x).parent = y;
    }

    fn transplant(&mut self, u: NodeId, v: NodeId) {
        let up = self.n(u).parent;
        if up == NIL {
            self.root = v;
        } else if self.n(up).left == u {
            self.n_mut(up).left = v;
        } else {
            self.n_mut(up).right = v;
        }
        self.n_mut(v).parent = up;
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while self.n(id).left != NIL {
            id = self.n(id).left;
        }
        id
    }

    fn child(&self, id: NodeId, dir: Dir) -> NodeId {
        match dir {
            Dir::Left => self.n(id).left,
            Dir::Right => self.n(id).right,
        }
    }

    fn set_child(&mut self, id: NodeId, dir: Dir, child: NodeId) {
        match dir {
            Dir::Left => self.n_mut(id).left = child,
            Dir::Right => self.n_mut(id).right = child,
        }
    }

    fn some(&self, id: NodeId) -> Option<NodeId> {
        (id != NIL).then_some(id)
    }

    fn n(&self, id: NodeId) -> &Node<T> {
        &self.nodes[id.0]
    }

    fn n_mut(&mut self, id: NodeId) -> &mut Node<T> {
        &mut self.nodes[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filled(n: usize) -> RedBlackTree<usize> {
        let mut tree = RedBlackTree::new();
        for i in 0..n {
            tree.insert(i);
        }
        tree
    }

    #[test]
    fn auto_keys_increase() {
        let mut tree = RedBlackTree::new();
        assert_eq!(tree.insert("a"), 1);
        assert_eq!(tree.insert("b"), 2);
        assert_eq!(tree.get(2), Some(&"b"));
        assert_eq!(tree.size(), 2);
    }

    #[test]
    fn keys_not_reused_after_delete() {
        let mut tree = filled(3);
        assert_eq!(tree.delete(2), Some(1));
        assert_eq!(tree.insert(99), 4);
        assert_eq!(tree.keys(), vec![1, 3, 4]);
    }

    #[test]
    fn explicit_duplicate_key_rejected() {
        let mut tree = RedBlackTree::new();
        tree.insert_with_key("x", 10).unwrap();
        assert_eq!(tree.insert_with_key("y", 10), Err(TreeError::DuplicateKey(10)));
        // auto keys continue above explicit ones
        assert_eq!(tree.insert("z"), 11);
    }

    #[test]
    fn small_tree_shape() {
        let tree = filled(3);
        let shape = tree.to_shape().unwrap();
        assert_eq!(shape.key, 2);
        assert_eq!(shape.left.as_ref().unwrap().key, 1);
        assert_eq!(shape.right.as_ref().unwrap().key, 3);
        assert_eq!(shape.flatten(), vec![2, 1, 3]);
        assert!(!tree.is_red(tree.root().unwrap()));
    }

    #[test]
    fn leaves_left_to_right() {
        let tree = filled(7);
        let keys: Vec<u64> = tree.leaves().into_iter().map(|l| tree.key(l)).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert!(!keys.is_empty());
    }

    #[test]
    fn delete_missing_is_none() {
        let mut tree = filled(4);
        assert_eq!(tree.delete(42), None);
        assert_eq!(tree.size(), 4);
    }

    #[test]
    fn delete_root_until_empty() {
        let mut tree = filled(20);
        while let Some(root) = tree.root() {
            let key = tree.key(root);
            tree.delete(key);
            assert!(tree.check_invariants().is_some());
        }
        assert!(tree.is_empty());
        assert_eq!(tree.first(), None);
        assert_eq!(tree.last(), None);
    }

    #[test]
    fn first_and_last() {
        let mut tree = filled(10);
        assert_eq!(tree.first(), Some(1));
        assert_eq!(tree.last(), Some(10));
        tree.delete(1);
        tree.delete(10);
        assert_eq!(tree.first(), Some(2));
        assert_eq!(tree.last(), Some(9));
    }

    #[test]
    fn sibling_and_parent_links() {
        let tree = filled(3);
        let root = tree.root().unwrap();
        let left = tree.left(root).unwrap();
        let right = tree.right(root).unwrap();
        assert_eq!(tree.sibling(left), Some(right));
        assert_eq!(tree.parent(right), Some(root));
        assert!(tree.is_left_child(left));
        assert_eq!(tree.level(left), 1);
        assert_eq!(tree.depth(), 1);
    }

    proptest! {
        #[test]
        fn balanced_after_inserts(n in 1usize..1000) {
            let tree = filled(n);
            prop_assert_eq!(tree.size(), n);
            prop_assert_eq!(tree.to_shape().unwrap().flatten().len(), n);
            prop_assert!(tree.check_invariants().is_some());
        }

        #[test]
        fn balanced_after_deletes(n in 1usize..300, picks in proptest::collection::vec(any::<u64>(), 0..150)) {
            let mut tree = filled(n);
            let mut expected: Vec<u64> = (1..=n as u64).collect();
            for pick in picks {
                if expected.is_empty() {
                    break;
                }
                let key = expected.remove((pick % expected.len() as u64) as usize);
                prop_assert!(tree.delete(key).is_some());
                prop_assert!(tree.check_invariants().is_some());
            }
            prop_assert_eq!(tree.keys(), expected);
        }
    }
}
