//! # Compact Sparse Merkle Index
//!
//! An indexed set of ring keys with a Merkle root: two indexes holding the
//! same key set have identical root hashes, which lets replicas compare
//! whole key ranges by exchanging a single hash instead of the keys
//! themselves.
//!
//! Placement is driven by the distance function `⌊log2(a XOR b)⌋` — the
//! position of the highest differing bit. Keys sharing a long common prefix
//! cluster under a common subtree, so the final shape depends only on the
//! bit patterns of the inserted keys, never on insertion order. Each
//! internal node routes by the minimum key of its subtree and carries a
//! Merkle hash recomputed from the concatenated child hashes whenever the
//! subtree is rebuilt; leaves carry their key as both.

use std::fmt;

use crate::key::Key;

/// Highest differing bit between two ring positions.
///
/// `None` when the keys are equal, which orders below every `Some` — the
/// zero-distance branch always wins routing, mirroring `log2(0) = -∞`.
fn distance(a: Key, b: Key) -> Option<u32> {
    let xor = a.value() ^ b.value();
    if xor == 0 {
        None
    } else {
        Some(127 - xor.leading_zeros())
    }
}

enum MerkleNode {
    Leaf(Key),
    Internal {
        hash: Key,
        /// Minimum key in this subtree. Because every key in a subtree
        /// shares the prefix that placed it there, the distance from an
        /// outside key to any member is the same, so the minimum is a valid
        /// routing representative for the whole cluster.
        min_key: Key,
        left: Box<MerkleNode>,
        right: Box<MerkleNode>,
    },
}

impl MerkleNode {
    fn hash(&self) -> Key {
        match self {
            MerkleNode::Leaf(key) => *key,
            MerkleNode::Internal { hash, .. } => *hash,
        }
    }

    fn routing_key(&self) -> Key {
        match self {
            MerkleNode::Leaf(key) => *key,
            MerkleNode::Internal { min_key, .. } => *min_key,
        }
    }

    fn is_leaf(&self) -> bool {
        matches!(self, MerkleNode::Leaf(_))
    }
}

/// Build an internal node, hashing the concatenated child hash strings.
fn internal(left: Box<MerkleNode>, right: Box<MerkleNode>) -> Box<MerkleNode> {
    let hash = Key::hash(&format!("{}{}", left.hash().to_hex(), right.hash().to_hex()));
    let min_key = left.routing_key().min(right.routing_key());
    Box::new(MerkleNode::Internal { hash, min_key, left, right })
}

fn insert(node: Box<MerkleNode>, key: Key) -> Box<MerkleNode> {
    if node.is_leaf() {
        return insert_at_leaf(node, key);
    }

    let (left, right) = match *node {
        MerkleNode::Internal { left, right, .. } => (left, right),
        MerkleNode::Leaf(_) => unreachable!(),
    };

    let left_dist = distance(key, left.routing_key());
    let right_dist = distance(key, right.routing_key());

    if left_dist == right_dist {
        // Equidistant from both branches: the key diverges above this
        // subtree's common prefix and belongs beside it, ordered against
        // the subtree minimum.
        let smaller = left.routing_key().min(right.routing_key());
        let rebuilt = internal(left, right);
        let new_leaf = Box::new(MerkleNode::Leaf(key));
        if key < smaller {
            internal(new_leaf, rebuilt)
        } else {
            internal(rebuilt, new_leaf)
        }
    } else if left_dist < right_dist {
        internal(insert(left, key), right)
    } else {
        internal(left, insert(right, key))
    }
}

fn insert_at_leaf(leaf: Box<MerkleNode>, key: Key) -> Box<MerkleNode> {
    let existing = leaf.hash();
    if key < existing {
        internal(Box::new(MerkleNode::Leaf(key)), leaf)
    } else if key > existing {
        internal(leaf, Box::new(MerkleNode::Leaf(key)))
    } else {
        leaf
    }
}

fn delete(node: Box<MerkleNode>, key: Key) -> Box<MerkleNode> {
    if node.is_leaf() {
        return node;
    }

    let (left, right) = match *node {
        MerkleNode::Internal { left, right, .. } => (left, right),
        MerkleNode::Leaf(_) => unreachable!(),
    };

    // A matching leaf that is a direct child is replaced by its sibling.
    if left.is_leaf() && left.hash() == key {
        return right;
    }
    if right.is_leaf() && right.hash() == key {
        return left;
    }

    let left_dist = distance(key, left.routing_key());
    let right_dist = distance(key, right.routing_key());

    if left_dist == right_dist {
        internal(left, right)
    } else if left_dist < right_dist {
        internal(delete(left, key), right)
    } else {
        internal(left, delete(right, key))
    }
}

fn contains(node: &MerkleNode, key: Key) -> bool {
    match node {
        MerkleNode::Leaf(existing) => *existing == key,
        MerkleNode::Internal { left, right, .. } => {
            if left.is_leaf() && left.hash() == key {
                return true;
            }
            if right.is_leaf() && right.hash() == key {
                return true;
            }

            let left_dist = distance(key, left.routing_key());
            let right_dist = distance(key, right.routing_key());
            if left_dist < right_dist {
                contains(left, key)
            } else if right_dist < left_dist {
                contains(right, key)
            } else {
                // Insertion would have created a sibling here, so an
                // equidistant internal node means the key is absent.
                false
            }
        }
    }
}

fn render(node: &MerkleNode, level: usize, out: &mut String) {
    let tabs = "\t".repeat(level);
    out.push_str(&tabs);
    out.push_str("HASH: ");
    out.push_str(&node.hash().to_hex());
    if let MerkleNode::Internal { left, right, .. } = node {
        out.push_str(&format!("\n{tabs}LEFT: {{\n"));
        render(left, level + 1, out);
        out.push_str(&format!("\n{tabs}}}\n{tabs}RIGHT: {{\n"));
        render(right, level + 1, out);
        out.push_str(&format!("\n{tabs}}}"));
    }
}

/// The index proper: an optional root over the inserted key set.
#[derive(Default)]
pub struct MerkleIndex {
    root: Option<Box<MerkleNode>>,
}

impl MerkleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key. Inserting a key already present leaves the tree
    /// untouched.
    pub fn insert(&mut self, key: Key) {
        self.root = Some(match self.root.take() {
            Some(root) => insert(root, key),
            None => Box::new(MerkleNode::Leaf(key)),
        });
    }

    /// Remove a key. Removing an absent key leaves the tree untouched.
    pub fn delete(&mut self, key: Key) {
        if let Some(root) = self.root.take() {
            if root.is_leaf() && root.hash() == key {
                self.root = None;
            } else {
                self.root = Some(delete(root, key));
            }
        }
    }

    /// Retrace the insertion routing to test membership.
    pub fn contains(&self, key: Key) -> bool {
        self.root.as_deref().is_some_and(|root| contains(root, key))
    }

    /// Root hash, or `None` for an empty index. Equal key sets yield equal
    /// root hashes.
    pub fn root_hash(&self) -> Option<Key> {
        self.root.as_deref().map(MerkleNode::hash)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}

impl fmt::Display for MerkleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root.as_deref() {
            None => write!(f, "(empty)"),
            Some(root) => {
                let mut out = String::new();
                render(root, 0, &mut out);
                write!(f, "{out}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(keys: &[Key]) -> MerkleIndex {
        let mut index = MerkleIndex::new();
        for &key in keys {
            index.insert(key);
        }
        index
    }

    #[test]
    fn contains_inserted_keys() {
        let index = index_of(&[Key::hash("a"), Key::hash("b"), Key::hash("c")]);
        assert!(index.contains(Key::hash("a")));
        assert!(index.contains(Key::hash("b")));
        assert!(index.contains(Key::hash("c")));
        assert!(!index.contains(Key::hash("d")));
    }

    #[test]
    fn delete_preserves_remaining_keys() {
        let mut index = index_of(&[Key::hash("a"), Key::hash("b"), Key::hash("c")]);
        index.delete(Key::hash("a"));
        assert!(!index.contains(Key::hash("a")));
        assert!(index.contains(Key::hash("b")));
        assert!(index.contains(Key::hash("c")));

        index.delete(Key::hash("b"));
        index.delete(Key::hash("c"));
        assert!(index.is_empty());
        assert_eq!(index.root_hash(), None);
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let mut index = index_of(&[Key::hash("a"), Key::hash("b")]);
        let before = index.root_hash();
        index.insert(Key::hash("a"));
        assert_eq!(index.root_hash(), before);
    }

    #[test]
    fn insertion_order_does_not_change_the_root() {
        let keys = [Key::hash("a"), Key::hash("b"), Key::hash("c")];
        let reference = index_of(&keys).root_hash();

        // All six insertion orders of three keys.
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let permuted: Vec<Key> = order.iter().map(|&i| keys[i]).collect();
            assert_eq!(index_of(&permuted).root_hash(), reference, "order {order:?}");
        }
    }

    /// Two indexes over the same key set serialize to the same root hash
    /// regardless of the order the keys went in.
    #[test]
    fn extensionality_over_shuffled_sets() {
        let mut state = 0x243f6a8885a308d3u64;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            state
        };

        for round in 0..50 {
            let size = 2 + (next() % 19) as usize;
            let keys: Vec<Key> = (0..size)
                .map(|i| Key::hash(&format!("set-{round}-key-{i}")))
                .collect();

            let reference = index_of(&keys);
            for &key in &keys {
                assert!(reference.contains(key), "round {round}");
            }

            // A handful of shuffles of the same set.
            for _ in 0..4 {
                let mut shuffled = keys.clone();
                for i in (1..shuffled.len()).rev() {
                    shuffled.swap(i, (next() % (i as u64 + 1)) as usize);
                }
                assert_eq!(
                    index_of(&shuffled).root_hash(),
                    reference.root_hash(),
                    "round {round}"
                );
            }
        }
    }

    #[test]
    fn routing_groups_keys_by_shared_prefix() {
        // 0b100 and 0b101 differ only in the lowest bit; 0b001 is far from
        // both, so every insertion order nests the close pair together.
        let near_a = Key::from(0b100);
        let near_b = Key::from(0b101);
        let far = Key::from(0b001);

        let reference = index_of(&[near_a, near_b, far]);
        let rendered = reference.to_string();

        for permuted in [
            vec![near_b, far, near_a],
            vec![far, near_a, near_b],
            vec![far, near_b, near_a],
            vec![near_a, far, near_b],
        ] {
            let other = index_of(&permuted);
            assert_eq!(other.root_hash(), reference.root_hash());
            assert_eq!(other.to_string(), rendered);
        }

        for key in [near_a, near_b, far] {
            assert!(reference.contains(key));
        }
        assert!(!reference.contains(Key::from(0b111)));
    }

    #[test]
    fn single_key_tree() {
        let mut index = MerkleIndex::new();
        index.insert(Key::hash("only"));
        assert_eq!(index.root_hash(), Some(Key::hash("only")));
        assert!(index.contains(Key::hash("only")));

        index.delete(Key::hash("only"));
        assert!(index.is_empty());
    }

    #[test]
    fn delete_absent_key_is_a_no_op() {
        let mut index = index_of(&[Key::hash("a"), Key::hash("b")]);
        let before = index.root_hash();
        index.delete(Key::hash("zzz"));
        assert_eq!(index.root_hash(), before);
    }

    #[test]
    fn delete_from_nested_subtree() {
        let keys: Vec<Key> = (0..12).map(|i| Key::hash(&format!("nested-{i}"))).collect();
        let mut index = index_of(&keys);

        index.delete(keys[5]);
        assert!(!index.contains(keys[5]));
        for (i, &key) in keys.iter().enumerate() {
            if i != 5 {
                assert!(index.contains(key), "key {i} lost after delete");
            }
        }

        // The depleted index matches one built without the key at all.
        let without: Vec<Key> = keys
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 5)
            .map(|(_, &k)| k)
            .collect();
        assert_eq!(index.root_hash(), index_of(&without).root_hash());
    }

    #[test]
    fn debug_rendering_shows_structure() {
        let index = index_of(&[Key::from(0b100), Key::from(0b101), Key::from(0b001)]);
        let rendered = index.to_string();
        assert!(rendered.starts_with("HASH: "));
        assert!(rendered.contains("LEFT: {"));
        assert!(rendered.contains("RIGHT: {"));
        // The isolated key sits on its own branch.
        assert!(rendered.contains(&Key::from(0b001).to_hex()));
    }
}
