use crate::core::Transaction;
use crate::error::Result;
use crate::utils::sha256_digest;

/// Size of the placeholder leaf used when a tree is built from nothing.
const EMPTY_LEAF_LEN: usize = 32;

/// Binary hash tree committing an ordered list of leaves to one root.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: MerkleNode,
}

#[derive(Debug, Clone)]
struct MerkleNode {
    left: Option<Box<MerkleNode>>,
    right: Option<Box<MerkleNode>>,
    data: Vec<u8>,
}

impl MerkleNode {
    fn leaf(data: Vec<u8>) -> MerkleNode {
        MerkleNode {
            left: None,
            right: None,
            data,
        }
    }

    fn parent(left: MerkleNode, right: MerkleNode) -> MerkleNode {
        let data = hash_pair(&left.data, &right.data);
        MerkleNode {
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
            data,
        }
    }
}

impl MerkleTree {
    /// Builds the tree over the full serialized form of each transaction.
    pub fn new(transactions: &[Transaction]) -> Result<MerkleTree> {
        let leaves = transactions
            .iter()
            .map(|tx| Ok(sha256_digest(tx.serialize()?.as_slice())))
            .collect::<Result<Vec<Vec<u8>>>>()?;
        Ok(MerkleTree::from_hashes(leaves))
    }

    /// Builds the tree from precomputed leaf hashes.
    ///
    /// An empty list becomes a single all-zero leaf. Every level with an odd
    /// count pairs its last node with a copy of itself, and at least one
    /// pairing round always runs, so a lone leaf `h` yields `H(h || h)`.
    pub fn from_hashes(hashes: Vec<Vec<u8>>) -> MerkleTree {
        let mut level: Vec<MerkleNode> = if hashes.is_empty() {
            vec![MerkleNode::leaf(vec![0; EMPTY_LEAF_LEN])]
        } else {
            hashes.into_iter().map(MerkleNode::leaf).collect()
        };

        loop {
            if level.len() % 2 == 1 {
                if let Some(last) = level.last().cloned() {
                    level.push(last);
                }
            }

            let mut next = Vec::with_capacity(level.len() / 2);
            let mut nodes = level.into_iter();
            while let (Some(left), Some(right)) = (nodes.next(), nodes.next()) {
                next.push(MerkleNode::parent(left, right));
            }
            level = next;

            if level.len() == 1 {
                break;
            }
        }

        // the loop only exits with exactly one node left
        let root = level.remove(0);
        MerkleTree { root }
    }

    pub fn root_hash(&self) -> &[u8] {
        self.root.data.as_slice()
    }

    /// Number of levels below the root.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = &self.root;
        while let Some(left) = node.left.as_deref() {
            depth += 1;
            node = left;
        }
        depth
    }

    #[cfg(test)]
    fn has_children(&self) -> bool {
        self.root.left.is_some() && self.root.right.is_some()
    }
}

fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(left.len() + right.len());
    data.extend_from_slice(left);
    data.extend_from_slice(right);
    sha256_digest(data.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> Vec<u8> {
        sha256_digest(&[byte])
    }

    #[test]
    fn test_root_is_stable() {
        let hashes = vec![leaf(1), leaf(2), leaf(3), leaf(4)];
        let a = MerkleTree::from_hashes(hashes.clone());
        let b = MerkleTree::from_hashes(hashes);
        assert_eq!(a.root_hash(), b.root_hash());
        assert_eq!(a.depth(), 2);
    }

    #[test]
    fn test_two_leaves() {
        let tree = MerkleTree::from_hashes(vec![leaf(1), leaf(2)]);
        assert_eq!(tree.root_hash(), hash_pair(&leaf(1), &leaf(2)).as_slice());
        assert!(tree.has_children());
    }

    #[test]
    fn test_single_leaf_is_paired_with_itself() {
        let tree = MerkleTree::from_hashes(vec![leaf(7)]);
        assert_eq!(tree.root_hash(), hash_pair(&leaf(7), &leaf(7)).as_slice());
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn test_empty_input_uses_zero_leaf() {
        let tree = MerkleTree::from_hashes(vec![]);
        let zero = vec![0u8; EMPTY_LEAF_LEN];
        assert_eq!(tree.root_hash(), hash_pair(&zero, &zero).as_slice());
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let odd = MerkleTree::from_hashes(vec![leaf(1), leaf(2), leaf(3)]);
        let padded = MerkleTree::from_hashes(vec![leaf(1), leaf(2), leaf(3), leaf(3)]);
        assert_eq!(odd.root_hash(), padded.root_hash());

        let left = hash_pair(&leaf(1), &leaf(2));
        let right = hash_pair(&leaf(3), &leaf(3));
        assert_eq!(odd.root_hash(), hash_pair(&left, &right).as_slice());
    }

    #[test]
    fn test_order_matters() {
        let a = MerkleTree::from_hashes(vec![leaf(1), leaf(2)]);
        let b = MerkleTree::from_hashes(vec![leaf(2), leaf(1)]);
        assert_ne!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn test_changed_leaf_changes_root() {
        let base = vec![leaf(1), leaf(2), leaf(3), leaf(4), leaf(5)];
        let original = MerkleTree::from_hashes(base.clone());
        for i in 0..base.len() {
            let mut changed = base.clone();
            changed[i][0] ^= 0x01;
            let tree = MerkleTree::from_hashes(changed);
            assert_ne!(tree.root_hash(), original.root_hash(), "leaf {i}");
        }
    }

    #[test]
    fn test_transaction_tree_tracks_contents() {
        let address = crate::wallet::Wallet::new().unwrap().get_address();
        let a = Transaction::new_coinbase_tx(&address, b"first").unwrap();
        let b = Transaction::new_coinbase_tx(&address, b"second").unwrap();
        let c = Transaction::new_coinbase_tx(&address, b"secone").unwrap();

        let ab = MerkleTree::new(&[a.clone(), b]).unwrap();
        let b_again = Transaction::new_coinbase_tx(&address, b"second").unwrap();
        let ab_again = MerkleTree::new(&[a.clone(), b_again]).unwrap();
        let ac = MerkleTree::new(&[a, c]).unwrap();

        assert_eq!(ab.root_hash(), ab_again.root_hash());
        assert_ne!(ab.root_hash(), ac.root_hash());
    }
}
