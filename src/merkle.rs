use serde::{Deserialize, Serialize};

use crate::crypto::{blake2b256, blake2b256_of_slices};

const EMPTY_TREE_DOMAIN: &[u8] = b"sdc-empty-tree";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleStep {
    pub sibling: [u8; 32],
    pub sibling_on_left: bool,
}

/// Authentication path from a leaf up to the tree root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerklePath {
    pub steps: Vec<MerkleStep>,
}

impl MerklePath {
    pub fn apply(&self, leaf: [u8; 32]) -> [u8; 32] {
        let mut current = leaf;
        for step in &self.steps {
            current = if step.sibling_on_left {
                hash_pair(&step.sibling, &current)
            } else {
                hash_pair(&current, &step.sibling)
            };
        }
        current
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTree {
    leaves: Vec<[u8; 32]>,
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: Vec<[u8; 32]>) -> Self {
        let mut levels = Vec::new();
        let mut current = leaves.clone();
        while current.len() > 1 {
            let mut next = Vec::with_capacity((current.len() + 1) / 2);
            for chunk in current.chunks(2) {
                let left = chunk[0];
                let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
                next.push(hash_pair(&left, &right));
            }
            levels.push(current);
            current = next;
        }
        levels.push(current);
        Self { leaves, levels }
    }

    pub fn root(&self) -> [u8; 32] {
        match self.levels.last().and_then(|level| level.first()) {
            Some(root) => *root,
            None => blake2b256(EMPTY_TREE_DOMAIN),
        }
    }

    pub fn leaves(&self) -> &[[u8; 32]] {
        &self.leaves
    }

    pub fn leaf_index(&self, leaf: &[u8; 32]) -> Option<usize> {
        self.leaves.iter().position(|candidate| candidate == leaf)
    }

    pub fn path_for(&self, index: usize) -> Option<MerklePath> {
        if index >= self.leaves.len() {
            return None;
        }
        let mut steps = Vec::new();
        let mut position = index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_index = if position % 2 == 0 { position + 1 } else { position - 1 };
            let sibling = if sibling_index < level.len() {
                level[sibling_index]
            } else {
                // odd level end duplicates its own node
                level[position]
            };
            steps.push(MerkleStep {
                sibling,
                sibling_on_left: position % 2 == 1,
            });
            position /= 2;
        }
        Some(MerklePath { steps })
    }
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    blake2b256_of_slices(&[left, right])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_leaves(count: usize) -> Vec<[u8; 32]> {
        (0..count)
            .map(|index| blake2b256(&(index as u64).to_be_bytes()))
            .collect()
    }

    #[test]
    fn empty_tree_has_domain_root() {
        let tree = MerkleTree::from_leaves(Vec::new());
        assert_eq!(tree.root(), blake2b256(EMPTY_TREE_DOMAIN));
        assert!(tree.path_for(0).is_none());
    }

    #[test]
    fn single_leaf_root_is_leaf() {
        let leaves = sample_leaves(1);
        let tree = MerkleTree::from_leaves(leaves.clone());
        assert_eq!(tree.root(), leaves[0]);
        let path = tree.path_for(0).unwrap();
        assert!(path.steps.is_empty());
        assert_eq!(path.apply(leaves[0]), tree.root());
    }

    #[test]
    fn paths_reconstruct_root() {
        for count in [2usize, 3, 4, 5, 8, 9] {
            let leaves = sample_leaves(count);
            let tree = MerkleTree::from_leaves(leaves.clone());
            for (index, leaf) in leaves.iter().enumerate() {
                let path = tree.path_for(index).unwrap();
                assert_eq!(path.apply(*leaf), tree.root(), "leaf {index} of {count}");
            }
        }
    }

    #[test]
    fn wrong_leaf_fails_path_check() {
        let leaves = sample_leaves(4);
        let tree = MerkleTree::from_leaves(leaves.clone());
        let path = tree.path_for(1).unwrap();
        assert_ne!(path.apply(leaves[2]), tree.root());
    }

    #[test]
    fn leaf_index_finds_duplicate_first() {
        let mut leaves = sample_leaves(3);
        leaves.push(leaves[1]);
        let tree = MerkleTree::from_leaves(leaves.clone());
        assert_eq!(tree.leaf_index(&leaves[1]), Some(1));
        assert_eq!(tree.leaf_index(&blake2b256(b"missing")), None);
    }
}
