//! Merkle tree commitments over transaction hashes
//!
//! Bitcoin-style: double-SHA256 of concatenated pairs, odd levels duplicate
//! their last node. Duplicated *pairs* make the tree malleable (two
//! different transaction lists share a root), so the mutation flag is
//! reported alongside the root.

use super::hash::{double_sha256, Hash256};

/// Calculate the merkle root from a list of transaction hashes
pub fn calculate_merkle_root(hashes: &[Hash256]) -> Hash256 {
    merkle_root_with_mutation(hashes).0
}

/// Calculate the merkle root and whether any level contained two identical
/// adjacent hashes
pub fn merkle_root_with_mutation(hashes: &[Hash256]) -> (Hash256, bool) {
    if hashes.is_empty() {
        return (Hash256::ZERO, false);
    }

    let mut mutated = false;
    let mut current_level: Vec<Hash256> = hashes.to_vec();

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity(current_level.len().div_ceil(2));

        for chunk in current_level.chunks(2) {
            let (left, right) = match chunk {
                [left, right] => {
                    if left == right {
                        mutated = true;
                    }
                    (left, right)
                }
                [single] => (single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            };
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(left.as_bytes());
            data[32..].copy_from_slice(right.as_bytes());
            next_level.push(double_sha256(&data));
        }

        current_level = next_level;
    }

    (current_level[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_single() {
        let hashes = vec![double_sha256(b"tx1")];
        assert_eq!(calculate_merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_merkle_root_two() {
        let hash1 = double_sha256(b"tx1");
        let hash2 = double_sha256(b"tx2");

        let mut expected = hash1.as_bytes().to_vec();
        expected.extend_from_slice(hash2.as_bytes());

        assert_eq!(
            calculate_merkle_root(&[hash1, hash2]),
            double_sha256(&expected)
        );
    }

    #[test]
    fn test_odd_count_duplicates_last() {
        let a = double_sha256(b"a");
        let b = double_sha256(b"b");
        let c = double_sha256(b"c");
        let (three, mutated) = merkle_root_with_mutation(&[a, b, c]);
        assert!(!mutated);
        // Appending a copy of the last element yields the same root, and is flagged
        let (four, mutated) = merkle_root_with_mutation(&[a, b, c, c]);
        assert_eq!(three, four);
        assert!(mutated);
    }

    #[test]
    fn test_empty_merkle_root() {
        assert_eq!(calculate_merkle_root(&[]), Hash256::ZERO);
    }
}
