//! Partial Merkle trees as carried by `merkleblock` messages: a depth-first
//! encoding of the subset of the tree needed to prove which transactions in a
//! block matched a filter.

use finch_consensus::Hash256;

use crate::hash::sha256d_pair;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerkleError {
    NoTransactions,
    /// More hashes than the claimed transaction count allows.
    TooManyHashes,
    BitsExhausted,
    HashesExhausted,
    UnusedBits,
    UnusedHashes,
    /// Identical left and right child; forbidden to close CVE-2012-2459.
    DuplicateNode,
}

impl std::fmt::Display for MerkleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MerkleError::NoTransactions => write!(f, "partial merkle tree with no transactions"),
            MerkleError::TooManyHashes => write!(f, "more hashes than transactions"),
            MerkleError::BitsExhausted => write!(f, "flag bits exhausted during traversal"),
            MerkleError::HashesExhausted => write!(f, "hashes exhausted during traversal"),
            MerkleError::UnusedBits => write!(f, "unconsumed flag bits after traversal"),
            MerkleError::UnusedHashes => write!(f, "unconsumed hashes after traversal"),
            MerkleError::DuplicateNode => write!(f, "duplicate inner node"),
        }
    }
}

impl std::error::Error for MerkleError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartialMerkleTree {
    /// Number of transactions in the full block.
    pub total: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

impl PartialMerkleTree {
    /// Builds the proof for `matched[i] == true` leaves. Test and peer-serving
    /// counterpart of [`PartialMerkleTree::extract_matches`].
    pub fn from_txids(txids: &[Hash256], matched: &[bool]) -> Self {
        debug_assert_eq!(txids.len(), matched.len());
        let mut tree = Self {
            total: txids.len() as u32,
            hashes: Vec::new(),
            flags: Vec::new(),
        };
        if txids.is_empty() {
            return tree;
        }
        let mut bits = Vec::new();
        let height = tree.tree_height();
        tree.build(height, 0, txids, matched, &mut bits);
        tree.flags = pack_bits(&bits);
        tree
    }

    /// Recomputes the Merkle root and collects matched txids in tree order.
    pub fn extract_matches(&self) -> Result<(Hash256, Vec<Hash256>), MerkleError> {
        if self.total == 0 {
            return Err(MerkleError::NoTransactions);
        }
        if self.hashes.len() as u64 > self.total as u64 {
            return Err(MerkleError::TooManyHashes);
        }
        let mut cursor = Cursor {
            bit: 0,
            hash: 0,
            matches: Vec::new(),
        };
        let root = self.extract(self.tree_height(), 0, &mut cursor)?;
        if cursor.hash != self.hashes.len() {
            return Err(MerkleError::UnusedHashes);
        }
        // Only zero padding may remain in the final flag byte.
        if cursor.bit.div_ceil(8) != self.flags.len() {
            return Err(MerkleError::UnusedBits);
        }
        for bit in cursor.bit..self.flags.len() * 8 {
            if self.flag_bit(bit) == Some(true) {
                return Err(MerkleError::UnusedBits);
            }
        }
        Ok((root, cursor.matches))
    }

    /// Number of leaves at `height` levels above the transaction row.
    fn row_width(&self, height: u32) -> u32 {
        (self.total + (1 << height) - 1) >> height
    }

    fn tree_height(&self) -> u32 {
        let mut height = 0;
        while self.row_width(height) > 1 {
            height += 1;
        }
        height
    }

    fn flag_bit(&self, index: usize) -> Option<bool> {
        let byte = self.flags.get(index >> 3)?;
        Some(byte & (1 << (index & 7)) != 0)
    }

    fn build(
        &mut self,
        height: u32,
        pos: u32,
        txids: &[Hash256],
        matched: &[bool],
        bits: &mut Vec<bool>,
    ) {
        let mut any_match = false;
        let first = (pos << height) as usize;
        let last = (((pos + 1) << height) as usize).min(txids.len());
        for leaf in first..last {
            if matched[leaf] {
                any_match = true;
            }
        }
        bits.push(any_match);
        if height == 0 || !any_match {
            let hash = self.subtree_hash(height, pos, txids);
            self.hashes.push(hash);
        } else {
            self.build(height - 1, pos * 2, txids, matched, bits);
            if pos * 2 + 1 < self.row_width(height - 1) {
                self.build(height - 1, pos * 2 + 1, txids, matched, bits);
            }
        }
    }

    fn subtree_hash(&self, height: u32, pos: u32, txids: &[Hash256]) -> Hash256 {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = self.subtree_hash(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < self.row_width(height - 1) {
            self.subtree_hash(height - 1, pos * 2 + 1, txids)
        } else {
            left
        };
        sha256d_pair(&left, &right)
    }

    fn extract(&self, height: u32, pos: u32, cursor: &mut Cursor) -> Result<Hash256, MerkleError> {
        let bit = self
            .flag_bit(cursor.bit)
            .ok_or(MerkleError::BitsExhausted)?;
        cursor.bit += 1;
        if height == 0 || !bit {
            let hash = *self
                .hashes
                .get(cursor.hash)
                .ok_or(MerkleError::HashesExhausted)?;
            cursor.hash += 1;
            if height == 0 && bit {
                cursor.matches.push(hash);
            }
            return Ok(hash);
        }
        let left = self.extract(height - 1, pos * 2, cursor)?;
        let right = if pos * 2 + 1 < self.row_width(height - 1) {
            let right = self.extract(height - 1, pos * 2 + 1, cursor)?;
            if right == left {
                return Err(MerkleError::DuplicateNode);
            }
            right
        } else {
            left
        };
        Ok(sha256d_pair(&left, &right))
    }
}

struct Cursor {
    bit: usize,
    hash: usize,
    matches: Vec<Hash256>,
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (index, bit) in bits.iter().enumerate() {
        if *bit {
            out[index >> 3] |= 1 << (index & 7);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256d;

    fn txids(count: usize) -> Vec<Hash256> {
        (0..count).map(|i| sha256d(&(i as u64).to_le_bytes())).collect()
    }

    fn full_root(ids: &[Hash256]) -> Hash256 {
        let mut row = ids.to_vec();
        while row.len() > 1 {
            let mut next = Vec::with_capacity(row.len().div_ceil(2));
            for pair in row.chunks(2) {
                let left = pair[0];
                let right = *pair.get(1).unwrap_or(&pair[0]);
                next.push(sha256d_pair(&left, &right));
            }
            row = next;
        }
        row[0]
    }

    #[test]
    fn single_transaction_block_roundtrips() {
        let ids = txids(1);
        let tree = PartialMerkleTree::from_txids(&ids, &[true]);
        let (root, matches) = tree.extract_matches().unwrap();
        assert_eq!(root, ids[0]);
        assert_eq!(matches, ids);
    }

    #[test]
    fn extraction_recovers_root_and_matches_across_sizes() {
        for count in [2usize, 3, 5, 7, 8, 13] {
            let ids = txids(count);
            let matched: Vec<bool> = (0..count).map(|i| i % 3 == 1).collect();
            let tree = PartialMerkleTree::from_txids(&ids, &matched);
            let (root, matches) = tree.extract_matches().unwrap();
            assert_eq!(root, full_root(&ids), "count {count}");
            let expected: Vec<Hash256> = ids
                .iter()
                .zip(&matched)
                .filter(|(_, m)| **m)
                .map(|(id, _)| *id)
                .collect();
            assert_eq!(matches, expected, "count {count}");
        }
    }

    #[test]
    fn no_matches_encodes_single_root_hash() {
        let ids = txids(9);
        let tree = PartialMerkleTree::from_txids(&ids, &vec![false; 9]);
        assert_eq!(tree.hashes.len(), 1);
        let (root, matches) = tree.extract_matches().unwrap();
        assert_eq!(root, full_root(&ids));
        assert!(matches.is_empty());
    }

    #[test]
    fn empty_tree_is_rejected() {
        let tree = PartialMerkleTree {
            total: 0,
            hashes: Vec::new(),
            flags: Vec::new(),
        };
        assert_eq!(tree.extract_matches(), Err(MerkleError::NoTransactions));
    }

    #[test]
    fn trailing_set_flag_bits_are_rejected() {
        let ids = txids(4);
        let mut tree = PartialMerkleTree::from_txids(&ids, &[true, false, false, false]);
        let last = tree.flags.len() - 1;
        tree.flags[last] |= 0x80;
        assert_eq!(tree.extract_matches(), Err(MerkleError::UnusedBits));
    }

    #[test]
    fn missing_hashes_are_rejected() {
        let ids = txids(4);
        let mut tree = PartialMerkleTree::from_txids(&ids, &[true, true, false, false]);
        tree.hashes.pop();
        assert_eq!(tree.extract_matches(), Err(MerkleError::HashesExhausted));
    }
}
