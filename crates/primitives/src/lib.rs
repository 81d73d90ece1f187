pub mod block;
pub mod bloom;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod transaction;

pub use block::BlockHeader;
pub use bloom::BloomFilter;
pub use merkle::PartialMerkleTree;
pub use transaction::{OutPoint, Transaction};

use finch_consensus::Hash256;

/// Renders a hash in the conventional big-endian display order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
