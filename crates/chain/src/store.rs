//! Persistence layer for header nodes: three logical namespaces
//! (`node/{hash}`, `height/{h}`, and the best-header/best-block pointers)
//! mapped onto the key-value store capability.

use std::sync::Arc;

use finch_consensus::{constants::MEDIAN_TIME_SPAN, Hash256};
use finch_primitives::block::BlockHeader;
use finch_primitives::encoding::{DecodeError, Decoder, Encoder};
use finch_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::chain::HeaderError;

const BEST_HEADER_KEY: &[u8; 4] = b"best";
const BEST_BLOCK_KEY: &[u8; 5] = b"block";

/// A validated header and its chain metadata. Created once on acceptance,
/// updated only to link in a committed descendant, never deleted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: u32,
    /// Cumulative work from genesis through this header.
    pub chain_work: U256,
    /// Main-chain successor, set when a descendant is committed.
    pub child_hash: Option<Hash256>,
    /// Timestamps of this header and up to ten ancestors, newest first.
    pub median_times: Vec<u32>,
    /// Last difficulty that was not the minimum; consulted by the
    /// min-difficulty rule between retarget boundaries.
    pub min_work: u32,
}

impl HeaderNode {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(160);
        self.header.encode_into(&mut encoder);
        encoder.write_u32_le(self.height);
        encoder.write_bytes(&self.chain_work.to_big_endian());
        match &self.child_hash {
            Some(child) => {
                encoder.write_u8(1);
                encoder.write_hash_le(child);
            }
            None => encoder.write_u8(0),
        }
        encoder.write_u8(self.median_times.len() as u8);
        for time in &self.median_times {
            encoder.write_u32_le(*time);
        }
        encoder.write_u32_le(self.min_work);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let height = decoder.read_u32_le()?;
        let chain_work = U256::from_big_endian(&decoder.read_fixed::<32>()?);
        let child_hash = match decoder.read_u8()? {
            0 => None,
            _ => Some(decoder.read_hash_le()?),
        };
        let count = decoder.read_u8()? as usize;
        if count > MEDIAN_TIME_SPAN {
            return Err(DecodeError::Oversized("median time"));
        }
        let mut median_times = Vec::with_capacity(count);
        for _ in 0..count {
            median_times.push(decoder.read_u32_le()?);
        }
        let min_work = decoder.read_u32_le()?;
        Ok(Self {
            hash: header.hash(),
            header,
            height,
            chain_work,
            child_hash,
            median_times,
            min_work,
        })
    }

    /// Median of the stored timestamp window.
    pub fn median_time_past(&self) -> u32 {
        let mut times = self.median_times.clone();
        times.sort_unstable();
        times[times.len() / 2]
    }
}

pub struct HeaderStore<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> HeaderStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get_node(&self, hash: &Hash256) -> Result<Option<HeaderNode>, HeaderError> {
        let Some(bytes) = self.store.get(Column::HeaderNode, hash)? else {
            return Ok(None);
        };
        let node = HeaderNode::decode(&bytes)
            .map_err(|_| HeaderError::CorruptIndex("undecodable header node"))?;
        Ok(Some(node))
    }

    pub fn put_node(&self, batch: &mut WriteBatch, node: &HeaderNode) {
        batch.put(Column::HeaderNode, node.hash, node.encode());
    }

    pub fn put_height(&self, batch: &mut WriteBatch, node: &HeaderNode) {
        batch.put(Column::HeightIndex, node.height.to_be_bytes(), node.hash.to_vec());
    }

    pub fn delete_height(&self, batch: &mut WriteBatch, height: u32) {
        batch.delete(Column::HeightIndex, height.to_be_bytes());
    }

    /// Main-chain hash at `height`, if indexed.
    pub fn get_height_hash(&self, height: u32) -> Result<Option<Hash256>, HeaderError> {
        let Some(bytes) = self.store.get(Column::HeightIndex, &height.to_be_bytes())? else {
            return Ok(None);
        };
        if bytes.len() != 32 {
            return Err(HeaderError::CorruptIndex("height index entry is not a hash"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Some(hash))
    }

    pub fn get_by_height(&self, height: u32) -> Result<Option<HeaderNode>, HeaderError> {
        match self.get_height_hash(height)? {
            Some(hash) => self.get_node(&hash),
            None => Ok(None),
        }
    }

    pub fn get_best(&self) -> Result<Option<HeaderNode>, HeaderError> {
        self.get_pointer(BEST_HEADER_KEY)
    }

    pub fn set_best(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, *BEST_HEADER_KEY, hash.to_vec());
    }

    /// The tip of the imported (merkle-confirmed) prefix of the chain; always
    /// at or behind the best header.
    pub fn get_block_tip(&self) -> Result<Option<HeaderNode>, HeaderError> {
        self.get_pointer(BEST_BLOCK_KEY)
    }

    pub fn set_block_tip(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, *BEST_BLOCK_KEY, hash.to_vec());
    }

    pub fn commit(&self, batch: &WriteBatch) -> Result<(), HeaderError> {
        Ok(self.store.write_batch(batch)?)
    }

    fn get_pointer(&self, key: &[u8]) -> Result<Option<HeaderNode>, HeaderError> {
        let Some(bytes) = self.store.get(Column::Meta, key)? else {
            return Ok(None);
        };
        if bytes.len() != 32 {
            return Err(HeaderError::CorruptIndex("best pointer is not a hash"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        self.get_node(&hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finch_storage::memory::MemoryStore;

    fn sample_node() -> HeaderNode {
        let header = BlockHeader {
            version: 2,
            prev_block: [7u8; 32],
            merkle_root: [9u8; 32],
            time: 1_300_000_000,
            bits: 0x1d00_ffff,
            nonce: 42,
        };
        HeaderNode {
            hash: header.hash(),
            header,
            height: 12,
            chain_work: U256::from(0x1234_5678u64),
            child_hash: Some([3u8; 32]),
            median_times: vec![1_300_000_000, 1_299_999_000, 1_299_998_000],
            min_work: 0x1d00_ffff,
        }
    }

    #[test]
    fn header_node_codec_roundtrips() {
        let node = sample_node();
        let decoded = HeaderNode::decode(&node.encode()).expect("decode");
        assert_eq!(decoded, node);

        let mut bare = node.clone();
        bare.child_hash = None;
        let decoded = HeaderNode::decode(&bare.encode()).expect("decode");
        assert_eq!(decoded, bare);
    }

    #[test]
    fn store_roundtrips_node_height_and_pointers() {
        let store = HeaderStore::new(Arc::new(MemoryStore::new()));
        let node = sample_node();

        let mut batch = WriteBatch::new();
        store.put_node(&mut batch, &node);
        store.put_height(&mut batch, &node);
        store.set_best(&mut batch, &node.hash);
        store.set_block_tip(&mut batch, &node.hash);
        store.commit(&batch).expect("commit");

        assert_eq!(store.get_node(&node.hash).expect("get"), Some(node.clone()));
        assert_eq!(store.get_by_height(12).expect("get"), Some(node.clone()));
        assert_eq!(store.get_best().expect("get"), Some(node.clone()));
        assert_eq!(store.get_block_tip().expect("get"), Some(node.clone()));

        let mut batch = WriteBatch::new();
        store.delete_height(&mut batch, 12);
        store.commit(&batch).expect("commit");
        assert_eq!(store.get_by_height(12).expect("get"), None);
    }

    #[test]
    fn median_time_past_is_the_middle_value() {
        let mut node = sample_node();
        node.median_times = vec![9, 1, 5];
        assert_eq!(node.median_time_past(), 5);
        node.median_times = vec![4];
        assert_eq!(node.median_time_past(), 4);
    }
}
