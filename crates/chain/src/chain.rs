//! Chain selection over validated headers. `HeaderChain` is the single
//! authority on chain structure: it validates and persists headers, evaluates
//! every extension against the current best chain, commits height-index
//! rewrites for reorganizations, and tracks the imported-block pointer the
//! merkle download pipeline advances.

use std::sync::Arc;

use finch_consensus::constants::{MAX_FUTURE_BLOCK_TIME, MEDIAN_TIME_SPAN};
use finch_consensus::{ChainParams, Hash256};
use finch_pow::{block_proof, compact_to_u256, retarget_bits};
use finch_primitives::block::BlockHeader;
use finch_storage::{KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use crate::store::{HeaderNode, HeaderStore};

#[derive(Debug)]
pub enum HeaderError {
    /// The previous block is not in the store.
    ParentUnknown,
    BadProofOfWork,
    /// Timestamp too far past the adjusted network time.
    BadTimestamp,
    /// Timestamp at or below the median of the last eleven ancestors.
    TimestampTooEarly,
    /// Compact difficulty differs from the retarget schedule.
    BadWork { expected: u32, got: u32 },
    /// The header would fork off below the last enforced checkpoint.
    RewritesCheckpoint,
    /// The header sits at a checkpointed height with the wrong hash.
    FailsCheckpoint,
    /// Version retired at this height by network rule.
    DisallowedVersion,
    /// A batch whose headers do not form a prev-linked sequence.
    NotLinked,
    Store(StoreError),
    CorruptIndex(&'static str),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::ParentUnknown => write!(f, "previous block unknown"),
            HeaderError::BadProofOfWork => write!(f, "proof of work check failed"),
            HeaderError::BadTimestamp => write!(f, "timestamp too far in the future"),
            HeaderError::TimestampTooEarly => write!(f, "timestamp below median time past"),
            HeaderError::BadWork { expected, got } => {
                write!(f, "difficulty bits {got:#x} do not match required {expected:#x}")
            }
            HeaderError::RewritesCheckpoint => write!(f, "forks below the last checkpoint"),
            HeaderError::FailsCheckpoint => write!(f, "checkpoint mismatch"),
            HeaderError::DisallowedVersion => write!(f, "block version retired at this height"),
            HeaderError::NotLinked => write!(f, "header batch is not contiguous"),
            HeaderError::Store(err) => write!(f, "{err}"),
            HeaderError::CorruptIndex(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for HeaderError {}

impl From<StoreError> for HeaderError {
    fn from(err: StoreError) -> Self {
        HeaderError::Store(err)
    }
}

/// Outcome of connecting one or more headers, relative to the best chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainAction {
    /// The headers extend the best chain; the list is the new suffix.
    BestChain(Vec<HeaderNode>),
    /// The headers land on a lighter fork. The first node is the fork point
    /// on the main chain, the rest are the side nodes.
    SideChain(Vec<HeaderNode>),
    /// The headers complete a heavier fork. `old` and `new` are the segments
    /// strictly above `split`.
    ChainReorg {
        split: HeaderNode,
        old: Vec<HeaderNode>,
        new: Vec<HeaderNode>,
    },
    /// Every header was already known.
    KnownChain(Vec<HeaderNode>),
}

impl ChainAction {
    /// The nodes newly accepted onto some chain by this action.
    pub fn accepted(&self) -> &[HeaderNode] {
        match self {
            ChainAction::BestChain(new) => new,
            ChainAction::SideChain(nodes) => nodes.get(1..).unwrap_or(&[]),
            ChainAction::ChainReorg { new, .. } => new,
            ChainAction::KnownChain(_) => &[],
        }
    }
}

/// Outcome of importing a downloaded (merkle) block against the imported
/// prefix of the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockAction {
    /// Extends the imported prefix by one.
    BestBlock(HeaderNode),
    /// A block on a fork of the header chain.
    SideBlock(HeaderNode),
    /// Already at or below the imported tip.
    OldBlock(HeaderNode),
    /// First block of the winning branch after a header reorg; `old` lists
    /// the imported blocks being abandoned.
    ChainReorg {
        split: HeaderNode,
        old: Vec<HeaderNode>,
        new: Vec<HeaderNode>,
    },
}

impl BlockAction {
    pub fn node(&self) -> &HeaderNode {
        match self {
            BlockAction::BestBlock(node)
            | BlockAction::SideBlock(node)
            | BlockAction::OldBlock(node) => node,
            BlockAction::ChainReorg { new, .. } => &new[new.len() - 1],
        }
    }
}

pub struct HeaderChain<S> {
    store: HeaderStore<S>,
    params: ChainParams,
}

impl<S: KeyValueStore> HeaderChain<S> {
    pub fn new(store: Arc<S>, params: ChainParams) -> Self {
        Self {
            store: HeaderStore::new(store),
            params,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn genesis_header(&self) -> BlockHeader {
        let consensus = &self.params.consensus;
        BlockHeader {
            version: consensus.genesis_version,
            prev_block: [0u8; 32],
            merkle_root: consensus.genesis_merkle_root,
            time: consensus.genesis_time,
            bits: consensus.genesis_bits,
            nonce: consensus.genesis_nonce,
        }
    }

    /// Ensures the genesis node and both chain pointers exist. Idempotent.
    pub fn init(&self, fast_catchup: u32) -> Result<(), HeaderError> {
        if self.store.get_best()?.is_none() {
            let header = self.genesis_header();
            let hash = header.hash();
            if hash != self.params.consensus.hash_genesis_block {
                return Err(HeaderError::CorruptIndex("genesis constants inconsistent"));
            }
            let node = HeaderNode {
                hash,
                height: 0,
                chain_work: block_proof(header.bits).map_err(|_| HeaderError::BadProofOfWork)?,
                child_hash: None,
                median_times: vec![header.time],
                min_work: header.bits,
                header,
            };
            let mut batch = WriteBatch::new();
            self.store.put_node(&mut batch, &node);
            self.store.put_height(&mut batch, &node);
            self.store.set_best(&mut batch, &hash);
            self.store.set_block_tip(&mut batch, &hash);
            self.store.commit(&batch)?;
        } else if self.store.get_block_tip()?.is_none() {
            let mut batch = WriteBatch::new();
            self.store
                .set_block_tip(&mut batch, &self.params.consensus.hash_genesis_block);
            self.store.commit(&batch)?;
        }
        if fast_catchup > 0 {
            self.download_start(fast_catchup)?;
        }
        Ok(())
    }

    pub fn best_tip(&self) -> Result<HeaderNode, HeaderError> {
        self.store
            .get_best()?
            .ok_or(HeaderError::CorruptIndex("chain not initialized"))
    }

    /// Tip of the imported (merkle-confirmed) prefix.
    pub fn best_block(&self) -> Result<HeaderNode, HeaderError> {
        self.store
            .get_block_tip()?
            .ok_or(HeaderError::CorruptIndex("chain not initialized"))
    }

    pub fn get_node(&self, hash: &Hash256) -> Result<Option<HeaderNode>, HeaderError> {
        self.store.get_node(hash)
    }

    /// Main-chain node at `height`, if the height index covers it.
    pub fn get_by_height(&self, height: u32) -> Result<Option<HeaderNode>, HeaderError> {
        self.store.get_by_height(height)
    }

    /// Validates and persists one header. With `commit` the height index and
    /// best pointer are updated in the same call; otherwise the caller gets
    /// the action first and makes it durable via [`HeaderChain::commit_action`].
    pub fn connect_header(
        &self,
        header: &BlockHeader,
        adjusted_time: i64,
        commit: bool,
    ) -> Result<ChainAction, HeaderError> {
        self.connect_headers(std::slice::from_ref(header), adjusted_time, commit)
    }

    /// Batched form of [`HeaderChain::connect_header`]. The batch must be
    /// internally linked; validation fails fast without touching the store.
    pub fn connect_headers(
        &self,
        headers: &[BlockHeader],
        adjusted_time: i64,
        commit: bool,
    ) -> Result<ChainAction, HeaderError> {
        if headers.is_empty() {
            return Ok(ChainAction::KnownChain(Vec::new()));
        }
        let hashes: Vec<Hash256> = headers.iter().map(|header| header.hash()).collect();
        for index in 1..headers.len() {
            if headers[index].prev_block != hashes[index - 1] {
                return Err(HeaderError::NotLinked);
            }
        }

        let best = self.best_tip()?;
        let mut nodes: Vec<HeaderNode> = Vec::with_capacity(headers.len());
        let mut fresh_from = headers.len();
        for (index, header) in headers.iter().enumerate() {
            match self.store.get_node(&hashes[index])? {
                Some(node) => {
                    if fresh_from != headers.len() {
                        // Linked list cannot revisit known hashes after a new one.
                        return Err(HeaderError::CorruptIndex("known header after new header"));
                    }
                    nodes.push(node);
                }
                None => {
                    if fresh_from == headers.len() {
                        fresh_from = index;
                    }
                    let parent = match nodes.last() {
                        Some(parent) => parent.clone(),
                        None => self
                            .store
                            .get_node(&header.prev_block)?
                            .ok_or(HeaderError::ParentUnknown)?,
                    };
                    self.verify_header(&parent, header, &hashes[index], &best, adjusted_time)?;
                    nodes.push(self.make_node(&parent, header, hashes[index])?);
                }
            }
        }

        if fresh_from < headers.len() {
            let mut batch = WriteBatch::new();
            for node in &nodes[fresh_from..] {
                self.store.put_node(&mut batch, node);
            }
            self.store.commit(&batch)?;
        } else {
            return Ok(ChainAction::KnownChain(nodes));
        }

        let action = self.eval_new_chain(nodes)?;
        if commit {
            self.commit_action(&action)?;
        }
        Ok(action)
    }

    /// Classifies freshly persisted nodes against the best chain.
    fn eval_new_chain(&self, input: Vec<HeaderNode>) -> Result<ChainAction, HeaderError> {
        let Some(last) = input.last().cloned() else {
            return Ok(ChainAction::KnownChain(input));
        };
        let best = self.best_tip()?;

        // Walk the higher chain down until heights match, then both in
        // lockstep to the common ancestor.
        let mut a = last.clone();
        let mut b = best.clone();
        let mut new_branch: Vec<HeaderNode> = Vec::new();
        let mut old_branch: Vec<HeaderNode> = Vec::new();
        while a.height > b.height {
            new_branch.push(a.clone());
            a = self.parent_of(&a)?;
        }
        while b.height > a.height {
            old_branch.push(b.clone());
            b = self.parent_of(&b)?;
        }
        while a.hash != b.hash {
            new_branch.push(a.clone());
            old_branch.push(b.clone());
            a = self.parent_of(&a)?;
            b = self.parent_of(&b)?;
        }
        let split = a;
        new_branch.reverse();
        old_branch.reverse();

        if new_branch.is_empty() {
            return Ok(ChainAction::KnownChain(input));
        }
        if old_branch.is_empty() {
            return Ok(ChainAction::BestChain(new_branch));
        }
        let new_work = new_branch[new_branch.len() - 1].chain_work;
        let old_work = old_branch[old_branch.len() - 1].chain_work;
        if new_work > old_work {
            Ok(ChainAction::ChainReorg {
                split,
                old: old_branch,
                new: new_branch,
            })
        } else {
            let mut nodes = Vec::with_capacity(new_branch.len() + 1);
            nodes.push(split);
            nodes.extend(new_branch);
            Ok(ChainAction::SideChain(nodes))
        }
    }

    /// The only operation that rewrites the height index and best pointer.
    pub fn commit_action(&self, action: &ChainAction) -> Result<(), HeaderError> {
        let (new, old_tip_height) = match action {
            ChainAction::BestChain(new) => (new.as_slice(), None),
            ChainAction::ChainReorg { old, new, .. } => {
                (new.as_slice(), old.last().map(|node| node.height))
            }
            ChainAction::SideChain(_) | ChainAction::KnownChain(_) => return Ok(()),
        };
        let Some(last) = new.last() else {
            return Ok(());
        };

        let mut batch = WriteBatch::new();
        let mut parent = self
            .store
            .get_node(&new[0].header.prev_block)?
            .ok_or(HeaderError::CorruptIndex("missing parent during commit"))?;
        for node in new {
            parent.child_hash = Some(node.hash);
            self.store.put_node(&mut batch, &parent);
            self.store.put_height(&mut batch, node);
            parent = node.clone();
        }
        // A heavier branch can still be shorter; drop indexed heights the new
        // chain no longer reaches.
        if let Some(old_tip) = old_tip_height {
            for height in last.height + 1..=old_tip {
                self.store.delete_height(&mut batch, height);
            }
        }
        self.store.set_best(&mut batch, &last.hash);
        self.store.commit(&batch)
    }

    /// Advances the imported-block pointer for a downloaded block, or reports
    /// how the block relates to the imported prefix. Returns `None` when the
    /// block is unknown or its parent has not been imported yet (orphan).
    pub fn connect_block(&self, hash: &Hash256) -> Result<Option<BlockAction>, HeaderError> {
        let Some(node) = self.store.get_node(hash)? else {
            return Ok(None);
        };
        let block = self.best_block()?;
        if node.hash == block.hash {
            return Ok(Some(BlockAction::OldBlock(node)));
        }
        if node.header.prev_block == block.hash {
            self.move_block_tip(&node.hash)?;
            return Ok(Some(BlockAction::BestBlock(node)));
        }
        let on_main = self.store.get_height_hash(node.height)? == Some(node.hash);
        if !on_main {
            return Ok(Some(BlockAction::SideBlock(node)));
        }
        let block_on_main = self.store.get_height_hash(block.height)? == Some(block.hash);
        if block_on_main {
            if node.height <= block.height {
                return Ok(Some(BlockAction::OldBlock(node)));
            }
            // Parent not imported yet; refuse the orphan.
            return Ok(None);
        }
        // Imported tip is stranded on a losing branch: find the fork point.
        let mut old = Vec::new();
        let mut cursor = block;
        while self.store.get_height_hash(cursor.height)? != Some(cursor.hash) {
            old.push(cursor.clone());
            cursor = self.parent_of(&cursor)?;
        }
        let split = cursor;
        old.reverse();
        if node.height <= split.height {
            return Ok(Some(BlockAction::OldBlock(node)));
        }
        if node.height != split.height + 1 {
            return Ok(None);
        }
        self.move_block_tip(&node.hash)?;
        Ok(Some(BlockAction::ChainReorg {
            split,
            old,
            new: vec![node],
        }))
    }

    /// Sparse locator over the best chain: the last ten heights, then
    /// geometrically receding ones, then genesis.
    pub fn block_locator(&self) -> Result<Vec<Hash256>, HeaderError> {
        let tip = self.best_tip()?;
        self.block_locator_at(tip.height)
    }

    pub fn block_locator_at(&self, height: u32) -> Result<Vec<Hash256>, HeaderError> {
        let tip = self.best_tip()?;
        let top = height.min(tip.height);
        let mut locator = Vec::new();
        for height in locator_heights(top) {
            let hash = self
                .store
                .get_height_hash(height)?
                .ok_or(HeaderError::CorruptIndex("height index gap in locator"))?;
            locator.push(hash);
        }
        locator.push(self.params.consensus.hash_genesis_block);
        Ok(locator)
    }

    /// Locator for continuing a side chain: the most recent side nodes
    /// (newest first, at most ten) ahead of the mainline locator anchored at
    /// the fork point.
    pub fn block_locator_side(&self, action: &ChainAction) -> Result<Vec<Hash256>, HeaderError> {
        let ChainAction::SideChain(nodes) = action else {
            return self.block_locator();
        };
        let Some((split, side)) = nodes.split_first() else {
            return self.block_locator();
        };
        let mut locator: Vec<Hash256> =
            side.iter().rev().take(10).map(|node| node.hash).collect();
        locator.extend(self.block_locator_at(split.height)?);
        Ok(locator)
    }

    /// Main-chain blocks above the imported pointer, subject to the
    /// fast-catchup floor, in ascending height order.
    pub fn blocks_to_download(
        &self,
        fast_catchup: u32,
    ) -> Result<Vec<(u32, Hash256)>, HeaderError> {
        let start = self.download_start(fast_catchup)?;
        self.enumerate_main(start)
    }

    /// Forces re-enumeration (and re-import) of everything from the
    /// fast-catchup floor by rewinding the imported-block pointer.
    pub fn rescan(&self, fast_catchup: u32) -> Result<Vec<(u32, Hash256)>, HeaderError> {
        let tip = self.best_tip()?;
        let start = match self.node_at_timestamp(fast_catchup)? {
            Some(node) => node.height.max(1),
            None => {
                self.move_block_tip(&tip.hash)?;
                return Ok(Vec::new());
            }
        };
        let anchor = self
            .store
            .get_by_height(start - 1)?
            .ok_or(HeaderError::CorruptIndex("height index gap before rescan"))?;
        self.move_block_tip(&anchor.hash)?;
        self.enumerate_main(start)
    }

    /// Up to `count` main-chain nodes starting at `from`, following child
    /// links.
    pub fn node_window(
        &self,
        from: &Hash256,
        count: usize,
    ) -> Result<Vec<HeaderNode>, HeaderError> {
        let mut out = Vec::new();
        let Some(mut node) = self.store.get_node(from)? else {
            return Ok(out);
        };
        out.push(node.clone());
        while out.len() < count {
            let Some(child) = node.child_hash else { break };
            node = self
                .store
                .get_node(&child)?
                .ok_or(HeaderError::CorruptIndex("dangling child link"))?;
            out.push(node.clone());
        }
        Ok(out)
    }

    /// Earliest main-chain node whose timestamp has reached `timestamp`, by
    /// walking back from the tip until the clock falls below it.
    pub fn node_at_timestamp(&self, timestamp: u32) -> Result<Option<HeaderNode>, HeaderError> {
        let mut node = self.best_tip()?;
        if node.header.time < timestamp {
            return Ok(None);
        }
        loop {
            if node.height == 0 {
                return Ok(Some(node));
            }
            let parent = self.parent_of(&node)?;
            if parent.header.time < timestamp {
                return Ok(Some(node));
            }
            node = parent;
        }
    }

    fn enumerate_main(&self, start: u32) -> Result<Vec<(u32, Hash256)>, HeaderError> {
        let tip = self.best_tip()?;
        let mut out = Vec::new();
        for height in start.max(1)..=tip.height {
            let hash = self
                .store
                .get_height_hash(height)?
                .ok_or(HeaderError::CorruptIndex("height index gap"))?;
            out.push((height, hash));
        }
        Ok(out)
    }

    /// First height still to download, fast-forwarding the imported pointer
    /// past blocks older than the catchup floor.
    fn download_start(&self, fast_catchup: u32) -> Result<u32, HeaderError> {
        let tip = self.best_tip()?;
        let block = self.best_block()?;
        let mut start = if self.store.get_height_hash(block.height)? == Some(block.hash) {
            block.height + 1
        } else {
            // Pointer stranded on a losing branch; resume from the fork.
            let mut cursor = block;
            while self.store.get_height_hash(cursor.height)? != Some(cursor.hash) {
                cursor = self.parent_of(&cursor)?;
            }
            cursor.height + 1
        };
        if fast_catchup > 0 {
            match self.node_at_timestamp(fast_catchup)? {
                Some(node) if node.height > start => {
                    let anchor = self.store.get_by_height(node.height - 1)?.ok_or(
                        HeaderError::CorruptIndex("height index gap before catchup"),
                    )?;
                    self.move_block_tip(&anchor.hash)?;
                    start = node.height;
                }
                Some(_) => {}
                None => start = tip.height + 1,
            }
        }
        Ok(start)
    }

    fn move_block_tip(&self, hash: &Hash256) -> Result<(), HeaderError> {
        let mut batch = WriteBatch::new();
        self.store.set_block_tip(&mut batch, hash);
        self.store.commit(&batch)
    }

    fn parent_of(&self, node: &HeaderNode) -> Result<HeaderNode, HeaderError> {
        self.store
            .get_node(&node.header.prev_block)?
            .ok_or(HeaderError::CorruptIndex("missing parent node"))
    }

    /// Contextual header checks: proof of work, clock drift, difficulty
    /// schedule, median time, checkpoints, version floor. The parent is
    /// already resolved by the caller.
    fn verify_header(
        &self,
        parent: &HeaderNode,
        header: &BlockHeader,
        hash: &Hash256,
        best: &HeaderNode,
        adjusted_time: i64,
    ) -> Result<(), HeaderError> {
        let consensus = &self.params.consensus;

        let target = compact_to_u256(header.bits).map_err(|_| HeaderError::BadProofOfWork)?;
        let limit =
            compact_to_u256(consensus.pow_limit_bits).map_err(|_| HeaderError::BadProofOfWork)?;
        if target.is_zero() || target > limit {
            return Err(HeaderError::BadProofOfWork);
        }
        if U256::from_little_endian(hash) >= target {
            return Err(HeaderError::BadProofOfWork);
        }

        if header.time as i64 > adjusted_time + MAX_FUTURE_BLOCK_TIME {
            return Err(HeaderError::BadTimestamp);
        }

        let expected = self.next_work_required(parent, header)?;
        if header.bits != expected {
            return Err(HeaderError::BadWork {
                expected,
                got: header.bits,
            });
        }

        if header.time <= parent.median_time_past() {
            return Err(HeaderError::TimestampTooEarly);
        }

        let height = parent.height + 1;
        if let Some(checkpoint) = consensus.last_checkpoint_at(best.height) {
            if height <= checkpoint.height {
                return Err(HeaderError::RewritesCheckpoint);
            }
        }
        if let Some(checkpoint) = consensus.checkpoint_at(height) {
            if checkpoint.hash != *hash {
                return Err(HeaderError::FailsCheckpoint);
            }
        }

        if let Some(floor) = consensus.min_version_2_height {
            if header.version < 2 && height >= floor {
                return Err(HeaderError::DisallowedVersion);
            }
        }

        Ok(())
    }

    /// The compact difficulty the next header must carry.
    fn next_work_required(
        &self,
        parent: &HeaderNode,
        header: &BlockHeader,
    ) -> Result<u32, HeaderError> {
        let consensus = &self.params.consensus;
        let next_height = parent.height + 1;
        let interval = consensus.retarget_interval();

        if interval == 0 || next_height % interval != 0 {
            if consensus.allow_min_difficulty_blocks {
                let quiet = parent.header.time as i64 + consensus.pow_target_spacing * 2;
                if header.time as i64 > quiet {
                    return Ok(consensus.pow_limit_bits);
                }
                return Ok(parent.min_work);
            }
            return Ok(parent.header.bits);
        }

        let mut first = parent.clone();
        for _ in 0..interval - 1 {
            if first.height == 0 {
                // Chain shorter than a retarget window; no schedule to apply.
                return Ok(consensus.pow_limit_bits);
            }
            first = self.parent_of(&first)?;
        }
        let actual = parent.header.time as i64 - first.header.time as i64;
        retarget_bits(
            parent.header.bits,
            actual,
            consensus.pow_target_timespan,
            consensus.pow_limit_bits,
        )
        .map_err(|_| HeaderError::BadProofOfWork)
    }

    fn make_node(
        &self,
        parent: &HeaderNode,
        header: &BlockHeader,
        hash: Hash256,
    ) -> Result<HeaderNode, HeaderError> {
        let consensus = &self.params.consensus;
        let work = block_proof(header.bits).map_err(|_| HeaderError::BadProofOfWork)?;
        let height = parent.height + 1;
        let mut median_times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        median_times.push(header.time);
        median_times.extend(
            parent
                .median_times
                .iter()
                .copied()
                .take(MEDIAN_TIME_SPAN - 1),
        );
        let interval = consensus.retarget_interval();
        let boundary = interval > 0 && height % interval == 0;
        let min_work = if boundary || header.bits != consensus.pow_limit_bits {
            header.bits
        } else {
            parent.min_work
        };
        Ok(HeaderNode {
            hash,
            header: *header,
            height,
            chain_work: parent.chain_work + work,
            child_hash: None,
            median_times,
            min_work,
        })
    }
}

/// Heights sampled by a locator anchored at `top`: the last ten, then
/// `top - 10 - 2^k`, clipped to positive. Genesis is appended by the caller.
fn locator_heights(top: u32) -> Vec<u32> {
    let top = top as i64;
    let mut heights = Vec::new();
    for height in (top - 9..=top).rev() {
        if height > 0 {
            heights.push(height as u32);
        }
    }
    let mut step: i64 = 1;
    loop {
        let height = top - 10 - step;
        if height <= 0 {
            break;
        }
        heights.push(height as u32);
        match step.checked_mul(2) {
            Some(next) => step = next,
            None => break,
        }
    }
    heights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_heights_cover_recent_then_geometric() {
        assert_eq!(locator_heights(0), Vec::<u32>::new());
        assert_eq!(locator_heights(3), vec![3, 2, 1]);
        assert_eq!(
            locator_heights(10),
            vec![10, 9, 8, 7, 6, 5, 4, 3, 2, 1]
        );
        let heights = locator_heights(100);
        assert_eq!(&heights[..10], &[100, 99, 98, 97, 96, 95, 94, 93, 92, 91]);
        assert_eq!(&heights[10..], &[89, 88, 86, 82, 74, 58, 26]);
    }

    #[test]
    fn locator_length_grows_logarithmically() {
        let short = locator_heights(1_000).len();
        let long = locator_heights(1_000_000).len();
        assert!(long <= short + 10);
    }
}
