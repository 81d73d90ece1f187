use std::sync::Arc;

use finch_chain::{BlockAction, ChainAction, HeaderChain, HeaderError};
use finch_consensus::{ChainParams, Network};
use finch_pow::{hash_meets_target, retarget_bits};
use finch_primitives::block::BlockHeader;
use finch_storage::memory::MemoryStore;

const SPACING: u32 = 600;

fn regtest() -> ChainParams {
    ChainParams::for_network(Network::Regtest)
}

fn far_future(params: &ChainParams) -> i64 {
    params.consensus.genesis_time as i64 + 100_000_000
}

fn new_chain(params: ChainParams) -> HeaderChain<MemoryStore> {
    let chain = HeaderChain::new(Arc::new(MemoryStore::new()), params);
    chain.init(0).expect("init");
    chain
}

fn mine(prev: &BlockHeader, time: u32, bits: u32, tag: u8) -> BlockHeader {
    let mut header = BlockHeader {
        version: 2,
        prev_block: prev.hash(),
        merkle_root: [tag; 32],
        time,
        bits,
        nonce: 0,
    };
    while !hash_meets_target(&header.hash(), header.bits).expect("target") {
        header.nonce += 1;
    }
    header
}

/// Mines `count` headers on top of `prev` at the pow limit, spaced evenly.
fn mine_chain(params: &ChainParams, prev: &BlockHeader, count: usize, tag: u8) -> Vec<BlockHeader> {
    let bits = params.consensus.pow_limit_bits;
    let mut headers = Vec::with_capacity(count);
    let mut parent = *prev;
    for _ in 0..count {
        let header = mine(&parent, parent.time + SPACING, bits, tag);
        headers.push(header);
        parent = header;
    }
    headers
}

#[test]
fn fresh_sync_builds_best_chain() {
    let params = regtest();
    let now = far_future(&params);
    let chain = new_chain(params.clone());
    let headers = mine_chain(&params, &chain.genesis_header(), 10, 0);

    for header in &headers {
        let action = chain.connect_header(header, now, true).expect("connect");
        assert!(matches!(action, ChainAction::BestChain(_)));
    }

    let tip = chain.best_tip().expect("tip");
    assert_eq!(tip.height, 10);
    assert_eq!(tip.hash, headers[9].hash());

    let locator = chain.block_locator().expect("locator");
    assert_eq!(locator.len(), 11);
    assert_eq!(locator[0], tip.hash);
    assert_eq!(
        *locator.last().unwrap(),
        params.consensus.hash_genesis_block
    );

    let downloads = chain.blocks_to_download(0).expect("downloads");
    let heights: Vec<u32> = downloads.iter().map(|(height, _)| *height).collect();
    assert_eq!(heights, (1..=10).collect::<Vec<u32>>());
}

#[test]
fn chain_work_is_monotonic_and_height_index_traces_to_genesis() {
    let params = regtest();
    let chain = new_chain(params.clone());
    let headers = mine_chain(&params, &chain.genesis_header(), 8, 0);
    chain
        .connect_headers(&headers, far_future(&params), true)
        .expect("connect");

    let tip = chain.best_tip().expect("tip");
    let mut node = tip.clone();
    while node.height > 0 {
        let parent = chain
            .get_node(&node.header.prev_block)
            .expect("get")
            .expect("parent");
        assert!(node.chain_work > parent.chain_work);
        assert_eq!(parent.child_hash, Some(node.hash));
        assert_eq!(parent.height + 1, node.height);
        node = parent;
    }
    assert_eq!(node.hash, params.consensus.hash_genesis_block);
}

#[test]
fn resending_known_headers_is_a_known_chain() {
    let params = regtest();
    let chain = new_chain(params.clone());
    let headers = mine_chain(&params, &chain.genesis_header(), 4, 0);
    chain
        .connect_headers(&headers, far_future(&params), true)
        .expect("connect");
    let action = chain
        .connect_headers(&headers, far_future(&params), true)
        .expect("reconnect");
    match action {
        ChainAction::KnownChain(nodes) => assert_eq!(nodes.len(), 4),
        other => panic!("expected KnownChain, got {other:?}"),
    }
}

#[test]
fn orphan_header_is_rejected() {
    let params = regtest();
    let chain = new_chain(params.clone());
    let mut phantom = chain.genesis_header();
    phantom.nonce ^= 0xdead_beef;
    let header = mine(&phantom, phantom.time + SPACING, params.consensus.pow_limit_bits, 0);
    match chain.connect_header(&header, far_future(&params), true) {
        Err(HeaderError::ParentUnknown) => {}
        other => panic!("expected ParentUnknown, got {other:?}"),
    }
}

#[test]
fn unlinked_batch_is_rejected() {
    let params = regtest();
    let chain = new_chain(params.clone());
    let headers = mine_chain(&params, &chain.genesis_header(), 3, 0);
    let batch = vec![headers[0], headers[2]];
    match chain.connect_headers(&batch, far_future(&params), true) {
        Err(HeaderError::NotLinked) => {}
        other => panic!("expected NotLinked, got {other:?}"),
    }
    // Failing fast must not have persisted anything.
    assert!(chain.get_node(&headers[0].hash()).expect("get").is_none());
}

#[test]
fn insufficient_proof_of_work_is_rejected() {
    let params = regtest();
    let chain = new_chain(params.clone());
    let genesis = chain.genesis_header();
    let mut header = mine(
        &genesis,
        genesis.time + SPACING,
        params.consensus.pow_limit_bits,
        0,
    );
    while hash_meets_target(&header.hash(), header.bits).expect("target") {
        header.nonce += 1;
    }
    match chain.connect_header(&header, far_future(&params), true) {
        Err(HeaderError::BadProofOfWork) => {}
        other => panic!("expected BadProofOfWork, got {other:?}"),
    }
}

#[test]
fn off_schedule_difficulty_is_rejected() {
    let params = regtest();
    let chain = new_chain(params.clone());
    let genesis = chain.genesis_header();
    // Harder than required; the schedule demands the pow limit here.
    let header = mine(&genesis, genesis.time + SPACING, 0x2000_ffff, 0);
    match chain.connect_header(&header, far_future(&params), true) {
        Err(HeaderError::BadWork { expected, got }) => {
            assert_eq!(expected, params.consensus.pow_limit_bits);
            assert_eq!(got, 0x2000_ffff);
        }
        other => panic!("expected BadWork, got {other:?}"),
    }
}

#[test]
fn future_timestamp_is_rejected() {
    let params = regtest();
    let chain = new_chain(params.clone());
    let genesis = chain.genesis_header();
    let now = genesis.time as i64;
    let header = mine(
        &genesis,
        genesis.time + 3 * 60 * 60,
        params.consensus.pow_limit_bits,
        0,
    );
    match chain.connect_header(&header, now, true) {
        Err(HeaderError::BadTimestamp) => {}
        other => panic!("expected BadTimestamp, got {other:?}"),
    }
}

#[test]
fn timestamp_below_median_is_rejected() {
    let params = regtest();
    let now = far_future(&params);
    let chain = new_chain(params.clone());
    let headers = mine_chain(&params, &chain.genesis_header(), 3, 0);
    chain.connect_headers(&headers, now, true).expect("connect");
    // Parent window holds [t3, t2, t1, genesis]; the median is t2, and t1
    // does not clear it.
    let stale = mine(
        &headers[2],
        headers[0].time,
        params.consensus.pow_limit_bits,
        1,
    );
    match chain.connect_header(&stale, now, true) {
        Err(HeaderError::TimestampTooEarly) => {}
        other => panic!("expected TimestampTooEarly, got {other:?}"),
    }
}

#[test]
fn reorg_replaces_lighter_suffix_and_rewrites_height_index() {
    let params = regtest();
    let now = far_future(&params);
    let chain = new_chain(params.clone());

    let main = mine_chain(&params, &chain.genesis_header(), 10, 0);
    chain.connect_headers(&main, now, true).expect("main");

    // A heavier branch forking above height 5: seven blocks at the same
    // difficulty reach height 12.
    let branch_point = main[4];
    let fork = mine_chain(&params, &branch_point, 7, 7);
    let action = chain.connect_headers(&fork, now, true).expect("fork");

    match &action {
        ChainAction::ChainReorg { split, old, new } => {
            assert_eq!(split.height, 5);
            assert_eq!(split.hash, branch_point.hash());
            assert_eq!(old.len(), 5);
            assert_eq!(new.len(), 7);
        }
        other => panic!("expected ChainReorg, got {other:?}"),
    }

    let tip = chain.best_tip().expect("tip");
    assert_eq!(tip.height, 12);
    assert_eq!(tip.hash, fork[6].hash());
    for (offset, header) in fork.iter().enumerate() {
        let height = 6 + offset as u32;
        let indexed = chain
            .get_by_height(height)
            .expect("get")
            .expect("height indexed");
        assert_eq!(indexed.hash, header.hash(), "height {height}");
    }

    // The split now feeds the new branch; abandoned nodes keep their stale
    // child links, which point off the main chain.
    let split_node = chain
        .get_node(&branch_point.hash())
        .expect("get")
        .expect("split");
    assert_eq!(split_node.child_hash, Some(fork[0].hash()));
    let old_six = chain
        .get_node(&main[5].hash())
        .expect("get")
        .expect("old node");
    assert_eq!(old_six.child_hash, Some(main[6].hash()));

    let reloaded = chain
        .connect_headers(&fork, now, true)
        .expect("replay fork");
    assert!(matches!(reloaded, ChainAction::KnownChain(_)));
}

#[test]
fn lighter_fork_stays_a_side_chain_with_split_headed_action() {
    let params = regtest();
    let now = far_future(&params);
    let chain = new_chain(params.clone());

    let main = mine_chain(&params, &chain.genesis_header(), 10, 0);
    chain.connect_headers(&main, now, true).expect("main");

    let fork = mine_chain(&params, &main[4], 3, 9);
    let action = chain.connect_headers(&fork, now, true).expect("fork");
    match &action {
        ChainAction::SideChain(nodes) => {
            assert_eq!(nodes.len(), 4);
            assert_eq!(nodes[0].hash, main[4].hash());
            assert_eq!(nodes[3].hash, fork[2].hash());
        }
        other => panic!("expected SideChain, got {other:?}"),
    }

    // Best chain untouched.
    assert_eq!(chain.best_tip().expect("tip").hash, main[9].hash());

    let locator = chain.block_locator_side(&action).expect("locator");
    assert_eq!(locator[0], fork[2].hash());
    assert_eq!(locator[1], fork[1].hash());
    assert_eq!(locator[2], fork[0].hash());
    // Mainline portion anchors at the fork height.
    assert_eq!(locator[3], main[4].hash());
}

#[test]
fn checkpoint_mismatch_and_rewrite_are_rejected() {
    let params = regtest();
    let now = far_future(&params);

    // Learn real hashes first on an unconstrained chain.
    let scratch = new_chain(params.clone());
    let headers = mine_chain(&params, &scratch.genesis_header(), 4, 0);

    let mut pinned = params.clone();
    pinned.consensus.checkpoints = vec![finch_consensus::Checkpoint {
        height: 2,
        hash: headers[1].hash(),
    }];

    let chain = new_chain(pinned.clone());
    chain.connect_headers(&headers, now, true).expect("connect");

    // A fork below the checkpoint is refused outright.
    let fork = mine(&headers[0], headers[0].time + SPACING, params.consensus.pow_limit_bits, 3);
    match chain.connect_header(&fork, now, true) {
        Err(HeaderError::RewritesCheckpoint) => {}
        other => panic!("expected RewritesCheckpoint, got {other:?}"),
    }

    // A chain presenting the wrong hash at the pinned height is refused.
    let mut wrong = pinned.clone();
    wrong.consensus.checkpoints[0].hash = [0x55; 32];
    let chain = new_chain(wrong);
    let action = chain.connect_header(&headers[0], now, true).expect("first");
    assert!(matches!(action, ChainAction::BestChain(_)));
    match chain.connect_header(&headers[1], now, true) {
        Err(HeaderError::FailsCheckpoint) => {}
        other => panic!("expected FailsCheckpoint, got {other:?}"),
    }
}

#[test]
fn version_one_blocks_retire_at_configured_height() {
    let mut params = regtest();
    params.consensus.min_version_2_height = Some(2);
    let now = far_future(&params);
    let chain = new_chain(params.clone());

    let genesis = chain.genesis_header();
    let mut first = mine(&genesis, genesis.time + SPACING, params.consensus.pow_limit_bits, 0);
    first.version = 1;
    while !hash_meets_target(&first.hash(), first.bits).expect("target") {
        first.nonce += 1;
    }
    chain.connect_header(&first, now, true).expect("height 1 accepts v1");

    let mut second = mine(&first, first.time + SPACING, params.consensus.pow_limit_bits, 0);
    second.version = 1;
    while !hash_meets_target(&second.hash(), second.bits).expect("target") {
        second.nonce += 1;
    }
    match chain.connect_header(&second, now, true) {
        Err(HeaderError::DisallowedVersion) => {}
        other => panic!("expected DisallowedVersion, got {other:?}"),
    }
}

fn short_interval_params(allow_min_difficulty: bool) -> ChainParams {
    let mut params = regtest();
    params.consensus.pow_target_timespan = 8 * SPACING as i64;
    params.consensus.pow_target_spacing = SPACING as i64;
    params.consensus.allow_min_difficulty_blocks = allow_min_difficulty;
    params
}

#[test]
fn retarget_boundary_enforces_clamped_ratio_formula() {
    let params = short_interval_params(false);
    let now = far_future(&params);
    let chain = new_chain(params.clone());

    // Blocks 1..=7 at 400s spacing: the window ran fast, difficulty rises.
    let bits = params.consensus.pow_limit_bits;
    let mut headers = Vec::new();
    let mut parent = chain.genesis_header();
    for _ in 0..7 {
        let header = mine(&parent, parent.time + 400, bits, 0);
        headers.push(header);
        parent = header;
    }
    chain.connect_headers(&headers, now, true).expect("window");

    let actual = parent.time as i64 - chain.genesis_header().time as i64;
    let expected = retarget_bits(
        parent.bits,
        actual,
        params.consensus.pow_target_timespan,
        params.consensus.pow_limit_bits,
    )
    .expect("retarget");
    assert_ne!(expected, bits);

    let lazy = mine(&parent, parent.time + 400, bits, 1);
    match chain.connect_header(&lazy, now, true) {
        Err(HeaderError::BadWork { expected: want, .. }) => assert_eq!(want, expected),
        other => panic!("expected BadWork, got {other:?}"),
    }

    let proper = mine(&parent, parent.time + 400, expected, 1);
    let action = chain.connect_header(&proper, now, true).expect("boundary");
    assert!(matches!(action, ChainAction::BestChain(_)));
    assert_eq!(chain.best_tip().expect("tip").height, 8);
}

#[test]
fn min_difficulty_rule_remembers_last_real_work() {
    let params = short_interval_params(true);
    let now = far_future(&params);
    let chain = new_chain(params.clone());

    let limit = params.consensus.pow_limit_bits;
    let mut headers = Vec::new();
    let mut parent = chain.genesis_header();
    for _ in 0..7 {
        let header = mine(&parent, parent.time + 400, limit, 0);
        headers.push(header);
        parent = header;
    }
    chain.connect_headers(&headers, now, true).expect("window");

    let boundary_bits = retarget_bits(
        parent.bits,
        parent.time as i64 - chain.genesis_header().time as i64,
        params.consensus.pow_target_timespan,
        limit,
    )
    .expect("retarget");
    assert_ne!(boundary_bits, limit);
    let boundary = mine(&parent, parent.time + 400, boundary_bits, 1);
    chain.connect_header(&boundary, now, true).expect("boundary");

    // A quiet gap lets the next block fall back to the pow limit.
    let slow = mine(
        &boundary,
        boundary.time + 3 * SPACING,
        limit,
        2,
    );
    chain.connect_header(&slow, now, true).expect("min difficulty block");

    // On-schedule blocks must resume the remembered difficulty, not the
    // minimum their parent carried.
    let wrong = mine(&slow, slow.time + SPACING, limit, 3);
    match chain.connect_header(&wrong, now, true) {
        Err(HeaderError::BadWork { expected, .. }) => assert_eq!(expected, boundary_bits),
        other => panic!("expected BadWork, got {other:?}"),
    }
    let right = mine(&slow, slow.time + SPACING, boundary_bits, 3);
    chain.connect_header(&right, now, true).expect("resumes real work");
}

#[test]
fn blocks_import_in_order_only() {
    let params = regtest();
    let now = far_future(&params);
    let chain = new_chain(params.clone());
    let headers = mine_chain(&params, &chain.genesis_header(), 3, 0);
    chain.connect_headers(&headers, now, true).expect("connect");

    // Orphan import refused until the parent lands.
    assert_eq!(chain.connect_block(&headers[1].hash()).expect("gap"), None);

    match chain.connect_block(&headers[0].hash()).expect("import") {
        Some(BlockAction::BestBlock(node)) => assert_eq!(node.height, 1),
        other => panic!("expected BestBlock, got {other:?}"),
    }
    match chain.connect_block(&headers[1].hash()).expect("import") {
        Some(BlockAction::BestBlock(node)) => assert_eq!(node.height, 2),
        other => panic!("expected BestBlock, got {other:?}"),
    }
    match chain.connect_block(&headers[0].hash()).expect("reimport") {
        Some(BlockAction::OldBlock(node)) => assert_eq!(node.height, 1),
        other => panic!("expected OldBlock, got {other:?}"),
    }
    assert_eq!(chain.best_block().expect("block tip").height, 2);
}

#[test]
fn block_import_reports_reorg_of_imported_prefix() {
    let params = regtest();
    let now = far_future(&params);
    let chain = new_chain(params.clone());

    let main = mine_chain(&params, &chain.genesis_header(), 4, 0);
    chain.connect_headers(&main, now, true).expect("main");
    for header in &main {
        chain.connect_block(&header.hash()).expect("import");
    }

    let fork = mine_chain(&params, &main[1], 4, 5);
    let action = chain.connect_headers(&fork, now, true).expect("fork");
    assert!(matches!(action, ChainAction::ChainReorg { .. }));

    match chain.connect_block(&fork[0].hash()).expect("reorg import") {
        Some(BlockAction::ChainReorg { split, old, new }) => {
            assert_eq!(split.hash, main[1].hash());
            assert_eq!(old.len(), 2);
            assert_eq!(old[0].hash, main[2].hash());
            assert_eq!(new.len(), 1);
            assert_eq!(new[0].hash, fork[0].hash());
        }
        other => panic!("expected ChainReorg, got {other:?}"),
    }
    match chain.connect_block(&fork[1].hash()).expect("import") {
        Some(BlockAction::BestBlock(node)) => assert_eq!(node.hash, fork[1].hash()),
        other => panic!("expected BestBlock, got {other:?}"),
    }

    // The abandoned branch re-delivered now counts as a side block.
    match chain.connect_block(&main[2].hash()).expect("stale") {
        Some(BlockAction::SideBlock(node)) => assert_eq!(node.hash, main[2].hash()),
        other => panic!("expected SideBlock, got {other:?}"),
    }
}

#[test]
fn fast_catchup_skips_old_blocks_and_rescan_rewinds() {
    let params = regtest();
    let now = far_future(&params);
    let chain = new_chain(params.clone());
    let headers = mine_chain(&params, &chain.genesis_header(), 8, 0);
    chain.connect_headers(&headers, now, true).expect("connect");

    // Floor at the timestamp of height 5.
    let floor = headers[4].time;
    let downloads = chain.blocks_to_download(floor).expect("downloads");
    let heights: Vec<u32> = downloads.iter().map(|(height, _)| *height).collect();
    assert_eq!(heights, vec![5, 6, 7, 8]);
    assert_eq!(chain.best_block().expect("pointer").height, 4);

    for (_, hash) in &downloads {
        chain.connect_block(hash).expect("import");
    }
    assert_eq!(chain.best_block().expect("pointer").height, 8);
    assert!(chain.blocks_to_download(floor).expect("drained").is_empty());

    let rescan = chain.rescan(headers[2].time).expect("rescan");
    let heights: Vec<u32> = rescan.iter().map(|(height, _)| *height).collect();
    assert_eq!(heights, vec![3, 4, 5, 6, 7, 8]);
    assert_eq!(chain.best_block().expect("pointer").height, 2);
}

#[test]
fn node_at_timestamp_finds_earliest_reaching_node() {
    let params = regtest();
    let now = far_future(&params);
    let chain = new_chain(params.clone());
    let headers = mine_chain(&params, &chain.genesis_header(), 5, 0);
    chain.connect_headers(&headers, now, true).expect("connect");

    let node = chain
        .node_at_timestamp(headers[2].time)
        .expect("query")
        .expect("node");
    assert_eq!(node.height, 3);

    let node = chain
        .node_at_timestamp(headers[2].time + 1)
        .expect("query")
        .expect("node");
    assert_eq!(node.height, 4);

    assert!(chain
        .node_at_timestamp(headers[4].time + 1)
        .expect("query")
        .is_none());

    let node = chain.node_at_timestamp(0).expect("query").expect("node");
    assert_eq!(node.height, 0);
}

#[test]
fn node_window_follows_committed_children() {
    let params = regtest();
    let now = far_future(&params);
    let chain = new_chain(params.clone());
    let headers = mine_chain(&params, &chain.genesis_header(), 5, 0);
    chain.connect_headers(&headers, now, true).expect("connect");

    let window = chain
        .node_window(&headers[0].hash(), 3)
        .expect("window");
    assert_eq!(window.len(), 3);
    assert_eq!(window[0].height, 1);
    assert_eq!(window[2].height, 3);

    let tail = chain
        .node_window(&headers[3].hash(), 10)
        .expect("window");
    assert_eq!(tail.len(), 2);
}
