//! Per-network chain parameters: proof-of-work limits, retarget constants,
//! checkpoints, genesis constants and the P2P surface (magic, port, seeds).

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mainnet" | "main" => Some(Self::Mainnet),
            "testnet" | "test" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }
}

/// Hard-coded `(height, hash)` pair that any accepted chain must respect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    /// Easiest allowed proof-of-work target, in compact form.
    pub pow_limit_bits: u32,
    /// Length of a retarget window in seconds.
    pub pow_target_timespan: i64,
    /// Intended block spacing in seconds.
    pub pow_target_spacing: i64,
    /// Whether blocks may fall back to the pow limit after a quiet spell
    /// (testnet rule).
    pub allow_min_difficulty_blocks: bool,
    pub checkpoints: Vec<Checkpoint>,
    pub hash_genesis_block: Hash256,
    pub genesis_version: i32,
    pub genesis_merkle_root: Hash256,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    /// Height at or above which version-1 blocks are rejected, if any.
    pub min_version_2_height: Option<u32>,
}

impl ConsensusParams {
    /// Number of blocks between difficulty retargets.
    pub fn retarget_interval(&self) -> u32 {
        (self.pow_target_timespan / self.pow_target_spacing) as u32
    }

    /// The highest checkpoint at or below `height`, if any.
    pub fn last_checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.height <= height)
            .max_by_key(|checkpoint| checkpoint.height)
    }

    /// The checkpoint pinning exactly `height`, if any.
    pub fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub name: &'static str,
    /// Four magic bytes prefixed to every wire frame.
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub protocol_version: i32,
    /// Bootstrap hosts; resolved once at startup, no further discovery.
    pub seeds: &'static [&'static str],
    pub consensus: ConsensusParams,
}

impl ChainParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => mainnet(),
            Network::Testnet => testnet(),
            Network::Regtest => regtest(),
        }
    }
}

const GENESIS_HASH_MAINNET: Hash256 = [
    0x6f, 0xe2, 0x8c, 0x0a, 0xb6, 0xf1, 0xb3, 0x72, 0xc1, 0xa6, 0xa2, 0x46, 0xae, 0x63, 0xf7,
    0x4f, 0x93, 0x1e, 0x83, 0x65, 0xe1, 0x5a, 0x08, 0x9c, 0x68, 0xd6, 0x19, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

const GENESIS_HASH_TESTNET: Hash256 = [
    0x43, 0x49, 0x7f, 0xd7, 0xf8, 0x26, 0x95, 0x71, 0x08, 0xf4, 0xa3, 0x0f, 0xd9, 0xce, 0xc3,
    0xae, 0xba, 0x79, 0x97, 0x20, 0x84, 0xe9, 0x0e, 0xad, 0x01, 0xea, 0x33, 0x09, 0x00, 0x00,
    0x00, 0x00,
];

const GENESIS_HASH_REGTEST: Hash256 = [
    0x06, 0x22, 0x6e, 0x46, 0x11, 0x1a, 0x0b, 0x59, 0xca, 0xaf, 0x12, 0x60, 0x43, 0xeb, 0x5b,
    0xbf, 0x28, 0xc3, 0x4f, 0x3a, 0x5e, 0x33, 0x2a, 0x1f, 0xc7, 0xb2, 0xb7, 0x3c, 0xf1, 0x88,
    0x91, 0x0f,
];

/// Merkle root of the single coinbase in the genesis block; shared by all
/// three networks.
const GENESIS_MERKLE_ROOT: Hash256 = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f,
    0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e,
    0x5e, 0x4a,
];

fn mainnet_checkpoints() -> Vec<Checkpoint> {
    vec![
        Checkpoint {
            height: 11_111,
            hash: [
                0x1d, 0x7c, 0x6e, 0xb2, 0xfd, 0x42, 0xf5, 0x59, 0x25, 0xe9, 0x2e, 0xfa, 0xd6,
                0x8b, 0x61, 0xed, 0xd2, 0x2f, 0xba, 0x29, 0xfd, 0xe8, 0x78, 0x3d, 0xf7, 0x44,
                0xe2, 0x69, 0x00, 0x00, 0x00, 0x00,
            ],
        },
        Checkpoint {
            height: 33_333,
            hash: [
                0xa6, 0xd0, 0xb5, 0xdf, 0x7d, 0x0d, 0xf0, 0x69, 0xce, 0xb1, 0xe7, 0x36, 0xa2,
                0x16, 0xad, 0x18, 0x7a, 0x50, 0xb0, 0x7a, 0xaa, 0x4e, 0x78, 0x74, 0x8a, 0x58,
                0xd5, 0x2d, 0x00, 0x00, 0x00, 0x00,
            ],
        },
        Checkpoint {
            height: 74_000,
            hash: [
                0x20, 0x1a, 0x66, 0xb8, 0x53, 0xf9, 0xe7, 0x81, 0x4a, 0x82, 0x0e, 0x2a, 0xf5,
                0xf5, 0xdc, 0x79, 0xc0, 0x71, 0x44, 0xe3, 0x1c, 0xe4, 0xc9, 0xa3, 0x93, 0x39,
                0x57, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        },
        Checkpoint {
            height: 105_000,
            hash: [
                0x97, 0xdc, 0x6b, 0x1d, 0x15, 0xfb, 0xee, 0xf3, 0x73, 0xa7, 0x44, 0xfe, 0xe0,
                0xb2, 0x54, 0xb0, 0xd2, 0xc8, 0x20, 0xa3, 0xae, 0x7f, 0x02, 0x28, 0xce, 0x91,
                0x02, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        },
        Checkpoint {
            height: 134_444,
            hash: [
                0xa1, 0xb4, 0xcc, 0x52, 0x95, 0x9a, 0x53, 0x91, 0x4c, 0x81, 0xac, 0x30, 0xf4,
                0x94, 0xa5, 0xd4, 0xff, 0x34, 0xcd, 0x15, 0xd3, 0x4c, 0xfd, 0x2f, 0xb1, 0x05,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        },
        Checkpoint {
            height: 168_000,
            hash: [
                0x63, 0xb7, 0x03, 0x83, 0x5c, 0xb7, 0x35, 0xcb, 0x9a, 0x89, 0xd7, 0x33, 0xcb,
                0xe6, 0x6f, 0x21, 0x2f, 0x63, 0x79, 0x5e, 0x01, 0x72, 0xea, 0x61, 0x9e, 0x09,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        },
        Checkpoint {
            height: 216_116,
            hash: [
                0x4e, 0xdf, 0x23, 0x1b, 0xf1, 0x70, 0x23, 0x4e, 0x6a, 0x81, 0x14, 0x60, 0xf9,
                0x5c, 0x94, 0xaf, 0x94, 0x64, 0xe4, 0x1e, 0xe8, 0x33, 0xb4, 0xf4, 0xb4, 0x01,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        },
        Checkpoint {
            height: 225_430,
            hash: [
                0x32, 0x59, 0x57, 0x30, 0xb1, 0x65, 0xf0, 0x97, 0xe7, 0xb8, 0x06, 0xa6, 0x79,
                0xcf, 0x7f, 0x3e, 0x43, 0x90, 0x40, 0xf7, 0x50, 0x43, 0x38, 0x08, 0xc1, 0x01,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        },
        Checkpoint {
            height: 250_000,
            hash: [
                0x14, 0xd2, 0xf2, 0x4d, 0x29, 0xbe, 0xd7, 0x53, 0x54, 0xf3, 0xf8, 0x8a, 0x5f,
                0xb5, 0x00, 0x22, 0xfc, 0x06, 0x4b, 0x02, 0x29, 0x1f, 0xdf, 0x87, 0x38, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        },
    ]
}

fn mainnet() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        name: "mainnet",
        message_start: [0xf9, 0xbe, 0xb4, 0xd9],
        default_port: 8333,
        protocol_version: crate::constants::PROTOCOL_VERSION,
        seeds: &[
            "seed.bitcoin.sipa.be",
            "dnsseed.bluematt.me",
            "seed.bitcoinstats.com",
            "seed.btc.petertodd.org",
        ],
        consensus: ConsensusParams {
            pow_limit_bits: 0x1d00_ffff,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 10 * 60,
            allow_min_difficulty_blocks: false,
            checkpoints: mainnet_checkpoints(),
            hash_genesis_block: GENESIS_HASH_MAINNET,
            genesis_version: 1,
            genesis_merkle_root: GENESIS_MERKLE_ROOT,
            genesis_time: 1_231_006_505,
            genesis_bits: 0x1d00_ffff,
            genesis_nonce: 2_083_236_893,
            min_version_2_height: Some(227_931),
        },
    }
}

fn testnet() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        name: "testnet",
        message_start: [0x0b, 0x11, 0x09, 0x07],
        default_port: 18_333,
        protocol_version: crate::constants::PROTOCOL_VERSION,
        seeds: &[
            "testnet-seed.bitcoin.jonasschnelli.ch",
            "seed.tbtc.petertodd.org",
        ],
        consensus: ConsensusParams {
            pow_limit_bits: 0x1d00_ffff,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 10 * 60,
            allow_min_difficulty_blocks: true,
            checkpoints: vec![Checkpoint {
                height: 546,
                hash: [
                    0x70, 0xcb, 0x6a, 0xf7, 0xeb, 0xbc, 0xb1, 0x31, 0x5d, 0x34, 0x14, 0x02,
                    0x9c, 0x55, 0x6c, 0x55, 0xf3, 0xe2, 0xfc, 0x35, 0x3c, 0x4c, 0x90, 0x63,
                    0xa7, 0x6c, 0x93, 0x2a, 0x00, 0x00, 0x00, 0x00,
                ],
            }],
            hash_genesis_block: GENESIS_HASH_TESTNET,
            genesis_version: 1,
            genesis_merkle_root: GENESIS_MERKLE_ROOT,
            genesis_time: 1_296_688_602,
            genesis_bits: 0x1d00_ffff,
            genesis_nonce: 414_098_458,
            min_version_2_height: Some(21_111),
        },
    }
}

fn regtest() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        name: "regtest",
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 18_444,
        protocol_version: crate::constants::PROTOCOL_VERSION,
        seeds: &[],
        consensus: ConsensusParams {
            pow_limit_bits: 0x207f_ffff,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 10 * 60,
            allow_min_difficulty_blocks: true,
            checkpoints: Vec::new(),
            hash_genesis_block: GENESIS_HASH_REGTEST,
            genesis_version: 1,
            genesis_merkle_root: GENESIS_MERKLE_ROOT,
            genesis_time: 1_296_688_602,
            genesis_bits: 0x207f_ffff,
            genesis_nonce: 2,
            min_version_2_height: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_interval_matches_two_weeks_of_blocks() {
        let params = ChainParams::for_network(Network::Mainnet);
        assert_eq!(params.consensus.retarget_interval(), 2016);
    }

    #[test]
    fn checkpoint_lookup_picks_highest_at_or_below() {
        let params = ChainParams::for_network(Network::Mainnet);
        let last = params.consensus.last_checkpoint_at(200_000).expect("checkpoint");
        assert_eq!(last.height, 168_000);
        assert!(params.consensus.last_checkpoint_at(11_110).is_none());
        assert_eq!(params.consensus.last_checkpoint_at(11_111).unwrap().height, 11_111);
        assert!(params.consensus.checkpoint_at(11_112).is_none());
    }
}
