//! Network parameters and consensus constants shared across the node.

pub mod constants;
pub mod params;

/// Raw 32-byte hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub use params::{ChainParams, Checkpoint, ConsensusParams, Network};
