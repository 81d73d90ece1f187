//! Proof-of-work arithmetic: compact targets, block work, retargeting.

pub mod difficulty;

pub use difficulty::{
    block_proof, compact_to_u256, hash_meets_target, retarget_bits, u256_to_compact, CompactError,
};
