//! Consensus-wide constants shared across validation and the P2P layer.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_015;
/// Oldest protocol version this node will talk to (first with `filterload`).
pub const MIN_PROTOCOL_VERSION: i32 = 70_001;
/// The maximum number of headers in a single `headers` message (network rule).
pub const MAX_HEADERS_RESULTS: usize = 2_000;
/// Maximum accepted clock drift for header timestamps, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of ancestor timestamps kept for the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Service bit advertising full block relay.
pub const NODE_NETWORK: u64 = 1;
/// Service bit advertising BIP37 bloom filter support.
pub const NODE_BLOOM: u64 = 1 << 2;
