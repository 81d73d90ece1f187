//! The wallet consumer boundary. The coordinator pushes ordered transactions
//! and merkle actions through this capability and owns nothing wallet-side.

use finch_chain::BlockAction;
use finch_consensus::Hash256;
use finch_primitives::hash256_to_hex;
use finch_primitives::transaction::Transaction;

pub trait WalletSink: Send {
    /// Transactions relevant to the wallet's filter, deduplicated, delivered
    /// before the merkle action of the block that contains them.
    fn import_txs(&mut self, txs: &[Transaction]) -> Result<(), String>;

    /// One per downloaded block, strictly ascending in best-chain height for
    /// main-chain actions. `expected` lists the txids the block proved.
    fn import_merkle(&mut self, action: &BlockAction, expected: &[Hash256]) -> Result<(), String>;
}

/// Stand-in sink for running without a wallet: logs what one would ingest.
pub struct LogWallet;

impl WalletSink for LogWallet {
    fn import_txs(&mut self, txs: &[Transaction]) -> Result<(), String> {
        for tx in txs {
            log_info!("wallet: tx {}", hash256_to_hex(&tx.txid()));
        }
        Ok(())
    }

    fn import_merkle(&mut self, action: &BlockAction, expected: &[Hash256]) -> Result<(), String> {
        match action {
            BlockAction::BestBlock(node) => {
                log_info!(
                    "wallet: block {} height {} ({} matched)",
                    hash256_to_hex(&node.hash),
                    node.height,
                    expected.len()
                );
            }
            BlockAction::SideBlock(node) => {
                log_info!(
                    "wallet: side block {} height {}",
                    hash256_to_hex(&node.hash),
                    node.height
                );
            }
            BlockAction::OldBlock(node) => {
                log_debug!(
                    "wallet: old block {} height {}",
                    hash256_to_hex(&node.hash),
                    node.height
                );
            }
            BlockAction::ChainReorg { split, old, new } => {
                log_info!(
                    "wallet: reorg at height {}: {} block(s) abandoned, now at {}",
                    split.height,
                    old.len(),
                    new.last().map(|node| node.height).unwrap_or(split.height)
                );
            }
        }
        Ok(())
    }
}
