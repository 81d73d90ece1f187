use finch_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

const MAX_TX_ITEMS: usize = 100_000;
const MAX_SCRIPT_LEN: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxInput {
    pub prev_out: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOutput {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

/// A legacy-format transaction. The SPV layer relays transactions opaquely;
/// only identity (txid) and wire framing matter here.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            encoder.write_hash_le(&input.prev_out.hash);
            encoder.write_u32_le(input.prev_out.index);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_count(MAX_TX_ITEMS, "tx input")?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let hash = decoder.read_hash_le()?;
            let index = decoder.read_u32_le()?;
            let script_sig = decoder.read_var_bytes(MAX_SCRIPT_LEN, "script")?;
            let sequence = decoder.read_u32_le()?;
            inputs.push(TxInput {
                prev_out: OutPoint { hash, index },
                script_sig,
                sequence,
            });
        }
        let output_count = decoder.read_count(MAX_TX_ITEMS, "tx output")?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes(MAX_SCRIPT_LEN, "script")?;
            outputs.push(TxOutput {
                value,
                script_pubkey,
            });
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        Self::consensus_decode_from(&mut decoder)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_out: OutPoint {
                    hash: [tag; 32],
                    index: 0,
                },
                script_sig: vec![0x51],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value: 50_000,
                script_pubkey: vec![0x76, 0xa9, tag, 0x88, 0xac],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn transaction_codec_roundtrips() {
        let tx = sample_tx(0x41);
        let bytes = tx.consensus_encode();
        assert_eq!(Transaction::consensus_decode(&bytes).unwrap(), tx);
    }

    #[test]
    fn txid_depends_on_content() {
        assert_ne!(sample_tx(1).txid(), sample_tx(2).txid());
        assert_eq!(sample_tx(1).txid(), sample_tx(1).txid());
    }

    #[test]
    fn oversized_script_is_rejected() {
        let mut tx = sample_tx(3);
        tx.inputs[0].script_sig = vec![0u8; MAX_SCRIPT_LEN + 1];
        let bytes = tx.consensus_encode();
        assert!(Transaction::consensus_decode(&bytes).is_err());
    }
}
