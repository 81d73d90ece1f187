//! Wire serialization helpers. Everything on the wire is little-endian with
//! Bitcoin-style compact-size counts.

use finch_consensus::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEnd,
    /// A compact-size count exceeded the caller-imposed bound.
    Oversized(&'static str),
    InvalidUtf8,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEnd => write!(f, "unexpected end of input"),
            DecodeError::Oversized(what) => write!(f, "{what} count too large"),
            DecodeError::InvalidUtf8 => write!(f, "invalid utf-8 string"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_hash_le(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }

    pub fn write_varint(&mut self, value: u64) {
        if value < 0xfd {
            self.buf.push(value as u8);
        } else if value <= 0xffff {
            self.buf.push(0xfd);
            self.buf.extend_from_slice(&(value as u16).to_le_bytes());
        } else if value <= 0xffff_ffff {
            self.buf.push(0xfe);
            self.buf.extend_from_slice(&(value as u32).to_le_bytes());
        } else {
            self.buf.push(0xff);
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_hash_le(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let first = self.read_u8()?;
        match first {
            0xfd => Ok(u16::from_le_bytes(self.read_fixed::<2>()?) as u64),
            0xfe => Ok(u32::from_le_bytes(self.read_fixed::<4>()?) as u64),
            0xff => Ok(u64::from_le_bytes(self.read_fixed::<8>()?)),
            value => Ok(value as u64),
        }
    }

    /// Reads a compact-size count, rejecting values above `limit`.
    pub fn read_count(&mut self, limit: usize, what: &'static str) -> Result<usize, DecodeError> {
        let count = self.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::Oversized(what))?;
        if count > limit {
            return Err(DecodeError::Oversized(what));
        }
        Ok(count)
    }

    pub fn read_var_bytes(&mut self, limit: usize, what: &'static str) -> Result<Vec<u8>, DecodeError> {
        let count = self.read_count(limit, what)?;
        Ok(self.read_bytes(count)?.to_vec())
    }

    pub fn read_var_str(&mut self, limit: usize) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes(limit, "string")?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrips_at_boundaries() {
        for value in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let mut encoder = Encoder::new();
            encoder.write_varint(value);
            let bytes = encoder.into_inner();
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_varint().unwrap(), value);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn varint_width_is_minimal_for_small_values() {
        let mut encoder = Encoder::new();
        encoder.write_varint(0xfc);
        assert_eq!(encoder.len(), 1);
        let mut encoder = Encoder::new();
        encoder.write_varint(0xfd);
        assert_eq!(encoder.len(), 3);
        let mut encoder = Encoder::new();
        encoder.write_varint(0x1_0000);
        assert_eq!(encoder.len(), 5);
    }

    #[test]
    fn count_limit_is_enforced() {
        let mut encoder = Encoder::new();
        encoder.write_varint(10);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(
            decoder.read_count(9, "item"),
            Err(DecodeError::Oversized("item"))
        );
    }

    #[test]
    fn truncated_input_reports_unexpected_end() {
        let mut decoder = Decoder::new(&[0x01, 0x02]);
        assert_eq!(decoder.read_u32_le(), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn var_str_roundtrips() {
        let mut encoder = Encoder::new();
        encoder.write_var_str("/finchd:0.1.0/");
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_var_str(256).unwrap(), "/finchd:0.1.0/");
    }
}
