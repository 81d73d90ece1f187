//! Wire codec and per-connection peer sessions.
//!
//! Each connection runs one read task and one write task. The read task
//! drives the version handshake, answers pings, assembles a `merkleblock`
//! with its trailing matched transactions into a single event, and forwards
//! everything else to the coordinator as typed [`PeerEvent`]s. The write task
//! drains the outbound channel the coordinator sends on.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use finch_consensus::constants::{MAX_HEADERS_RESULTS, MIN_PROTOCOL_VERSION, NODE_BLOOM, NODE_NETWORK};
use finch_consensus::{ChainParams, Hash256};
use finch_primitives::block::BlockHeader;
use finch_primitives::bloom::BloomFilter;
use finch_primitives::encoding::{DecodeError, Decoder, Encoder};
use finch_primitives::hash::sha256d;
use finch_primitives::hash256_to_hex;
use finch_primitives::merkle::PartialMerkleTree;
use finch_primitives::transaction::Transaction;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::peers::PeerId;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;

/// `reject` code for a repeated `version` message.
pub const REJECT_DUPLICATE: u8 = 0x12;

const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
const MAX_INV_ENTRIES: usize = 50_000;
const MAX_LOCATOR_HASHES: usize = 101;
const MAX_MERKLE_HASHES: usize = 1 << 17;
const MAX_USER_AGENT_LEN: usize = 256;
const MAX_FILTER_BYTES: usize = 36_000;
const HANDSHAKE_TIMEOUT_SECS: u64 = 15;
const USER_AGENT: &str = "/finchd:0.1.0/";

/// Outbound queue depth per peer; the coordinator blocks when it fills.
pub const OUTBOUND_QUEUE: usize = 64;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub enum PeerError {
    /// Remote speaks a protocol older than we support.
    BadProtocolVersion(i32),
    /// Remote sent `version` twice.
    DuplicateVersion,
    /// Malformed payload; terminates the session.
    Codec(String),
    /// Framing or sequencing violation.
    Protocol(&'static str),
    Io(String),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::BadProtocolVersion(version) => {
                write!(f, "unsupported protocol version {version}")
            }
            PeerError::DuplicateVersion => write!(f, "duplicate version message"),
            PeerError::Codec(message) => write!(f, "codec error: {message}"),
            PeerError::Protocol(message) => write!(f, "{message}"),
            PeerError::Io(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<DecodeError> for PeerError {
    fn from(err: DecodeError) -> Self {
        PeerError::Codec(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inventory {
    pub kind: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub total_tx: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

impl MerkleBlockMessage {
    pub fn partial_tree(&self) -> PartialMerkleTree {
        PartialMerkleTree {
            total: self.total_tx,
            hashes: self.hashes.clone(),
            flags: self.flags.clone(),
        }
    }
}

/// A `merkleblock` plus the matched transactions the peer streamed after it.
#[derive(Clone, Debug)]
pub struct DecodedMerkleBlock {
    pub merkle: MerkleBlockMessage,
    /// Root recomputed from the partial tree, to be checked against the
    /// header the chain knows.
    pub root: Hash256,
    /// Txids the tree claims match, in tree order.
    pub expected: Vec<Hash256>,
    /// Matched transactions collected from the wire; may be short when the
    /// peer considered some already relayed.
    pub txs: Vec<Transaction>,
}

impl DecodedMerkleBlock {
    pub fn block_hash(&self) -> Hash256 {
        self.merkle.header.hash()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Version(VersionPayload),
    VerAck,
    Ping(u64),
    Pong(u64),
    Inv(Vec<Inventory>),
    GetHeaders {
        version: u32,
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    Headers(Vec<BlockHeader>),
    GetData(Vec<Inventory>),
    MerkleBlock(MerkleBlockMessage),
    Tx(Transaction),
    FilterLoad(BloomFilter),
    Reject {
        message: String,
        code: u8,
        reason: String,
    },
    Unknown(String),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetData(_) => "getdata",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Tx(_) => "tx",
            Message::FilterLoad(_) => "filterload",
            Message::Reject { .. } => "reject",
            Message::Unknown(_) => "unknown",
        }
    }

    pub fn encode(&self) -> (&'static str, Vec<u8>) {
        let mut encoder = Encoder::new();
        match self {
            Message::Version(version) => {
                encoder.write_i32_le(version.version);
                encoder.write_u64_le(version.services);
                encoder.write_i64_le(version.timestamp);
                write_net_addr(&mut encoder, version.services);
                write_net_addr(&mut encoder, version.services);
                encoder.write_u64_le(version.nonce);
                encoder.write_var_str(&version.user_agent);
                encoder.write_i32_le(version.start_height);
                encoder.write_u8(version.relay as u8);
            }
            Message::VerAck => {}
            Message::Ping(nonce) | Message::Pong(nonce) => encoder.write_u64_le(*nonce),
            Message::Inv(items) | Message::GetData(items) => {
                encoder.write_varint(items.len() as u64);
                for item in items {
                    encoder.write_u32_le(item.kind);
                    encoder.write_hash_le(&item.hash);
                }
            }
            Message::GetHeaders {
                version,
                locator,
                stop,
            } => {
                encoder.write_u32_le(*version);
                encoder.write_varint(locator.len() as u64);
                for hash in locator {
                    encoder.write_hash_le(hash);
                }
                encoder.write_hash_le(stop);
            }
            Message::Headers(headers) => {
                encoder.write_varint(headers.len() as u64);
                for header in headers {
                    header.encode_into(&mut encoder);
                    encoder.write_varint(0);
                }
            }
            Message::MerkleBlock(merkle) => {
                merkle.header.encode_into(&mut encoder);
                encoder.write_u32_le(merkle.total_tx);
                encoder.write_varint(merkle.hashes.len() as u64);
                for hash in &merkle.hashes {
                    encoder.write_hash_le(hash);
                }
                encoder.write_var_bytes(&merkle.flags);
            }
            Message::Tx(tx) => tx.encode_into(&mut encoder),
            Message::FilterLoad(filter) => {
                encoder.write_var_bytes(&filter.data);
                encoder.write_u32_le(filter.hash_funcs);
                encoder.write_u32_le(filter.tweak);
                encoder.write_u8(filter.flags);
            }
            Message::Reject {
                message,
                code,
                reason,
            } => {
                encoder.write_var_str(message);
                encoder.write_u8(*code);
                encoder.write_var_str(reason);
            }
            Message::Unknown(_) => {}
        }
        (self.command(), encoder.into_inner())
    }

    pub fn decode(command: &str, payload: &[u8]) -> Result<Message, PeerError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            "version" => {
                let version = decoder.read_i32_le()?;
                let services = decoder.read_u64_le()?;
                let timestamp = decoder.read_i64_le()?;
                read_net_addr(&mut decoder)?;
                read_net_addr(&mut decoder)?;
                let nonce = decoder.read_u64_le()?;
                let user_agent = decoder.read_var_str(MAX_USER_AGENT_LEN)?;
                let start_height = decoder.read_i32_le()?;
                let relay = match decoder.is_empty() {
                    true => true,
                    false => decoder.read_u8()? != 0,
                };
                Message::Version(VersionPayload {
                    version,
                    services,
                    timestamp,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            "verack" => Message::VerAck,
            "ping" | "pong" => {
                let nonce = if decoder.is_empty() {
                    0
                } else {
                    decoder.read_u64_le()?
                };
                match command {
                    "ping" => Message::Ping(nonce),
                    _ => Message::Pong(nonce),
                }
            }
            "inv" => Message::Inv(read_inventory(&mut decoder)?),
            "getdata" => Message::GetData(read_inventory(&mut decoder)?),
            "getheaders" => {
                let version = decoder.read_u32_le()?;
                let count = decoder.read_count(MAX_LOCATOR_HASHES, "locator")?;
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(decoder.read_hash_le()?);
                }
                let stop = decoder.read_hash_le()?;
                Message::GetHeaders {
                    version,
                    locator,
                    stop,
                }
            }
            "headers" => {
                let count = decoder.read_count(MAX_HEADERS_RESULTS, "header")?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::consensus_decode_from(&mut decoder)?);
                    let _tx_count = decoder.read_varint()?;
                }
                Message::Headers(headers)
            }
            "merkleblock" => {
                let header = BlockHeader::consensus_decode_from(&mut decoder)?;
                let total_tx = decoder.read_u32_le()?;
                let count = decoder.read_count(MAX_MERKLE_HASHES, "merkle hash")?;
                let mut hashes = Vec::with_capacity(count);
                for _ in 0..count {
                    hashes.push(decoder.read_hash_le()?);
                }
                let flags = decoder.read_var_bytes(MAX_PAYLOAD_SIZE, "merkle flags")?;
                Message::MerkleBlock(MerkleBlockMessage {
                    header,
                    total_tx,
                    hashes,
                    flags,
                })
            }
            "tx" => Message::Tx(Transaction::consensus_decode_from(&mut decoder)?),
            "filterload" => {
                let data = decoder.read_var_bytes(MAX_FILTER_BYTES, "filter")?;
                let hash_funcs = decoder.read_u32_le()?;
                let tweak = decoder.read_u32_le()?;
                let flags = decoder.read_u8()?;
                Message::FilterLoad(BloomFilter {
                    data,
                    hash_funcs,
                    tweak,
                    flags,
                })
            }
            "reject" => {
                let message = decoder.read_var_str(64)?;
                let code = decoder.read_u8()?;
                let reason = decoder.read_var_str(MAX_USER_AGENT_LEN)?;
                Message::Reject {
                    message,
                    code,
                    reason,
                }
            }
            other => Message::Unknown(other.to_string()),
        };
        Ok(message)
    }
}

fn read_inventory(decoder: &mut Decoder<'_>) -> Result<Vec<Inventory>, PeerError> {
    let count = decoder.read_count(MAX_INV_ENTRIES, "inventory")?;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(Inventory {
            kind: decoder.read_u32_le()?,
            hash: decoder.read_hash_le()?,
        });
    }
    Ok(items)
}

fn write_net_addr(encoder: &mut Encoder, services: u64) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&[0u8; 16]);
    encoder.write_bytes(&0u16.to_be_bytes());
}

fn read_net_addr(decoder: &mut Decoder<'_>) -> Result<(), DecodeError> {
    let _services = decoder.read_u64_le()?;
    let _ip = decoder.read_fixed::<16>()?;
    let _port = decoder.read_bytes(2)?;
    Ok(())
}

/// Events a peer session delivers to the coordinator, in wire order.
#[derive(Debug)]
pub enum PeerEvent {
    Handshake {
        peer: PeerId,
        addr: SocketAddr,
        version: VersionPayload,
        sender: mpsc::Sender<Message>,
    },
    Disconnect(PeerId),
    Inbound(PeerId, Message),
    MerkleAssembled(PeerId, DecodedMerkleBlock),
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
) -> Result<(String, Vec<u8>), PeerError> {
    let mut header = [0u8; 24];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|err| PeerError::Io(err.to_string()))?;
    if header[..4] != magic {
        return Err(PeerError::Protocol("invalid magic"));
    }
    let command = header[4..16]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect::<String>();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(PeerError::Protocol("payload too large"));
    }
    let checksum = [header[20], header[21], header[22], header[23]];
    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| PeerError::Io(err.to_string()))?;
    let calc = sha256d(&payload);
    if checksum != calc[..4] {
        return Err(PeerError::Protocol("invalid payload checksum"));
    }
    Ok((command, payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> Result<(), PeerError> {
    let mut frame = Vec::with_capacity(24 + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; 12];
    let raw = command.as_bytes();
    if raw.len() > 12 {
        return Err(PeerError::Protocol("command too long"));
    }
    command_bytes[..raw.len()].copy_from_slice(raw);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(payload);
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(payload);
    writer
        .write_all(&frame)
        .await
        .map_err(|err| PeerError::Io(err.to_string()))
}

fn local_version(params: &ChainParams, start_height: i32) -> VersionPayload {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    VersionPayload {
        version: params.protocol_version,
        services: 0,
        timestamp,
        nonce: rand::random(),
        user_agent: USER_AGENT.to_string(),
        start_height,
        // Relay only what the bloom filter selects.
        relay: false,
    }
}

/// Connects to `addr` and runs the session until the peer goes away or a
/// protocol error ends it. Always emits `Disconnect` after `Handshake`.
pub async fn run_peer(
    peer: PeerId,
    addr: SocketAddr,
    params: Arc<ChainParams>,
    start_height: i32,
    events: mpsc::Sender<PeerEvent>,
) -> Result<(), PeerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|err| PeerError::Io(err.to_string()))?;
    run_peer_on(peer, addr, stream, params, start_height, events).await
}

/// Session driver over any byte stream; split out so tests can run it over
/// an in-memory duplex.
pub async fn run_peer_on<S>(
    peer: PeerId,
    addr: SocketAddr,
    stream: S,
    params: Arc<ChainParams>,
    start_height: i32,
    events: mpsc::Sender<PeerEvent>,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let magic = params.message_start;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let ours = local_version(&params, start_height);
    let handshake = timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        drive_handshake(peer, &mut reader, &mut writer, magic, &ours),
    )
    .await
    .map_err(|_| PeerError::Protocol("handshake timed out"))??;

    let (sender, mut outbound) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let (command, payload) = message.encode();
            if write_frame(&mut writer, magic, command, &payload)
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let delivered = events
        .send(PeerEvent::Handshake {
            peer,
            addr,
            version: handshake,
            sender: sender.clone(),
        })
        .await
        .is_ok();

    let result = if delivered {
        read_loop(peer, &mut reader, magic, &events, &sender).await
    } else {
        Ok(())
    };
    let _ = events.send(PeerEvent::Disconnect(peer)).await;
    writer_task.abort();
    result
}

async fn drive_handshake<R, W>(
    peer: PeerId,
    reader: &mut R,
    writer: &mut W,
    magic: [u8; 4],
    ours: &VersionPayload,
) -> Result<VersionPayload, PeerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (command, payload) = Message::Version(ours.clone()).encode();
    write_frame(writer, magic, command, &payload).await?;

    let mut theirs: Option<VersionPayload> = None;
    let mut got_verack = false;
    while theirs.is_none() || !got_verack {
        let (command, payload) = read_frame(reader, magic).await?;
        match Message::decode(&command, &payload)? {
            Message::Version(version) => {
                if theirs.is_some() {
                    return Err(PeerError::DuplicateVersion);
                }
                if version.version < MIN_PROTOCOL_VERSION {
                    return Err(PeerError::BadProtocolVersion(version.version));
                }
                if version.services & NODE_NETWORK == 0 {
                    return Err(PeerError::Protocol("peer does not serve blocks"));
                }
                if version.services & NODE_BLOOM == 0 {
                    // Pre-BIP111 nodes do not advertise the bit yet may still
                    // honor filterload; connect and find out.
                    log_debug!("peer {peer}: no bloom service bit advertised");
                }
                let (command, payload) = Message::VerAck.encode();
                write_frame(writer, magic, command, &payload).await?;
                theirs = Some(version);
            }
            Message::VerAck => got_verack = true,
            Message::Ping(nonce) => {
                let (command, payload) = Message::Pong(nonce).encode();
                write_frame(writer, magic, command, &payload).await?;
            }
            _ => {}
        }
    }
    Ok(theirs.unwrap_or_else(|| ours.clone()))
}

struct MerkleAssembly {
    dmb: DecodedMerkleBlock,
    missing: HashSet<Hash256>,
}

async fn read_loop<R: AsyncRead + Unpin>(
    peer: PeerId,
    reader: &mut R,
    magic: [u8; 4],
    events: &mpsc::Sender<PeerEvent>,
    outbound: &mpsc::Sender<Message>,
) -> Result<(), PeerError> {
    let mut assembly: Option<MerkleAssembly> = None;
    loop {
        let (command, payload) = read_frame(reader, magic).await?;
        match Message::decode(&command, &payload)? {
            Message::Version(_) => {
                let _ = outbound
                    .send(Message::Reject {
                        message: "version".to_string(),
                        code: REJECT_DUPLICATE,
                        reason: "duplicate version".to_string(),
                    })
                    .await;
                return Err(PeerError::DuplicateVersion);
            }
            Message::VerAck => {}
            Message::Ping(nonce) => {
                let _ = outbound.send(Message::Pong(nonce)).await;
            }
            Message::Pong(_) => {
                // The coordinator pings after a getdata batch; the pong marks
                // the tail of any in-progress assembly.
                if !flush_assembly(peer, &mut assembly, events).await {
                    return Ok(());
                }
            }
            Message::MerkleBlock(merkle) => {
                if !flush_assembly(peer, &mut assembly, events).await {
                    return Ok(());
                }
                match merkle.partial_tree().extract_matches() {
                    Ok((root, expected)) => {
                        let missing: HashSet<Hash256> = expected.iter().copied().collect();
                        let dmb = DecodedMerkleBlock {
                            merkle,
                            root,
                            expected,
                            txs: Vec::new(),
                        };
                        if missing.is_empty() {
                            if events
                                .send(PeerEvent::MerkleAssembled(peer, dmb))
                                .await
                                .is_err()
                            {
                                return Ok(());
                            }
                        } else {
                            assembly = Some(MerkleAssembly { dmb, missing });
                        }
                    }
                    Err(err) => {
                        log_warn!(
                            "peer {}: merkle block {} has invalid partial tree: {err}",
                            peer,
                            hash256_to_hex(&merkle.header.hash())
                        );
                    }
                }
            }
            Message::Tx(tx) => {
                if let Some(current) = assembly.as_mut() {
                    let txid = tx.txid();
                    if current.missing.remove(&txid) {
                        current.dmb.txs.push(tx);
                        if current.missing.is_empty()
                            && !flush_assembly(peer, &mut assembly, events).await
                        {
                            return Ok(());
                        }
                        continue;
                    }
                    if !flush_assembly(peer, &mut assembly, events).await {
                        return Ok(());
                    }
                }
                if events
                    .send(PeerEvent::Inbound(peer, Message::Tx(tx)))
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
            message => {
                if !flush_assembly(peer, &mut assembly, events).await {
                    return Ok(());
                }
                if events
                    .send(PeerEvent::Inbound(peer, message))
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
    }
}

/// Emits a pending assembly even if some expected txs never arrived (the
/// peer skips transactions it believes we already have). Returns false when
/// the coordinator is gone.
async fn flush_assembly(
    peer: PeerId,
    assembly: &mut Option<MerkleAssembly>,
    events: &mpsc::Sender<PeerEvent>,
) -> bool {
    let Some(current) = assembly.take() else {
        return true;
    };
    events
        .send(PeerEvent::MerkleAssembled(peer, current.dmb))
        .await
        .is_ok()
}
