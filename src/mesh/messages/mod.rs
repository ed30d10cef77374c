//! Types and codecs for the messages relay nodes trade on the wire.
//!
//! Every frame carries a fixed header (starting sequence, a 12-byte
//! ASCII type label, and a little endian payload length) followed by
//! the payload and a one byte control flag trailer whose `VALID` bit
//! must be set. Peers speaking protocol version 4 use a legacy frame
//! without the starting sequence and trailer; see the `versioning`
//! module for the converters.

pub mod factory;
pub mod validator;
pub mod versioning;

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::mesh::crypto::hash::{double_digest, Digest};

/// Every current frame opens with these bytes.
pub const STARTING_SEQUENCE: [u8; 4] = [0xFF, 0xFE, 0xFD, 0xFC];

/// Length of the ASCII message type label.
pub const MESSAGE_TYPE_LENGTH: usize = 12;

/// Length of the current frame header: starting sequence, type
/// label, payload length.
pub const HEADER_LENGTH: usize = 20;

/// Length of the protocol version 4 frame header: type label and
/// payload length only.
pub const LEGACY_HEADER_LENGTH: usize = 16;

/// Length of the control flag trailer. The trailer is counted in
/// the advertised payload length.
pub const CONTROL_FLAGS_LENGTH: usize = 1;

/// Length of a network number field.
pub const NETWORK_NUM_LENGTH: usize = 4;

/// Length of a node id (UUID) field.
pub const SOURCE_ID_LENGTH: usize = 16;

/// Length of the prefix common to all broadcast family payloads:
/// message hash, network number, source id.
pub const BROADCAST_PREFIX_LENGTH: usize = Digest::LENGTH + NETWORK_NUM_LENGTH + SOURCE_ID_LENGTH;

/// Payload cap for message types without a dedicated limit.
pub const DEFAULT_MAX_PAYLOAD_LEN_BYTES: usize = 1024 * 1024;

/// Control flag bits.
pub mod control_flags {
    /// Set on every well formed frame.
    pub const VALID: u8 = 0b0000_0001;
}

/// The reserved null short id; never stored, never assigned.
pub const NULL_TX_SID: u32 = 0;

/// Errors raised while framing, parsing or validating messages.
///
/// The connection layer dispatches on the variant: payload length
/// inconsistencies kill the connection, parse and validation
/// failures count toward the bad message throttle, unauthorized
/// messages are dropped and throttled.
#[derive(Debug)]
pub enum ProtocolError {
    /// The advertised payload length contradicts the frame.
    PayloadLen(String),
    /// A frame failed per-kind construction.
    Parse(String),
    /// The message kind is not permitted for this peer.
    Unauthorized(MessageKind),
    /// A validator check failed; `full_message` tells whether the
    /// offending frame was completely buffered (and recoverable).
    Validation { full_message: bool, reason: String },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PayloadLen(msg) => write!(fmt, "payload length error: {}", msg),
            ProtocolError::Parse(msg) => write!(fmt, "parse error: {}", msg),
            ProtocolError::Unauthorized(kind) => {
                write!(fmt, "unauthorized message of kind {:?}", kind)
            }
            ProtocolError::Validation { reason, .. } => {
                write!(fmt, "validation error: {}", reason)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The id a node introduces itself with during the handshake, and
/// stamps into every broadcast family message it originates.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct SourceId([u8; SOURCE_ID_LENGTH]);

impl SourceId {
    /// The all-zero id peers send before they know who they are.
    pub const EMPTY: SourceId = SourceId([0; SOURCE_ID_LENGTH]);

    pub fn from_bytes(bytes: [u8; SOURCE_ID_LENGTH]) -> Self {
        SourceId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SOURCE_ID_LENGTH] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // canonical 8-4-4-4-12 UUID formatting
        for (i, b) in self.0.iter().enumerate() {
            if let 4 | 6 | 8 | 10 = i {
                write!(fmt, "-")?;
            }
            write!(fmt, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "SourceId({})", self)
    }
}

/// The message kinds of the relay protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageKind {
    Hello,
    Ack,
    Ping,
    Pong,
    Broadcast,
    Tx,
    Txs,
    Key,
    BlockHold,
    GetTxs,
    TxAssign,
    TxServiceSync,
    BlockConfirmation,
    TxCleanup,
}

/// All kinds, in no particular order.
pub const ALL_MESSAGE_KINDS: [MessageKind; 14] = [
    MessageKind::Hello,
    MessageKind::Ack,
    MessageKind::Ping,
    MessageKind::Pong,
    MessageKind::Broadcast,
    MessageKind::Tx,
    MessageKind::Txs,
    MessageKind::Key,
    MessageKind::BlockHold,
    MessageKind::GetTxs,
    MessageKind::TxAssign,
    MessageKind::TxServiceSync,
    MessageKind::BlockConfirmation,
    MessageKind::TxCleanup,
];

impl MessageKind {
    /// The NUL padded 12-byte label identifying this kind on
    /// the wire.
    pub fn label(self) -> [u8; MESSAGE_TYPE_LENGTH] {
        match self {
            MessageKind::Hello => padded(b"hello"),
            MessageKind::Ack => padded(b"ack"),
            MessageKind::Ping => padded(b"ping"),
            MessageKind::Pong => padded(b"pong"),
            MessageKind::Broadcast => padded(b"broadcast"),
            MessageKind::Tx => padded(b"tx"),
            MessageKind::Txs => padded(b"txs"),
            MessageKind::Key => padded(b"key"),
            MessageKind::BlockHold => padded(b"blockhold"),
            MessageKind::GetTxs => padded(b"gettxs"),
            MessageKind::TxAssign => padded(b"txassign"),
            MessageKind::TxServiceSync => padded(b"txservsync"),
            MessageKind::BlockConfirmation => padded(b"blockconf"),
            MessageKind::TxCleanup => padded(b"txcleanup"),
        }
    }

    /// Maps a wire label back to a kind.
    pub fn from_label(label: &[u8; MESSAGE_TYPE_LENGTH]) -> Option<Self> {
        ALL_MESSAGE_KINDS
            .iter()
            .copied()
            .find(|kind| kind.label() == *label)
    }

    /// Whether payloads of this kind open with the broadcast
    /// family prefix.
    pub fn is_broadcast_family(self) -> bool {
        matches!(
            self,
            MessageKind::Broadcast
                | MessageKind::Tx
                | MessageKind::Key
                | MessageKind::BlockHold
                | MessageKind::BlockConfirmation
                | MessageKind::TxCleanup
        )
    }

    /// Whether this kind may arrive before the handshake finishes.
    pub fn is_handshake(self) -> bool {
        matches!(self, MessageKind::Hello | MessageKind::Ack)
    }
}

fn padded(label: &[u8]) -> [u8; MESSAGE_TYPE_LENGTH] {
    debug_assert!(label.len() <= MESSAGE_TYPE_LENGTH);
    let mut out = [0; MESSAGE_TYPE_LENGTH];
    out[..label.len()].copy_from_slice(label);
    out
}

/// The prefix shared by all broadcast family payloads.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BroadcastHeader {
    pub message_hash: Digest,
    pub network_num: u32,
    pub source_id: SourceId,
}

impl BroadcastHeader {
    fn write_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.message_hash.as_ref());
        let mut num = [0; NETWORK_NUM_LENGTH];
        LittleEndian::write_u32(&mut num, self.network_num);
        out.extend_from_slice(&num);
        out.extend_from_slice(self.source_id.as_bytes());
    }

    fn read_from(payload: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if payload.len() < BROADCAST_PREFIX_LENGTH {
            return Err(ProtocolError::Parse(
                "payload too short for a broadcast family prefix".into(),
            ));
        }
        let message_hash = Digest::from_bytes(&payload[..Digest::LENGTH])
            .map_err(|e| ProtocolError::Parse(e.to_string()))?;
        let network_num = LittleEndian::read_u32(&payload[Digest::LENGTH..]);
        let mut source = [0; SOURCE_ID_LENGTH];
        source.copy_from_slice(
            &payload[Digest::LENGTH + NETWORK_NUM_LENGTH..BROADCAST_PREFIX_LENGTH],
        );
        Ok((
            BroadcastHeader {
                message_hash,
                network_num,
                source_id: SourceId::from_bytes(source),
            },
            &payload[BROADCAST_PREFIX_LENGTH..],
        ))
    }
}

/// An entry of a `txs` batch: a fully resolved transaction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TxEntry {
    pub short_id: u32,
    pub hash: Digest,
    pub contents: Vec<u8>,
}

/// First message of the handshake, in either direction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub network_num: u32,
    pub node_id: SourceId,
}

/// Handshake acknowledgement.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckMessage;

/// Keepalive request carrying a nonce the peer echoes back.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PingMessage {
    pub nonce: u64,
}

/// Keepalive response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PongMessage {
    pub nonce: u64,
}

/// A (possibly encrypted) block being propagated.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BroadcastMessage {
    pub header: BroadcastHeader,
    pub is_encrypted: bool,
    pub blob: Vec<u8>,
}

/// A single transaction being propagated, optionally with a short
/// id already assigned.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TxMessage {
    pub header: BroadcastHeader,
    pub short_id: u32,
    pub contents: Vec<u8>,
}

/// A batch of resolved transactions, e.g. answering `gettxs`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TxsMessage {
    pub txs: Vec<TxEntry>,
}

/// The decryption key for a previously broadcast encrypted block.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KeyMessage {
    pub header: BroadcastHeader,
    pub key: [u8; KeyMessage::KEY_LENGTH],
}

impl KeyMessage {
    pub const KEY_LENGTH: usize = 32;
}

/// Announces the sender is holding a block it cannot decrypt yet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockHoldingMessage {
    pub header: BroadcastHeader,
}

/// Requests the transactions behind a set of short ids.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GetTxsMessage {
    pub short_ids: Vec<u32>,
}

/// Assigns a short id to a transaction hash.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TxAssignMessage {
    pub tx_hash: Digest,
    pub short_id: u32,
}

/// Requests a transaction service snapshot for one network.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TxServiceSyncMessage {
    pub network_num: u32,
}

/// Reports the short ids and hashes confirmed by a mined block.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockConfirmationMessage {
    pub header: BroadcastHeader,
    pub short_ids: Vec<u32>,
    pub tx_hashes: Vec<Digest>,
}

/// Instructs peers to drop a set of short ids and hashes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TxCleanupMessage {
    pub header: BroadcastHeader,
    pub short_ids: Vec<u32>,
    pub tx_hashes: Vec<Digest>,
}

impl TxCleanupMessage {
    /// Builds a cleanup message, deriving the message hash from the
    /// cleanup body so receivers can deduplicate it like any other
    /// broadcast family message.
    pub fn new(
        network_num: u32,
        source_id: SourceId,
        short_ids: Vec<u32>,
        tx_hashes: Vec<Digest>,
    ) -> Self {
        let mut body = Vec::with_capacity(
            NETWORK_NUM_LENGTH + short_ids.len() * 4 + tx_hashes.len() * Digest::LENGTH,
        );
        let mut num = [0; NETWORK_NUM_LENGTH];
        LittleEndian::write_u32(&mut num, network_num);
        body.extend_from_slice(&num);
        for sid in short_ids.iter() {
            LittleEndian::write_u32(&mut num, *sid);
            body.extend_from_slice(&num);
        }
        for hash in tx_hashes.iter() {
            body.extend_from_slice(hash.as_ref());
        }
        TxCleanupMessage {
            header: BroadcastHeader {
                message_hash: double_digest(&body),
                network_num,
                source_id,
            },
            short_ids,
            tx_hashes,
        }
    }
}

/// A fully parsed wire message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    Hello(HelloMessage),
    Ack(AckMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    Broadcast(BroadcastMessage),
    Tx(TxMessage),
    Txs(TxsMessage),
    Key(KeyMessage),
    BlockHold(BlockHoldingMessage),
    GetTxs(GetTxsMessage),
    TxAssign(TxAssignMessage),
    TxServiceSync(TxServiceSyncMessage),
    BlockConfirmation(BlockConfirmationMessage),
    TxCleanup(TxCleanupMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::Ack(_) => MessageKind::Ack,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::Broadcast(_) => MessageKind::Broadcast,
            Message::Tx(_) => MessageKind::Tx,
            Message::Txs(_) => MessageKind::Txs,
            Message::Key(_) => MessageKind::Key,
            Message::BlockHold(_) => MessageKind::BlockHold,
            Message::GetTxs(_) => MessageKind::GetTxs,
            Message::TxAssign(_) => MessageKind::TxAssign,
            Message::TxServiceSync(_) => MessageKind::TxServiceSync,
            Message::BlockConfirmation(_) => MessageKind::BlockConfirmation,
            Message::TxCleanup(_) => MessageKind::TxCleanup,
        }
    }

    /// The broadcast family prefix, for kinds that carry one.
    pub fn broadcast_header(&self) -> Option<&BroadcastHeader> {
        match self {
            Message::Broadcast(m) => Some(&m.header),
            Message::Tx(m) => Some(&m.header),
            Message::Key(m) => Some(&m.header),
            Message::BlockHold(m) => Some(&m.header),
            Message::BlockConfirmation(m) => Some(&m.header),
            Message::TxCleanup(m) => Some(&m.header),
            _ => None,
        }
    }

    /// Serializes the payload of this message, without the control
    /// flag trailer, appending to `out`.
    pub fn write_payload(&self, out: &mut Vec<u8>) {
        let mut num = [0; 4];
        match self {
            Message::Hello(m) => {
                LittleEndian::write_u32(&mut num, m.protocol_version);
                out.extend_from_slice(&num);
                LittleEndian::write_u32(&mut num, m.network_num);
                out.extend_from_slice(&num);
                out.extend_from_slice(m.node_id.as_bytes());
            }
            Message::Ack(_) => (),
            Message::Ping(m) => {
                let mut nonce = [0; 8];
                LittleEndian::write_u64(&mut nonce, m.nonce);
                out.extend_from_slice(&nonce);
            }
            Message::Pong(m) => {
                let mut nonce = [0; 8];
                LittleEndian::write_u64(&mut nonce, m.nonce);
                out.extend_from_slice(&nonce);
            }
            Message::Broadcast(m) => {
                m.header.write_into(out);
                out.push(m.is_encrypted as u8);
                out.extend_from_slice(&m.blob);
            }
            Message::Tx(m) => {
                m.header.write_into(out);
                LittleEndian::write_u32(&mut num, m.short_id);
                out.extend_from_slice(&num);
                out.extend_from_slice(&m.contents);
            }
            Message::Txs(m) => {
                LittleEndian::write_u32(&mut num, m.txs.len() as u32);
                out.extend_from_slice(&num);
                for tx in m.txs.iter() {
                    LittleEndian::write_u32(&mut num, tx.short_id);
                    out.extend_from_slice(&num);
                    out.extend_from_slice(tx.hash.as_ref());
                    LittleEndian::write_u32(&mut num, tx.contents.len() as u32);
                    out.extend_from_slice(&num);
                    out.extend_from_slice(&tx.contents);
                }
            }
            Message::Key(m) => {
                m.header.write_into(out);
                out.extend_from_slice(&m.key);
            }
            Message::BlockHold(m) => {
                m.header.write_into(out);
            }
            Message::GetTxs(m) => {
                LittleEndian::write_u32(&mut num, m.short_ids.len() as u32);
                out.extend_from_slice(&num);
                for sid in m.short_ids.iter() {
                    LittleEndian::write_u32(&mut num, *sid);
                    out.extend_from_slice(&num);
                }
            }
            Message::TxAssign(m) => {
                out.extend_from_slice(m.tx_hash.as_ref());
                LittleEndian::write_u32(&mut num, m.short_id);
                out.extend_from_slice(&num);
            }
            Message::TxServiceSync(m) => {
                LittleEndian::write_u32(&mut num, m.network_num);
                out.extend_from_slice(&num);
            }
            Message::BlockConfirmation(m) => {
                m.header.write_into(out);
                write_sid_and_hash_lists(out, &m.short_ids, &m.tx_hashes);
            }
            Message::TxCleanup(m) => {
                m.header.write_into(out);
                write_sid_and_hash_lists(out, &m.short_ids, &m.tx_hashes);
            }
        }
    }

    /// Parses a payload (without the control flag trailer) of the
    /// given kind.
    pub fn parse_payload(kind: MessageKind, payload: &[u8]) -> Result<Message, ProtocolError> {
        match kind {
            MessageKind::Hello => {
                // version specific extensions may follow the base fields
                let base = 2 * 4 + SOURCE_ID_LENGTH;
                if payload.len() < base {
                    return Err(ProtocolError::Parse("hello payload too short".into()));
                }
                let protocol_version = LittleEndian::read_u32(payload);
                let network_num = LittleEndian::read_u32(&payload[4..]);
                let mut node_id = [0; SOURCE_ID_LENGTH];
                node_id.copy_from_slice(&payload[8..base]);
                Ok(Message::Hello(HelloMessage {
                    protocol_version,
                    network_num,
                    node_id: SourceId::from_bytes(node_id),
                }))
            }
            MessageKind::Ack => Ok(Message::Ack(AckMessage)),
            MessageKind::Ping => Ok(Message::Ping(PingMessage {
                nonce: parse_nonce(payload)?,
            })),
            MessageKind::Pong => Ok(Message::Pong(PongMessage {
                nonce: parse_nonce(payload)?,
            })),
            MessageKind::Broadcast => {
                let (header, rest) = BroadcastHeader::read_from(payload)?;
                if rest.is_empty() {
                    return Err(ProtocolError::Parse(
                        "broadcast payload missing encryption flag".into(),
                    ));
                }
                Ok(Message::Broadcast(BroadcastMessage {
                    header,
                    is_encrypted: rest[0] != 0,
                    blob: rest[1..].to_vec(),
                }))
            }
            MessageKind::Tx => {
                let (header, rest) = BroadcastHeader::read_from(payload)?;
                if rest.len() < 4 {
                    return Err(ProtocolError::Parse("tx payload missing short id".into()));
                }
                Ok(Message::Tx(TxMessage {
                    header,
                    short_id: LittleEndian::read_u32(rest),
                    contents: rest[4..].to_vec(),
                }))
            }
            MessageKind::Txs => {
                let mut rest = expect_len(payload, 4, "txs count")?;
                let count = LittleEndian::read_u32(payload) as usize;
                let mut txs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let after_sid = expect_len(rest, 4, "txs short id")?;
                    let short_id = LittleEndian::read_u32(rest);
                    let after_hash = expect_len(after_sid, Digest::LENGTH, "txs hash")?;
                    let hash = Digest::from_bytes(after_sid)
                        .map_err(|e| ProtocolError::Parse(e.to_string()))?;
                    let after_len = expect_len(after_hash, 4, "txs contents length")?;
                    let contents_len = LittleEndian::read_u32(after_hash) as usize;
                    rest = expect_len(after_len, contents_len, "txs contents")?;
                    txs.push(TxEntry {
                        short_id,
                        hash,
                        contents: after_len[..contents_len].to_vec(),
                    });
                }
                Ok(Message::Txs(TxsMessage { txs }))
            }
            MessageKind::Key => {
                let (header, rest) = BroadcastHeader::read_from(payload)?;
                if rest.len() < KeyMessage::KEY_LENGTH {
                    return Err(ProtocolError::Parse("key payload too short".into()));
                }
                let mut key = [0; KeyMessage::KEY_LENGTH];
                key.copy_from_slice(&rest[..KeyMessage::KEY_LENGTH]);
                Ok(Message::Key(KeyMessage { header, key }))
            }
            MessageKind::BlockHold => {
                let (header, _) = BroadcastHeader::read_from(payload)?;
                Ok(Message::BlockHold(BlockHoldingMessage { header }))
            }
            MessageKind::GetTxs => {
                let mut rest = expect_len(payload, 4, "gettxs count")?;
                let count = LittleEndian::read_u32(payload) as usize;
                let mut short_ids = Vec::with_capacity(count.min(16 * 1024));
                for _ in 0..count {
                    let after = expect_len(rest, 4, "gettxs short id")?;
                    short_ids.push(LittleEndian::read_u32(rest));
                    rest = after;
                }
                Ok(Message::GetTxs(GetTxsMessage { short_ids }))
            }
            MessageKind::TxAssign => {
                if payload.len() < Digest::LENGTH + 4 {
                    return Err(ProtocolError::Parse("txassign payload too short".into()));
                }
                let tx_hash = Digest::from_bytes(payload)
                    .map_err(|e| ProtocolError::Parse(e.to_string()))?;
                Ok(Message::TxAssign(TxAssignMessage {
                    tx_hash,
                    short_id: LittleEndian::read_u32(&payload[Digest::LENGTH..]),
                }))
            }
            MessageKind::TxServiceSync => {
                if payload.len() < NETWORK_NUM_LENGTH {
                    return Err(ProtocolError::Parse("txservsync payload too short".into()));
                }
                Ok(Message::TxServiceSync(TxServiceSyncMessage {
                    network_num: LittleEndian::read_u32(payload),
                }))
            }
            MessageKind::BlockConfirmation => {
                let (header, rest) = BroadcastHeader::read_from(payload)?;
                let (short_ids, tx_hashes) = parse_sid_and_hash_lists(rest)?;
                Ok(Message::BlockConfirmation(BlockConfirmationMessage {
                    header,
                    short_ids,
                    tx_hashes,
                }))
            }
            MessageKind::TxCleanup => {
                let (header, rest) = BroadcastHeader::read_from(payload)?;
                let (short_ids, tx_hashes) = parse_sid_and_hash_lists(rest)?;
                Ok(Message::TxCleanup(TxCleanupMessage {
                    header,
                    short_ids,
                    tx_hashes,
                }))
            }
        }
    }
}

fn parse_nonce(payload: &[u8]) -> Result<u64, ProtocolError> {
    if payload.len() < 8 {
        return Err(ProtocolError::Parse("keepalive payload too short".into()));
    }
    Ok(LittleEndian::read_u64(payload))
}

/// Checks `buf` holds at least `n` bytes for `what`, returning the
/// remainder past them.
fn expect_len<'a>(buf: &'a [u8], n: usize, what: &str) -> Result<&'a [u8], ProtocolError> {
    if buf.len() < n {
        return Err(ProtocolError::Parse(format!("truncated field: {}", what)));
    }
    Ok(&buf[n..])
}

fn write_sid_and_hash_lists(out: &mut Vec<u8>, short_ids: &[u32], tx_hashes: &[Digest]) {
    let mut num = [0; 4];
    LittleEndian::write_u32(&mut num, short_ids.len() as u32);
    out.extend_from_slice(&num);
    for sid in short_ids.iter() {
        LittleEndian::write_u32(&mut num, *sid);
        out.extend_from_slice(&num);
    }
    LittleEndian::write_u32(&mut num, tx_hashes.len() as u32);
    out.extend_from_slice(&num);
    for hash in tx_hashes.iter() {
        out.extend_from_slice(hash.as_ref());
    }
}

fn parse_sid_and_hash_lists(buf: &[u8]) -> Result<(Vec<u32>, Vec<Digest>), ProtocolError> {
    let mut rest = expect_len(buf, 4, "short id count")?;
    let sid_count = LittleEndian::read_u32(buf) as usize;
    let mut short_ids = Vec::with_capacity(sid_count.min(16 * 1024));
    for _ in 0..sid_count {
        let after = expect_len(rest, 4, "short id")?;
        short_ids.push(LittleEndian::read_u32(rest));
        rest = after;
    }
    let mut hashes_buf = expect_len(rest, 4, "hash count")?;
    let hash_count = LittleEndian::read_u32(rest) as usize;
    let mut tx_hashes = Vec::with_capacity(hash_count.min(16 * 1024));
    for _ in 0..hash_count {
        let after = expect_len(hashes_buf, Digest::LENGTH, "transaction hash")?;
        tx_hashes
            .push(Digest::from_bytes(hashes_buf).map_err(|e| ProtocolError::Parse(e.to_string()))?);
        hashes_buf = after;
    }
    Ok((short_ids, tx_hashes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::crypto::hash::digest;

    fn sample_header() -> BroadcastHeader {
        BroadcastHeader {
            message_hash: digest(b"123"),
            network_num: 12345,
            source_id: SourceId::from_bytes([7; SOURCE_ID_LENGTH]),
        }
    }

    fn payload_roundtrip(msg: Message) -> Message {
        let mut payload = Vec::new();
        msg.write_payload(&mut payload);
        let parsed = Message::parse_payload(msg.kind(), &payload).unwrap();
        assert_eq!(msg, parsed);
        parsed
    }

    #[test]
    fn test_labels_resolve_back_to_kinds() {
        for kind in ALL_MESSAGE_KINDS.iter().copied() {
            assert_eq!(Some(kind), MessageKind::from_label(&kind.label()));
        }
        assert_eq!(None, MessageKind::from_label(&padded(b"bogus")));
    }

    #[test]
    fn test_hello_payload_roundtrip() {
        payload_roundtrip(Message::Hello(HelloMessage {
            protocol_version: 5,
            network_num: 2,
            node_id: SourceId::from_bytes([3; SOURCE_ID_LENGTH]),
        }));
    }

    #[test]
    fn test_keepalive_payload_roundtrip() {
        payload_roundtrip(Message::Ping(PingMessage { nonce: 50 }));
        payload_roundtrip(Message::Pong(PongMessage { nonce: 50 }));
    }

    #[test]
    fn test_broadcast_payload_roundtrip() {
        payload_roundtrip(Message::Broadcast(BroadcastMessage {
            header: sample_header(),
            is_encrypted: true,
            blob: vec![1, 1, 1, 1],
        }));
    }

    #[test]
    fn test_tx_payload_roundtrip() {
        payload_roundtrip(Message::Tx(TxMessage {
            header: sample_header(),
            short_id: 12,
            contents: vec![1; 5],
        }));
    }

    #[test]
    fn test_txs_payload_roundtrip() {
        payload_roundtrip(Message::Txs(TxsMessage {
            txs: vec![
                TxEntry {
                    short_id: 1,
                    hash: digest(b"123"),
                    contents: vec![0; 4],
                },
                TxEntry {
                    short_id: 2,
                    hash: digest(b"234"),
                    contents: vec![0; 8],
                },
            ],
        }));
    }

    #[test]
    fn test_remaining_payload_roundtrips() {
        payload_roundtrip(Message::Ack(AckMessage));
        payload_roundtrip(Message::Key(KeyMessage {
            header: sample_header(),
            key: [1; KeyMessage::KEY_LENGTH],
        }));
        payload_roundtrip(Message::BlockHold(BlockHoldingMessage {
            header: sample_header(),
        }));
        payload_roundtrip(Message::GetTxs(GetTxsMessage {
            short_ids: vec![1, 2, 3],
        }));
        payload_roundtrip(Message::TxAssign(TxAssignMessage {
            tx_hash: digest(b"123"),
            short_id: 9,
        }));
        payload_roundtrip(Message::TxServiceSync(TxServiceSyncMessage { network_num: 4 }));
        payload_roundtrip(Message::BlockConfirmation(BlockConfirmationMessage {
            header: sample_header(),
            short_ids: vec![10, 11],
            tx_hashes: vec![digest(b"a"), digest(b"b")],
        }));
    }

    #[test]
    fn test_tx_cleanup_derives_message_hash() {
        let msg = TxCleanupMessage::new(
            12345,
            SourceId::from_bytes([7; SOURCE_ID_LENGTH]),
            vec![23, 99],
            vec![digest(b"x")],
        );
        assert_ne!(Digest::from_bytes(&[0; 32]).unwrap(), msg.header.message_hash);
        payload_roundtrip(Message::TxCleanup(msg));
    }

    #[test]
    fn test_truncated_payloads_fail_parsing() {
        assert!(Message::parse_payload(MessageKind::Hello, &[0; 8]).is_err());
        assert!(Message::parse_payload(MessageKind::Ping, &[0; 4]).is_err());
        assert!(Message::parse_payload(MessageKind::Tx, &[0; 16]).is_err());
        // txs batch advertising more entries than present
        let mut payload = Vec::new();
        let mut num = [0; 4];
        LittleEndian::write_u32(&mut num, 3);
        payload.extend_from_slice(&num);
        assert!(Message::parse_payload(MessageKind::Txs, &payload).is_err());
    }

    #[test]
    fn test_broadcast_family_kinds_expose_their_prefix() {
        let msg = Message::Broadcast(BroadcastMessage {
            header: sample_header(),
            is_encrypted: false,
            blob: Vec::new(),
        });
        assert!(msg.kind().is_broadcast_family());
        assert_eq!(12345, msg.broadcast_header().unwrap().network_num);

        let ping = Message::Ping(PingMessage { nonce: 1 });
        assert!(!ping.kind().is_broadcast_family());
        assert!(ping.broadcast_header().is_none());
    }

    #[test]
    fn test_source_id_formats_as_uuid() {
        let id = SourceId::from_bytes([0xc2; SOURCE_ID_LENGTH]);
        let text = format!("{}", id);
        assert_eq!(36, text.len());
        assert_eq!(4, text.matches('-').count());
    }
}
