//! Builds and parses framed messages for one wire protocol
//! generation.
//!
//! The factory never consumes input buffer bytes itself; callers
//! preview the header, decide whether a full frame is buffered, and
//! only then pop the frame and hand it to `create_from_buffer`.

use byteorder::{ByteOrder, LittleEndian};

use crate::mesh::buffers::InputBuffer;
use crate::mesh::crypto::hash::Digest;
use crate::mesh::messages::{
    control_flags, Message, MessageKind, ProtocolError, SourceId, BROADCAST_PREFIX_LENGTH,
    CONTROL_FLAGS_LENGTH, HEADER_LENGTH, LEGACY_HEADER_LENGTH, MESSAGE_TYPE_LENGTH,
    NETWORK_NUM_LENGTH, SOURCE_ID_LENGTH, STARTING_SEQUENCE,
};

/// Result of previewing a frame header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HeaderPreview {
    /// Not even a full header is buffered yet.
    NeedMoreBytes,
    /// The header was read; `is_full` tells whether the whole frame
    /// is buffered.
    Header {
        is_full: bool,
        label: [u8; MESSAGE_TYPE_LENGTH],
        payload_len: usize,
    },
}

impl HeaderPreview {
    pub fn is_full(&self) -> bool {
        matches!(self, HeaderPreview::Header { is_full: true, .. })
    }
}

/// Result of previewing a broadcast family frame up to its
/// payload prefix.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BroadcastPreview {
    NeedMoreBytes,
    Header {
        is_full: bool,
        message_hash: Digest,
        network_num: u32,
        source_id: SourceId,
        payload_len: usize,
    },
}

/// A message factory for one framing generation.
///
/// The current generation opens frames with the starting sequence
/// and closes them with a control flag byte; the legacy (protocol
/// version 4) generation has neither.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MessageFactory {
    header_length: usize,
    framed: bool,
}

impl MessageFactory {
    /// The factory for current frames.
    pub fn current() -> Self {
        MessageFactory {
            header_length: HEADER_LENGTH,
            framed: true,
        }
    }

    /// The factory for protocol version 4 frames.
    pub fn legacy() -> Self {
        MessageFactory {
            header_length: LEGACY_HEADER_LENGTH,
            framed: false,
        }
    }

    /// Header length of this framing generation.
    pub fn header_length(&self) -> usize {
        self.header_length
    }

    /// Whether frames carry the starting sequence and control
    /// flag trailer.
    pub fn is_framed(&self) -> bool {
        self.framed
    }

    /// Previews the next frame header on the input buffer.
    pub fn peek_header(&self, input: &mut InputBuffer) -> HeaderPreview {
        if input.len() < self.header_length {
            return HeaderPreview::NeedMoreBytes;
        }
        let header = match input.peek(self.header_length) {
            Ok(header) => header,
            Err(_) => return HeaderPreview::NeedMoreBytes,
        };
        let label_off = if self.framed {
            STARTING_SEQUENCE.len()
        } else {
            0
        };
        let mut label = [0; MESSAGE_TYPE_LENGTH];
        label.copy_from_slice(&header[label_off..label_off + MESSAGE_TYPE_LENGTH]);
        let payload_len =
            LittleEndian::read_u32(&header[label_off + MESSAGE_TYPE_LENGTH..]) as usize;
        HeaderPreview::Header {
            is_full: input.len() >= self.header_length + payload_len,
            label,
            payload_len,
        }
    }

    /// Previews the next frame as a broadcast family message,
    /// exposing the payload prefix before the frame is complete.
    pub fn peek_broadcast_header(&self, input: &mut InputBuffer) -> BroadcastPreview {
        let needed = self.header_length + BROADCAST_PREFIX_LENGTH;
        if input.len() < needed {
            return BroadcastPreview::NeedMoreBytes;
        }
        let (payload_len, prefix) = {
            let bytes = match input.peek(needed) {
                Ok(bytes) => bytes,
                Err(_) => return BroadcastPreview::NeedMoreBytes,
            };
            let len_off = self.header_length - 4;
            (
                LittleEndian::read_u32(&bytes[len_off..]) as usize,
                bytes[self.header_length..].to_vec(),
            )
        };
        // prefix length is checked above, from_bytes cannot fail
        let message_hash = match Digest::from_bytes(&prefix[..Digest::LENGTH]) {
            Ok(hash) => hash,
            Err(_) => return BroadcastPreview::NeedMoreBytes,
        };
        let network_num = LittleEndian::read_u32(&prefix[Digest::LENGTH..]);
        let mut source = [0; SOURCE_ID_LENGTH];
        source.copy_from_slice(&prefix[Digest::LENGTH + NETWORK_NUM_LENGTH..]);
        BroadcastPreview::Header {
            is_full: input.len() >= self.header_length + payload_len,
            message_hash,
            network_num,
            source_id: SourceId::from_bytes(source),
            payload_len,
        }
    }

    /// Constructs a typed message from a complete frame.
    pub fn create_from_buffer(&self, buf: &[u8]) -> Result<Message, ProtocolError> {
        if buf.len() < self.header_length {
            return Err(ProtocolError::PayloadLen(format!(
                "frame of {} bytes is shorter than the header",
                buf.len()
            )));
        }
        let label_off = if self.framed {
            STARTING_SEQUENCE.len()
        } else {
            0
        };
        let mut label = [0; MESSAGE_TYPE_LENGTH];
        label.copy_from_slice(&buf[label_off..label_off + MESSAGE_TYPE_LENGTH]);
        let payload_len = LittleEndian::read_u32(&buf[label_off + MESSAGE_TYPE_LENGTH..]) as usize;
        if payload_len != buf.len() - self.header_length {
            return Err(ProtocolError::PayloadLen(format!(
                "payload length does not match buffer size: {} vs {} bytes",
                payload_len,
                buf.len() - self.header_length
            )));
        }
        if self.framed && payload_len < CONTROL_FLAGS_LENGTH {
            return Err(ProtocolError::PayloadLen(
                "frame has no room for control flags".into(),
            ));
        }
        let kind = MessageKind::from_label(&label).ok_or_else(|| {
            ProtocolError::Parse(format!(
                "unknown message label {:?}",
                String::from_utf8_lossy(&label)
            ))
        })?;
        let payload_end = if self.framed {
            buf.len() - CONTROL_FLAGS_LENGTH
        } else {
            buf.len()
        };
        Message::parse_payload(kind, &buf[self.header_length..payload_end])
    }

    /// Serializes a message into a complete frame.
    pub fn build(&self, msg: &Message) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_length + 64);
        if self.framed {
            out.extend_from_slice(&STARTING_SEQUENCE);
        }
        out.extend_from_slice(&msg.kind().label());
        // payload length backpatched once the payload is written
        out.extend_from_slice(&[0; 4]);
        let len_off = out.len() - 4;
        msg.write_payload(&mut out);
        if self.framed {
            out.push(control_flags::VALID);
        }
        let payload_len = (out.len() - self.header_length) as u32;
        let mut num = [0; 4];
        LittleEndian::write_u32(&mut num, payload_len);
        out[len_off..len_off + 4].copy_from_slice(&num);
        out
    }
}
