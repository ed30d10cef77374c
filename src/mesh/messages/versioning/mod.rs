//! Protocol version negotiation and frame downgrade conversion.
//!
//! The first frame a peer sends is always a `hello`; its framing
//! (starting sequence or not) and version field tell us which
//! protocol generation the peer speaks. Frames relayed to an older
//! peer are converted wholesale, or in first/last byte pieces when
//! a message straddles buffer boundaries.

use byteorder::{ByteOrder, LittleEndian};

use crate::mesh::buffers::InputBuffer;
use crate::mesh::error::*;
use crate::mesh::messages::factory::MessageFactory;
use crate::mesh::messages::{
    control_flags, MessageKind, CONTROL_FLAGS_LENGTH, HEADER_LENGTH, LEGACY_HEADER_LENGTH,
    MESSAGE_TYPE_LENGTH, STARTING_SEQUENCE,
};

/// The protocol version this node speaks.
pub const CURRENT_PROTOCOL_VERSION: u32 = 5;

/// The oldest protocol version this node still accepts.
pub const MIN_SUPPORTED_PROTOCOL_VERSION: u32 = 4;

/// Converts frames between the current and the legacy (version 4)
/// framing.
///
/// Version 4 payloads are byte for byte identical to current ones;
/// the generations differ only in the starting sequence and the
/// control flag trailer, so one converter covers every message kind.
#[derive(Debug, Copy, Clone)]
pub struct FrameConverter;

impl FrameConverter {
    /// Growth in bytes when a legacy frame is upgraded.
    pub const SIZE_DELTA: usize = STARTING_SEQUENCE.len() + CONTROL_FLAGS_LENGTH;

    /// Converts a complete current frame into a legacy frame.
    pub fn convert_to_older(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < HEADER_LENGTH + CONTROL_FLAGS_LENGTH
            || frame[..STARTING_SEQUENCE.len()] != STARTING_SEQUENCE
        {
            return Err("Not a current frame").wrapped(ErrorKind::MessageVersioning);
        }
        let mut out = self.convert_first_bytes_to_older(frame)?;
        out.truncate(out.len() - CONTROL_FLAGS_LENGTH);
        Ok(out)
    }

    /// Converts a complete legacy frame into a current frame.
    pub fn convert_from_older(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut out = self.convert_first_bytes_from_older(frame)?;
        self.convert_last_bytes_from_older(&mut out);
        Ok(out)
    }

    /// Converts the leading bytes of a current frame (at least the
    /// header) into legacy framing, leaving the trailer for
    /// `convert_last_bytes_to_older`.
    pub fn convert_first_bytes_to_older(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < HEADER_LENGTH {
            return Err("First frame bytes are shorter than the header")
                .wrapped(ErrorKind::MessageVersioning);
        }
        let payload_len =
            LittleEndian::read_u32(&bytes[STARTING_SEQUENCE.len() + MESSAGE_TYPE_LENGTH..]);
        if (payload_len as usize) < CONTROL_FLAGS_LENGTH {
            return Err("Current frame advertises no control flags")
                .wrapped(ErrorKind::MessageVersioning);
        }
        let mut out = Vec::with_capacity(bytes.len() - STARTING_SEQUENCE.len());
        out.extend_from_slice(
            &bytes[STARTING_SEQUENCE.len()..STARTING_SEQUENCE.len() + MESSAGE_TYPE_LENGTH],
        );
        let mut num = [0; 4];
        LittleEndian::write_u32(&mut num, payload_len - CONTROL_FLAGS_LENGTH as u32);
        out.extend_from_slice(&num);
        out.extend_from_slice(&bytes[HEADER_LENGTH..]);
        Ok(out)
    }

    /// Converts the leading bytes of a legacy frame (at least the
    /// header) into current framing, leaving the trailer for
    /// `convert_last_bytes_from_older`.
    pub fn convert_first_bytes_from_older(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < LEGACY_HEADER_LENGTH {
            return Err("First frame bytes are shorter than the legacy header")
                .wrapped(ErrorKind::MessageVersioning);
        }
        let payload_len = LittleEndian::read_u32(&bytes[MESSAGE_TYPE_LENGTH..]);
        let mut out = Vec::with_capacity(bytes.len() + Self::SIZE_DELTA);
        out.extend_from_slice(&STARTING_SEQUENCE);
        out.extend_from_slice(&bytes[..MESSAGE_TYPE_LENGTH]);
        let mut num = [0; 4];
        LittleEndian::write_u32(&mut num, payload_len + CONTROL_FLAGS_LENGTH as u32);
        out.extend_from_slice(&num);
        out.extend_from_slice(&bytes[LEGACY_HEADER_LENGTH..]);
        Ok(out)
    }

    /// Drops the control flag trailer from the final bytes of a
    /// frame heading to a legacy peer.
    pub fn convert_last_bytes_to_older(&self, bytes: &mut Vec<u8>) {
        bytes.truncate(bytes.len().saturating_sub(CONTROL_FLAGS_LENGTH));
    }

    /// Appends the control flag trailer to the final bytes of a
    /// frame arriving from a legacy peer.
    pub fn convert_last_bytes_from_older(&self, bytes: &mut Vec<u8>) {
        bytes.push(control_flags::VALID);
    }

    /// Size change when converting to the older framing.
    pub fn size_delta_to_older(&self) -> isize {
        -(Self::SIZE_DELTA as isize)
    }

    /// Size change when converting from the older framing.
    pub fn size_delta_from_older(&self) -> isize {
        Self::SIZE_DELTA as isize
    }
}

/// Per-connection protocol version negotiation, and the tables of
/// factories and converters for each supported version.
#[derive(Debug, Copy, Clone)]
pub struct VersionManager {
    converter: FrameConverter,
}

impl VersionManager {
    pub fn new() -> Self {
        VersionManager {
            converter: FrameConverter,
        }
    }

    pub fn is_protocol_supported(&self, protocol_version: u32) -> bool {
        (MIN_SUPPORTED_PROTOCOL_VERSION..=CURRENT_PROTOCOL_VERSION).contains(&protocol_version)
    }

    /// The message factory speaking `protocol_version` framing.
    pub fn factory_for_version(&self, protocol_version: u32) -> Result<MessageFactory> {
        if !self.is_protocol_supported(protocol_version) {
            return Err("Unsupported protocol version").wrapped(ErrorKind::MessageVersioning);
        }
        if protocol_version == CURRENT_PROTOCOL_VERSION {
            Ok(MessageFactory::current())
        } else {
            Ok(MessageFactory::legacy())
        }
    }

    /// The frame converter between `protocol_version` and the
    /// current one.
    pub fn converter_for_version(&self, protocol_version: u32) -> Result<&FrameConverter> {
        if protocol_version == MIN_SUPPORTED_PROTOCOL_VERSION {
            Ok(&self.converter)
        } else {
            Err("No converter for protocol version").wrapped(ErrorKind::MessageVersioning)
        }
    }

    /// Determines the protocol version a newly connected peer
    /// speaks, from the first frame sitting in its input buffer.
    ///
    /// Returns `None` until enough bytes arrive. A first frame that
    /// is not a `hello` fails, and the connection should close.
    pub fn probe_protocol_version(&self, input: &mut InputBuffer) -> Result<Option<u32>> {
        const VERSION_FIELD_LENGTH: usize = 4;
        if input.len() < HEADER_LENGTH + VERSION_FIELD_LENGTH {
            return Ok(None);
        }
        let (label, payload_len, header_length) = {
            let header = input.peek(HEADER_LENGTH)?;
            if header[..STARTING_SEQUENCE.len()] == STARTING_SEQUENCE {
                let mut label = [0; MESSAGE_TYPE_LENGTH];
                label.copy_from_slice(&header[STARTING_SEQUENCE.len()..][..MESSAGE_TYPE_LENGTH]);
                let payload_len =
                    LittleEndian::read_u32(&header[STARTING_SEQUENCE.len() + MESSAGE_TYPE_LENGTH..]);
                (label, payload_len, HEADER_LENGTH)
            } else {
                let mut label = [0; MESSAGE_TYPE_LENGTH];
                label.copy_from_slice(&header[..MESSAGE_TYPE_LENGTH]);
                let payload_len = LittleEndian::read_u32(&header[MESSAGE_TYPE_LENGTH..]);
                (label, payload_len, LEGACY_HEADER_LENGTH)
            }
        };
        if label != MessageKind::Hello.label() {
            return Err("First frame from peer is not a hello").wrapped(ErrorKind::MessageVersioning);
        }
        if (payload_len as usize) < VERSION_FIELD_LENGTH {
            // predates versioned hello payloads entirely
            return Ok(Some(1));
        }
        let version_bytes = input.get_slice(header_length, header_length + VERSION_FIELD_LENGTH)?;
        Ok(Some(LittleEndian::read_u32(&version_bytes)))
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::messages::{HelloMessage, Message, PingMessage, SourceId};

    fn hello(version: u32) -> Message {
        Message::Hello(HelloMessage {
            protocol_version: version,
            network_num: 1,
            node_id: SourceId::from_bytes([2; 16]),
        })
    }

    fn input_with(bytes: &[u8]) -> InputBuffer {
        let mut input = InputBuffer::new();
        input.append(bytes);
        input
    }

    #[test]
    fn test_probe_current_version() {
        let vm = VersionManager::new();
        let frame = MessageFactory::current().build(&hello(CURRENT_PROTOCOL_VERSION));
        let mut input = input_with(&frame);
        assert_eq!(
            Some(CURRENT_PROTOCOL_VERSION),
            vm.probe_protocol_version(&mut input).unwrap()
        );
    }

    #[test]
    fn test_probe_legacy_version() {
        let vm = VersionManager::new();
        let frame = MessageFactory::legacy().build(&hello(4));
        let mut input = input_with(&frame);
        assert_eq!(Some(4), vm.probe_protocol_version(&mut input).unwrap());
    }

    #[test]
    fn test_probe_needs_more_bytes() {
        let vm = VersionManager::new();
        let frame = MessageFactory::current().build(&hello(CURRENT_PROTOCOL_VERSION));
        let mut input = input_with(&frame[..10]);
        assert_eq!(None, vm.probe_protocol_version(&mut input).unwrap());
    }

    #[test]
    fn test_probe_rejects_non_hello() {
        let vm = VersionManager::new();
        let frame = MessageFactory::current().build(&Message::Ping(PingMessage { nonce: 1 }));
        let mut input = input_with(&frame);
        assert!(vm.probe_protocol_version(&mut input).is_err());
    }

    #[test]
    fn test_frame_conversion_roundtrip() {
        let converter = FrameConverter;
        let msg = hello(4);
        let new_frame = MessageFactory::current().build(&msg);
        let old_frame = MessageFactory::legacy().build(&msg);
        assert_eq!(old_frame, converter.convert_to_older(&new_frame).unwrap());
        assert_eq!(new_frame, converter.convert_from_older(&old_frame).unwrap());
    }

    #[test]
    fn test_split_conversion_matches_whole() {
        let converter = FrameConverter;
        let old_frame = MessageFactory::legacy().build(&hello(4));
        // convert the header and half the payload first, the rest later
        let cut = LEGACY_HEADER_LENGTH + 4;
        let mut first = converter.convert_first_bytes_from_older(&old_frame[..cut]).unwrap();
        first.extend_from_slice(&old_frame[cut..]);
        converter.convert_last_bytes_from_older(&mut first);
        assert_eq!(converter.convert_from_older(&old_frame).unwrap(), first);
    }

    #[test]
    fn test_size_deltas_agree() {
        let converter = FrameConverter;
        let msg = hello(4);
        let new_frame = MessageFactory::current().build(&msg);
        let old_frame = MessageFactory::legacy().build(&msg);
        assert_eq!(
            new_frame.len() as isize + converter.size_delta_to_older(),
            old_frame.len() as isize
        );
        assert_eq!(
            old_frame.len() as isize + converter.size_delta_from_older(),
            new_frame.len() as isize
        );
    }

    #[test]
    fn test_supported_versions() {
        let vm = VersionManager::new();
        assert!(vm.is_protocol_supported(4));
        assert!(vm.is_protocol_supported(5));
        assert!(!vm.is_protocol_supported(3));
        assert!(!vm.is_protocol_supported(6));
        assert!(vm.factory_for_version(3).is_err());
    }
}
