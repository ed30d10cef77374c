//! Checks framed messages before they are parsed: starting
//! sequence, payload size caps, and the control flag trailer.
//!
//! Validation runs on every `process_message` iteration, including
//! ones where the frame is still incomplete; failures feed the
//! per-connection bad message throttle.

use crate::mesh::buffers::InputBuffer;
use crate::mesh::messages::factory::HeaderPreview;
use crate::mesh::messages::{
    control_flags, MessageKind, ProtocolError, CONTROL_FLAGS_LENGTH,
    DEFAULT_MAX_PAYLOAD_LEN_BYTES, STARTING_SEQUENCE,
};

/// Protocol versions above this one frame messages with the
/// starting sequence and control flags.
pub const STARTING_SEQUENCE_CONTROL_FLAGS_FIRST_VERSION: u32 = 4;

/// Per-type payload size caps.
#[derive(Debug, Copy, Clone)]
pub struct MessageValidationSettings {
    pub max_tx_size_bytes: usize,
    pub max_block_size_bytes: usize,
}

impl Default for MessageValidationSettings {
    fn default() -> Self {
        MessageValidationSettings {
            max_tx_size_bytes: 1024 * 1024,
            max_block_size_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Validates frames for a connection speaking one protocol version.
#[derive(Debug, Copy, Clone)]
pub struct MessageValidator {
    settings: MessageValidationSettings,
    protocol_version: u32,
}

impl MessageValidator {
    pub fn new(settings: MessageValidationSettings, protocol_version: u32) -> Self {
        MessageValidator {
            settings,
            protocol_version,
        }
    }

    fn has_framing(&self) -> bool {
        self.protocol_version > STARTING_SEQUENCE_CONTROL_FLAGS_FIRST_VERSION
    }

    /// Validates the frame previewed from `input`.
    pub fn validate(
        &self,
        preview: &HeaderPreview,
        header_length: usize,
        input: &InputBuffer,
    ) -> Result<(), ProtocolError> {
        if self.has_framing() {
            self.validate_starting_sequence(preview, input)?;
        }
        if let HeaderPreview::Header {
            label, payload_len, ..
        } = preview
        {
            self.validate_payload_length(MessageKind::from_label(label), *payload_len, preview)?;
        }
        if self.has_framing() && preview.is_full() {
            if let HeaderPreview::Header { payload_len, .. } = preview {
                self.validate_control_flags(header_length, *payload_len, input)?;
            }
        }
        Ok(())
    }

    fn validate_starting_sequence(
        &self,
        preview: &HeaderPreview,
        input: &InputBuffer,
    ) -> Result<(), ProtocolError> {
        if input.len() < STARTING_SEQUENCE.len() {
            return Ok(());
        }
        let head = input
            .get_slice(0, STARTING_SEQUENCE.len())
            .map_err(|e| ProtocolError::Validation {
                full_message: false,
                reason: e.to_string(),
            })?;
        if head[..] != STARTING_SEQUENCE {
            return Err(ProtocolError::Validation {
                full_message: preview.is_full(),
                reason: format!(
                    "expected frame to begin with the starting sequence, got {:02x?}",
                    &head[..]
                ),
            });
        }
        Ok(())
    }

    fn validate_payload_length(
        &self,
        kind: Option<MessageKind>,
        payload_len: usize,
        preview: &HeaderPreview,
    ) -> Result<(), ProtocolError> {
        let max = match kind {
            Some(MessageKind::Tx) => self.settings.max_tx_size_bytes,
            Some(MessageKind::Broadcast) | Some(MessageKind::Txs) => {
                self.settings.max_block_size_bytes
            }
            _ => DEFAULT_MAX_PAYLOAD_LEN_BYTES,
        };
        if payload_len > max {
            return Err(ProtocolError::Validation {
                full_message: preview.is_full(),
                reason: format!(
                    "payload of {} bytes exceeds the {} byte cap for {:?}",
                    payload_len, max, kind
                ),
            });
        }
        Ok(())
    }

    fn validate_control_flags(
        &self,
        header_length: usize,
        payload_len: usize,
        input: &InputBuffer,
    ) -> Result<(), ProtocolError> {
        let frame_len = header_length + payload_len;
        if payload_len < CONTROL_FLAGS_LENGTH || input.len() < frame_len {
            return Err(ProtocolError::Validation {
                full_message: false,
                reason: "frame too short to carry control flags".into(),
            });
        }
        let trailer = input
            .get_slice(frame_len - CONTROL_FLAGS_LENGTH, frame_len)
            .map_err(|e| ProtocolError::Validation {
                full_message: false,
                reason: e.to_string(),
            })?;
        if trailer[0] & control_flags::VALID == 0 {
            return Err(ProtocolError::Validation {
                full_message: true,
                reason: format!("control flags byte {:#04x} lacks the VALID bit", trailer[0]),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::messages::factory::MessageFactory;
    use crate::mesh::messages::versioning::CURRENT_PROTOCOL_VERSION;
    use crate::mesh::messages::{AckMessage, Message, PingMessage, HEADER_LENGTH};

    fn current_validator() -> MessageValidator {
        MessageValidator::new(MessageValidationSettings::default(), CURRENT_PROTOCOL_VERSION)
    }

    fn preview_of(input: &mut InputBuffer) -> HeaderPreview {
        MessageFactory::current().peek_header(input)
    }

    #[test]
    fn test_valid_frame_passes() {
        let frame = MessageFactory::current().build(&Message::Ping(PingMessage { nonce: 1 }));
        let mut input = InputBuffer::new();
        input.append(&frame);
        let preview = preview_of(&mut input);
        assert!(current_validator()
            .validate(&preview, HEADER_LENGTH, &input)
            .is_ok());
    }

    #[test]
    fn test_bad_starting_sequence_rejected() {
        let mut frame = MessageFactory::current().build(&Message::Ack(AckMessage));
        frame[0] = 0x00;
        let mut input = InputBuffer::new();
        input.append(&frame);
        let preview = preview_of(&mut input);
        match current_validator().validate(&preview, HEADER_LENGTH, &input) {
            Err(ProtocolError::Validation { full_message, .. }) => assert!(full_message),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let settings = MessageValidationSettings {
            max_tx_size_bytes: 16,
            max_block_size_bytes: 16,
        };
        let validator = MessageValidator::new(settings, CURRENT_PROTOCOL_VERSION);
        use crate::mesh::crypto::hash::digest;
        use crate::mesh::messages::{BroadcastHeader, SourceId, TxMessage};
        let frame = MessageFactory::current().build(&Message::Tx(TxMessage {
            header: BroadcastHeader {
                message_hash: digest(b"1"),
                network_num: 1,
                source_id: SourceId::EMPTY,
            },
            short_id: 1,
            contents: vec![0; 64],
        }));
        let mut input = InputBuffer::new();
        input.append(&frame);
        let preview = preview_of(&mut input);
        assert!(validator.validate(&preview, HEADER_LENGTH, &input).is_err());
    }

    #[test]
    fn test_unset_valid_bit_rejected() {
        let mut frame = MessageFactory::current().build(&Message::Ack(AckMessage));
        let last = frame.len() - 1;
        frame[last] = 0;
        let mut input = InputBuffer::new();
        input.append(&frame);
        let preview = preview_of(&mut input);
        match current_validator().validate(&preview, HEADER_LENGTH, &input) {
            Err(ProtocolError::Validation { full_message, .. }) => assert!(full_message),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_skips_control_flags() {
        let frame = MessageFactory::current().build(&Message::Ping(PingMessage { nonce: 1 }));
        let mut input = InputBuffer::new();
        input.append(&frame[..frame.len() - 2]);
        let preview = preview_of(&mut input);
        assert!(!preview.is_full());
        assert!(current_validator()
            .validate(&preview, HEADER_LENGTH, &input)
            .is_ok());
    }

    #[test]
    fn test_legacy_validator_ignores_framing() {
        use crate::mesh::messages::LEGACY_HEADER_LENGTH;
        let validator = MessageValidator::new(MessageValidationSettings::default(), 4);
        let frame = MessageFactory::legacy().build(&Message::Ping(PingMessage { nonce: 1 }));
        let mut input = InputBuffer::new();
        input.append(&frame);
        let preview = MessageFactory::legacy().peek_header(&mut input);
        assert!(validator
            .validate(&preview, LEGACY_HEADER_LENGTH, &input)
            .is_ok());
    }
}
