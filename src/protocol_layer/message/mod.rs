//! Definitions of message content.
//!
//! Messages cross the driver boundary as a little-endian header word followed by up to seven
//! little-endian data objects.
pub mod data;
pub mod header;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use data::PdoState;
use header::{Header, MessageType};

/// Maximum number of data objects in a (non-extended) message.
pub const MAX_DATA_OBJECTS: usize = 7;

/// Maximum size of a serialized message in bytes.
pub const MAX_MESSAGE_SIZE: usize = Header::SIZE + 4 * MAX_DATA_OBJECTS;

/// Raw data objects of one message.
pub type Objects = Vec<u32, MAX_DATA_OBJECTS>;

/// Errors that can occur during message/header parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    #[error("invalid input buffer length (expected {expected:?}, found {found:?})")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field is not supported.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
    /// The header announces a different number of data objects than were supplied.
    #[error("object count mismatch (expected {expected:?}, found {found:?})")]
    ObjectCountMismatch {
        /// Object count announced by the header.
        expected: usize,
        /// Objects actually supplied.
        found: usize,
    },
    /// A message that carries exactly one data object came with a different number.
    #[error("unexpected number of data objects `{0}`")]
    UnexpectedDataObjects(usize),
}

/// Payload of a USB PD message, if any.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Payload {
    /// Payload for a data message.
    Data(data::Data),
    /// Raw data objects of an extended message.
    Extended(Objects),
}

/// A USB PD message.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    /// The message header.
    pub header: Header,
    /// Optional payload for data and extended messages.
    pub payload: Option<Payload>,
}

impl Message {
    /// Create a new message from a message header.
    pub fn new(header: Header) -> Self {
        Self { header, payload: None }
    }

    /// Create a new message from a message header and payload data.
    pub fn new_with_data(header: Header, data: data::Data) -> Self {
        Self {
            header,
            payload: Some(Payload::Data(data)),
        }
    }

    /// Decode a message from its header word and data objects.
    ///
    /// Requests are decoded without knowledge of the source capabilities, see
    /// [`Message::decode_with_state`].
    pub fn decode(header: u16, objects: &[u32]) -> Result<Self, ParseError> {
        Self::decode_with_state(header, objects, &())
    }

    /// Decode a message, resolving request object positions against `state`.
    pub fn decode_with_state<P: PdoState>(header: u16, objects: &[u32], state: &P) -> Result<Self, ParseError> {
        let header = Header::from_raw(header)?;

        if header.num_objects() != objects.len() {
            return Err(ParseError::ObjectCountMismatch {
                expected: header.num_objects(),
                found: objects.len(),
            });
        }

        match header.message_type() {
            MessageType::Control(_) => Ok(Self::new(header)),
            MessageType::Extended(_) => Ok(Self {
                header,
                payload: Some(Payload::Extended(collect_objects(objects))),
            }),
            MessageType::Data(message_type) => {
                data::Data::decode(message_type, objects, state).map(|data| Self::new_with_data(header, data))
            }
        }
    }

    /// Parse a message from a slice of bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        Self::from_bytes_with_state(data, &())
    }

    /// Parse a message from a slice of bytes, resolving request object positions against `state`.
    ///
    /// Trailing bytes beyond the announced data objects are ignored.
    pub fn from_bytes_with_state<P: PdoState>(data: &[u8], state: &P) -> Result<Self, ParseError> {
        let header = Header::from_bytes(data)?;
        let expected = Header::SIZE + 4 * header.num_objects();

        if data.len() < expected {
            return Err(ParseError::InvalidLength {
                expected,
                found: data.len(),
            });
        }

        let objects: Objects = data[Header::SIZE..expected]
            .chunks_exact(4)
            .map(LittleEndian::read_u32)
            .collect();

        Self::decode_with_state(header.0, &objects, state)
    }

    /// The raw data objects that this message carries.
    pub fn objects(&self) -> Objects {
        match self.payload.as_ref() {
            Some(Payload::Data(data)) => data.objects(),
            Some(Payload::Extended(objects)) => objects.clone(),
            None => Objects::new(),
        }
    }

    /// Encode the message into its header and data objects.
    pub fn encode(&self) -> (Header, Objects) {
        let objects = self.objects();
        (self.header.with_num_objects(objects.len() as u8), objects)
    }

    /// Serialize a message to a slice, returning the number of written bytes.
    ///
    /// The buffer must hold at least [`MAX_MESSAGE_SIZE`] bytes.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        let (header, objects) = self.encode();
        let mut size = header.to_bytes(buffer);

        for (chunk, object) in buffer[Header::SIZE..].chunks_exact_mut(4).zip(objects.iter()) {
            LittleEndian::write_u32(chunk, *object);
            size += 4;
        }

        size
    }
}

fn collect_objects(objects: &[u32]) -> Objects {
    objects.iter().copied().take(MAX_DATA_OBJECTS).collect()
}

#[cfg(test)]
mod tests {
    use super::data::Data;
    use super::data::source_capabilities::{Augmented, PowerDataObject};
    use super::header::{ControlMessageType, DataMessageType};
    use super::*;
    use crate::dummy::{DUMMY_CAPABILITIES, get_dummy_source_capabilities};

    #[test]
    fn parse_dummy_capabilities() {
        let message = Message::from_bytes(&DUMMY_CAPABILITIES).unwrap();

        assert_eq!(
            message.header.message_type(),
            MessageType::Data(DataMessageType::SourceCapabilities)
        );

        let Some(Payload::Data(Data::SourceCapabilities(caps))) = message.payload.as_ref() else {
            panic!("expected source capabilities");
        };

        assert_eq!(caps.pdos(), get_dummy_source_capabilities().as_slice());
        assert!(matches!(caps.pdos()[4], PowerDataObject::Augmented(Augmented::Spr(_))));
    }

    #[test]
    fn serialize_matches_input() {
        let message = Message::from_bytes(&DUMMY_CAPABILITIES).unwrap();
        let mut buffer = [0u8; MAX_MESSAGE_SIZE];

        assert_eq!(message.to_bytes(&mut buffer), 30);
        assert_eq!(buffer, DUMMY_CAPABILITIES);
    }

    #[test]
    fn decode_control_message() {
        // Accept, message ID 3, from a revision 3.x source
        let message = Message::decode(0x07A3, &[]).unwrap();

        assert_eq!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::Accept)
        );
        assert_eq!(message.header.message_id(), 3);
        assert!(message.payload.is_none());
    }

    #[test]
    fn object_count_must_match_header() {
        // Source_Capabilities announcing two objects
        let header = 0x21A1;
        assert_eq!(
            Message::decode(header, &[0x0801_912C]),
            Err(ParseError::ObjectCountMismatch { expected: 2, found: 1 })
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert_eq!(
            Message::from_bytes(&DUMMY_CAPABILITIES[..20]),
            Err(ParseError::InvalidLength { expected: 30, found: 20 })
        );
    }
}
