//! Definitions and implementations of data messages.
//!
//! See [6.4].
use super::header::DataMessageType;
use super::{Objects, ParseError, collect_objects};

pub mod request;
pub mod source_capabilities;

/// Resolves the kind of PDO that a request object position refers to.
pub trait PdoState {
    /// The kind of PDO at a 1-based object position, if known.
    fn pdo_at_object_position(&self, position: u8) -> Option<source_capabilities::Kind>;
}

impl PdoState for () {
    fn pdo_at_object_position(&self, _position: u8) -> Option<source_capabilities::Kind> {
        None
    }
}

/// Types of data messages.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Data {
    /// Source capabilities.
    SourceCapabilities(source_capabilities::SourceCapabilities),
    /// Request for a power level from the source.
    Request(request::PowerSource),
    /// Any other data message, kept as raw objects.
    Unknown(Objects),
}

impl Data {
    /// Decode the data objects of a data message.
    pub fn decode<P: PdoState>(
        message_type: DataMessageType,
        objects: &[u32],
        state: &P,
    ) -> Result<Self, ParseError> {
        Ok(match message_type {
            DataMessageType::SourceCapabilities => Data::SourceCapabilities(source_capabilities::SourceCapabilities(
                objects
                    .iter()
                    .copied()
                    .map(source_capabilities::parse_raw_pdo)
                    .collect(),
            )),
            DataMessageType::Request => {
                let [raw] = objects else {
                    return Err(ParseError::UnexpectedDataObjects(objects.len()));
                };

                Data::Request(request::PowerSource::from_raw(*raw, state))
            }
            _ => {
                trace!("Keep raw data message {:?}", message_type);
                Data::Unknown(collect_objects(objects))
            }
        })
    }

    /// The raw data objects of this message.
    pub fn objects(&self) -> Objects {
        match self {
            Self::SourceCapabilities(capabilities) => capabilities.pdos().iter().map(|pdo| pdo.raw()).collect(),
            Self::Request(request) => {
                let mut objects = Objects::new();
                // Cannot fail, capacity is larger than one.
                let _ = objects.push(request.raw());
                objects
            }
            Self::Unknown(objects) => objects.clone(),
        }
    }
}
