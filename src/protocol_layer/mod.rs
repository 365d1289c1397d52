//! The protocol layer is controlled by the policy engine, and commands the PHY layer.
//!
//! Handles
//! - construction of messages,
//! - message IDs and retransmission detection,
//! - transmit retries,
//! - GoodCRC handling for PHYs without automatic GoodCRC,
//! - hard reset signaling.
//!
//! Extended messages are received as raw objects, but never transmitted.

pub mod message;

use message::data::request::PowerSource;
use message::data::{Data, PdoState};
use message::header::{ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision};
use message::{MAX_MESSAGE_SIZE, Message, ParseError};
use pd_ufp_traits::{Driver, DriverRxError, DriverTxError};

use crate::counters::{Counter, CounterType, Error as CounterError};

/// Errors that can occur in the protocol layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Driver reported a hard reset.
    #[error("hard reset")]
    HardReset,
    /// Transmission failed after the maximum number of allowed retries.
    #[error("transmit retries exceeded")]
    TransmitRetriesExceeded,
    /// A received message could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Debug)]
struct Counters {
    rx_message: Option<Counter>,
    tx_message: Counter,
    retry: Counter,
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            rx_message: None,
            tx_message: Counter::new(CounterType::MessageId),
            retry: Counter::new(CounterType::Retry),
        }
    }
}

/// The USB PD protocol layer.
#[derive(Debug)]
pub struct ProtocolLayer<DRIVER: Driver> {
    driver: DRIVER,
    counters: Counters,
    template: Header,
    default_header: Header,
}

impl<DRIVER: Driver> ProtocolLayer<DRIVER> {
    /// Create a new protocol layer from a driver and default header.
    pub fn new(driver: DRIVER, default_header: Header) -> Self {
        Self {
            driver,
            counters: Default::default(),
            template: default_header,
            default_header,
        }
    }

    /// Reset message IDs and the negotiated specification revision.
    pub fn reset(&mut self) {
        self.counters = Default::default();
        self.default_header = self.template;
    }

    /// Access the driver.
    pub fn driver(&mut self) -> &mut DRIVER {
        &mut self.driver
    }

    /// The specification revision used towards the port partner.
    pub fn spec_revision(&self) -> SpecificationRevision {
        self.default_header
            .spec_revision()
            .unwrap_or(SpecificationRevision::R3_X)
    }

    fn transmit_inner(&mut self, buffer: &[u8]) -> Result<(), Error> {
        self.counters.retry.reset();

        loop {
            match self.driver.transmit(buffer) {
                Ok(()) => return Ok(()),
                Err(DriverTxError::HardReset) => return Err(Error::HardReset),
                Err(DriverTxError::Discarded) => match self.counters.retry.increment() {
                    Ok(()) => trace!("Retry transmission"),
                    Err(CounterError::Exceeded) => return Err(Error::TransmitRetriesExceeded),
                },
            }
        }
    }

    /// Transmit a message.
    ///
    /// The message ID is advanced once the PHY reports that the partner acknowledged it.
    // GoodCrc message transmission is handled separately.
    // See `transmit_good_crc()` instead.
    pub fn transmit(&mut self, message: &Message) -> Result<(), Error> {
        trace!("Transmit message {:?}", message);

        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        let size = message.to_bytes(&mut buffer);

        self.transmit_inner(&buffer[..size])?;
        _ = self.counters.tx_message.increment();

        Ok(())
    }

    /// Send a GoodCrc message to the port partner.
    fn transmit_good_crc(&mut self, message_id: Counter) -> Result<(), Error> {
        trace!("Transmit message GoodCrc for RX message count {}", message_id.value());

        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        let size = Message::new(Header::new_control(
            self.default_header,
            message_id,
            ControlMessageType::GoodCRC,
        ))
        .to_bytes(&mut buffer);

        self.transmit_inner(&buffer[..size])
    }

    /// Transmit a control message of the provided type.
    pub fn transmit_control_message(&mut self, control_message_type: ControlMessageType) -> Result<Message, Error> {
        let message = Message::new(Header::new_control(
            self.default_header,
            self.counters.tx_message,
            control_message_type,
        ));

        self.transmit(&message)?;
        Ok(message)
    }

    /// Request a certain power level from the source.
    pub fn request_power(&mut self, request: PowerSource) -> Result<Message, Error> {
        let header = Header::new_data(
            self.default_header,
            self.counters.tx_message,
            DataMessageType::Request,
            1,
        );
        let message = Message::new_with_data(header, Data::Request(request));

        self.transmit(&message)?;
        Ok(message)
    }

    /// Receive a pending message.
    ///
    /// Returns `None` for discarded frames, GoodCRC messages, and retransmissions. All other
    /// messages are acknowledged (unless the PHY does so itself) and returned.
    pub fn receive_message<P: PdoState>(&mut self, state: &P) -> Result<Option<Message>, Error> {
        let mut buffer = [0u8; MAX_MESSAGE_SIZE];

        let length = match self.driver.receive(&mut buffer) {
            Ok(length) => length,
            Err(DriverRxError::Discarded) => return Ok(None),
            Err(DriverRxError::HardReset) => return Err(Error::HardReset),
        };

        let message = Message::from_bytes_with_state(&buffer[..length.min(MAX_MESSAGE_SIZE)], state)?;

        if matches!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::GoodCRC)
        ) {
            trace!(
                "Received GoodCrc, ID: {}, last transmitted: {}",
                message.header.message_id(),
                self.counters.tx_message.value().wrapping_sub(1) & 0b111
            );
            return Ok(None);
        }

        // Never negotiate above the own revision.
        if let Ok(revision) = message.header.spec_revision() {
            if revision < self.spec_revision() {
                self.default_header = self.default_header.with_spec_revision(revision);
            }
        }

        let is_retransmission = self.update_rx_message_counter(&message);

        if !DRIVER::HAS_AUTO_GOOD_CRC {
            self.transmit_good_crc(Counter::new_from_value(
                CounterType::MessageId,
                message.header.message_id(),
            ))?;
        }

        if is_retransmission {
            return Ok(None);
        }

        Ok(Some(message))
    }

    /// Forget the last received message ID, e.g. after a soft reset.
    pub fn reset_message_ids(&mut self) {
        self.counters.rx_message = None;
        self.counters.tx_message.reset();
    }

    /// Updates the received message counter.
    ///
    /// If receiving the first message after protocol layer reset, copy its ID.
    /// Otherwise, compare the received ID with the stored ID. If they are equal, this is a retransmission.
    ///
    /// Returns `true`, if this was a retransmission.
    fn update_rx_message_counter(&mut self, rx_message: &Message) -> bool {
        match self.counters.rx_message.as_mut() {
            None => {
                trace!(
                    "Received first message after protocol layer reset with RX counter value {}",
                    rx_message.header.message_id()
                );
                self.counters.rx_message = Some(Counter::new_from_value(
                    CounterType::MessageId,
                    rx_message.header.message_id(),
                ));
                false
            }
            Some(counter) => {
                if rx_message.header.message_id() == counter.value()
                    && !matches!(
                        rx_message.header.message_type(),
                        MessageType::Control(ControlMessageType::SoftReset)
                    )
                {
                    trace!("Received retransmission of RX counter value {}", counter.value());
                    true
                } else {
                    counter.set(rx_message.header.message_id());
                    false
                }
            }
        }
    }

    /// Perform a hard-reset procedure.
    ///
    /// See [6.7.1.1].
    pub fn hard_reset(&mut self) -> Result<(), Error> {
        self.reset();

        loop {
            match self.driver.transmit_hard_reset() {
                Ok(()) | Err(DriverTxError::HardReset) => return Ok(()),
                Err(DriverTxError::Discarded) => match self.counters.retry.increment() {
                    Ok(()) => (),
                    Err(CounterError::Exceeded) => return Err(Error::TransmitRetriesExceeded),
                },
            }
        }
    }
}
