//! USB PD sink transceiver traits.
//!
//! Provides a polled driver trait that allows to add support for various USB PD PHYs
//! (e.g. FUSB302-style I2C transceivers).
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
use proc_bitfield::bitfield;

bitfield! {
    /// Line-level events reported by the transceiver since the last poll.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Events(pub u8): Debug, FromStorage, IntoStorage {
        /// A port partner was attached.
        pub attached: bool @ 0,
        /// The port partner was detached.
        pub detached: bool @ 1,
        /// A message is waiting in the receive FIFO.
        pub message_received: bool @ 2,
        /// The PHY acknowledged a received message with GoodCRC.
        pub good_crc_sent: bool @ 3,
        /// Hard Reset signaling was received.
        pub hard_reset_received: bool @ 4,
    }
}

impl Events {
    /// No pending events.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Rp current advertisement seen on one CC line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcLevel {
    /// Below vRd-Connect, nothing attached on this leg.
    #[default]
    Open,
    /// Default USB power.
    Default,
    /// 1.5 A at 5 V.
    Power1A5,
    /// 3.0 A at 5 V.
    Power3A0,
}

impl CcLevel {
    /// Whether this leg carries a termination.
    pub fn is_active(&self) -> bool {
        !matches!(self, CcLevel::Open)
    }
}

/// Which CC conductor carries the PD control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CableOrientation {
    /// Control channel on CC1.
    Cc1,
    /// Control channel on CC2 (flipped plug).
    Cc2,
}

/// Status of both CC lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CcStatus {
    /// Level on CC1.
    pub cc1: CcLevel,
    /// Level on CC2.
    pub cc2: CcLevel,
}

impl CcStatus {
    /// The active leg and its level.
    ///
    /// `None` if no leg or both legs are active.
    pub fn orientation(&self) -> Option<(CableOrientation, CcLevel)> {
        match (self.cc1.is_active(), self.cc2.is_active()) {
            (true, false) => Some((CableOrientation::Cc1, self.cc1)),
            (false, true) => Some((CableOrientation::Cc2, self.cc2)),
            _ => None,
        }
    }
}

/// Transceiver identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceId {
    /// Silicon version.
    pub version: u8,
    /// Silicon revision.
    pub revision: u8,
}

/// Register access error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    /// The bus transaction towards the transceiver failed.
    Bus,
}

/// Receive Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverRxError {
    /// Received message discarded, e.g. due to CRC errors or an empty FIFO.
    Discarded,

    /// Hard Reset received before or during reception.
    HardReset,
}

/// Transmit Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverTxError {
    /// Concurrent receive in progress or excessive noise on the line.
    Discarded,

    /// Hard Reset received before or during transmission.
    HardReset,
}

/// Driver trait, through which the protocol layer talks to the PHY.
///
/// All methods are non-blocking. The sink polls [`Driver::alert`] periodically, and additionally
/// whenever [`Driver::interrupt_pending`] reports an asserted interrupt line.
pub trait Driver {
    /// If this is `true`, the protocol layer will not send its own
    /// GoodCRC messages and will instead rely on the hardware.
    const HAS_AUTO_GOOD_CRC: bool = true;

    /// Read and clear pending line events.
    fn alert(&mut self) -> Result<Events, DriverError>;

    /// Whether the transceiver interrupt line is asserted.
    fn interrupt_pending(&self) -> bool {
        false
    }

    /// Measure the CC lines.
    fn cc_status(&mut self) -> Result<CcStatus, DriverError>;

    /// Receive a packet.
    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, DriverRxError>;

    /// Transmit a packet.
    fn transmit(&mut self, data: &[u8]) -> Result<(), DriverTxError>;

    /// Transmit a hard reset signal.
    fn transmit_hard_reset(&mut self) -> Result<(), DriverTxError>;

    /// Enable or disable VBUS presence detection.
    fn set_vbus_sense(&mut self, _enabled: bool) -> Result<(), DriverError> {
        Ok(())
    }

    /// Read the transceiver identification.
    fn device_id(&mut self) -> Result<DeviceId, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_requires_exactly_one_leg() {
        let status = CcStatus {
            cc1: CcLevel::Open,
            cc2: CcLevel::Power3A0,
        };
        assert_eq!(status.orientation(), Some((CableOrientation::Cc2, CcLevel::Power3A0)));

        let both = CcStatus {
            cc1: CcLevel::Default,
            cc2: CcLevel::Power1A5,
        };
        assert_eq!(both.orientation(), None);
        assert_eq!(CcStatus::default().orientation(), None);
    }

    #[test]
    fn event_bits() {
        let events = Events::default().with_attached(true).with_good_crc_sent(true);
        assert_eq!(events.0, 0b1001);
        assert!(!events.is_empty());
        assert!(Events(0).is_empty());
    }
}
