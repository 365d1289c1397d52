//! Implements a dummy driver, clock and device for testing.
use std::cell::Cell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use pd_ufp_traits::{CcStatus, DeviceId, Driver, DriverError, DriverRxError, DriverTxError, Events};

use crate::counters::{Counter, CounterType};
use crate::protocol_layer::message::data::source_capabilities::{
    Augmented, FixedSupply, PowerDataObject, SprProgrammablePowerSupply,
};
use crate::protocol_layer::message::header::{ControlMessageType, Header, SpecificationRevision};
use crate::protocol_layer::message::{MAX_MESSAGE_SIZE, Message};
use crate::sink::Contract;
use crate::sink::device_policy_manager::DevicePolicyManager;
use crate::timers::Clock;
use crate::{DataRole, PowerRole};

/// A dummy driver for testing.
///
/// Received frames are delivered one per alert, with the message and GoodCRC events raised for as
/// long as frames are queued.
#[derive(Debug, Default)]
pub struct DummyDriver {
    events: Events,
    cc_status: CcStatus,
    received: VecDeque<Vec<u8>>,
    transmitted: Vec<Vec<u8>>,
    discard_transmissions: usize,
    failing_alerts: usize,
    hard_resets: usize,
    vbus_sense: Option<bool>,
    source_message_id: u8,
}

impl DummyDriver {
    /// Create a new dummy driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a source with the given CC line status.
    pub fn attach(&mut self, cc_status: CcStatus) {
        self.cc_status = cc_status;
        self.events.set_attached(true);
    }

    /// Unplug the source.
    pub fn detach(&mut self) {
        self.cc_status = CcStatus::default();
        self.received.clear();
        self.events.set_detached(true);
    }

    /// Signal a hard reset from the source.
    pub fn inject_hard_reset(&mut self) {
        self.events.set_hard_reset_received(true);
    }

    /// Inject received data that can be retrieved later.
    pub fn inject_received_data(&mut self, data: &[u8]) {
        self.received.push_back(data.to_vec());
    }

    fn next_source_message_id(&mut self) -> u8 {
        let id = self.source_message_id;
        self.source_message_id = (id + 1) % 8;
        id
    }

    /// Inject a control message from the source, with the next source message ID.
    pub fn inject_control(&mut self, message_type: ControlMessageType) {
        let id = Counter::new_from_value(CounterType::MessageId, self.next_source_message_id());
        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        let size = Message::new(Header::new_control(source_template(), id, message_type)).to_bytes(&mut buffer);

        self.inject_received_data(&buffer[..size]);
    }

    /// Inject [`DUMMY_CAPABILITIES`], with the next source message ID.
    pub fn inject_source_capabilities(&mut self) {
        let id = self.next_source_message_id();
        let mut frame = DUMMY_CAPABILITIES;
        let header = Header::from_bytes(&frame).unwrap().with_message_id(id);
        header.to_bytes(&mut frame);

        self.inject_received_data(&frame);
    }

    /// Let the next alert reads fail.
    pub fn fail_next_alerts(&mut self, count: usize) {
        self.failing_alerts = count;
    }

    /// Let the next transmissions be discarded, as if the line was busy.
    pub fn discard_next_transmissions(&mut self, count: usize) {
        self.discard_transmissions = count;
    }

    /// Take all frames that were transmitted so far.
    pub fn take_transmitted(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.transmitted)
    }

    /// Take all transmitted messages so far, parsed.
    pub fn take_messages(&mut self) -> Vec<Message> {
        self.take_transmitted()
            .iter()
            .map(|frame| Message::from_bytes(frame).unwrap())
            .collect()
    }

    /// Number of transmitted hard resets.
    pub fn hard_resets(&self) -> usize {
        self.hard_resets
    }

    /// The last VBUS sense setting.
    pub fn vbus_sense(&self) -> Option<bool> {
        self.vbus_sense
    }
}

fn source_template() -> Header {
    Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X)
}

impl Driver for DummyDriver {
    fn alert(&mut self) -> Result<Events, DriverError> {
        if self.failing_alerts > 0 {
            self.failing_alerts -= 1;
            return Err(DriverError::Bus);
        }

        let mut events = std::mem::take(&mut self.events);
        if !self.received.is_empty() {
            events.set_message_received(true);
            events.set_good_crc_sent(true);
        }

        Ok(events)
    }

    fn interrupt_pending(&self) -> bool {
        !self.events.is_empty() || !self.received.is_empty()
    }

    fn cc_status(&mut self) -> Result<CcStatus, DriverError> {
        Ok(self.cc_status)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, DriverRxError> {
        let frame = self.received.pop_front().ok_or(DriverRxError::Discarded)?;
        let length = frame.len().min(buffer.len());
        buffer[..length].copy_from_slice(&frame[..length]);

        Ok(length)
    }

    fn transmit(&mut self, data: &[u8]) -> Result<(), DriverTxError> {
        if self.discard_transmissions > 0 {
            self.discard_transmissions -= 1;
            return Err(DriverTxError::Discarded);
        }

        self.transmitted.push(data.to_vec());
        Ok(())
    }

    fn transmit_hard_reset(&mut self) -> Result<(), DriverTxError> {
        self.hard_resets += 1;
        Ok(())
    }

    fn set_vbus_sense(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.vbus_sense = Some(enabled);
        Ok(())
    }

    fn device_id(&mut self) -> Result<DeviceId, DriverError> {
        Ok(DeviceId {
            version: 8,
            revision: 2,
        })
    }
}

/// A dummy driver for a PHY that does not answer GoodCRC by itself.
#[derive(Debug, Default)]
pub struct ManualGoodCrcDriver(DummyDriver);

impl ManualGoodCrcDriver {
    /// Create a new dummy driver.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Deref for ManualGoodCrcDriver {
    type Target = DummyDriver;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ManualGoodCrcDriver {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Driver for ManualGoodCrcDriver {
    const HAS_AUTO_GOOD_CRC: bool = false;

    fn alert(&mut self) -> Result<Events, DriverError> {
        self.0.alert().map(|events| events.with_good_crc_sent(false))
    }

    fn interrupt_pending(&self) -> bool {
        self.0.interrupt_pending()
    }

    fn cc_status(&mut self) -> Result<CcStatus, DriverError> {
        self.0.cc_status()
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, DriverRxError> {
        self.0.receive(buffer)
    }

    fn transmit(&mut self, data: &[u8]) -> Result<(), DriverTxError> {
        self.0.transmit(data)
    }

    fn transmit_hard_reset(&mut self) -> Result<(), DriverTxError> {
        self.0.transmit_hard_reset()
    }

    fn set_vbus_sense(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.0.set_vbus_sense(enabled)
    }

    fn device_id(&mut self) -> Result<DeviceId, DriverError> {
        self.0.device_id()
    }
}

/// A dummy clock, advanced by the test. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct DummyClock {
    now: Rc<Cell<u16>>,
}

impl DummyClock {
    /// Create a clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock at the given time.
    pub fn starting_at(milliseconds: u16) -> Self {
        let clock = Self::new();
        clock.now.set(milliseconds);
        clock
    }

    /// Let time pass.
    pub fn advance(&self, milliseconds: u16) {
        self.now.set(self.now.get().wrapping_add(milliseconds));
    }
}

impl Clock for DummyClock {
    fn now_millis(&self) -> u16 {
        self.now.get()
    }

    fn delay_millis(&mut self, milliseconds: u16) {
        self.advance(milliseconds);
    }
}

/// A device that records the power it was offered.
#[derive(Debug, Default)]
pub struct DummySinkDevice {
    /// Contracts in the order they became available.
    pub contracts: Vec<Contract>,
    /// Number of hard resets.
    pub hard_resets: usize,
}

impl DevicePolicyManager for DummySinkDevice {
    fn transition_power(&mut self, contract: &Contract) {
        self.contracts.push(*contract);
    }

    fn hard_reset(&mut self) {
        self.hard_resets += 1;
    }
}

/// Dummy capabilities to deserialize.
///
/// - Fixed 5 V at 3 A
/// - Fixed 9 V at 3 A
/// - Fixed 15 V at 3 A
/// - Fixed 20 V at 2.25 A
/// - PPS 3.3-11 V at 5 A
/// - PPS 3.3-16 V at 3 A
/// - PPS 3.3-21 V at 2.25 A
pub const DUMMY_CAPABILITIES: [u8; 30] = [
    0xA1, // Header
    0x71, // Header
    0x2c, // +
    0x91, // | Fixed 5V @ 3A
    0x01, // |
    0x08, // +
    0x2c, // +
    0xD1, // |
    0x02, // | Fixed 9V @ 3A
    0x00, // +
    0x2C, // +
    0xB1, // |
    0x04, // | Fixed 15V @ 3A
    0x00, // +
    0xE1, // +
    0x40, // |
    0x06, // | Fixed 20V @ 2.25A
    0x00, // +
    0x64, // +
    0x21, // |
    0xDC, // | PPS 3.3-11V @ 5A
    0xC8, // +
    0x3C, // +
    0x21, // |
    0x40, // | PPS 3.3-16V @ 3A
    0xC9, // +
    0x2D, // +
    0x21, // |
    0xA4, // | PPS 3.3-21V @ 2.25A
    0xC9, // +
];

/// Get dummy source capabilities for testing.
///
/// Corresponds to the `DUMMY_CAPABILITIES` above.
pub fn get_dummy_source_capabilities() -> Vec<PowerDataObject> {
    let fixed = |raw_voltage, raw_max_current| {
        FixedSupply::default()
            .with_raw_voltage(raw_voltage)
            .with_raw_max_current(raw_max_current)
    };
    let pps = |raw_max_voltage, raw_max_current| {
        SprProgrammablePowerSupply::default()
            .with_raw_min_voltage(33)
            .with_raw_max_voltage(raw_max_voltage)
            .with_raw_max_current(raw_max_current)
            .with_pps_power_limited(true)
    };

    vec![
        PowerDataObject::FixedSupply(fixed(100, 300).with_unconstrained_power(true)),
        PowerDataObject::FixedSupply(fixed(180, 300)),
        PowerDataObject::FixedSupply(fixed(300, 300)),
        PowerDataObject::FixedSupply(fixed(400, 225)),
        PowerDataObject::Augmented(Augmented::Spr(pps(110, 100))),
        PowerDataObject::Augmented(Augmented::Spr(pps(160, 60))),
        PowerDataObject::Augmented(Augmented::Spr(pps(210, 45))),
    ]
}
