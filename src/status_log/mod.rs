//! Status log of protocol events, for diagnostics.
//!
//! The policy engine reports events through the [`EventSink`] trait. [`StatusLog`] records them in
//! fixed-capacity queues without blocking, and renders them as human-readable lines on demand, one
//! line per [`StatusLog::readline`] call.
use core::fmt::{self, Write};

use heapless::spsc::Queue;
use pd_ufp_traits::{CcLevel, CcStatus, DeviceId, DriverError};

use crate::protocol_layer::message::Message;
use crate::protocol_layer::message::data::source_capabilities::{Kind, SourceCapabilities, parse_raw_pdo};
use crate::protocol_layer::message::header::Header;
use crate::sink::Contract;

/// An event reported by the policy engine.
#[derive(Debug, Clone, Copy)]
pub enum StatusEvent<'a> {
    /// The engine was created, with the transceiver identification if it could be read.
    Initialized(Result<DeviceId, DriverError>),
    /// A port partner was attached.
    Attached(CcStatus),
    /// An attach was detected, but the CC lines do not identify exactly one active leg.
    CableFault(CcStatus),
    /// A message was transmitted.
    MessageTx(&'a Message),
    /// A message was received.
    MessageRx(&'a Message),
    /// Source capabilities were evaluated.
    SourceCapabilities {
        /// The advertised capabilities.
        capabilities: &'a SourceCapabilities,
        /// The 1-based position of the requested PDO.
        selected: Option<u8>,
    },
    /// A new power level is available.
    PowerReady(Contract),
    /// The first stage of a low-voltage PPS startup is ready, the real target follows.
    PpsStartup,
    /// The source rejected a request.
    Rejected,
    /// A hard reset was sent or received.
    HardReset,
}

/// Receiver of status events.
pub trait EventSink {
    /// Record an event, at a millisecond timestamp. Must not block.
    fn log_event(&mut self, timestamp: u16, event: StatusEvent<'_>);
}

impl EventSink for () {
    fn log_event(&mut self, _timestamp: u16, _event: StatusEvent<'_>) {}
}

impl<T: EventSink> EventSink for &mut T {
    fn log_event(&mut self, timestamp: u16, event: StatusEvent<'_>) {
        T::log_event(self, timestamp, event)
    }
}

/// Detail of rendered lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LogLevel {
    /// Message names and power events.
    #[default]
    Info,
    /// Additionally, message IDs, raw headers and data objects.
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Tx,
    Rx,
}

#[derive(Debug, Clone, Copy)]
enum RecordKind {
    Initialized(Result<DeviceId, DriverError>),
    Attached(CcStatus),
    CableFault(CcStatus),
    Message {
        direction: Direction,
        header: Header,
        objects: u8,
    },
    SourceCapabilities {
        objects: u8,
        selected: Option<u8>,
    },
    PowerReady(Contract),
    PpsStartup,
    Rejected,
    HardReset,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    time: u16,
    kind: RecordKind,
}

/// A ring-buffer status log.
///
/// `N` is the size of the record queue, `M` the size of the queue of raw data objects that messages
/// and source capabilities refer to. Both must be powers of two, no larger than 256. When a queue is
/// full, new entries are dropped and unread entries are kept.
pub struct StatusLog<const N: usize = 16, const M: usize = 32> {
    records: Queue<Record, N>,
    objects: Queue<u32, M>,
    level: LogLevel,
    continuation: u8,
}

impl<const N: usize, const M: usize> StatusLog<N, M> {
    const VALID_CAPACITY: () = assert!(
        N.is_power_of_two() && N <= 256 && M.is_power_of_two() && M <= 256,
        "status log queue sizes must be powers of two, up to 256"
    );

    /// Create an empty log.
    pub fn new(level: LogLevel) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_CAPACITY;

        Self {
            records: Queue::new(),
            objects: Queue::new(),
            level,
            continuation: 0,
        }
    }

    /// Change the detail of rendered lines.
    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    /// Number of unread records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there are no unread records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Maximum number of unread records.
    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }

    fn push_objects(&mut self, words: impl Iterator<Item = u32>) -> u8 {
        let mut stored = 0;
        for word in words {
            if self.objects.enqueue(word).is_err() {
                break;
            }
            stored += 1;
        }
        stored
    }

    fn drain_objects(&mut self, count: u8) {
        for _ in 0..count {
            self.objects.dequeue();
        }
    }

    /// Render the next line of the oldest unread record into `out`.
    ///
    /// Returns `false` if there is nothing to render. Records with data objects span several
    /// lines, one per call. Lines start with a `NNNN: ` millisecond timestamp and carry no line
    /// terminator.
    pub fn readline<W: Write>(&mut self, out: &mut W) -> Result<bool, fmt::Error> {
        let Some(record) = self.records.peek().copied() else {
            return Ok(false);
        };

        write!(out, "{:04}: ", record.time)?;

        let finished = match record.kind {
            RecordKind::Initialized(Ok(id)) => {
                write!(
                    out,
                    "PHY ver ID:{}_rev{}",
                    char::from(b'A'.wrapping_add(id.version)),
                    char::from(b'A'.wrapping_add(id.revision))
                )?;
                true
            }
            RecordKind::Initialized(Err(_)) => {
                out.write_str("PHY init error")?;
                true
            }
            RecordKind::Attached(cc) => {
                write_cc(out, cc)?;
                true
            }
            RecordKind::CableFault(cc) => {
                write_cc(out, cc)?;
                out.write_str(", no PD contract")?;
                true
            }
            RecordKind::Message {
                direction,
                header,
                objects,
            } => self.readline_message(out, direction, header, objects)?,
            RecordKind::SourceCapabilities { objects, selected } => {
                if objects == 0 {
                    out.write_str("   no capabilities")?;
                    true
                } else {
                    let index = self.continuation;
                    let raw = self.objects.dequeue().unwrap_or_default();
                    write_pdo(out, index, raw, selected == Some(index + 1))?;
                    self.continuation += 1;
                    self.continuation >= objects
                }
            }
            RecordKind::PowerReady(contract) => {
                write_contract(out, contract)?;
                true
            }
            RecordKind::PpsStartup => {
                out.write_str("PPS 2-stage startup")?;
                true
            }
            RecordKind::Rejected => {
                out.write_str("Request Rejected")?;
                true
            }
            RecordKind::HardReset => {
                out.write_str("Hard Reset")?;
                true
            }
        };

        if finished {
            self.records.dequeue();
            self.continuation = 0;
        }

        Ok(true)
    }

    fn readline_message<W: Write>(
        &mut self,
        out: &mut W,
        direction: Direction,
        header: Header,
        objects: u8,
    ) -> Result<bool, fmt::Error> {
        if self.continuation == 0 {
            let kind = match direction {
                Direction::Tx => 'T',
                Direction::Rx => 'R',
            };
            write!(out, "{}X {}", kind, header.message_name())?;

            if self.level == LogLevel::Verbose {
                let extended = if header.extended() { "ext, " } else { "" };
                write!(out, " id={} {}raw=0x{:04X}", header.message_id(), extended, header.0)?;

                if objects > 0 {
                    self.continuation = 1;
                    return Ok(false);
                }
            } else {
                self.drain_objects(objects);
            }

            return Ok(true);
        }

        let index = self.continuation - 1;
        let raw = self.objects.dequeue().unwrap_or_default();
        write!(out, " obj{}=0x{:08X}", index, raw)?;
        self.continuation += 1;

        Ok(self.continuation > objects)
    }
}

impl<const N: usize, const M: usize> Default for StatusLog<N, M> {
    fn default() -> Self {
        Self::new(LogLevel::default())
    }
}

impl<const N: usize, const M: usize> EventSink for StatusLog<N, M> {
    fn log_event(&mut self, timestamp: u16, event: StatusEvent<'_>) {
        // Drop new records when full, and do not store their objects either.
        if self.records.len() >= self.records.capacity() {
            return;
        }

        let kind = match event {
            StatusEvent::Initialized(id) => RecordKind::Initialized(id),
            StatusEvent::Attached(cc) => RecordKind::Attached(cc),
            StatusEvent::CableFault(cc) => RecordKind::CableFault(cc),
            StatusEvent::MessageTx(message) | StatusEvent::MessageRx(message) => RecordKind::Message {
                direction: if matches!(event, StatusEvent::MessageTx(_)) {
                    Direction::Tx
                } else {
                    Direction::Rx
                },
                header: message.header,
                objects: self.push_objects(message.objects().into_iter()),
            },
            StatusEvent::SourceCapabilities { capabilities, selected } => RecordKind::SourceCapabilities {
                objects: self.push_objects(capabilities.pdos().iter().map(|pdo| pdo.raw())),
                selected,
            },
            StatusEvent::PowerReady(contract) => RecordKind::PowerReady(contract),
            StatusEvent::PpsStartup => RecordKind::PpsStartup,
            StatusEvent::Rejected => RecordKind::Rejected,
            StatusEvent::HardReset => RecordKind::HardReset,
        };

        _ = self.records.enqueue(Record { time: timestamp, kind });
    }
}

fn cc_level_name(level: CcLevel) -> &'static str {
    match level {
        CcLevel::Open => "open",
        CcLevel::Default => "USB",
        CcLevel::Power1A5 => "1.5",
        CcLevel::Power3A0 => "3.0",
    }
}

fn write_cc<W: Write>(out: &mut W, cc: CcStatus) -> fmt::Result {
    match (cc.cc1.is_active(), cc.cc2.is_active()) {
        (false, false) => out.write_str("USB attached vRA"),
        (true, false) => write!(out, "USB attached CC1 vRd-{}", cc_level_name(cc.cc1)),
        (false, true) => write!(out, "USB attached CC2 vRd-{}", cc_level_name(cc.cc2)),
        (true, true) => out.write_str("USB attached unknown"),
    }
}

fn write_pdo<W: Write>(out: &mut W, index: u8, raw: u32, selected: bool) -> fmt::Result {
    let marker = if selected { " *" } else { "" };

    let Ok(info) = parse_raw_pdo(raw).power_info() else {
        return write!(out, "   [{}] unsupported APDO 0x{:08X}{}", index, raw, marker);
    };

    write!(out, "   [{}] ", index)?;

    // Voltages in 50 mV, currents in 10 mA, power in 250 mW units
    if info.min_voltage > 0 {
        write!(out, "{}.{:02}V-", info.min_voltage / 20, (info.min_voltage * 5) % 100)?;
    }
    write!(out, "{}.{:02}V ", info.max_voltage / 20, (info.max_voltage * 5) % 100)?;

    if info.max_current > 0 {
        write!(out, "{}.{:02}A", info.max_current / 100, info.max_current % 100)?;
    } else {
        write!(out, "{}.{:02}W", info.max_power / 4, (info.max_power * 25) % 100)?;
    }

    let suffix = match info.kind {
        Kind::FixedSupply => "",
        Kind::Battery => " BAT",
        Kind::VariableSupply => " VAR",
        Kind::Pps => " PPS",
    };

    write!(out, "{}{}", suffix, marker)
}

fn write_contract<W: Write>(out: &mut W, contract: Contract) -> fmt::Result {
    let (voltage, current) = (contract.voltage(), contract.current());

    match contract {
        Contract::None => out.write_str("No power"),
        Contract::Default | Contract::Fixed { .. } => write!(
            out,
            "{}.{:02}V {}.{:02}A supply ready",
            voltage / 20,
            (voltage * 5) % 100,
            current / 100,
            current % 100
        ),
        Contract::Pps { .. } => write!(
            out,
            "PPS {}.{:02}V {}.{:02}A supply ready",
            voltage / 50,
            (voltage * 2) % 100,
            current / 20,
            (current * 5) % 100
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DUMMY_CAPABILITIES;
    use crate::protocol_layer::message::data::Data;
    use crate::protocol_layer::message::{Message, Payload};

    fn lines<const N: usize, const M: usize>(log: &mut StatusLog<N, M>) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if !log.readline(&mut line).unwrap() {
                return lines;
            }
            lines.push(line);
        }
    }

    fn dummy_capabilities() -> SourceCapabilities {
        let message = Message::from_bytes(&DUMMY_CAPABILITIES).unwrap();
        match message.payload {
            Some(Payload::Data(Data::SourceCapabilities(caps))) => caps,
            _ => panic!("expected source capabilities"),
        }
    }

    #[test]
    fn power_lines() {
        let mut log: StatusLog = StatusLog::new(LogLevel::Info);

        log.log_event(12, StatusEvent::PowerReady(Contract::Default));
        log.log_event(
            345,
            StatusEvent::PowerReady(Contract::Fixed {
                voltage: 180,
                current: 225,
            }),
        );
        log.log_event(
            6789,
            StatusEvent::PowerReady(Contract::Pps {
                voltage: 175,
                current: 41,
            }),
        );
        log.log_event(65535, StatusEvent::PpsStartup);
        log.log_event(7, StatusEvent::Rejected);

        assert_eq!(
            lines(&mut log),
            [
                "0012: 5.00V 1.00A supply ready",
                "0345: 9.00V 2.25A supply ready",
                "6789: PPS 3.50V 2.05A supply ready",
                "65535: PPS 2-stage startup",
                "0007: Request Rejected",
            ]
        );
        assert!(log.is_empty());
    }

    #[test]
    fn attach_and_device_lines() {
        let mut log: StatusLog = StatusLog::default();

        log.log_event(0, StatusEvent::Initialized(Ok(DeviceId { version: 8, revision: 2 })));
        log.log_event(1, StatusEvent::Initialized(Err(DriverError::Bus)));
        log.log_event(
            2,
            StatusEvent::Attached(CcStatus {
                cc1: CcLevel::Open,
                cc2: CcLevel::Power3A0,
            }),
        );
        log.log_event(
            3,
            StatusEvent::CableFault(CcStatus {
                cc1: CcLevel::Default,
                cc2: CcLevel::Power1A5,
            }),
        );

        assert_eq!(
            lines(&mut log),
            [
                "0000: PHY ver ID:I_revC",
                "0001: PHY init error",
                "0002: USB attached CC2 vRd-3.0",
                "0003: USB attached unknown, no PD contract",
            ]
        );
    }

    #[test]
    fn source_capability_listing() {
        let mut log: StatusLog = StatusLog::new(LogLevel::Info);
        let caps = dummy_capabilities();

        log.log_event(
            100,
            StatusEvent::SourceCapabilities {
                capabilities: &caps,
                selected: Some(2),
            },
        );

        assert_eq!(
            lines(&mut log),
            [
                "0100:    [0] 5.00V 3.00A",
                "0100:    [1] 9.00V 3.00A *",
                "0100:    [2] 15.00V 3.00A",
                "0100:    [3] 20.00V 2.25A",
                "0100:    [4] 3.30V-11.00V 5.00A PPS",
                "0100:    [5] 3.30V-16.00V 3.00A PPS",
                "0100:    [6] 3.30V-21.00V 2.25A PPS",
            ]
        );
    }

    #[test]
    fn message_lines_per_level() {
        // The first two source capabilities, announced as two objects
        let mut frame = [0u8; 10];
        frame.copy_from_slice(&DUMMY_CAPABILITIES[..10]);
        frame[1] = 0x21;
        let message = Message::from_bytes(&frame).unwrap();

        let mut info: StatusLog = StatusLog::new(LogLevel::Info);
        info.log_event(5, StatusEvent::MessageRx(&message));
        info.log_event(6, StatusEvent::MessageRx(&message));
        assert_eq!(
            lines(&mut info),
            ["0005: RX Source_Capabilities", "0006: RX Source_Capabilities"]
        );

        let mut verbose: StatusLog = StatusLog::new(LogLevel::Verbose);
        verbose.log_event(5, StatusEvent::MessageRx(&message));
        assert_eq!(
            lines(&mut verbose),
            [
                "0005: RX Source_Capabilities id=0 raw=0x21A1",
                "0005:  obj0=0x0801912C",
                "0005:  obj1=0x0002D12C",
            ]
        );
    }

    #[test]
    fn full_log_drops_new_entries() {
        let mut log: StatusLog<4, 4> = StatusLog::new(LogLevel::Info);
        let capacity = log.capacity();

        for time in 0..10 {
            log.log_event(time, StatusEvent::Rejected);
        }
        assert_eq!(log.len(), capacity);

        let lines = lines(&mut log);
        assert_eq!(lines.len(), capacity);
        for (time, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("{:04}: Request Rejected", time));
        }

        // Space is available again after reading.
        log.log_event(99, StatusEvent::HardReset);
        let mut line = String::new();
        assert!(log.readline(&mut line).unwrap());
        assert_eq!(line, "0099: Hard Reset");
    }

    #[test]
    fn object_overflow_keeps_records_consistent() {
        let mut log: StatusLog<8, 4> = StatusLog::new(LogLevel::Verbose);
        let caps = dummy_capabilities();

        log.log_event(
            1,
            StatusEvent::SourceCapabilities {
                capabilities: &caps,
                selected: None,
            },
        );
        log.log_event(2, StatusEvent::PpsStartup);

        let lines = lines(&mut log);
        let stored = lines.len() - 1;

        assert!(stored < caps.pdos().len());
        assert_eq!(lines[0], "0001:    [0] 5.00V 3.00A");
        assert_eq!(lines[stored], "0002: PPS 2-stage startup");
    }
}
