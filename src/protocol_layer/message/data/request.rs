//! Definitions of request message content, and selection of the requested PDO.
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;
use uom::si::electric_potential::volt;

use super::PdoState;
use super::source_capabilities::{FixedSupply, Kind, PowerDataObject, SourceCapabilities};
use crate::_20millivolts_mod::_20millivolts;
use crate::_50milliamperes_mod::_50milliamperes;
use crate::_250milliwatts_mod::_250milliwatts;
use crate::units::{ElectricCurrent, ElectricPotential, Power};

bitfield! {
    /// A request data object of unknown kind.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct RawDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=7
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
    }
}

bitfield! {
    /// A request for a fixed or variable supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct FixedVariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=7
        pub object_position: u8 @ 28..=31,
        /// GiveBackFlag
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// Operating current in 10mA units
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum operating current in 10mA units
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

#[allow(missing_docs)]
impl FixedVariableSupply {
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operating_current().into())
    }

    pub fn max_operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_operating_current().into())
    }
}

bitfield! {
    /// A request for a battery supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        /// GiveBackFlag = 0
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// Operating power in 250mW units
        pub raw_operating_power: u16 @ 10..=19,
        /// Maximum operating power in 250mW units
        pub raw_max_operating_power: u16 @ 0..=9,
    }
}

#[allow(missing_docs)]
impl Battery {
    pub fn operating_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_operating_power().into())
    }

    pub fn max_operating_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_max_operating_power().into())
    }
}

bitfield!(
    /// A request for a programmable power supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Pps(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// Output voltage in 20mV units
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50mA units
        pub raw_operating_current: u8 @ 0..=6,
    }
);

#[allow(missing_docs)]
impl Pps {
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

/// Power requests towards the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerSource {
    /// Request for a fixed or variable supply.
    FixedVariableSupply(FixedVariableSupply),
    /// Request for a battery supply.
    Battery(Battery),
    /// Request for a programmable power supply.
    Pps(Pps),
    /// Request whose PDO kind is not known.
    Unknown(RawDataObject),
}

/// Errors that can occur during sink requests towards the source.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The source capabilities contain no usable fixed supply.
    #[error("no fixed supply in source capabilities")]
    VoltageMismatch,
}

/// Power level preference used for selecting a fixed supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerOption {
    /// Highest voltage up to 5 V.
    #[default]
    Max5V,
    /// Highest voltage up to 9 V.
    Max9V,
    /// Highest voltage up to 12 V.
    Max12V,
    /// Highest voltage up to 15 V.
    Max15V,
    /// Highest voltage up to 20 V.
    Max20V,
    /// Highest voltage available.
    MaxVoltage,
    /// Highest current available.
    MaxCurrent,
    /// Highest power available.
    MaxPower,
}

impl PowerOption {
    fn voltage_ceiling(self) -> Option<ElectricPotential> {
        let volts = match self {
            Self::Max5V => 5,
            Self::Max9V => 9,
            Self::Max12V => 12,
            Self::Max15V => 15,
            Self::Max20V => 20,
            Self::MaxVoltage | Self::MaxCurrent | Self::MaxPower => return None,
        };

        Some(ElectricPotential::new::<volt>(volts))
    }

    /// Whether `candidate` is preferable over `current` under this option.
    fn prefers(self, candidate: &FixedSupply, current: &FixedSupply) -> bool {
        let by_voltage = (candidate.voltage(), candidate.max_current()) > (current.voltage(), current.max_current());

        match self {
            Self::MaxCurrent => {
                (candidate.max_current(), candidate.voltage()) > (current.max_current(), current.voltage())
            }
            Self::MaxPower => {
                let candidate_power = candidate.voltage() * candidate.max_current();
                let current_power = current.voltage() * current.max_current();
                candidate_power > current_power || (candidate_power == current_power && by_voltage)
            }
            _ => by_voltage,
        }
    }
}

/// A programmable supply operating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PpsTarget {
    /// Output voltage in 20 mV units.
    pub voltage: u16,
    /// Operating current in 50 mA units.
    pub current: u8,
}

impl PpsTarget {
    /// Create a target from raw units (20 mV, 50 mA).
    pub const fn new(voltage: u16, current: u8) -> Self {
        Self { voltage, current }
    }

    /// Create a target from millivolts and milliamperes, rounding down to the unit grid.
    pub const fn from_millis(millivolts: u16, milliamperes: u16) -> Self {
        let current = milliamperes / 50;
        Self {
            voltage: millivolts / 20,
            current: if current > 0x7f { 0x7f } else { current as u8 },
        }
    }
}

impl PowerSource {
    /// Interpret a raw request object, using `state` to resolve the PDO kind.
    pub fn from_raw<P: PdoState>(raw: u32, state: &P) -> Self {
        let raw = RawDataObject(raw);
        match state.pdo_at_object_position(raw.object_position()) {
            Some(Kind::FixedSupply | Kind::VariableSupply) => Self::FixedVariableSupply(FixedVariableSupply(raw.0)),
            Some(Kind::Battery) => Self::Battery(Battery(raw.0)),
            Some(Kind::Pps) => Self::Pps(Pps(raw.0)),
            None => Self::Unknown(raw),
        }
    }

    /// The raw request object.
    pub fn raw(&self) -> u32 {
        match self {
            Self::FixedVariableSupply(p) => p.0,
            Self::Battery(p) => p.0,
            Self::Pps(p) => p.0,
            Self::Unknown(p) => p.0,
        }
    }

    /// The 1-based position of the requested PDO.
    pub fn object_position(&self) -> u8 {
        RawDataObject(self.raw()).object_position()
    }

    /// Whether the sink reported that the source cannot satisfy its needs.
    pub fn capability_mismatch(&self) -> bool {
        RawDataObject(self.raw()).capability_mismatch()
    }

    /// Select a PDO and build the request for it.
    ///
    /// With a PPS target, the first PPS APDO that covers the target is requested. If the target
    /// voltage is within an APDO but its current is not, the APDO with the largest current is
    /// requested with a clamped current and the capability mismatch flag set. Otherwise, a fixed
    /// supply is chosen according to `option`.
    pub fn select(
        source_capabilities: &SourceCapabilities,
        option: PowerOption,
        pps: Option<PpsTarget>,
    ) -> Result<Self, Error> {
        if let Some(target) = pps {
            if let Some(request) = Self::select_pps(source_capabilities, target) {
                return Ok(request);
            }

            debug!("No PPS APDO contains the target, fall back to fixed supply");
        }

        Self::select_fixed(source_capabilities, option)
    }

    fn select_pps(source_capabilities: &SourceCapabilities, target: PpsTarget) -> Option<Self> {
        if let Some((position, _)) = source_capabilities.pps_pdos().find(|(_, pps)| pps.covers(target)) {
            return Some(Self::new_pps(position, target, false));
        }

        let (position, pps) = source_capabilities
            .pps_pdos()
            .filter(|(_, pps)| pps.contains_voltage(target))
            .reduce(|best, candidate| {
                if candidate.1.raw_max_current() > best.1.raw_max_current() {
                    candidate
                } else {
                    best
                }
            })?;

        warn!("Clamp PPS current to {} x 50 mA", pps.raw_max_current());
        let clamped = PpsTarget::new(target.voltage, pps.raw_max_current());
        Some(Self::new_pps(position, clamped, true))
    }

    fn select_fixed(source_capabilities: &SourceCapabilities, option: PowerOption) -> Result<Self, Error> {
        let ceiling = option.voltage_ceiling();
        let mut selected: Option<(u8, &FixedSupply)> = None;

        for (position, supply) in source_capabilities.fixed_pdos() {
            if ceiling.is_some_and(|ceiling| supply.voltage() > ceiling) {
                trace!("Skip fixed PDO {} above ceiling", position);
                continue;
            }

            selected = match selected {
                Some((_, best)) if !option.prefers(supply, best) => selected,
                _ => Some((position, supply)),
            };
        }

        // vSafe5V is the floor for any ceiling.
        let (position, supply) = selected
            .or_else(|| source_capabilities.vsafe_5v().map(|supply| (1, supply)))
            .ok_or(Error::VoltageMismatch)?;

        Ok(Self::new_fixed(position, supply))
    }

    /// Create a request for a fixed supply at its maximum current.
    pub fn new_fixed(position: u8, supply: &FixedSupply) -> Self {
        let current = supply.raw_max_current();

        Self::FixedVariableSupply(
            FixedVariableSupply(0)
                .with_raw_operating_current(current)
                .with_raw_max_operating_current(current)
                .with_object_position(position)
                .with_capability_mismatch(false)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        )
    }

    /// Create a request for a programmable power supply.
    pub fn new_pps(position: u8, target: PpsTarget, capability_mismatch: bool) -> Self {
        let mut raw_current = target.current;

        if raw_current > 0x7f {
            error!("Clamping invalid current: {} mA", 50 * u16::from(raw_current));
            raw_current = 0x7f;
        }

        Self::Pps(
            Pps(0)
                .with_raw_output_voltage(target.voltage & 0xfff)
                .with_raw_operating_current(raw_current)
                .with_object_position(position)
                .with_capability_mismatch(capability_mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        )
    }

    /// The PDO that this request refers to.
    pub fn pdo<'a>(&self, source_capabilities: &'a SourceCapabilities) -> Option<&'a PowerDataObject> {
        source_capabilities.at_position(self.object_position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::get_dummy_source_capabilities;
    use crate::protocol_layer::message::data::source_capabilities::{
        Augmented, SprProgrammablePowerSupply, parse_raw_pdo,
    };

    fn dummy_capabilities() -> SourceCapabilities {
        SourceCapabilities(get_dummy_source_capabilities().into_iter().collect())
    }

    fn fixed(raw_voltage: u16, raw_max_current: u16) -> PowerDataObject {
        PowerDataObject::FixedSupply(
            FixedSupply::default()
                .with_raw_voltage(raw_voltage)
                .with_raw_max_current(raw_max_current),
        )
    }

    fn fixed_request(request: PowerSource) -> FixedVariableSupply {
        match request {
            PowerSource::FixedVariableSupply(rdo) => rdo,
            other => panic!("expected a fixed request, got {other:?}"),
        }
    }

    #[test]
    fn fixed_selection_per_option() {
        let caps = dummy_capabilities();
        let position = |option| PowerSource::select(&caps, option, None).unwrap().object_position();

        assert_eq!(position(PowerOption::Max5V), 1);
        assert_eq!(position(PowerOption::Max9V), 2);
        assert_eq!(position(PowerOption::Max12V), 2);
        assert_eq!(position(PowerOption::Max15V), 3);
        assert_eq!(position(PowerOption::Max20V), 4);
        assert_eq!(position(PowerOption::MaxVoltage), 4);
        // 3 A at 5, 9 and 15 V, the tie goes to the higher voltage
        assert_eq!(position(PowerOption::MaxCurrent), 3);
        // 45 W at both 15 V and 20 V
        assert_eq!(position(PowerOption::MaxPower), 4);
    }

    #[test]
    fn fixed_request_fields() {
        let caps = dummy_capabilities();
        let rdo = fixed_request(PowerSource::select(&caps, PowerOption::Max20V, None).unwrap());

        assert_eq!(rdo.object_position(), 4);
        assert_eq!(rdo.raw_operating_current(), 225);
        assert_eq!(rdo.raw_max_operating_current(), 225);
        assert!(rdo.no_usb_suspend());
        assert!(rdo.usb_communications_capable());
        assert!(!rdo.capability_mismatch());
    }

    #[test]
    fn every_capability_list_selects_a_valid_position() {
        let pdos = [fixed(100, 300), fixed(180, 200), fixed(240, 150), fixed(300, 300), fixed(400, 500)];
        let options = [
            PowerOption::Max5V,
            PowerOption::Max9V,
            PowerOption::Max12V,
            PowerOption::Max15V,
            PowerOption::Max20V,
            PowerOption::MaxVoltage,
            PowerOption::MaxCurrent,
            PowerOption::MaxPower,
        ];

        for count in 1..=pdos.len() {
            let caps = SourceCapabilities(pdos[..count].iter().copied().collect());

            for option in options {
                let request = PowerSource::select(&caps, option, None).unwrap();
                let position = request.object_position();

                assert!((1..=count as u8).contains(&position));
                assert_eq!(request.pdo(&caps), Some(&pdos[position as usize - 1]));
            }
        }
    }

    #[test]
    fn max_current_and_power_preferences() {
        let caps = SourceCapabilities([fixed(100, 300), fixed(180, 500), fixed(400, 250)].into_iter().collect());

        assert_eq!(
            PowerSource::select(&caps, PowerOption::MaxCurrent, None)
                .unwrap()
                .object_position(),
            2
        );
        // 20 V x 2.5 A = 50 W beats 9 V x 5 A = 45 W
        assert_eq!(
            PowerSource::select(&caps, PowerOption::MaxPower, None)
                .unwrap()
                .object_position(),
            3
        );
    }

    #[test]
    fn pps_selection_prefers_covering_apdo() {
        let caps = dummy_capabilities();

        // 12 V, 2 A is only inside the 3.3-16 V APDO
        let request = PowerSource::select(&caps, PowerOption::Max5V, Some(PpsTarget::new(600, 40))).unwrap();
        let PowerSource::Pps(rdo) = request else {
            panic!("expected a PPS request");
        };

        assert_eq!(rdo.object_position(), 6);
        assert_eq!(rdo.raw_output_voltage(), 600);
        assert_eq!(rdo.raw_operating_current(), 40);
        assert!(!rdo.capability_mismatch());
    }

    #[test]
    fn pps_current_is_clamped_with_mismatch() {
        let caps = dummy_capabilities();

        // 9 V at 6 A exceeds every APDO, the 5 A one has the most current
        let request = PowerSource::select(&caps, PowerOption::Max5V, Some(PpsTarget::new(450, 120))).unwrap();
        let PowerSource::Pps(rdo) = request else {
            panic!("expected a PPS request");
        };

        assert_eq!(rdo.object_position(), 5);
        assert_eq!(rdo.raw_operating_current(), 100);
        assert!(rdo.capability_mismatch());
    }

    #[test]
    fn pps_without_matching_apdo_falls_back_to_fixed() {
        let caps = dummy_capabilities();

        // 25 V is outside every APDO
        let request = PowerSource::select(&caps, PowerOption::Max9V, Some(PpsTarget::new(1250, 20))).unwrap();
        assert_eq!(fixed_request(request).object_position(), 2);

        let no_pps = SourceCapabilities([fixed(100, 300), fixed(180, 300)].into_iter().collect());
        let request = PowerSource::select(&no_pps, PowerOption::Max5V, Some(PpsTarget::new(250, 20))).unwrap();
        assert_eq!(fixed_request(request).object_position(), 1);
    }

    #[test]
    fn unsupported_apdo_is_skipped() {
        let caps = SourceCapabilities(
            [
                fixed(100, 300),
                PowerDataObject::Augmented(Augmented::Spr(
                    SprProgrammablePowerSupply::default()
                        .with_raw_min_voltage(33)
                        .with_raw_max_voltage(59)
                        .with_raw_max_current(60),
                )),
                parse_raw_pdo(0xD000_0000 | (200 << 17) | (50 << 8) | 100),
            ]
            .into_iter()
            .collect(),
        );

        let request = PowerSource::select(&caps, PowerOption::Max5V, Some(PpsTarget::new(500, 40))).unwrap();
        assert_eq!(request.object_position(), 1);
    }

    #[test]
    fn request_decodes_against_capabilities() {
        let caps = dummy_capabilities();

        let fixed = PowerSource::select(&caps, PowerOption::Max15V, None).unwrap();
        assert_eq!(PowerSource::from_raw(fixed.raw(), &caps), fixed);

        let pps = PowerSource::new_pps(7, PpsTarget::from_millis(20_000, 2_250), false);
        let decoded = PowerSource::from_raw(pps.raw(), &caps);
        assert_eq!(decoded, pps);

        let PowerSource::Pps(rdo) = decoded else {
            panic!("expected a PPS request");
        };
        assert_eq!(rdo.raw_output_voltage(), 1000);
        assert_eq!(rdo.raw_operating_current(), 45);

        assert!(matches!(PowerSource::from_raw(pps.raw(), &()), PowerSource::Unknown(_)));
    }
}
