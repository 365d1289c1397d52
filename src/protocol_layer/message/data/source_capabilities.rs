//! Definitions of source capabilities data message content.
use heapless::Vec;
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;
use uom::si::electric_potential::decivolt;

use super::PdoState;
use super::request::PpsTarget;
use crate::_20millivolts_mod::_20millivolts;
use crate::_50milliamperes_mod::_50milliamperes;
use crate::_50millivolts_mod::_50millivolts;
use crate::_250milliwatts_mod::_250milliwatts;
use crate::protocol_layer::message::MAX_DATA_OBJECTS;
use crate::units::{ElectricCurrent, ElectricPotential, Power};

/// Kinds of supplies that can be reported within source capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Kind {
    /// Fixed voltage supply.
    FixedSupply,
    /// Battery supply.
    Battery,
    /// Variable voltage supply.
    VariableSupply,
    /// Programmable power supply.
    Pps,
}

/// An augmented PDO of a subtype other than SPR PPS.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("unsupported augmented power data object (supply type `{supply}`)")]
pub struct UnsupportedCapability {
    /// The augmented supply subtype (bits 28..=29).
    pub supply: u8,
}

/// A power data object holds information about one type of source capability.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerDataObject {
    /// Fixed voltage supply.
    FixedSupply(FixedSupply),
    /// Battery supply.
    Battery(Battery),
    /// Variable voltage supply.
    VariableSupply(VariableSupply),
    /// Augmented supply.
    Augmented(Augmented),
}

impl PowerDataObject {
    /// The raw object word.
    pub fn raw(&self) -> u32 {
        match self {
            Self::FixedSupply(pdo) => pdo.0,
            Self::Battery(pdo) => pdo.0,
            Self::VariableSupply(pdo) => pdo.0,
            Self::Augmented(Augmented::Spr(pdo)) => pdo.0,
            Self::Augmented(Augmented::Unsupported(pdo)) => pdo.0,
        }
    }

    /// The kind of supply.
    ///
    /// Augmented PDOs that are not SPR PPS are reported as unsupported, so that callers skip them
    /// instead of misreading their fields.
    pub fn kind(&self) -> Result<Kind, UnsupportedCapability> {
        match self {
            Self::FixedSupply(_) => Ok(Kind::FixedSupply),
            Self::Battery(_) => Ok(Kind::Battery),
            Self::VariableSupply(_) => Ok(Kind::VariableSupply),
            Self::Augmented(Augmented::Spr(_)) => Ok(Kind::Pps),
            Self::Augmented(Augmented::Unsupported(raw)) => Err(UnsupportedCapability { supply: raw.supply() }),
        }
    }

    /// Normalized voltage, current and power limits of this PDO.
    pub fn power_info(&self) -> Result<PowerInfo, UnsupportedCapability> {
        let kind = self.kind()?;
        let info = PowerInfo {
            kind,
            ..Default::default()
        };

        Ok(match self {
            Self::FixedSupply(pdo) => PowerInfo {
                max_voltage: pdo.raw_voltage(),
                max_current: pdo.raw_max_current(),
                ..info
            },
            Self::Battery(pdo) => PowerInfo {
                min_voltage: pdo.raw_min_voltage(),
                max_voltage: pdo.raw_max_voltage(),
                max_power: pdo.raw_max_power(),
                ..info
            },
            Self::VariableSupply(pdo) => PowerInfo {
                min_voltage: pdo.raw_min_voltage(),
                max_voltage: pdo.raw_max_voltage(),
                max_current: pdo.raw_max_current(),
                ..info
            },
            // 100 mV -> 50 mV, 50 mA -> 10 mA
            Self::Augmented(Augmented::Spr(pdo)) => PowerInfo {
                min_voltage: u16::from(pdo.raw_min_voltage()) * 2,
                max_voltage: u16::from(pdo.raw_max_voltage()) * 2,
                max_current: u16::from(pdo.raw_max_current()) * 5,
                ..info
            },
            Self::Augmented(Augmented::Unsupported(_)) => info,
        })
    }
}

/// Limits of a PDO in common units, for reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerInfo {
    /// The kind of supply.
    pub kind: Kind,
    /// Minimum voltage in 50 mV units, zero for fixed supplies.
    pub min_voltage: u16,
    /// Maximum (or fixed) voltage in 50 mV units.
    pub max_voltage: u16,
    /// Maximum current in 10 mA units, zero for battery supplies.
    pub max_current: u16,
    /// Maximum power in 250 mW units, only set for battery supplies.
    pub max_power: u16,
}

impl Default for PowerInfo {
    fn default() -> Self {
        Self {
            kind: Kind::FixedSupply,
            min_voltage: 0,
            max_voltage: 0,
            max_current: 0,
            max_power: 0,
        }
    }
}

bitfield! {
    /// A raw power data object.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct RawPowerDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The kind of power data object.
        pub kind: u8 @ 30..=31,
    }
}

bitfield! {
    /// A fixed voltage supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FixedSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Fixed supply
        pub kind: u8 @ 30..=31,
        /// Dual-role power
        pub dual_role_power: bool @ 29,
        /// USB suspend supported
        pub usb_suspend_supported: bool @ 28,
        /// Unconstrained power
        pub unconstrained_power: bool @ 27,
        /// USB communications capable
        pub usb_communications_capable: bool @ 26,
        /// Dual-role data
        pub dual_role_data: bool @ 25,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 24,
        /// Peak current
        pub peak_current: u8 @ 20..=21,
        /// Voltage in 50 mV units
        pub raw_voltage: u16 @ 10..=19,
        /// Maximum current in 10 mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

#[allow(clippy::derivable_impls)]
impl Default for FixedSupply {
    fn default() -> Self {
        Self(0)
    }
}

#[allow(missing_docs)]
impl FixedSupply {
    pub fn voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_voltage().into())
    }

    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }
}

bitfield! {
    /// A battery supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Battery
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50 mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50 mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum Allowable Power in 250 mW units
        pub raw_max_power: u16 @ 0..=9,
    }
}

#[allow(missing_docs)]
impl Battery {
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    pub fn max_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_max_power().into())
    }
}

bitfield! {
    /// A variable (non-battery) supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Variable supply (non-battery)
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum current in 10mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

#[allow(missing_docs)]
impl VariableSupply {
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }
}

/// Augmented power data objects.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Augmented {
    /// SPR programmable power supply.
    Spr(SprProgrammablePowerSupply),
    /// Any other augmented subtype (e.g. EPR AVS), not supported by this sink.
    Unsupported(AugmentedRaw),
}

bitfield! {
    /// An augmented PDO of unknown subtype.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AugmentedRaw(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object
        pub kind: u8 @ 30..=31,
        /// Augmented supply subtype
        pub supply: u8 @ 28..=29,
        /// Subtype-specific content
        pub power_capabilities: u32 @ 0..=27,
    }
}

bitfield! {
    /// An SPR programmable power supply APDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SprProgrammablePowerSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object
        pub kind: u8 @ 30..=31,
        /// SPR programmable power supply
        pub supply: u8 @ 28..=29,
        /// PPS power limited
        pub pps_power_limited: bool @ 27,
        /// Maximum voltage in 100mV increments
        pub raw_max_voltage: u8 @ 17..=24,
        /// Minimum Voltage in 100mV increments
        pub raw_min_voltage: u8 @ 8..=15,
        /// Maximum Current in 50mA increments
        pub raw_max_current: u8 @ 0..=6,
    }
}

impl Default for SprProgrammablePowerSupply {
    fn default() -> Self {
        Self(0).with_kind(0b11).with_supply(0b00)
    }
}

#[allow(missing_docs)]
impl SprProgrammablePowerSupply {
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_max_voltage().into())
    }

    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_min_voltage().into())
    }

    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_max_current().into())
    }

    /// Whether the target voltage lies within the programmable range.
    pub fn contains_voltage(&self, target: PpsTarget) -> bool {
        let voltage = ElectricPotential::new::<_20millivolts>(target.voltage.into());
        self.min_voltage() <= voltage && voltage <= self.max_voltage()
    }

    /// Whether the target is fully covered, voltage and current.
    pub fn covers(&self, target: PpsTarget) -> bool {
        self.contains_voltage(target) && target.current <= self.raw_max_current()
    }
}

/// The capabilities that a source advertises, in priority order.
///
/// The first entry is always the vSafe5V fixed supply. The 1-based index of an entry is its
/// object position in requests.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceCapabilities(pub(crate) Vec<PowerDataObject, MAX_DATA_OBJECTS>);

impl SourceCapabilities {
    /// The vSafe5V supply, if the source complies with the first-PDO rule.
    pub fn vsafe_5v(&self) -> Option<&FixedSupply> {
        self.0.first().and_then(|supply| {
            if let PowerDataObject::FixedSupply(supply) = supply {
                Some(supply)
            } else {
                None
            }
        })
    }

    /// Determine, whether the source has unconstrained power (e.g. mains powered).
    pub fn unconstrained_power(&self) -> bool {
        self.vsafe_5v()
            .map(FixedSupply::unconstrained_power)
            .unwrap_or_default()
    }

    /// Determine, whether the source supports USB suspend.
    pub fn usb_suspend_supported(&self) -> bool {
        self.vsafe_5v()
            .map(FixedSupply::usb_suspend_supported)
            .unwrap_or_default()
    }

    /// Get power data objects (PDOs) from the source.
    pub fn pdos(&self) -> &[PowerDataObject] {
        &self.0
    }

    /// The PDO at a 1-based object position.
    pub fn at_position(&self, position: u8) -> Option<&PowerDataObject> {
        self.0.get(usize::from(position).checked_sub(1)?)
    }

    /// SPR PPS APDOs with their 1-based object positions.
    pub fn pps_pdos(&self) -> impl Iterator<Item = (u8, &SprProgrammablePowerSupply)> {
        self.0.iter().enumerate().filter_map(|(index, pdo)| match pdo {
            PowerDataObject::Augmented(Augmented::Spr(pps)) => Some((index as u8 + 1, pps)),
            _ => None,
        })
    }

    /// Fixed supply PDOs with their 1-based object positions.
    pub fn fixed_pdos(&self) -> impl Iterator<Item = (u8, &FixedSupply)> {
        self.0.iter().enumerate().filter_map(|(index, pdo)| match pdo {
            PowerDataObject::FixedSupply(fixed) => Some((index as u8 + 1, fixed)),
            _ => None,
        })
    }
}

impl PdoState for SourceCapabilities {
    fn pdo_at_object_position(&self, position: u8) -> Option<Kind> {
        self.at_position(position).and_then(|pdo| pdo.kind().ok())
    }
}

impl PdoState for Option<SourceCapabilities> {
    fn pdo_at_object_position(&self, position: u8) -> Option<Kind> {
        self.as_ref().and_then(|s| s.pdo_at_object_position(position))
    }
}

/// Parse a raw PDO into a typed power data object.
///
/// Decodes the PDO type bits and constructs the appropriate variant.
pub fn parse_raw_pdo(raw: u32) -> PowerDataObject {
    match RawPowerDataObject(raw).kind() {
        0b00 => PowerDataObject::FixedSupply(FixedSupply(raw)),
        0b01 => PowerDataObject::Battery(Battery(raw)),
        0b10 => PowerDataObject::VariableSupply(VariableSupply(raw)),
        _ => PowerDataObject::Augmented(match AugmentedRaw(raw).supply() {
            0b00 => Augmented::Spr(SprProgrammablePowerSupply(raw)),
            x => {
                warn!("Unsupported augmented PDO supply {}", x);
                Augmented::Unsupported(AugmentedRaw(raw))
            }
        }),
    }
}
