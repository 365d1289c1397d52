//! The sink implementation.
pub mod device_policy_manager;
pub mod policy_engine;

pub use crate::protocol_layer::message::data::request::{PowerOption, PpsTarget};

/// Fixed supply voltage of a default USB power contract in 50 mV units (5 V).
pub const DEFAULT_POWER_VOLTAGE: u16 = 100;

/// Current of a default USB power contract in 10 mA units (1 A).
pub const DEFAULT_POWER_CURRENT: u16 = 100;

/// Lowest PPS voltage that is requested on first negotiation, in 20 mV units (5 V).
///
/// Lower targets are reached with a second request after the first contract is ready.
pub const PPS_STARTUP_VOLTAGE: u16 = 250;

/// Sink configuration, given at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Preference for fixed supply selection.
    pub power_option: PowerOption,
    /// Programmable supply operating point, requested when the source offers a matching APDO.
    pub pps: Option<PpsTarget>,
}

impl Config {
    /// Set the fixed supply preference.
    pub fn with_power_option(mut self, power_option: PowerOption) -> Self {
        self.power_option = power_option;
        self
    }

    /// Set the PPS operating point.
    pub fn with_pps(mut self, pps: PpsTarget) -> Self {
        self.pps = Some(pps);
        self
    }
}

/// The power level that the sink may currently draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Contract {
    /// No power is available.
    #[default]
    None,
    /// Default USB power (5 V, 1 A) without PD negotiation.
    Default,
    /// A negotiated fixed supply.
    Fixed {
        /// Voltage in 50 mV units.
        voltage: u16,
        /// Current in 10 mA units.
        current: u16,
    },
    /// A negotiated programmable supply.
    Pps {
        /// Voltage in 20 mV units.
        voltage: u16,
        /// Current in 50 mA units.
        current: u8,
    },
}

impl Contract {
    /// Voltage in the contract's units (50 mV for fixed, 20 mV for PPS).
    pub fn voltage(&self) -> u16 {
        match *self {
            Self::None => 0,
            Self::Default => DEFAULT_POWER_VOLTAGE,
            Self::Fixed { voltage, .. } | Self::Pps { voltage, .. } => voltage,
        }
    }

    /// Current in the contract's units (10 mA for fixed, 50 mA for PPS).
    pub fn current(&self) -> u16 {
        match *self {
            Self::None => 0,
            Self::Default => DEFAULT_POWER_CURRENT,
            Self::Fixed { current, .. } => current,
            Self::Pps { current, .. } => current.into(),
        }
    }

    /// A PPS contract.
    pub fn is_pps(&self) -> bool {
        matches!(self, Self::Pps { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_units() {
        assert_eq!((Contract::Default.voltage(), Contract::Default.current()), (100, 100));

        let pps = Contract::Pps {
            voltage: 175,
            current: 40,
        };
        assert_eq!((pps.voltage(), pps.current()), (175, 40));
        assert!(pps.is_pps());
        assert_eq!(Contract::None.voltage(), 0);
    }

    #[test]
    fn config_builders() {
        let config = Config::default()
            .with_power_option(PowerOption::Max15V)
            .with_pps(PpsTarget::new(175, 40));

        assert_eq!(config.power_option, PowerOption::Max15V);
        assert_eq!(config.pps, Some(PpsTarget::new(175, 40)));
        assert_eq!(Config::default().power_option, PowerOption::Max5V);
    }
}
