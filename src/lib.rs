//! A USB PD sink (UFP) engine for `[no_std]` targets.
//!
//! The engine negotiates fixed and programmable (PPS) power contracts with a USB-C PD source. It is
//! driven by a non-blocking [`sink::policy_engine::Sink::step`] function and talks to the PHY
//! through the [`pd_ufp_traits::Driver`] trait.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

// This must go FIRST so that all the other modules see its macros.
mod fmt;

pub mod counters;
pub mod protocol_layer;
pub mod sink;
pub mod status_log;
pub mod timers;

#[cfg(test)]
mod dummy;

pub use pd_ufp_traits::{CableOrientation, CcLevel, CcStatus, DeviceId, Driver, Events};

#[macro_use]
extern crate uom;

#[allow(missing_docs)]
pub mod units {
    ISQ!(
        uom::si,
        u32,
        (millimeter, kilogram, second, milliampere, kelvin, mole, candela)
    );
}

#[allow(missing_docs)]
pub mod _20millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_20millivolts: 0.02; "_20mV", "_20millivolts", "_20millivolts";
    }
}

#[allow(missing_docs)]
pub mod _50millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_50millivolts: 0.05; "_50mV", "_50millivolts", "_50millivolts";
    }
}

#[allow(missing_docs)]
pub mod _50milliamperes_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_current;

        @_50milliamperes: 0.05; "_50mA", "_50milliamperes", "_50milliamperes";
    }
}

#[allow(missing_docs)]
pub mod _250milliwatts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::power;

        @_250milliwatts: 0.25; "_250mW", "_250milliwatts", "_250milliwatts";
    }
}

/// The power role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerRole {
    /// The port consumes power.
    Sink,
    /// The port provides power.
    Source,
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// The data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataRole {
    /// Upstream facing port (device).
    Ufp,
    /// Downstream facing port (host).
    Dfp,
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}
