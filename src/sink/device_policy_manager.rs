//! The device policy manager (DPM) allows a device to control the policy engine, and be informed about status changes.
//!
//! For example, through the DPM, a device can pick the requested source capability, or react to a
//! new power contract.
use super::{Contract, PowerOption, PpsTarget};
use crate::protocol_layer::message::data::request::{self, PowerSource};
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;

/// Trait for the device policy manager.
///
/// All methods are called from within [`super::policy_engine::Sink::step`] and must not block.
pub trait DevicePolicyManager {
    /// Request a power source.
    ///
    /// Defaults to [`PowerSource::select`], which picks a PDO according to the power option and PPS target.
    fn request(
        &mut self,
        source_capabilities: &SourceCapabilities,
        power_option: PowerOption,
        pps: Option<PpsTarget>,
    ) -> Result<PowerSource, request::Error> {
        PowerSource::select(source_capabilities, power_option, pps)
    }

    /// Notify the device that it may draw power according to a new contract.
    fn transition_power(&mut self, _contract: &Contract) {}

    /// Notify the device that a hard reset occurred, and power returns to its default level.
    fn hard_reset(&mut self) {}
}

impl DevicePolicyManager for () {}
