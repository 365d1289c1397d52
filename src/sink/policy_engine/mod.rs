//! Policy engine for the implementation of a sink.
//!
//! The engine is a polled state machine. The host calls [`Sink::step`] at least every
//! [`TimerType::Poll`] period, and additionally whenever the transceiver raises its interrupt line.
use pd_ufp_traits::{CcLevel, CcStatus, Driver, DriverError, Events};

use super::device_policy_manager::DevicePolicyManager;
use super::{Config, Contract, PPS_STARTUP_VOLTAGE, PowerOption, PpsTarget};
use crate::counters::{Counter, CounterType};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::protocol_layer::{Error as ProtocolError, ProtocolLayer};
use crate::status_log::{EventSink, StatusEvent};
use crate::timers::{Clock, Timer, TimerType};
use crate::{DataRole, PowerRole};


/// Sink states.
#[derive(Debug, Clone, Copy)]
enum State {
    /// No source, or after a hard reset.
    Detached,
    /// Attached to a PD source, waiting for its capabilities.
    WaitForCapabilities { timer: Timer, retries: Counter },
    /// A request is outstanding, waiting for PS_RDY.
    ///
    /// Holds the preferences that the request was made with.
    TransitionSink {
        timer: Timer,
        power_option: PowerOption,
        pps: Option<PpsTarget>,
    },
    /// A PD contract is established, see [`Contract`].
    Ready,
    /// Default USB power, without a PD contract.
    DefaultPower,
}

/// A response that goes out once the received message was acknowledged.
#[derive(Debug, Clone, Copy)]
enum Response {
    Control(ControlMessageType),
    Request(PowerSource),
}

/// Errors that can occur in the sink policy engine state machine.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The transceiver could not be accessed.
    #[error("driver error: {0:?}")]
    Driver(DriverError),
    /// A protocol error has occured.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// An attach was detected, but not exactly one CC line is terminated.
    #[error("invalid cable orientation: {0:?}")]
    CableOrientation(CcStatus),
}

impl From<DriverError> for Error {
    fn from(driver_error: DriverError) -> Self {
        Error::Driver(driver_error)
    }
}

/// Implementation of the sink policy engine.
pub struct Sink<DRIVER: Driver, CLOCK: Clock, DPM: DevicePolicyManager, LOG: EventSink = ()> {
    device_policy_manager: DPM,
    protocol_layer: ProtocolLayer<DRIVER>,
    clock: CLOCK,
    event_sink: LOG,
    config: Config,
    state: State,
    contract: Contract,
    source_capabilities: Option<SourceCapabilities>,
    power_option: PowerOption,
    /// PPS operating point for the next request.
    pps: Option<PpsTarget>,
    /// The real PPS target, while the startup voltage is negotiated.
    pps_next: Option<PpsTarget>,
    /// PPS operating point of the established contract.
    accepted_pps: Option<PpsTarget>,
    /// Fixed supply preference of the established contract.
    accepted_power_option: PowerOption,
    /// The startup stage of a two-stage PPS negotiation, once the source is ready at it.
    startup_contract: Option<Contract>,
    /// The request that was sent last.
    requested: Option<PowerSource>,
    request_pending: bool,
    response: Option<Response>,
    poll_timer: Timer,
    pps_timer: Timer,
    /// Holds back a pending request after the source answered with Wait.
    retry_timer: Option<Timer>,
}

impl<DRIVER: Driver, CLOCK: Clock, DPM: DevicePolicyManager> Sink<DRIVER, CLOCK, DPM> {
    /// Create a new sink policy engine without status logging.
    pub fn new(driver: DRIVER, clock: CLOCK, device_policy_manager: DPM, config: Config) -> Self {
        Self::new_with_event_sink(driver, clock, device_policy_manager, config, ())
    }
}

impl<DRIVER: Driver, CLOCK: Clock, DPM: DevicePolicyManager, LOG: EventSink> Sink<DRIVER, CLOCK, DPM, LOG> {
    /// Create a new sink policy engine that reports to `event_sink`.
    pub fn new_with_event_sink(
        driver: DRIVER,
        clock: CLOCK,
        device_policy_manager: DPM,
        config: Config,
        event_sink: LOG,
    ) -> Self {
        let header = Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X);
        let now = clock.now_millis();

        let mut sink = Self {
            device_policy_manager,
            protocol_layer: ProtocolLayer::new(driver, header),
            clock,
            event_sink,
            config,
            state: State::Detached,
            contract: Contract::None,
            source_capabilities: None,
            power_option: config.power_option,
            pps: None,
            pps_next: None,
            accepted_pps: None,
            accepted_power_option: config.power_option,
            startup_contract: None,
            requested: None,
            request_pending: false,
            response: None,
            poll_timer: Timer::start(TimerType::Poll, now),
            pps_timer: Timer::start(TimerType::SinkPpsPeriodic, now),
            retry_timer: None,
        };

        let device_id = sink.protocol_layer.driver().device_id();
        match device_id {
            Ok(id) => info!("PHY version {} revision {}", id.version, id.revision),
            Err(_) => error!("PHY identification failed"),
        }
        sink.log(StatusEvent::Initialized(device_id));
        sink
    }

    /// Run a single step in the policy engine state machine.
    ///
    /// Never blocks, except for the short response delay after a received message.
    pub fn step(&mut self) -> Result<(), Error> {
        let result = self.update_state();

        match result {
            // Handle when hard reset is signaled by the driver itself.
            Err(Error::Protocol(ProtocolError::HardReset)) => {
                self.hard_reset_received();
                Ok(())
            }
            result => result,
        }
    }

    fn update_state(&mut self) -> Result<(), Error> {
        let now = self.clock.now_millis();
        self.run_timers(now)?;

        if self.poll_timer.is_expired(now) || self.protocol_layer.driver().interrupt_pending() {
            self.poll_timer.restart(now);

            if let Some(events) = self.alert() {
                self.handle_events(events)?;
            }
        }

        Ok(())
    }

    /// Read line events, retrying a failing transceiver a few times.
    fn alert(&mut self) -> Option<Events> {
        let mut attempts = Counter::new(CounterType::Alert);

        loop {
            match self.protocol_layer.driver().alert() {
                Ok(events) => return Some(events),
                Err(error) => {
                    _ = attempts.increment();
                    if attempts.value() >= attempts.max_value() {
                        warn!("Alert failed {} times: {:?}", attempts.value(), error);
                        return None;
                    }
                }
            }
        }
    }

    fn run_timers(&mut self, now: u16) -> Result<(), Error> {
        match self.state {
            State::WaitForCapabilities {
                mut timer,
                mut retries,
            } if timer.is_expired(now) => {
                timer.restart(now);
                let exhausted = retries.increment().is_err();
                self.state = State::WaitForCapabilities { timer, retries };

                if exhausted {
                    warn!("No source capabilities received, hard reset");
                    self.hard_reset()?;
                } else {
                    debug!("Request source capabilities, attempt {}", retries.value());
                    self.transmit_control_message(ControlMessageType::GetSourceCap)?;
                }
            }
            State::TransitionSink { timer, .. } if timer.is_expired(now) => {
                warn!("No PS_RDY within {} ms", timer.elapsed(now));
                self.enter_default_power();
            }
            State::Ready | State::DefaultPower if self.source_capabilities.is_some() => {
                if self.request_pending {
                    if self.retry_timer.is_none_or(|timer| timer.is_expired(now)) {
                        self.send_request(now)?;
                    }
                } else if self.contract.is_pps() && self.pps_timer.is_expired(now) {
                    trace!("PPS keep-alive");
                    self.send_request(now)?;
                }
            }
            _ => (),
        }

        Ok(())
    }

    fn handle_events(&mut self, events: Events) -> Result<(), Error> {
        trace!("Events {:?}", events);

        if events.detached() {
            self.detach();
            return Ok(());
        }

        if events.attached() {
            self.attach()?;
        }

        if events.hard_reset_received() {
            self.hard_reset_received();
            return Ok(());
        }

        if events.message_received() {
            self.receive()?;

            if !DRIVER::HAS_AUTO_GOOD_CRC {
                self.respond()?;
            }
        }

        if events.good_crc_sent() {
            self.respond()?;
        }

        Ok(())
    }

    /// Forget all session state.
    fn reset(&mut self) {
        self.protocol_layer.reset();
        self.state = State::Detached;
        self.source_capabilities = None;
        self.requested = None;
        self.request_pending = false;
        self.response = None;
        self.retry_timer = None;
        self.startup_contract = None;
        self.accepted_pps = None;
        self.power_option = self.config.power_option;
        self.accepted_power_option = self.config.power_option;
        self.stage_pps(self.config.pps);

        if self.contract != Contract::None {
            self.contract = Contract::None;
            self.device_policy_manager.transition_power(&self.contract);
        }
    }

    /// Aim the next negotiation at `target`.
    ///
    /// Sources need not support PPS voltages below 5 V on first negotiation, so lower targets are
    /// reached through the startup voltage.
    fn stage_pps(&mut self, target: Option<PpsTarget>) {
        (self.pps, self.pps_next) = match target {
            Some(target) if target.voltage < PPS_STARTUP_VOLTAGE => (
                Some(PpsTarget::new(PPS_STARTUP_VOLTAGE, target.current)),
                Some(target),
            ),
            target => (target, None),
        };
    }

    fn attach(&mut self) -> Result<(), Error> {
        let cc_status = self.protocol_layer.driver().cc_status()?;
        self.reset();

        let Some((orientation, level)) = cc_status.orientation() else {
            warn!("Invalid CC status {:?}", cc_status);
            self.log(StatusEvent::CableFault(cc_status));
            return Err(Error::CableOrientation(cc_status));
        };

        debug!("Attached on {:?} with Rp {:?}", orientation, level);
        self.log(StatusEvent::Attached(cc_status));

        match level {
            CcLevel::Power1A5 | CcLevel::Power3A0 => {
                let now = self.clock.now_millis();
                self.state = State::WaitForCapabilities {
                    timer: Timer::start(TimerType::SinkWaitCap, now),
                    retries: Counter::new(CounterType::Caps),
                };
            }
            _ => self.enter_default_power(),
        }

        Ok(())
    }

    fn detach(&mut self) {
        debug!("Detached");
        self.reset();
    }

    fn hard_reset_received(&mut self) {
        warn!("Hard reset received");
        self.log(StatusEvent::HardReset);
        self.reset();
        self.device_policy_manager.hard_reset();
    }

    /// Signal a hard reset to the source, and start over.
    fn hard_reset(&mut self) -> Result<(), Error> {
        self.log(StatusEvent::HardReset);
        self.reset();
        self.device_policy_manager.hard_reset();
        self.protocol_layer.hard_reset()?;

        Ok(())
    }

    fn enter_default_power(&mut self) {
        self.state = State::DefaultPower;
        self.establish(Contract::Default);
    }

    fn establish(&mut self, contract: Contract) {
        info!("Power ready: {:?}", contract);
        self.contract = contract;
        self.startup_contract = None;
        self.device_policy_manager.transition_power(&contract);
        self.log(StatusEvent::PowerReady(contract));
    }

    fn receive(&mut self) -> Result<(), Error> {
        let message = match self.protocol_layer.receive_message(&self.source_capabilities) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(ProtocolError::Parse(error)) => {
                warn!("Discard malformed message: {:?}", error);
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        self.log(StatusEvent::MessageRx(&message));
        self.handle_message(message)
    }

    fn handle_message(&mut self, message: Message) -> Result<(), Error> {
        match (message.header.message_type(), message.payload) {
            (_, Some(Payload::Data(Data::SourceCapabilities(source_capabilities)))) => {
                self.evaluate_capabilities(source_capabilities)
            }
            (MessageType::Control(ControlMessageType::Accept), _) => trace!("Request accepted"),
            (MessageType::Control(ControlMessageType::Reject), _) => self.request_rejected(),
            (MessageType::Control(ControlMessageType::Wait), _) => self.request_postponed(),
            (MessageType::Control(ControlMessageType::PsRdy), _) => self.power_supply_ready(),
            (MessageType::Control(ControlMessageType::SoftReset), _) => {
                debug!("Soft reset");
                self.protocol_layer.reset_message_ids();
                self.response = Some(Response::Control(ControlMessageType::Accept));
                self.request_pending = false;
                self.retry_timer = None;
                self.stage_pps(self.pps_next.or(self.pps));
                self.state = State::WaitForCapabilities {
                    timer: Timer::start(TimerType::SinkWaitCap, self.clock.now_millis()),
                    retries: Counter::new(CounterType::Caps),
                };
            }
            (
                MessageType::Control(
                    ControlMessageType::GoodCRC
                    | ControlMessageType::Ping
                    | ControlMessageType::NotSupported
                    | ControlMessageType::DataResetComplete,
                ),
                _,
            ) => (),
            (MessageType::Data(DataMessageType::Bist | DataMessageType::Alert), _) => (),
            (message_type, _) => {
                debug!("Unsupported message {:?}", message_type);
                let response = if self.protocol_layer.spec_revision() < SpecificationRevision::R3_X {
                    ControlMessageType::Reject
                } else {
                    ControlMessageType::NotSupported
                };
                self.response = Some(Response::Control(response));
            }
        }

        Ok(())
    }

    fn evaluate_capabilities(&mut self, source_capabilities: SourceCapabilities) {
        let now = self.clock.now_millis();
        let selection = self
            .device_policy_manager
            .request(&source_capabilities, self.power_option, self.pps);

        self.event_sink.log_event(
            now,
            StatusEvent::SourceCapabilities {
                capabilities: &source_capabilities,
                selected: selection.as_ref().ok().map(PowerSource::object_position),
            },
        );
        self.source_capabilities = Some(source_capabilities);

        match selection {
            Ok(request) => {
                debug!("Request object position {}", request.object_position());
                self.requested = Some(request);
                self.response = Some(Response::Request(request));
                self.transition(now);
            }
            Err(error) => {
                warn!("No capability to request: {:?}", error);
                self.enter_default_power();
            }
        }
    }

    /// Wait for PS_RDY with the current preferences.
    fn transition(&mut self, now: u16) {
        self.request_pending = false;
        self.retry_timer = None;
        self.pps_timer.restart(now);
        self.state = State::TransitionSink {
            timer: Timer::start(TimerType::SinkRequestToPsReady, now),
            power_option: self.power_option,
            pps: self.pps,
        };
    }

    fn request_rejected(&mut self) {
        let State::TransitionSink { .. } = self.state else {
            debug!("Ignore rejection without outstanding request");
            return;
        };

        warn!("Request rejected");
        self.log(StatusEvent::Rejected);

        // Later changes start from what the source agreed to.
        if self.startup_contract.is_some() || self.contract.is_pps() {
            self.pps = self.accepted_pps;
        }
        self.power_option = self.accepted_power_option;
        self.keep_previous_power();
    }

    fn request_postponed(&mut self) {
        let State::TransitionSink { .. } = self.state else {
            debug!("Ignore wait without outstanding request");
            return;
        };

        debug!("Source busy, repeat request later");
        self.request_pending = true;
        self.retry_timer = Some(Timer::start(TimerType::SinkRequest, self.clock.now_millis()));
        self.keep_previous_power();
    }

    /// Return to the last power level that the source confirmed.
    fn keep_previous_power(&mut self) {
        if let Some(contract) = self.startup_contract.take() {
            self.state = State::Ready;
            self.establish(contract);
            return;
        }

        match self.contract {
            Contract::None => self.enter_default_power(),
            Contract::Default => self.state = State::DefaultPower,
            _ => self.state = State::Ready,
        }
    }

    fn power_supply_ready(&mut self) {
        let State::TransitionSink { power_option, pps, .. } = self.state else {
            debug!("Ignore PS_RDY without outstanding request");
            return;
        };

        self.state = State::Ready;
        self.accepted_power_option = power_option;

        match self.requested {
            Some(PowerSource::Pps(request)) => {
                // The PPS voltage may fall below the VBUS detection threshold.
                self.set_vbus_sense(false);
                self.accepted_pps = pps;
                self.pps_timer.restart(self.clock.now_millis());

                let contract = Contract::Pps {
                    voltage: request.raw_output_voltage(),
                    current: request.raw_operating_current(),
                };

                if let Some(target) = self.pps_next.take() {
                    debug!("PPS startup voltage ready, request {:?}", target);
                    self.pps = Some(target);
                    self.request_pending = true;
                    self.startup_contract = Some(contract);
                    self.log(StatusEvent::PpsStartup);
                } else {
                    self.establish(contract);
                }
            }
            Some(request) => {
                self.set_vbus_sense(true);
                self.pps_next = None;
                self.accepted_pps = None;

                let contract = self
                    .source_capabilities
                    .as_ref()
                    .and_then(|source_capabilities| request.pdo(source_capabilities))
                    .and_then(|pdo| pdo.power_info().ok())
                    .map_or(Contract::Default, |info| Contract::Fixed {
                        voltage: info.max_voltage,
                        current: info.max_current,
                    });
                self.establish(contract);
            }
            None => warn!("PS_RDY without request"),
        }
    }

    fn set_vbus_sense(&mut self, enabled: bool) {
        if let Err(error) = self.protocol_layer.driver().set_vbus_sense(enabled) {
            warn!("Failed to set VBUS sense: {:?}", error);
        }
    }

    /// Send the response to the last received message, if any.
    fn respond(&mut self) -> Result<(), Error> {
        let Some(response) = self.response.take() else {
            return Ok(());
        };

        // Let the source settle after its message was acknowledged.
        self.clock.delay_millis(TimerType::ResponseDelay.duration_millis());

        match response {
            Response::Control(message_type) => self.transmit_control_message(message_type),
            Response::Request(request) => self.transmit_request(request),
        }
    }

    fn send_request(&mut self, now: u16) -> Result<(), Error> {
        let Some(source_capabilities) = self.source_capabilities.as_ref() else {
            return Ok(());
        };

        self.request_pending = false;

        let request = match self
            .device_policy_manager
            .request(source_capabilities, self.power_option, self.pps)
        {
            Ok(request) => request,
            Err(error) => {
                warn!("No capability to request: {:?}", error);
                return Ok(());
            }
        };

        self.requested = Some(request);
        self.transition(now);

        self.transmit_request(request)
    }

    fn transmit_request(&mut self, request: PowerSource) -> Result<(), Error> {
        let message = self.protocol_layer.request_power(request)?;
        self.log(StatusEvent::MessageTx(&message));
        Ok(())
    }

    fn transmit_control_message(&mut self, message_type: ControlMessageType) -> Result<(), Error> {
        let message = self.protocol_layer.transmit_control_message(message_type)?;
        self.log(StatusEvent::MessageTx(&message));
        Ok(())
    }

    fn log(&mut self, event: StatusEvent<'_>) {
        let now = self.clock.now_millis();
        self.event_sink.log_event(now, event);
    }

    /// Whether a fixed or default power contract is established.
    pub fn is_power_ready(&self) -> bool {
        matches!(self.contract, Contract::Default | Contract::Fixed { .. })
    }

    /// Whether a PPS contract is established.
    pub fn is_pps_ready(&self) -> bool {
        self.contract.is_pps()
    }

    /// Whether a request is pending or awaiting PS_RDY.
    pub fn is_transitioning(&self) -> bool {
        self.request_pending || matches!(self.state, State::TransitionSink { .. })
    }

    /// Voltage of the established contract, in 50 mV units for fixed supplies, 20 mV units for PPS.
    pub fn ready_voltage(&self) -> u16 {
        self.contract.voltage()
    }

    /// Current of the established contract, in 10 mA units for fixed supplies, 50 mA units for PPS.
    pub fn ready_current(&self) -> u16 {
        self.contract.current()
    }

    /// The established contract.
    pub fn contract(&self) -> Contract {
        self.contract
    }

    /// The capabilities that the source advertised last.
    pub fn source_capabilities(&self) -> Option<&SourceCapabilities> {
        self.source_capabilities.as_ref()
    }

    /// Move the PPS operating point.
    ///
    /// Only accepted while a PPS contract is established, and if an APDO of the source covers the
    /// target voltage and current. The request goes out on the next [`Sink::step`].
    pub fn request_pps(&mut self, target: PpsTarget) -> bool {
        if !self.contract.is_pps() {
            return false;
        }

        let Some(source_capabilities) = self.source_capabilities.as_ref() else {
            return false;
        };

        if !source_capabilities
            .pps_pdos()
            .any(|(_, supply)| supply.covers(target))
        {
            debug!("No APDO covers {:?}", target);
            return false;
        }

        if self.pps != Some(target) {
            self.pps = Some(target);
            self.request_pending = true;
        }

        true
    }

    /// Change the fixed supply preference, renegotiating if it changed.
    pub fn set_power_option(&mut self, power_option: PowerOption) {
        if power_option == self.power_option {
            return;
        }

        self.power_option = power_option;
        if self.source_capabilities.is_some() {
            self.request_pending = true;
        }
    }

    /// Access the event sink, e.g. for reading the status log.
    pub fn event_sink(&mut self) -> &mut LOG {
        &mut self.event_sink
    }

    /// Access the device policy manager.
    pub fn device_policy_manager(&mut self) -> &mut DPM {
        &mut self.device_policy_manager
    }

    /// Access the driver.
    pub fn driver(&mut self) -> &mut DRIVER {
        self.protocol_layer.driver()
    }
}
