//! Timers that are used by the protocol layer and policy engine.
//!
//! Time is a free-running millisecond counter that wraps at `u16::MAX`. Deadlines are
//! evaluated with wrapping subtraction, so every timer tolerates one wrap of the counter.

/// The clock capability to implement by the user application.
pub trait Clock {
    /// A monotonic millisecond counter, wrapping at `u16::MAX`.
    fn now_millis(&self) -> u16;

    /// Block for a short, bounded number of milliseconds.
    fn delay_millis(&mut self, milliseconds: u16);
}

impl<C: Clock> Clock for &mut C {
    fn now_millis(&self) -> u16 {
        C::now_millis(self)
    }

    fn delay_millis(&mut self, milliseconds: u16) {
        C::delay_millis(self, milliseconds)
    }
}

/// Types of timers that are used for timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    /// Interval between transceiver polls when no interrupt is pending.
    Poll,
    /// De-jitter delay between an outgoing GoodCRC and the response that follows it.
    ResponseDelay,
    /// Wait for Source_Capabilities after attach.
    SinkWaitCap,
    /// Wait for PS_RDY after a request (tSenderResponse + tPSTransition).
    SinkRequestToPsReady,
    /// Re-request interval that keeps a PPS contract alive.
    SinkPpsPeriodic,
    /// Back-off before repeating a request that the source answered with Wait (tSinkRequest).
    SinkRequest,
}

impl TimerType {
    /// The timeout of a timer type in milliseconds.
    pub const fn duration_millis(self) -> u16 {
        match self {
            TimerType::Poll => 100,
            TimerType::ResponseDelay => 2,
            TimerType::SinkWaitCap => 350,
            TimerType::SinkRequestToPsReady => 580,
            TimerType::SinkPpsPeriodic => 5000,
            TimerType::SinkRequest => 100,
        }
    }
}

/// A started timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timer {
    timer_type: TimerType,
    start: u16,
}

impl Timer {
    /// Start a timer of the given type at `now`.
    pub fn start(timer_type: TimerType, now: u16) -> Self {
        Self { timer_type, start: now }
    }

    /// Restart the timer at `now`.
    pub fn restart(&mut self, now: u16) {
        self.start = now;
    }

    /// Milliseconds since the timer was started.
    pub fn elapsed(&self, now: u16) -> u16 {
        now.wrapping_sub(self.start)
    }

    /// Whether the timeout has passed.
    pub fn is_expired(&self, now: u16) -> bool {
        self.elapsed(now) >= self.timer_type.duration_millis()
    }

    /// The type of this timer.
    pub fn timer_type(&self) -> TimerType {
        self.timer_type
    }
}
