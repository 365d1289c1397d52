//! Definition of counters, used for retry attempts and message IDs.

/// Counter errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The counter wrapped past its maximum value.
    Exceeded,
}

/// Kinds of counters, each with its own maximum value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterType {
    /// Get_Source_Cap attempts while waiting for capabilities.
    Caps,
    /// Attempts to read line events from the transceiver per poll.
    Alert,
    /// 3-bit message ID.
    MessageId,
    /// Transmit retries after a discarded message.
    Retry,
}

/// A bounded counter that wraps to zero after its maximum value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Counter {
    value: u8,
    max_value: u8,
}

impl Counter {
    /// Create a new counter of the given type, starting at zero.
    pub fn new(counter_type: CounterType) -> Self {
        let max_value = match counter_type {
            CounterType::Caps => 3,
            CounterType::Alert => 3,
            CounterType::MessageId => 7,
            CounterType::Retry => 2,
        };

        Self { value: 0, max_value }
    }

    /// Create a new counter with an initial value.
    pub fn new_from_value(counter_type: CounterType, value: u8) -> Self {
        let mut counter = Self::new(counter_type);
        counter.set(value);
        counter
    }

    /// Set the counter value, wrapping it into the valid range.
    pub fn set(&mut self, value: u8) {
        self.value = value % (self.max_value + 1);
    }

    /// The current value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// The largest value before wrapping.
    pub fn max_value(&self) -> u8 {
        self.max_value
    }

    /// Increment the counter.
    ///
    /// Fails when the counter wraps back to zero.
    pub fn increment(&mut self) -> Result<(), Error> {
        self.set(self.value.wrapping_add(1));

        if self.value == 0 { Err(Error::Exceeded) } else { Ok(()) }
    }

    /// Reset to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}
