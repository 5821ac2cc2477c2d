//! Externally settable meter configuration.
//!
//! Every settable quantity implements [`Setting`]: a value is first validated and
//! only applied when valid, so a rejected value leaves the prior state unchanged.

use crate::{energy, energy::CountingPolicy, poll::RegisterSet};
use std::time::Duration;

/// Capability interface of one settable quantity.
pub trait Setting {
    type Value;

    fn validate(&self, value: &Self::Value) -> bool;

    fn apply(&mut self, value: Self::Value);

    /// Validates and applies `value`. Returns whether the value was accepted.
    fn set(&mut self, value: Self::Value) -> bool {
        if !self.validate(&value) {
            return false;
        }
        self.apply(value);
        true
    }
}

pub const MIN_REFRESH_RATE: u8 = 1;
pub const MAX_REFRESH_RATE: u8 = 10;

/// Poll rate of the data registers in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRate(u8);

impl RefreshRate {
    pub fn hz(&self) -> u8 {
        self.0
    }

    /// Freshness window of a decoded value.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.0 as f64)
    }

    /// Refresh period in milliseconds.
    pub fn refresh_time_ms(&self) -> u32 {
        1000 / self.0 as u32
    }
}

impl Default for RefreshRate {
    fn default() -> Self {
        Self(MIN_REFRESH_RATE)
    }
}

impl Setting for RefreshRate {
    type Value = u8;

    fn validate(&self, value: &u8) -> bool {
        (MIN_REFRESH_RATE..=MAX_REFRESH_RATE).contains(value)
    }

    fn apply(&mut self, value: u8) {
        self.0 = value;
    }
}

/// Measured line of a single-phase meter, `0` for L1 up to `2` for L3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseSelection(u8);

impl PhaseSelection {
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Line number, starting at 1.
    pub fn line(&self) -> u8 {
        self.0 + 1
    }
}

impl Setting for PhaseSelection {
    type Value = u8;

    fn validate(&self, value: &u8) -> bool {
        *value <= 2
    }

    fn apply(&mut self, value: u8) {
        self.0 = value;
    }
}

/// The energy counter selector of grid meters (0, 1 or 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSelector(CountingPolicy);

impl CounterSelector {
    pub fn policy(&self) -> CountingPolicy {
        self.0
    }
}

impl Default for CounterSelector {
    fn default() -> Self {
        Self(CountingPolicy::DeviceRaw)
    }
}

impl Setting for CounterSelector {
    type Value = u8;

    fn validate(&self, value: &u8) -> bool {
        CountingPolicy::from_selector(*value).is_some()
    }

    fn apply(&mut self, value: u8) {
        if let Some(policy) = CountingPolicy::from_selector(value) {
            self.0 = policy;
        }
    }
}

/// Additive power calibration of the three lines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerOffsets([f64; 3]);

impl PowerOffsets {
    pub fn new(offsets: [f64; 3]) -> Self {
        Self(offsets)
    }

    /// Offset of line `1..=3`.
    pub fn get(&self, line: u8) -> Option<f64> {
        self.0.get(line.checked_sub(1)? as usize).copied()
    }

    /// Offset of the aggregate power, the sum of the line offsets.
    pub fn total(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Applies the offsets to the power registers of the register sets.
    pub fn apply_to(&self, sets: &mut [RegisterSet]) {
        for reg in sets.iter_mut().flat_map(|set| set.iter_mut()) {
            if reg.name() == energy::POWER {
                reg.set_offset(self.total());
                continue;
            }
            let line = (1..=3).find(|line| reg.name() == format!("/Ac/L{line}/Power"));
            if let Some(offset) = line.and_then(|line| self.get(line)) {
                reg.set_offset(offset);
            }
        }
    }
}

impl Setting for PowerOffsets {
    /// Line number and offset in W.
    type Value = (u8, f64);

    fn validate(&self, (line, offset): &(u8, f64)) -> bool {
        (1..=3).contains(line) && offset.is_finite()
    }

    fn apply(&mut self, (line, offset): (u8, f64)) {
        let index = (line as usize).checked_sub(1);
        if let Some(slot) = index.and_then(|index| self.0.get_mut(index)) {
            *slot = offset;
        }
    }
}

/// All settable quantities of one meter.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterSettings {
    pub refresh_rate: RefreshRate,
    pub phase: PhaseSelection,
    pub counter: CounterSelector,
    pub power_offsets: PowerOffsets,
}
