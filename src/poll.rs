//! Batched, staleness-aware register polling.
//!
//! Registers are grouped into [`RegisterSet`]s that can each be fetched with a
//! single Modbus read. A set is only read when at least one of its members is
//! stale, and only the stale members are decoded and published.

use crate::{error::Result, protocol::Register, publish::Publisher};
use log::*;
use std::time::{Duration, Instant};

/// Maximum number of registers a single Modbus read may request.
pub const MAX_READ_QUANTITY: u16 = 125;

/// Register level access to a device.
///
/// Implemented for the synchronous `tokio-modbus` client context, see
/// [`crate::tokio_sync`].
pub trait RegisterIo {
    /// Reads `quantity` input registers starting at `address`.
    fn read_input_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>>;

    /// Reads `quantity` holding registers starting at `address`.
    fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>>;

    /// Writes `words` to consecutive holding registers starting at `address`.
    fn write_multiple_registers(&mut self, address: u16, words: &[u16]) -> Result<()>;
}

/// Receives changed values of the registers it subscribes to.
pub trait ChangeHandler {
    /// Whether changes of the register `name` are of interest.
    fn handles(&self, name: &str) -> bool;

    /// Called after a decode of a subscribed register produced a different value.
    fn on_change(
        &mut self,
        name: &str,
        value: Option<f64>,
        now: Instant,
        publisher: &mut dyn Publisher,
    );
}

impl ChangeHandler for () {
    fn handles(&self, _name: &str) -> bool {
        false
    }

    fn on_change(&mut self, _: &str, _: Option<f64>, _: Instant, _: &mut dyn Publisher) {}
}

/// An address-ordered group of registers fetched with one read.
#[derive(Debug, Clone, Default)]
pub struct RegisterSet {
    registers: Vec<Register>,
}

impl RegisterSet {
    /// Creates a set, ordering the registers by address.
    pub fn new(mut registers: Vec<Register>) -> Self {
        registers.sort_by_key(|reg| reg.address());
        Self { registers }
    }

    /// Splits registers into sets whose span does not exceed [`MAX_READ_QUANTITY`].
    pub fn pack(mut registers: Vec<Register>) -> Vec<RegisterSet> {
        registers.sort_by_key(|reg| reg.address());
        let mut sets: Vec<Vec<Register>> = Vec::new();
        for reg in registers {
            let end = reg.address() as u32 + reg.word_count() as u32;
            match sets.last_mut() {
                Some(set) if end - set[0].address() as u32 <= MAX_READ_QUANTITY as u32 => {
                    set.push(reg)
                }
                _ => sets.push(vec![reg]),
            }
        }
        sets.into_iter().map(|registers| Self { registers }).collect()
    }

    /// Start address and quantity of the read covering all registers.
    pub fn span(&self) -> (u16, u16) {
        match (self.registers.first(), self.registers.iter().map(end_address).max()) {
            (Some(first), Some(end)) => (first.address(), end - first.address()),
            _ => (0, 0),
        }
    }

    /// Sets the freshness window of every register.
    pub fn set_max_age(&mut self, max_age: Duration) {
        for reg in self.registers.iter_mut() {
            reg.max_age = max_age;
        }
    }

    /// Whether every register is still younger than its `max_age`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.registers.iter().all(|reg| {
            reg.updated
                .is_some_and(|updated| now.saturating_duration_since(updated) < reg.max_age)
        })
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.registers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Register> {
        self.registers.iter_mut()
    }

    pub fn find(&self, name: &str) -> Option<&Register> {
        self.registers.iter().find(|reg| reg.name() == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Register> {
        self.registers.iter_mut().find(|reg| reg.name() == name)
    }

    /// Runs one poll of this set.
    ///
    /// Returns `Ok(None)` without any wire traffic when the set is fresh, otherwise
    /// the latency of the read. A failed read leaves every register untouched.
    pub fn poll(
        &mut self,
        io: &mut dyn RegisterIo,
        now: Instant,
        publisher: &mut dyn Publisher,
        handler: &mut dyn ChangeHandler,
    ) -> Result<Option<Duration>> {
        if self.is_empty() || self.is_fresh(now) {
            return Ok(None);
        }

        let (start, count) = self.span();
        let started = Instant::now();
        let words = io.read_input_registers(start, count).inspect_err(|err| {
            error!(
                "Error reading registers {:#06x}-{:#06x}: {err}",
                start,
                start as u32 + count as u32 - 1
            )
        })?;
        let latency = started.elapsed();

        for reg in self.registers.iter_mut() {
            let due = reg
                .updated
                .is_none_or(|updated| now.saturating_duration_since(updated) > reg.max_age);
            if !due {
                continue;
            }
            let base = (reg.address() - start) as usize;
            let end = base + reg.word_count() as usize;
            let changed = reg.decode(words.get(base..end).unwrap_or_default());
            reg.updated = Some(now);
            if changed {
                publisher.publish(reg.name(), reg.value(), reg.text());
                if handler.handles(reg.name()) {
                    handler.on_change(reg.name(), reg.value(), now, publisher);
                }
            }
        }
        trace!("Read registers {start:#06x}+{count} in {latency:?}");
        Ok(Some(latency))
    }
}

fn end_address(reg: &Register) -> u16 {
    reg.address() + reg.word_count()
}

/// Reads each register individually from the holding registers and publishes it.
pub fn read_info(
    registers: &mut [Register],
    io: &mut dyn RegisterIo,
    now: Instant,
    publisher: &mut dyn Publisher,
) -> Result<()> {
    for reg in registers.iter_mut() {
        let words = io
            .read_holding_registers(reg.address(), reg.word_count())
            .inspect_err(|err| {
                error!(
                    "Error reading register {:#06x} ({}): {err}",
                    reg.address(),
                    reg.name()
                )
            })?;
        reg.decode(&words);
        reg.updated = Some(now);
        publisher.publish(reg.name(), reg.value(), reg.text());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::fmt_w;
    use crate::publish::PublishedState;
    use crate::testing::SimulatedDevice;
    use assert_matches::assert_matches;

    const MAX_AGE: Duration = Duration::from_secs(1);

    fn power_set() -> RegisterSet {
        let mut set = RegisterSet::new(vec![
            Register::f32b(0x000c, "/Ac/L1/Power").with_formatter(fmt_w),
            Register::f32b(0x0000, "/Ac/L1/Voltage"),
            Register::f32b(0x0006, "/Ac/L1/Current"),
        ]);
        set.set_max_age(MAX_AGE);
        set
    }

    #[derive(Default)]
    struct Recorder(Vec<(String, Option<f64>)>);

    impl ChangeHandler for Recorder {
        fn handles(&self, name: &str) -> bool {
            name == "/Ac/L1/Power"
        }

        fn on_change(&mut self, name: &str, value: Option<f64>, _: Instant, _: &mut dyn Publisher) {
            self.0.push((name.to_string(), value));
        }
    }

    #[test]
    fn span_covers_all_registers() {
        let set = power_set();
        assert_eq!(set.span(), (0x0000, 0x000e));
        assert_eq!(
            set.iter().map(|reg| reg.address()).collect::<Vec<_>>(),
            vec![0x0000, 0x0006, 0x000c]
        );
        assert_eq!(RegisterSet::default().span(), (0, 0));
    }

    #[test]
    fn pack_respects_read_limit() {
        let sets = RegisterSet::pack(vec![
            Register::f32b(0x0160, "/Ac/L1/Energy/Reverse"),
            Register::f32b(0x0000, "/Ac/L1/Voltage"),
            Register::f32b(0x004a, "/Ac/Energy/ReverseSum"),
            Register::f32b(0x015a, "/Ac/L1/Energy/Forward"),
            Register::f32b(0x007b, "/Edge"),
            Register::f32b(0x007c, "/Beyond"),
        ]);
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0].span(), (0x0000, 0x007d));
        assert_eq!(sets[1].span(), (0x007c, 0x0002));
        assert_eq!(sets[2].span(), (0x015a, 0x0008));
    }

    #[test]
    fn freshness_gate() {
        let mut device = SimulatedDevice::new();
        device.set_input_f32(0x000c, 100.0);
        let mut set = power_set();
        let mut state = PublishedState::new();
        let t0 = Instant::now();

        assert_matches!(set.poll(&mut device, t0, &mut state, &mut ()), Ok(Some(_)));
        assert_eq!(device.reads, vec![(0x0000, 0x000e)]);

        // every member younger than max_age: no wire traffic
        let t1 = t0 + Duration::from_millis(500);
        assert_matches!(set.poll(&mut device, t1, &mut state, &mut ()), Ok(None));
        assert_eq!(device.reads.len(), 1);

        // stale again: exactly one read for the whole set
        let t2 = t0 + Duration::from_millis(1500);
        assert_matches!(set.poll(&mut device, t2, &mut state, &mut ()), Ok(Some(_)));
        assert_eq!(device.reads.len(), 2);
    }

    #[test]
    fn earliest_expiring_member_refetches_group() {
        let mut device = SimulatedDevice::new();
        let mut set = power_set();
        let mut state = PublishedState::new();
        let t0 = Instant::now();
        set.poll(&mut device, t0, &mut state, &mut ()).unwrap();
        set.find_mut("/Ac/L1/Voltage").unwrap().max_age = Duration::from_millis(100);

        let t1 = t0 + Duration::from_millis(200);
        device.set_input_f32(0x0000, 230.0);
        device.set_input_f32(0x000c, 50.0);
        assert_matches!(set.poll(&mut device, t1, &mut state, &mut ()), Ok(Some(_)));
        assert_eq!(device.reads.len(), 2);
        // only the stale member was decoded
        assert_eq!(state.value("/Ac/L1/Voltage"), Some(230.0));
        assert_eq!(state.value("/Ac/L1/Power"), Some(0.0));
        assert_eq!(set.find("/Ac/L1/Power").unwrap().last_update(), Some(t0));
    }

    #[test]
    fn publishes_only_changes() {
        let mut device = SimulatedDevice::new();
        device.set_input_f32(0x000c, 100.0);
        let mut set = power_set();
        let mut state = PublishedState::new();
        let mut recorder = Recorder::default();
        let t0 = Instant::now();

        set.poll(&mut device, t0, &mut state, &mut recorder).unwrap();
        assert_eq!(state.value("/Ac/L1/Power"), Some(100.0));
        assert_eq!(state.get("/Ac/L1/Power").unwrap().text.as_deref(), Some("100.0W"));

        set.poll(&mut device, t0 + 2 * MAX_AGE, &mut state, &mut recorder)
            .unwrap();
        assert_eq!(state.updates("/Ac/L1/Power"), 1);

        device.set_input_f32(0x000c, -20.0);
        set.poll(&mut device, t0 + 4 * MAX_AGE, &mut state, &mut recorder)
            .unwrap();
        assert_eq!(state.updates("/Ac/L1/Power"), 2);
        assert_eq!(
            recorder.0,
            vec![
                ("/Ac/L1/Power".to_string(), Some(100.0)),
                ("/Ac/L1/Power".to_string(), Some(-20.0))
            ]
        );
    }

    #[test]
    fn invalid_decode_publishes_absent() {
        let mut device = SimulatedDevice::new();
        device.set_input_f32(0x000c, 100.0);
        let mut set = power_set();
        let mut state = PublishedState::new();
        let t0 = Instant::now();
        set.poll(&mut device, t0, &mut state, &mut ()).unwrap();

        device.set_input_f32(0x000c, f32::NAN);
        set.poll(&mut device, t0 + 2 * MAX_AGE, &mut state, &mut ())
            .unwrap();
        assert_eq!(state.updates("/Ac/L1/Power"), 2);
        assert_eq!(state.value("/Ac/L1/Power"), None);
    }

    #[test]
    fn short_response_is_a_decode_fault() {
        let mut device = SimulatedDevice::new();
        device.truncate_responses = Some(4);
        let mut set = power_set();
        let mut state = PublishedState::new();
        set.poll(&mut device, Instant::now(), &mut state, &mut ())
            .unwrap();
        assert_eq!(state.value("/Ac/L1/Voltage"), Some(0.0));
        assert!(!set.find("/Ac/L1/Power").unwrap().is_valid());
        assert!(set.find("/Ac/L1/Power").unwrap().last_update().is_some());
    }

    #[test]
    fn read_fault_aborts_without_touching_registers() {
        let mut device = SimulatedDevice::new();
        device.exception = Some(tokio_modbus::ExceptionCode::ServerDeviceFailure);
        let mut set = power_set();
        let mut state = PublishedState::new();

        assert_matches!(
            set.poll(&mut device, Instant::now(), &mut state, &mut ()),
            Err(Error::TokioExceptionError(
                tokio_modbus::ExceptionCode::ServerDeviceFailure
            ))
        );
        assert!(set.iter().all(|reg| reg.last_update().is_none()));
        assert_eq!(state.iter().count(), 0);
    }

    #[test]
    fn info_registers_read_individually() {
        let mut device = SimulatedDevice::new();
        device.set_holding_u32(0xfc00, 123456);
        device.set_holding(0xfc02, 112);
        let mut regs = vec![
            Register::u32b(0xfc00, "/Serial"),
            Register::u16(0xfc02, "/HardwareVersion"),
        ];
        let mut state = PublishedState::new();
        read_info(&mut regs, &mut device, Instant::now(), &mut state).unwrap();
        assert_eq!(device.holding_reads, vec![(0xfc00, 2), (0xfc02, 1)]);
        assert_eq!(state.value("/Serial"), Some(123456.0));
        assert_eq!(state.value("/HardwareVersion"), Some(112.0));
    }
}
