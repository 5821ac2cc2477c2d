//! Per-device orchestration of info reads, register sets, poll cycles and settings.

use crate::{
    energy::{CountingPolicy, EnergyAccount},
    error::Result,
    model::{self, Model, Variant},
    poll::{self, ChangeHandler, RegisterIo, RegisterSet},
    protocol::{self as proto, Register, NR_PHASES},
    publish::Publisher,
    settings::{MeterSettings, Setting},
    store::EnergyStore,
};
use log::*;
use std::time::Instant;

/// One polled Eastron meter.
///
/// The register sets are rebuilt ("reinit") on the first [`Meter::update`] and
/// after every change of the phase configuration, the selected phase or the
/// refresh rate. Settings changes take effect on the next cycle.
#[derive(Debug)]
pub struct Meter {
    model: Model,
    settings: MeterSettings,
    info: Vec<Register>,
    sets: Vec<RegisterSet>,
    energy: Option<EnergyAccount>,
    phases: u8,
    reinit: bool,
    initialised: bool,
}

impl Meter {
    /// Creates the meter. The energy account of three-phase models is seeded from
    /// `store`; single-phase models have no energy accounting.
    pub fn new(
        model: Model,
        settings: MeterSettings,
        store: Box<dyn EnergyStore>,
        now: Instant,
    ) -> Result<Self> {
        let energy = match model.variant().counting_policy(settings.counter) {
            Some(policy) => Some(EnergyAccount::new(policy, store, now)?),
            None => None,
        };
        Ok(Self {
            model,
            settings,
            info: model.info_registers(),
            sets: Vec::new(),
            energy,
            phases: 0,
            reinit: true,
            initialised: false,
        })
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn settings(&self) -> &MeterSettings {
        &self.settings
    }

    /// Number of measured lines, known after the first initialisation.
    pub fn phases(&self) -> u8 {
        self.phases
    }

    pub fn energy(&self) -> Option<&EnergyAccount> {
        self.energy.as_ref()
    }

    pub fn register_sets(&self) -> &[RegisterSet] {
        &self.sets
    }

    /// All info and data registers.
    pub fn registers(&self) -> impl Iterator<Item = &Register> {
        self.info
            .iter()
            .chain(self.sets.iter().flat_map(|set| set.iter()))
    }

    pub fn register(&self, name: &str) -> Option<&Register> {
        self.registers().find(|reg| reg.name() == name)
    }

    /// The identifier `ea_<serial>`, once the serial number was read.
    pub fn identifier(&self) -> Option<String> {
        let serial = self.info.iter().find(|reg| reg.name() == model::SERIAL)?;
        Some(format!("ea_{}", serial.value()? as u32))
    }

    /// Reads the info registers and rebuilds the data register sets.
    pub fn init(
        &mut self,
        io: &mut dyn RegisterIo,
        now: Instant,
        publisher: &mut dyn Publisher,
    ) -> Result<()> {
        self.info = self.model.info_registers();
        poll::read_info(&mut self.info, io, now, publisher)?;

        self.phases = match self.model.variant() {
            Variant::SinglePhase => 1,
            _ => {
                let config = self
                    .info
                    .iter()
                    .find(|reg| reg.name() == model::PHASE_CONFIG)
                    .and_then(|reg| reg.value());
                match config {
                    Some(config) => NR_PHASES[config as usize],
                    None => {
                        warn!("Invalid phase configuration, polling no line registers");
                        0
                    }
                }
            }
        };

        let regs = self.model.data_registers(self.phases, self.settings.phase);
        self.sets = RegisterSet::pack(regs);
        for set in self.sets.iter_mut() {
            set.set_max_age(self.settings.refresh_rate.max_age());
        }
        if self.energy.is_some() {
            self.settings.power_offsets.apply_to(&mut self.sets);
        }
        self.publish_static(publisher);
        if !self.initialised {
            if let Some(energy) = &self.energy {
                energy.publish_initial(publisher);
            }
            self.initialised = true;
        }
        self.reinit = false;

        debug!(
            "Initialised {} ({} phases) with {} register sets: {:?}",
            self.model,
            self.phases,
            self.sets.len(),
            self.sets.iter().map(|set| set.span()).collect::<Vec<_>>()
        );
        Ok(())
    }

    fn publish_static(&self, publisher: &mut dyn Publisher) {
        let name = self.model.product_name();
        publisher.publish("/ProductName", None, Some(name.to_string()));
        publisher.publish(
            "/Model",
            Some(self.model.code() as f64),
            Some(name.to_string()),
        );
        publisher.publish("/Role", None, Some(self.model.variant().role().to_string()));
        self.publish_refresh_rate(publisher);

        if self.model.variant() == Variant::SinglePhase {
            let phase = self.settings.phase;
            publisher.publish("/Phase", Some(phase.index() as f64), None);
            publisher.publish("/Ac/Phase", Some(phase.line() as f64), None);
        }

        if let Some(energy) = &self.energy {
            if let Some(selector) = energy.policy().selector() {
                publisher.publish(
                    "/EnergyCounter",
                    Some(selector as f64),
                    Some(energy.policy().to_string()),
                );
            }
            for line in 1..=3 {
                self.publish_power_offset(line, publisher);
            }
        }
    }

    fn publish_refresh_rate(&self, publisher: &mut dyn Publisher) {
        let rate = self.settings.refresh_rate;
        publisher.publish("/RefreshRate", Some(rate.hz() as f64), None);
        publisher.publish(
            "/RefreshTime",
            Some(rate.refresh_time_ms() as f64),
            Some(format!("{} ms", rate.refresh_time_ms())),
        );
    }

    fn publish_power_offset(&self, line: u8, publisher: &mut dyn Publisher) {
        let offset = self.settings.power_offsets.get(line);
        publisher.publish(
            &format!("/Ac/L{line}/PowerOffset"),
            offset,
            offset.map(proto::fmt_w),
        );
    }

    /// Runs one poll cycle.
    ///
    /// A pending reinit runs first. Every register set is polled in address order,
    /// then the energy account's per-cycle hook runs. The first failing read aborts
    /// the cycle.
    pub fn update(
        &mut self,
        io: &mut dyn RegisterIo,
        now: Instant,
        publisher: &mut dyn Publisher,
    ) -> Result<()> {
        if self.reinit {
            self.init(io, now, publisher)?;
        }

        let mut no_hooks = ();
        let handler: &mut dyn ChangeHandler = match self.energy.as_mut() {
            Some(energy) => energy,
            None => &mut no_hooks,
        };
        for set in self.sets.iter_mut() {
            set.poll(io, now, publisher, handler)?;
        }

        if let Some(energy) = self.energy.as_mut() {
            energy.on_cycle(now, publisher);
        }
        Ok(())
    }

    /// Sets the poll rate in Hz (1 to 10). Rebuilds the register sets on the next cycle.
    pub fn set_refresh_rate(&mut self, rate: u8, publisher: &mut dyn Publisher) -> bool {
        if !self.settings.refresh_rate.set(rate) {
            warn!("Rejected refresh rate {rate}");
            return false;
        }
        self.publish_refresh_rate(publisher);
        self.reinit = true;
        true
    }

    /// Selects the measured line of a single-phase meter (0 to 2).
    pub fn set_phase(&mut self, phase: u8) -> bool {
        if self.model.variant() != Variant::SinglePhase || !self.settings.phase.set(phase) {
            warn!("Rejected phase {phase} for {}", self.model);
            return false;
        }
        self.reinit = true;
        true
    }

    /// Selects the counting policy of a three-phase grid meter (0, 1 or 2).
    pub fn set_energy_counter(&mut self, selector: u8, publisher: &mut dyn Publisher) -> bool {
        let Some(energy) = self.energy.as_mut() else {
            warn!("{} has no energy accounting", self.model);
            return false;
        };
        let accepted = self.settings.counter.validate(&selector)
            && CountingPolicy::from_selector(selector)
                .is_some_and(|policy| energy.set_policy(policy));
        if !accepted {
            warn!("Rejected energy counter {selector} for {}", self.model);
            return false;
        }
        self.settings.counter.apply(selector);
        let policy = self.settings.counter.policy();
        info!("Energy counter set to {policy}");
        publisher.publish("/EnergyCounter", Some(selector as f64), Some(policy.to_string()));
        true
    }

    /// Sets the power calibration offset of line `1..=3` in W.
    ///
    /// The line power register gets the offset, the aggregate power register the
    /// sum of all three line offsets.
    pub fn set_power_offset(
        &mut self,
        line: u8,
        offset: f64,
        publisher: &mut dyn Publisher,
    ) -> bool {
        if self.energy.is_none() || !self.settings.power_offsets.set((line, offset)) {
            warn!("Rejected power offset {offset} for line {line}");
            return false;
        }
        self.settings.power_offsets.apply_to(&mut self.sets);
        self.publish_power_offset(line, publisher);
        true
    }

    /// Writes `value` to the writable register `name`.
    ///
    /// The value is validated before anything is sent. A successful write triggers
    /// a reinit on the next cycle.
    pub fn write_register(
        &mut self,
        io: &mut dyn RegisterIo,
        name: &str,
        value: f64,
    ) -> Result<()> {
        let reg = self
            .registers()
            .find(|reg| reg.name() == name)
            .ok_or_else(|| proto::Error::UnknownRegister(name.to_string()))?;
        let words = reg.encode_for_write(value)?;
        let address = reg.address();
        io.write_multiple_registers(address, &words)?;
        info!("Wrote {value} to {name} ({address:#06x})");
        self.reinit = true;
        Ok(())
    }

    /// Zeroes the energy accumulators. Returns `false` if the model has none.
    pub fn reset_energy(&mut self, now: Instant, publisher: &mut dyn Publisher) -> Result<bool> {
        match self.energy.as_mut() {
            Some(energy) => {
                energy.reset(now, publisher)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
