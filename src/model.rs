//! Register tables of the supported Eastron SDM meters.
//!
//! All models share the info registers (serial number, hardware and firmware
//! version) in the holding register space. Three-phase models add the writable
//! phase configuration, which selects how many `/Ac/L{n}/*` groups are polled.

use crate::{
    energy::{self, CountingPolicy},
    protocol::{self as proto, fmt_a, fmt_hz, fmt_kwh, fmt_v, fmt_w, Register, PHASE_CONFIGS},
    settings::{CounterSelector, PhaseSelection},
};
use std::{fmt, str::FromStr};

pub const SERIAL: &str = "/Serial";
pub const HARDWARE_VERSION: &str = "/HardwareVersion";
pub const FIRMWARE_VERSION: &str = "/FirmwareVersion";
pub const PHASE_CONFIG: &str = "/PhaseConfig";

/// A supported meter model, identified by the code in its hardware version register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    Sdm72dm,
    Sdm72dm2,
    Sdm120m,
    Sdm230Modbus,
    Sdm630Modbus,
    Sdm630Mct,
    /// SDM630-MCT with 40 mA current transformers, installed on the inverter side.
    Sdm630Mct40,
}

/// How a model measures and accounts energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// One line, selected by [`PhaseSelection`]. Energy comes straight from the device.
    SinglePhase,
    /// Up to three lines, with local energy accounting.
    ThreePhase,
    /// Three-phase meter measuring an inverter output. Power is published with
    /// the opposite sign and energy is accounted by net metering.
    ThreePhaseInverter,
}

impl Variant {
    /// The counting policy of the energy account, `None` without energy accounting.
    pub fn counting_policy(&self, selector: CounterSelector) -> Option<CountingPolicy> {
        match self {
            Variant::SinglePhase => None,
            Variant::ThreePhase => Some(selector.policy()),
            Variant::ThreePhaseInverter => Some(CountingPolicy::NetMetering),
        }
    }

    /// Whether power registers are published with the opposite sign.
    pub fn inverts_power(&self) -> bool {
        matches!(self, Variant::ThreePhaseInverter)
    }

    pub fn role(&self) -> &'static str {
        match self {
            Variant::ThreePhaseInverter => "pvinverter",
            _ => "grid",
        }
    }
}

impl Model {
    pub const ALL: [Model; 7] = [
        Model::Sdm72dm,
        Model::Sdm72dm2,
        Model::Sdm120m,
        Model::Sdm230Modbus,
        Model::Sdm630Modbus,
        Model::Sdm630Mct,
        Model::Sdm630Mct40,
    ];

    pub fn code(&self) -> u16 {
        match self {
            Model::Sdm72dm => 132,
            Model::Sdm72dm2 => 137,
            Model::Sdm120m => 32,
            Model::Sdm230Modbus => 43,
            Model::Sdm630Modbus => 112,
            Model::Sdm630Mct => 121,
            Model::Sdm630Mct40 => 136,
        }
    }

    pub fn product_name(&self) -> &'static str {
        match self {
            Model::Sdm72dm => "SDM72D-M",
            Model::Sdm72dm2 => "SDM72D-M-2",
            Model::Sdm120m => "SDM120-M",
            Model::Sdm230Modbus => "SDM230-Modbus",
            Model::Sdm630Modbus => "SDM630-Modbus",
            Model::Sdm630Mct => "SDM630-MCT",
            Model::Sdm630Mct40 => "SDM630-MCT40",
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            Model::Sdm120m | Model::Sdm230Modbus => Variant::SinglePhase,
            Model::Sdm630Mct40 => Variant::ThreePhaseInverter,
            _ => Variant::ThreePhase,
        }
    }

    /// Holding registers read one by one when the meter is (re)initialised.
    pub fn info_registers(&self) -> Vec<Register> {
        let mut regs = vec![
            Register::u32b(0xfc00, SERIAL),
            Register::u16(0xfc02, HARDWARE_VERSION),
            Register::u16(0xfc03, FIRMWARE_VERSION),
        ];
        if self.variant() != Variant::SinglePhase {
            regs.push(
                Register::f32b(0x000a, PHASE_CONFIG)
                    .with_text(PHASE_CONFIGS)
                    .writable(0.0..=3.0),
            );
        }
        regs
    }

    /// Input registers polled on every cycle.
    ///
    /// `phases` is the number of measured lines of a three-phase model, `phase` the
    /// measured line of a single-phase model.
    pub fn data_registers(&self, phases: u8, phase: PhaseSelection) -> Vec<Register> {
        match self.variant() {
            Variant::SinglePhase => {
                let mut regs = vec![
                    Register::f32b(0x000c, energy::POWER).with_formatter(fmt_w),
                    Register::f32b(0x0006, "/Ac/Current").with_formatter(fmt_a),
                    Register::f32b(0x0046, "/Ac/Frequency").with_formatter(fmt_hz),
                    Register::f32b(0x0048, energy::FORWARD).with_formatter(fmt_kwh),
                    Register::f32b(0x004a, energy::REVERSE).with_formatter(fmt_kwh),
                ];
                regs.extend(line_registers(phase.line(), 0));
                regs.extend([
                    Register::f32b(0x0048, format!("/Ac/L{}/Energy/Forward", phase.line()))
                        .with_formatter(fmt_kwh),
                    Register::f32b(0x004a, format!("/Ac/L{}/Energy/Reverse", phase.line()))
                        .with_formatter(fmt_kwh),
                ]);
                regs
            }
            variant => {
                let mut regs = vec![
                    Register::f32b(0x0034, energy::POWER).with_formatter(fmt_w),
                    Register::f32b(0x0030, "/Ac/Current").with_formatter(fmt_a),
                    Register::f32b(0x0046, "/Ac/Frequency").with_formatter(fmt_hz),
                    Register::f32b(0x0048, energy::DEVICE_FORWARD).with_formatter(fmt_kwh),
                    Register::f32b(0x004a, energy::DEVICE_REVERSE).with_formatter(fmt_kwh),
                ];
                for line in 1..=phases.min(3) {
                    let shift = 2 * (line as u16 - 1);
                    regs.extend(line_registers(line, shift));
                    regs.extend([
                        Register::f32b(0x015a + shift, format!("/Ac/L{line}/Energy/Forward"))
                            .with_formatter(fmt_kwh),
                        Register::f32b(0x0160 + shift, format!("/Ac/L{line}/Energy/Reverse"))
                            .with_formatter(fmt_kwh),
                    ]);
                }
                if variant.inverts_power() {
                    regs = regs.into_iter().map(invert_power).collect();
                }
                regs
            }
        }
    }
}

fn line_registers(line: u8, shift: u16) -> [Register; 4] {
    [
        Register::f32b(shift, format!("/Ac/L{line}/Voltage")).with_formatter(fmt_v),
        Register::f32b(0x0006 + shift, format!("/Ac/L{line}/Current")).with_formatter(fmt_a),
        Register::f32b(0x000c + shift, format!("/Ac/L{line}/Power")).with_formatter(fmt_w),
        Register::f32b(0x001e + shift, format!("/Ac/L{line}/PowerFactor")),
    ]
}

fn invert_power(reg: Register) -> Register {
    let name = reg.name();
    if name == energy::POWER || (name.starts_with("/Ac/L") && name.ends_with("/Power")) {
        reg.inverted()
    } else {
        reg
    }
}

impl TryFrom<u16> for Model {
    type Error = proto::Error;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Model::ALL
            .into_iter()
            .find(|model| model.code() == code)
            .ok_or_else(|| proto::Error::UnknownModel(code.to_string()))
    }
}

impl FromStr for Model {
    type Err = proto::Error;

    /// Accepts the product name (`SDM630-Modbus`), the name without dashes
    /// (`sdm630modbus`) or the model code (`112`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u16>() {
            return Model::try_from(code);
        }
        let squash = |name: &str| name.replace('-', "").to_ascii_lowercase();
        let wanted = squash(s.trim());
        Model::ALL
            .into_iter()
            .find(|model| squash(model.product_name()) == wanted)
            .ok_or_else(|| proto::Error::UnknownModel(s.to_string()))
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.product_name())
    }
}
