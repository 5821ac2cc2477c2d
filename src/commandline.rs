use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use eastron_sdm_lib::{model::Model, protocol::PHASE_CONFIGS};
use std::{path::PathBuf, time::Duration};

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(s: &str) -> Result<u8, String> {
    let address =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    if !(1..=247).contains(&address) {
        return Err(format!("Address {address} is outside the range 1..=247"));
    }
    Ok(address)
}

fn parse_model(s: &str) -> Result<Model, String> {
    s.parse::<Model>().map_err(|e| e.to_string())
}

/// Accepts a phase configuration label (`1p2w`, `3p3w`, `3p4w`) or its index.
fn parse_phase_config(s: &str) -> Result<u8, String> {
    let index = PHASE_CONFIGS
        .iter()
        .position(|label| label.eq_ignore_ascii_case(s))
        .filter(|index| *index > 0);
    if let Some(index) = index {
        return Ok(index as u8);
    }
    clap_num::number_range(s, 1, 3)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliConnection {
    /// Connect to a meter via Modbus TCP, usually through an RS485 gateway.
    Tcp {
        /// The IP address or hostname and port of the Modbus TCP device.
        /// Example: "192.168.1.100:502".
        address: String,

        /// The Modbus unit identifier of the meter behind the gateway.
        #[arg(short, long, default_value_t = 1, value_parser = parse_address)]
        unit: u8,

        /// TCP-specific commands for the connected device.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// Connect to a meter via Modbus RTU (Serial).
    Rtu {
        /// Serial port device name.
        /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
        #[arg(short, long, default_value_t = default_device_name())]
        device: String,

        /// Baud rate for serial communication.
        /// Must match the baud rate configured on the meter.
        #[arg(long, default_value_t = 9600)]
        baud_rate: u32,

        /// The Modbus RTU device address, ranging from 1 to 247.
        #[arg(short, long, default_value_t = 1, value_parser = parse_address)]
        address: u8,

        /// RTU-specific commands for the connected device.
        #[command(subcommand)]
        command: CliCommands,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: poll the meter continuously and print every changed value.
    /// Refresh rate, energy counter, power offsets and the energy state file are
    /// taken from the configuration file.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// The YAML configuration file. Defaults apply when the file does not exist.
        #[arg(short, long)]
        config_file: Option<PathBuf>,
    },

    /// Run one poll cycle and print all measured values.
    Read,

    /// Read and display serial number, hardware and firmware version and the phase configuration.
    ReadInfo,

    /// Write the phase configuration of a three-phase meter.
    /// Accepted values: "1p2w", "3p3w", "3p4w" or 1 to 3.
    #[clap(verbatim_doc_comment)]
    SetPhaseConfig {
        #[arg(value_parser = parse_phase_config, verbatim_doc_comment)]
        config: u8,
    },

    /// Zero the locally integrated energy counters stored in the energy state file.
    /// **Warning:** This is an irreversible operation.
    #[clap(verbatim_doc_comment)]
    ResetEnergy {
        /// The energy state file of the meter.
        #[arg(short, long)]
        state_file: PathBuf,
    },
}

const fn about_text() -> &'static str {
    "Eastron SDM energy meter CLI - Poll Eastron SDM meters via Modbus RTU/TCP."
}

#[derive(Parser, Debug)]
#[command(name="sdmpoll", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Specifies the connection method and device-specific commands.
    #[command(subcommand)]
    pub connection: CliConnection,

    /// The meter model, by product name (e.g. "SDM630-Modbus") or model code.
    #[arg(global = true, short, long, default_value_t = Model::Sdm630Modbus, value_parser = parse_model)]
    pub model: Model,

    /// Modbus I/O timeout for read/write operations.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "500ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Minimum delay between multiple Modbus commands sent to the same device.
    /// Important for Modbus RTU, especially with USB-to-RS485 converters that need time
    /// to switch between transmitting (TX) and receiving (RX) modes.
    /// Examples: "50ms", "100ms".
    #[arg(global = true, long, default_value = "50ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub delay: Duration,
}

impl CliConnection {
    pub fn command(&self) -> &CliCommands {
        match self {
            CliConnection::Tcp { command, .. } | CliConnection::Rtu { command, .. } => command,
        }
    }
}
