//! Eastron SDM energy meter CLI
//!
//! A command-line interface (CLI) application for polling Eastron SDM energy
//! meters using Modbus RTU (serial) or Modbus TCP.
//!
//! This tool allows users to:
//! - Run one poll cycle and print all measured values.
//! - Read the serial number, hardware and firmware version and phase configuration.
//! - Write the phase configuration of three-phase meters.
//! - Reset the locally integrated energy counters.
//! - Run in a continuous daemon mode that prints every changed value and keeps
//!   the energy accounts in a state file.
//!
//! The CLI leverages the `eastron_sdm_lib` crate for register tables, polling and
//! energy accounting.

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Confirm;
use eastron_sdm_lib::{
    meter::Meter,
    model::{self, Model, Variant},
    poll,
    publish::{PublishedState, Publisher},
    settings::MeterSettings,
    store::{MemoryStore, YamlStore},
};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::path::{Path, PathBuf};
use std::{
    panic,
    time::{Duration, Instant},
};

mod commandline;
mod config;

use commandline::{CliCommands, CliConnection};
use config::MeterConfig;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Prints every published value to the standard output.
struct ConsolePublisher;

impl Publisher for ConsolePublisher {
    fn publish(&mut self, path: &str, value: Option<f64>, text: Option<String>) {
        match (text, value) {
            (Some(text), _) => println!("{path}: {text}"),
            (None, Some(value)) => println!("{path}: {value}"),
            (None, None) => println!("{path}: --"),
        }
    }
}

/// Calculates the minimum recommended delay for Modbus RTU based on baud rate.
/// This is typically 3.5 character times.
fn minimum_rtu_delay(baud_rate: u32) -> Duration {
    // 11 bits per character: start, 8 data, parity or stop, stop
    let bits_per_char = 11.0;
    if baud_rate == 0 {
        return Duration::from_millis(16);
    }
    let char_time_secs = bits_per_char / baud_rate as f64;
    let delay_micros = (3.5 * char_time_secs * 1_000_000.0) as u64;

    // Modbus minimum silence above 19200 baud
    const PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS: u64 = 1_750;
    Duration::from_micros(delay_micros.max(PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS))
}

/// Checks if the user-provided RTU delay is sufficient; if not, uses the calculated minimum.
fn check_rtu_delay(user_delay: Duration, baud_rate: u32) -> Duration {
    let min_rtu_delay = minimum_rtu_delay(baud_rate);
    if user_delay < min_rtu_delay {
        warn!(
            "RTU delay of {user_delay:?} is below the minimum of {min_rtu_delay:?} for {baud_rate} baud. Using minimum."
        );
        min_rtu_delay
    } else {
        user_delay
    }
}

/// Opens the Modbus connection described by the command-line arguments.
fn create_client(
    connection: &CliConnection,
    delay: &mut Duration,
) -> Result<tokio_modbus::client::sync::Context> {
    match connection {
        CliConnection::Tcp { address, unit, .. } => {
            let socket_addr = address
                .parse()
                .with_context(|| format!("Invalid TCP address format: '{address}'"))?;
            info!("Attempting to connect via TCP to {socket_addr} (Unit: {unit})...");
            tokio_modbus::client::sync::tcp::connect_slave(socket_addr, tokio_modbus::Slave(*unit))
                .with_context(|| format!("Failed to connect to Modbus TCP device at {socket_addr}"))
        }
        CliConnection::Rtu {
            device,
            baud_rate,
            address,
            ..
        } => {
            info!(
                "Attempting to connect via RTU to device {device} (Address: {address}, Baud: {baud_rate})..."
            );
            *delay = check_rtu_delay(*delay, *baud_rate);
            tokio_modbus::client::sync::rtu::connect_slave(
                &eastron_sdm_lib::tokio_common::serial_port_builder(device, *baud_rate),
                tokio_modbus::Slave(*address),
            )
            .with_context(|| format!("Cannot open serial port {device}"))
        }
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

/// Handles the energy reset command. The meter itself is not contacted.
fn handle_reset_energy(args: &commandline::CliArgs, state_file: &Path) -> Result<()> {
    if args.model.variant() == Variant::SinglePhase {
        bail!("{} has no locally integrated energy counters", args.model);
    }
    println!(
        "WARNING: This will set the energy counters in {} to zero.",
        state_file.display()
    );
    if !confirm("Are you sure you want to reset the energy counters?")? {
        info!("Energy reset aborted by user.");
        return Ok(());
    }
    let store = Box::new(YamlStore::new(state_file));
    let mut meter = Meter::new(args.model, MeterSettings::default(), store, Instant::now())
        .with_context(|| format!("Cannot load energy state {}", state_file.display()))?;
    let before = meter.energy().map(|energy| energy.balancing());
    meter
        .reset_energy(Instant::now(), &mut ConsolePublisher)
        .context("Cannot reset energy counters")?;
    println!("Energy counters reset (previously {before:?}).");
    Ok(())
}

fn run_daemon(
    ctx: &mut tokio_modbus::client::sync::Context,
    model: Model,
    config_file: &Path,
    delay: Duration,
) -> Result<()> {
    let config = MeterConfig::load(config_file)?;
    let settings = config.settings()?;
    let store = Box::new(YamlStore::new(&config.state_file));
    let mut meter = Meter::new(model, settings, store, Instant::now()).with_context(|| {
        format!("Cannot load energy state {}", config.state_file.display())
    })?;
    let mut publisher = ConsolePublisher;

    meter
        .init(ctx, Instant::now(), &mut publisher)
        .context("Cannot initialise meter")?;
    info!(
        "Starting daemon mode for {} ({}), interval={:?}",
        model,
        meter.identifier().unwrap_or_default(),
        config.poll_interval
    );
    loop {
        if let Err(err) = meter.update(ctx, Instant::now(), &mut publisher) {
            warn!("Poll cycle failed: {err}");
        }
        std::thread::sleep(delay.max(config.poll_interval));
    }
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "sdmpoll started for {}. Log level: {}",
        args.model,
        args.verbose.log_level_filter()
    );

    // 2. The energy reset works on the state file only
    if let CliCommands::ResetEnergy { state_file } = args.connection.command() {
        return handle_reset_energy(&args, state_file);
    }

    // 3. Setup for commands talking to the meter
    let mut delay = args.delay;
    let mut ctx = create_client(&args.connection, &mut delay)?;
    ctx.set_timeout(args.timeout);

    // 4. Execute the command
    match args.connection.command() {
        CliCommands::Daemon { config_file } => {
            let config_file = config_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(MeterConfig::DEFAULT_CONFIG_FILE));
            run_daemon(&mut ctx, args.model, &config_file, delay)?;
        }
        CliCommands::Read => {
            info!("Executing: Read");
            let store = Box::new(MemoryStore::default());
            let now = Instant::now();
            let mut meter = Meter::new(args.model, MeterSettings::default(), store, now)?;
            let mut state = PublishedState::new();
            meter
                .update(&mut ctx, now, &mut state)
                .context("Cannot read meter")?;
            for reg in meter.registers() {
                println!("{reg}");
            }
        }
        CliCommands::ReadInfo => {
            info!("Executing: Read Info");
            let mut regs = args.model.info_registers();
            poll::read_info(&mut regs, &mut ctx, Instant::now(), &mut PublishedState::new())
                .context("Cannot read info registers")?;
            println!("Model: {} ({})", args.model, args.model.code());
            for reg in &regs {
                println!("{reg}");
            }
        }
        CliCommands::SetPhaseConfig { config } => {
            if args.model.variant() == Variant::SinglePhase {
                bail!("{} has no phase configuration", args.model);
            }
            let label = eastron_sdm_lib::protocol::PHASE_CONFIGS[*config as usize];
            info!("Executing: Set Phase Config to {label}");
            if !confirm(&format!("Change the phase configuration of the meter to {label}?"))? {
                info!("Phase configuration change aborted by user.");
                return Ok(());
            }
            let store = Box::new(MemoryStore::default());
            let mut meter = Meter::new(args.model, MeterSettings::default(), store, Instant::now())?;
            meter
                .write_register(&mut ctx, model::PHASE_CONFIG, *config as f64)
                .with_context(|| format!("Failed to set phase configuration to {label}"))?;
            println!("Phase configuration set to {label} successfully.");
        }
        CliCommands::ResetEnergy { .. } => unreachable!("ResetEnergy is handled earlier."),
    }

    Ok(())
}
