//! [`RegisterIo`] for the synchronous `tokio-modbus` client context.
//!
//! This lets a [`Meter`](crate::meter::Meter) poll a device over Modbus RTU or TCP.
//! All methods block the current thread; timeouts are enforced by the context.
//!
//! # Examples
//!
//! ## TCP Client Example
//!
//! ```no_run
//! use eastron_sdm_lib::{
//!     meter::Meter, model::Model, publish::PublishedState, settings::MeterSettings,
//!     store::YamlStore,
//! };
//! use std::time::{Duration, Instant};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket_addr = "192.168.1.100:502".parse()?;
//!     let mut ctx = tokio_modbus::client::sync::tcp::connect_slave(
//!         socket_addr,
//!         tokio_modbus::Slave(1),
//!     )?;
//!     ctx.set_timeout(Some(Duration::from_secs(1)));
//!
//!     let store = Box::new(YamlStore::new("/var/lib/sdmpoll/energy.yml"));
//!     let mut meter = Meter::new(
//!         Model::Sdm630Modbus,
//!         MeterSettings::default(),
//!         store,
//!         Instant::now(),
//!     )?;
//!     let mut state = PublishedState::new();
//!     meter.update(&mut ctx, Instant::now(), &mut state)?;
//!     println!("Power: {:?} W", state.value("/Ac/Power"));
//!     Ok(())
//! }
//! ```

use crate::{error::Result, poll::RegisterIo};
use tokio_modbus::prelude::{SyncReader, SyncWriter};

/// Helper function to map tokio result to our result.
fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
    match result {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err.into()), // Modbus exception
        Err(err) => Err(err.into()),     // IO error
    }
}

impl RegisterIo for tokio_modbus::client::sync::Context {
    fn read_input_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        map_tokio_result(SyncReader::read_input_registers(self, address, quantity))
    }

    fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        map_tokio_result(SyncReader::read_holding_registers(self, address, quantity))
    }

    fn write_multiple_registers(&mut self, address: u16, words: &[u16]) -> Result<()> {
        map_tokio_result(SyncWriter::write_multiple_registers(self, address, words))
    }
}
