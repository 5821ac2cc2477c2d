//! A polling driver for Eastron SDM energy meters over Modbus.
//!
//! The crate turns the sparse register map of a meter into a consistent,
//! rate-limited set of published measurements and keeps energy accounts by
//! time-integrating the instantaneous power readings.
//!
//! ## Building blocks
//!
//! - [`protocol`]: register descriptors and their wire codec.
//! - [`poll`]: packing registers into batched reads and the staleness-aware poll cycle.
//! - [`energy`]: the energy account with its counting policies, publication and
//!   persistence cadence.
//! - [`model`]: the register tables of the supported SDM models.
//! - [`meter`]: one polled device, tying the above together.
//! - [`settings`], [`store`], [`publish`]: settable quantities, persisted
//!   accumulators and the sink for published values.
//!
//! ## Quick Start
//!
//! ```no_run
//! use eastron_sdm_lib::{
//!     meter::Meter, model::Model, publish::PublishedState, settings::MeterSettings,
//!     store::MemoryStore,
//! };
//! use std::time::{Duration, Instant};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let builder = eastron_sdm_lib::tokio_common::serial_port_builder("/dev/ttyUSB0", 9600);
//!     let mut ctx = tokio_modbus::client::sync::rtu::connect_slave(&builder, tokio_modbus::Slave(1))?;
//!     ctx.set_timeout(Some(Duration::from_millis(500)));
//!
//!     let store = Box::new(MemoryStore::default());
//!     let mut meter = Meter::new(Model::Sdm72dm, MeterSettings::default(), store, Instant::now())?;
//!     let mut state = PublishedState::new();
//!     loop {
//!         meter.update(&mut ctx, Instant::now(), &mut state)?;
//!         std::thread::sleep(Duration::from_millis(100));
//!     }
//! }
//! ```

pub mod energy;
pub mod error;
pub mod meter;
pub mod model;
pub mod poll;
pub mod protocol;
pub mod publish;
pub mod settings;
pub mod store;

pub use error::{Error, Result};

#[cfg_attr(docsrs, doc(cfg(feature = "tokio-rtu-sync")))]
#[cfg(feature = "tokio-rtu-sync")]
pub mod tokio_common;

#[cfg_attr(
    docsrs,
    doc(cfg(any(feature = "tokio-rtu-sync", feature = "tokio-tcp-sync")))
)]
#[cfg(any(feature = "tokio-rtu-sync", feature = "tokio-tcp-sync"))]
pub mod tokio_sync;

#[cfg(test)]
mod testing;
