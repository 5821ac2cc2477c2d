//! A simulated Modbus device for unit tests.

use crate::{error::Result, poll::RegisterIo};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct SimulatedDevice {
    pub input: HashMap<u16, u16>,
    pub holding: HashMap<u16, u16>,
    /// Every input register read as `(address, quantity)`.
    pub reads: Vec<(u16, u16)>,
    pub holding_reads: Vec<(u16, u16)>,
    pub writes: Vec<(u16, Vec<u16>)>,
    /// Answer every request with this exception.
    pub exception: Option<tokio_modbus::ExceptionCode>,
    /// Return at most this many words for input register reads.
    pub truncate_responses: Option<usize>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input_f32(&mut self, address: u16, value: f32) {
        let bits = value.to_bits();
        self.input.insert(address, (bits >> 16) as u16);
        self.input.insert(address + 1, bits as u16);
    }

    pub fn set_holding(&mut self, address: u16, value: u16) {
        self.holding.insert(address, value);
    }

    pub fn set_holding_u32(&mut self, address: u16, value: u32) {
        self.holding.insert(address, (value >> 16) as u16);
        self.holding.insert(address + 1, value as u16);
    }

    pub fn set_holding_f32(&mut self, address: u16, value: f32) {
        self.set_holding_u32(address, value.to_bits());
    }

    fn check(&self) -> Result<()> {
        match &self.exception {
            Some(exception) => Err(exception.clone().into()),
            None => Ok(()),
        }
    }
}

fn collect(registers: &HashMap<u16, u16>, address: u16, quantity: u16) -> Vec<u16> {
    (address..address + quantity)
        .map(|addr| registers.get(&addr).copied().unwrap_or(0))
        .collect()
}

impl RegisterIo for SimulatedDevice {
    fn read_input_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.check()?;
        self.reads.push((address, quantity));
        let mut words = collect(&self.input, address, quantity);
        if let Some(len) = self.truncate_responses {
            words.truncate(len);
        }
        Ok(words)
    }

    fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.check()?;
        self.holding_reads.push((address, quantity));
        Ok(collect(&self.holding, address, quantity))
    }

    fn write_multiple_registers(&mut self, address: u16, words: &[u16]) -> Result<()> {
        self.check()?;
        for (addr, word) in (address..).zip(words) {
            self.holding.insert(addr, *word);
        }
        self.writes.push((address, words.to_vec()));
        Ok(())
    }
}
