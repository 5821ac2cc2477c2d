//! Persistence of the locally integrated energy accumulators.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Errors raised while loading or saving the accumulators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot access energy state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid energy state file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The two persisted accumulator values in kWh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balancing {
    #[serde(rename = "forward_balancing")]
    pub forward: f64,
    #[serde(rename = "reverse_balancing")]
    pub reverse: f64,
}

/// External store the accumulators are checkpointed to.
pub trait EnergyStore {
    /// Loads the last checkpoint. A store that was never written yields zeros.
    fn load(&mut self) -> Result<Balancing, Error>;

    fn save(&mut self, balancing: &Balancing) -> Result<(), Error>;
}

/// Keeps the accumulators in a YAML file.
#[derive(Debug, Clone)]
pub struct YamlStore {
    path: PathBuf,
}

impl YamlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EnergyStore for YamlStore {
    fn load(&mut self) -> Result<Balancing, Error> {
        if !self.path.exists() {
            log::info!(
                "No energy state at {}, starting from zero",
                self.path.display()
            );
            return Ok(Balancing::default());
        }
        let file = File::open(&self.path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    fn save(&mut self, balancing: &Balancing) -> Result<(), Error> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        // the state file is replaced atomically
        let tmp = self.path.with_extension("tmp");
        serde_yaml::to_writer(File::create(&tmp)?, balancing)?;
        std::fs::rename(&tmp, &self.path)?;
        log::debug!("Saved {balancing:?} to {}", self.path.display());
        Ok(())
    }
}

/// Keeps the accumulators in memory only.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    balancing: Balancing,
}

impl MemoryStore {
    pub fn new(balancing: Balancing) -> Self {
        Self { balancing }
    }
}

impl EnergyStore for MemoryStore {
    fn load(&mut self) -> Result<Balancing, Error> {
        Ok(self.balancing)
    }

    fn save(&mut self, balancing: &Balancing) -> Result<(), Error> {
        self.balancing = *balancing;
        Ok(())
    }
}
