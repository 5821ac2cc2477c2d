use anyhow::{Context, Result, bail};
use eastron_sdm_lib::settings::{MeterSettings, Setting};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration of one meter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    /// Pause between two poll cycles.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Data register refresh rate in Hz (1 to 10).
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: u8,
    /// Measured line of single-phase meters (0 to 2).
    #[serde(default)]
    pub phase: u8,
    /// 0 = device counters, 1 = balancing, 2 = device net.
    #[serde(default)]
    pub energy_counter: u8,
    /// Power calibration of L1, L2 and L3 in W.
    #[serde(default)]
    pub power_offsets: [f64; 3],
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_refresh_rate() -> u8 {
    1
}

fn default_state_file() -> PathBuf {
    PathBuf::from("sdmpoll-energy.yml")
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            refresh_rate: default_refresh_rate(),
            phase: 0,
            energy_counter: 0,
            power_offsets: [0.0; 3],
            state_file: default_state_file(),
        }
    }
}

impl MeterConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "sdmpoll.yml";

    /// Loads the configuration, falling back to the defaults if `path` does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        log::debug!("Loading config file from {path:?}");
        let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        let config = serde_yaml::from_reader(file)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Validates the configured values into meter settings.
    pub fn settings(&self) -> Result<MeterSettings> {
        let mut settings = MeterSettings::default();
        if !settings.refresh_rate.set(self.refresh_rate) {
            bail!("Invalid refresh rate {}, expected 1 to 10", self.refresh_rate);
        }
        if !settings.phase.set(self.phase) {
            bail!("Invalid phase {}, expected 0 to 2", self.phase);
        }
        if !settings.counter.set(self.energy_counter) {
            bail!("Invalid energy counter {}, expected 0 to 2", self.energy_counter);
        }
        for (line, offset) in (1..=3).zip(self.power_offsets) {
            if !settings.power_offsets.set((line, offset)) {
                bail!("Invalid power offset {offset} for L{line}");
            }
        }
        Ok(settings)
    }
}
