//! Simulation configuration.

use anyhow::{Context, Result};
use apkes_core::Config;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Parameters of one simulation run.
///
/// Values come from the optional TOML file, with command-line flags
/// layered on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of simulated nodes
    pub nodes: usize,
    /// Wall-clock runtime of the simulation
    pub duration_secs: u64,
    /// Trickle minimum interval
    pub i_min_secs: u64,
    /// Longest random HELLO answer delay
    pub max_waiting_secs: u64,
    /// ACK grace period
    pub ack_delay_secs: u64,
    /// Base PRNG seed byte; omit for OS entropy
    pub seed: Option<u8>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            duration_secs: 30,
            i_min_secs: 5,
            max_waiting_secs: 3,
            ack_delay_secs: 1,
            seed: None,
        }
    }
}

impl SimConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// The protocol configuration the simulated nodes run with
    #[must_use]
    pub fn protocol_config(&self) -> Config {
        Config {
            trickle_min_interval: Duration::from_secs(self.i_min_secs),
            max_waiting_period: Duration::from_secs(self.max_waiting_secs),
            ack_delay: Duration::from_secs(self.ack_delay_secs),
            ..Config::default()
        }
    }
}
