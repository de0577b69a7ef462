//!
//! Tuning constants for the core. The source implementation bakes these in at
//! compile time; we carry them as an explicitly constructed, explicitly passed
//! runtime object instead (see the design note on process-wide singletons),
//! with `Default` giving the same values the source used.
use serde::{Deserialize, Serialize};

/// Tuning knobs for the provisioner and write-caching aggregator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sectors per media command (chunk size).
    pub sec_mcmd: u32,
    /// Minimum alignment unit, in sectors, a user write's size must respect.
    pub sec_mcmd_min: u32,
    /// Max child mcmds a single user command may fragment into.
    pub io_max_mcmd: u32,
    /// Max zones striped across for a single user command.
    pub pro_stripe: u32,
    /// Number of provisioning type lanes (round-robin group cursors).
    pub pro_types: u16,
    /// Use device zone-append instead of sequential write + explicit offset.
    pub write_append: bool,
    /// Pin the writer and completion threads to `write_core`.
    pub write_affinity: bool,
    /// Core to pin to when `write_affinity` is set.
    pub write_core: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sec_mcmd: 256,
            sec_mcmd_min: 8,
            io_max_mcmd: 64,
            pro_stripe: 4,
            pro_types: 2,
            write_append: true,
            write_affinity: false,
            write_core: 0,
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file, falling back to defaults for any
    /// field the file omits.
    pub fn from_yaml_str(s: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }
}
