use crate::RuntimeError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_CPU_SHARES: u64 = 1024;
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;
pub const DEFAULT_PIDS_MAX: u64 = 20;

const MIN_CPU_SHARES: u64 = 2;
const MAX_CPU_SHARES: u64 = 262_144;
const MAX_CPU_WEIGHT: u64 = 10_000;
const MIN_CPU_PERIOD_US: u64 = 1_000;
const MAX_CPU_PERIOD_US: u64 = 1_000_000;

/// Resource ceilings applied to a container's cgroup.
///
/// A zero `memory_bytes` or `pids_max` means "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_shares: u64,
    pub cpu_period_us: u64,
    pub pids_max: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            cpu_shares: DEFAULT_CPU_SHARES,
            cpu_period_us: DEFAULT_CPU_PERIOD_US,
            pids_max: DEFAULT_PIDS_MAX,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if !(MIN_CPU_SHARES..=MAX_CPU_SHARES).contains(&self.cpu_shares) {
            return Err(RuntimeError::Resource(format!(
                "cpu_shares must be between {MIN_CPU_SHARES} and {MAX_CPU_SHARES}, got {}",
                self.cpu_shares
            )));
        }
        if !(MIN_CPU_PERIOD_US..=MAX_CPU_PERIOD_US).contains(&self.cpu_period_us) {
            return Err(RuntimeError::Resource(format!(
                "cpu_period_us must be between {MIN_CPU_PERIOD_US} and {MAX_CPU_PERIOD_US}, got {}",
                self.cpu_period_us
            )));
        }
        Ok(())
    }

    /// cgroup v2 `cpu.weight` for the configured v1-style shares.
    pub fn cpu_weight(&self) -> u64 {
        let weight = 1 + (self.cpu_shares.saturating_sub(2) * 9999) / 262_142;
        weight.min(MAX_CPU_WEIGHT)
    }

    pub fn memory_max(&self) -> String {
        limit_value(self.memory_bytes)
    }

    pub fn pids_max_value(&self) -> String {
        limit_value(self.pids_max)
    }

    pub fn cpu_max(&self) -> String {
        format!("max {}", self.cpu_period_us)
    }
}

fn limit_value(v: u64) -> String {
    if v == 0 {
        "max".to_owned()
    } else {
        v.to_string()
    }
}
