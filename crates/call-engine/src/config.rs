//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Telephony limits and timers applied to every driver at setup.
///
/// All limits use `0` to mean "unlimited" / "disabled".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default answer timeout in milliseconds applied to accepted calls
    /// that do not carry their own `timeout` parameter.
    pub timeout_ms: u64,

    /// Maximum number of concurrent routing tasks per driver.
    pub maxroute: u32,

    /// Maximum number of live channels per driver.
    pub maxchans: u32,

    /// Quiet period in seconds between a module marking itself changed and
    /// the `module.update` emission on the next timer tick.
    pub update_delay_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            maxroute: 0,
            maxchans: 0,
            update_delay_secs: 5,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms > 86_400_000 {
            return Err(EngineError::Config(format!(
                "timeout_ms {} exceeds one day",
                self.timeout_ms
            )));
        }
        if self.update_delay_secs > 3600 {
            return Err(EngineError::Config(format!(
                "update_delay_secs {} exceeds one hour",
                self.update_delay_secs
            )));
        }
        Ok(())
    }
}
