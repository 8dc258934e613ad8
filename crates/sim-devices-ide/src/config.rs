use serde::{Deserialize, Serialize};
use thiserror::Error;

use sim_time::Tick;

/// Position of a drive on its channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveId {
    #[default]
    Master,
    Slave,
}

impl DriveId {
    pub fn index(self) -> usize {
        match self {
            DriveId::Master => 0,
            DriveId::Slave => 1,
        }
    }

    pub fn from_index(idx: u8) -> Option<Self> {
        match idx {
            0 => Some(DriveId::Master),
            1 => Some(DriveId::Slave),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("ticks_per_second must be non-zero")]
    ZeroClockRate,
    #[error("dma_page_size {0} must be a power of two of at least 512 bytes")]
    InvalidPageSize(u64),
}

/// Construction-time parameters of one IDE disk.
///
/// Loaded from JSON by tools; every field has a default so a partial document
/// (or `{}`) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdeDiskConfig {
    pub drive: DriveId,
    /// Fixed seek/rotation latency charged to every DMA transfer.
    pub disk_delay_us: u64,
    pub ticks_per_second: u64,
    /// Retry interval while the DMA bus is busy.
    pub dma_backoff_ticks: Tick,
    /// Granularity of DMA bus sub-transfers.
    pub dma_page_size: u64,
    /// Model string reported by IDENTIFY DEVICE.
    pub model: String,
}

impl Default for IdeDiskConfig {
    fn default() -> Self {
        Self {
            drive: DriveId::Master,
            disk_delay_us: 1,
            ticks_per_second: 1_000_000_000_000,
            dma_backoff_ticks: 200,
            dma_page_size: 8192,
            model: "SIM IDE DISK".to_string(),
        }
    }
}

impl IdeDiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticks_per_second == 0 {
            return Err(ConfigError::ZeroClockRate);
        }
        if !self.dma_page_size.is_power_of_two() || self.dma_page_size < 512 {
            return Err(ConfigError::InvalidPageSize(self.dma_page_size));
        }
        Ok(())
    }

    /// `disk_delay_us` expressed in simulator ticks.
    pub fn disk_delay_ticks(&self) -> Tick {
        let ticks = u128::from(self.disk_delay_us) * u128::from(self.ticks_per_second) / 1_000_000;
        Tick::try_from(ticks).unwrap_or(Tick::MAX)
    }
}
