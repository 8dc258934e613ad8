//! Register-level model of an IDE/ATA hard disk for an event-driven simulator.
//!
//! A guest drives the disk exclusively through byte/word accesses to the
//! command and control register blocks plus the bus-master DMA registers of
//! the owning channel. Every access is classified into an [`Action`] that is
//! fed to the drive's protocol state machine; DMA transfers walk a guest PRD
//! table in page-sized bus sub-transfers, each completion arriving as a
//! [`DiskEvent`] popped from the simulator's [`sim_time::TimerQueue`].
//!
//! The model is single-threaded and never blocks: all waiting is expressed as
//! an armed timer. At most one timer per drive is outstanding at any time,
//! which is what lets [`IdeDisk::save_state`] capture an in-flight DMA exactly.

#![forbid(unsafe_code)]

mod channel;
mod command;
mod config;
mod disk;
mod dma;
mod dma_bus;
mod error;
mod identify;
mod image;
pub mod regs;
mod snapshot;
mod state;
mod system;

pub use channel::{
    IdeChannel, PlatformBus, BM_CMD_START, BM_CMD_WRITE, BM_REG_COMMAND, BM_REG_PRD_TABLE,
    BM_REG_STATUS, BM_STATUS_ACTIVE, BM_STATUS_ERROR, BM_STATUS_IRQ, IDE_CHANNEL_DEVICE_ID,
};
pub use command::{decode as decode_command, AtaCommand, DecodedCommand, TransferClass};
pub use config::{ConfigError, DriveId, IdeDiskConfig};
pub use disk::{IdeContext, IdeDisk, IdeHost};
pub use dma::{bytes_in_dma_page, DmaDirection, PrdEntry, MAX_DMA_SIZE, PRD_ENTRY_SIZE};
pub use dma_bus::{BusOp, BusTransfer, DmaBus, SharedDmaBus};
pub use error::{IdeError, IdeResult};
pub use identify::{DriveIdentity, Geometry, IDENTIFY_LEN, MAX_MULTSECT};
pub use image::{DiskImage, FileDisk, MemDisk, SECTOR_SIZE};
pub use regs::{AccessWidth, Action, CommandRegisters, RegisterBlock};
pub use snapshot::{IdeDiskState, PendingTimer};
pub use state::{DeviceState, DiskEvent, DmaState, TimerKind};
pub use system::{IdeSystem, PRIMARY_IDE_IRQ};
