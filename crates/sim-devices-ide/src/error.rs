use sim_io_snapshot::io::state::SnapshotError;
use thiserror::Error;

use crate::config::{ConfigError, DriveId};
use crate::state::{DeviceState, DmaState, TimerKind};

/// Fatal conditions raised by the disk model.
///
/// Any of these means either the guest violated the protocol in a way the
/// model does not emulate, or the model itself reached an impossible state.
/// The simulation is expected to stop when one is returned.
#[derive(Debug, Error)]
pub enum IdeError {
    #[error("invalid command block register offset {0:#x}")]
    InvalidCommandOffset(u64),
    #[error("16-bit access to command block register {0:#x}; only the data port is 16 bits wide")]
    InvalidWordAccess(u64),
    #[error("invalid control block register offset {0:#x}")]
    InvalidControlOffset(u64),
    #[error("16-bit access to the control block")]
    ControlWordAccess,
    #[error("software reset through the device control register is not supported")]
    SoftwareReset,
    #[error("unsupported ATA command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("ATA command {0:#04x} issued with CHS addressing; only LBA is supported")]
    ChsAddressing(u8),
    #[error("8-bit PIO data transfer is not supported")]
    BytePioTransfer,
    #[error("PIO byte counters out of step (command {cmd_bytes_left}, DRQ block {drq_bytes_left})")]
    CounterMismatch {
        cmd_bytes_left: u32,
        drq_bytes_left: u32,
    },
    #[error("DMA transfer moved more data than the command requested")]
    DmaOverrun,
    #[error("PRD table ended with {0} command bytes still outstanding")]
    PrdTableShort(u32),
    #[error("interrupt posted while one is already pending")]
    InterruptAlreadyPending,
    #[error("interrupt cleared while none is pending")]
    NoInterruptPending,
    #[error("inconsistent DMA state for {op}: device {device:?}, DMA {dma:?}")]
    InconsistentDmaState {
        op: &'static str,
        device: DeviceState,
        dma: DmaState,
    },
    #[error("timer {new:?} armed while {outstanding:?} is still outstanding")]
    TimerAlreadyArmed {
        new: TimerKind,
        outstanding: TimerKind,
    },
    #[error("timer {fired:?} fired but {armed:?} was armed")]
    UnexpectedTimer {
        fired: TimerKind,
        armed: Option<TimerKind>,
    },
    #[error("short read of sector {sector}: {got} bytes")]
    ShortRead { sector: u64, got: usize },
    #[error("short write of sector {sector}: {got} bytes")]
    ShortWrite { sector: u64, got: usize },
    #[error("disk image has no sectors")]
    EmptyImage,
    #[error("no drive attached as {0:?}")]
    NoDrive(DriveId),
    #[error("drive slot {0:?} already occupied")]
    DriveSlotTaken(DriveId),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub type IdeResult<T> = Result<T, IdeError>;
