use sim_time::{Tick, TimerId};

use crate::config::DriveId;

/// Protocol state of one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    IdleSelected,
    IdleSelectedIntrPending,
    IdleNotSelected,
    CommandExecution,
    PrepareDataIn,
    DataReadyIntrIn,
    TransferDataIn,
    PrepareDataOut,
    DataReadyIntrOut,
    TransferDataOut,
    PrepareDataDma,
    TransferDataDma,
}

impl DeviceState {
    const ALL: [DeviceState; 12] = [
        DeviceState::IdleSelected,
        DeviceState::IdleSelectedIntrPending,
        DeviceState::IdleNotSelected,
        DeviceState::CommandExecution,
        DeviceState::PrepareDataIn,
        DeviceState::DataReadyIntrIn,
        DeviceState::TransferDataIn,
        DeviceState::PrepareDataOut,
        DeviceState::DataReadyIntrOut,
        DeviceState::TransferDataOut,
        DeviceState::PrepareDataDma,
        DeviceState::TransferDataDma,
    ];

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(usize::from(v)).copied()
    }

    pub fn is_dma(self) -> bool {
        matches!(
            self,
            DeviceState::PrepareDataDma | DeviceState::TransferDataDma
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaState {
    #[default]
    Idle,
    /// Command accepted; waiting for the host to set the bus-master start bit.
    Start,
    Transfer,
}

impl DmaState {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DmaState::Idle),
            1 => Some(DmaState::Start),
            2 => Some(DmaState::Transfer),
            _ => None,
        }
    }
}

/// Which step of the DMA engine the single outstanding timer resumes.
///
/// "Read" and "write" name the bus operation on guest memory: a disk write
/// reads guest memory, a disk read writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Start (or restart after backoff) the fetch of the next PRD entry.
    Kickoff,
    /// PRD entry fetch completed.
    PrdFetch,
    /// Bus was busy before the first guest-memory read of a PRD.
    MemReadWait,
    /// Bus was busy before the first guest-memory write of a PRD.
    MemWriteWait,
    /// A guest-memory read sub-transfer completed.
    MemReadChunk,
    /// A guest-memory write sub-transfer completed.
    MemWriteChunk,
}

impl TimerKind {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TimerKind::Kickoff),
            1 => Some(TimerKind::PrdFetch),
            2 => Some(TimerKind::MemReadWait),
            3 => Some(TimerKind::MemWriteWait),
            4 => Some(TimerKind::MemReadChunk),
            5 => Some(TimerKind::MemWriteChunk),
            _ => None,
        }
    }
}

/// Payload a drive schedules on the simulator's timer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskEvent {
    pub drive: DriveId,
    pub kind: TimerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArmedTimer {
    pub kind: TimerKind,
    pub deadline: Tick,
    pub id: TimerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_round_trip() {
        for s in DeviceState::ALL {
            assert_eq!(DeviceState::from_u8(s.to_u8()), Some(s));
        }
        assert_eq!(DeviceState::from_u8(12), None);
        assert_eq!(DmaState::from_u8(DmaState::Transfer.to_u8()), Some(DmaState::Transfer));
        assert_eq!(DmaState::from_u8(3), None);
        assert_eq!(TimerKind::from_u8(5), Some(TimerKind::MemWriteChunk));
        assert_eq!(TimerKind::from_u8(6), None);
    }
}
