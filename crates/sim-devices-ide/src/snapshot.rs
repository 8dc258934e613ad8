use sim_io_snapshot::io::state::codec::{Decoder, Encoder};
use sim_io_snapshot::io::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use sim_time::{Tick, TimerQueue};

use crate::config::DriveId;
use crate::disk::IdeDisk;
use crate::dma::{DmaDirection, PrdEntry, MAX_DMA_SIZE};
use crate::error::IdeResult;
use crate::image::SECTOR_SIZE;
use crate::regs::CommandRegisters;
use crate::state::{DeviceState, DiskEvent, DmaState, TimerKind};

const TAG_REGS: u16 = 1;
const TAG_NIEN: u16 = 2;
const TAG_DRIVE: u16 = 3;
const TAG_PRD: u16 = 4;
const TAG_PRD_CURSOR: u16 = 5;
const TAG_CMD_BYTES_LEFT: u16 = 6;
const TAG_DRQ_BYTES_LEFT: u16 = 7;
const TAG_CUR_SECTOR: u16 = 8;
const TAG_CUR_COMMAND: u16 = 9;
const TAG_DMA_DIRECTION: u16 = 10;
const TAG_DMA_INTERFACE_BYTES: u16 = 11;
const TAG_INTR_PENDING: u16 = 12;
const TAG_DEV_STATE: u16 = 13;
const TAG_DMA_STATE: u16 = 14;
const TAG_BUFFER: u16 = 15;
const TAG_TIMER: u16 = 16;
const TAG_DEFERRED_INTR: u16 = 17;
const TAG_SECTOR_CARRY: u16 = 18;

/// The single outstanding DMA timer, recorded by absolute deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub kind: TimerKind,
    pub deadline: Tick,
}

/// Everything needed to resume a drive mid-command. The backing image is
/// checkpointed separately by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdeDiskState {
    pub regs: CommandRegisters,
    pub nien: bool,
    pub drive: DriveId,
    pub cur_prd: PrdEntry,
    pub prd_cursor: u64,
    pub cmd_bytes_left: u32,
    pub drq_bytes_left: u32,
    pub cur_sector: u32,
    pub cur_command: u8,
    pub dma_direction: DmaDirection,
    pub dma_interface_bytes: u32,
    /// Sector split across PRD entries; `sector_fill` of its bytes have moved.
    pub sector_carry: [u8; SECTOR_SIZE],
    pub sector_fill: u32,
    pub intr_pending: bool,
    pub deferred_intr: bool,
    pub dev_state: DeviceState,
    pub dma_state: DmaState,
    pub buffer: Vec<u8>,
    pub timer: Option<PendingTimer>,
}

impl Default for IdeDiskState {
    fn default() -> Self {
        Self {
            regs: CommandRegisters::default(),
            nien: false,
            drive: DriveId::Master,
            cur_prd: PrdEntry::default(),
            prd_cursor: 0,
            cmd_bytes_left: 0,
            drq_bytes_left: 0,
            cur_sector: 0,
            cur_command: 0,
            dma_direction: DmaDirection::FromDisk,
            dma_interface_bytes: 0,
            sector_carry: [0; SECTOR_SIZE],
            sector_fill: 0,
            intr_pending: false,
            deferred_intr: false,
            dev_state: DeviceState::IdleSelected,
            dma_state: DmaState::Idle,
            buffer: vec![0; MAX_DMA_SIZE],
            timer: None,
        }
    }
}

impl IdeDiskState {
    /// Cross-field invariants a live drive always satisfies.
    pub fn validate(&self) -> SnapshotResult<()> {
        if self.buffer.len() != MAX_DMA_SIZE {
            return Err(SnapshotError::InvalidFieldEncoding("staging buffer length"));
        }
        if self.dma_state != DmaState::Idle && !self.dev_state.is_dma() {
            return Err(SnapshotError::InvalidFieldEncoding(
                "dma active outside a dma command",
            ));
        }
        if self.timer.is_some() && self.dma_state != DmaState::Transfer {
            return Err(SnapshotError::InvalidFieldEncoding(
                "timer recorded without a dma transfer",
            ));
        }
        if self.drq_bytes_left as usize > SECTOR_SIZE
            || self.dma_interface_bytes as usize > MAX_DMA_SIZE
            || self.sector_fill as usize >= SECTOR_SIZE
        {
            return Err(SnapshotError::InvalidFieldEncoding("transfer counter range"));
        }
        Ok(())
    }
}

impl IoSnapshot for IdeDiskState {
    const DEVICE_ID: [u8; 4] = *b"IDED";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 1);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_REGS, self.regs.encode().to_vec());
        w.field_bool(TAG_NIEN, self.nien);
        w.field_u8(TAG_DRIVE, self.drive.index() as u8);
        w.field_bytes(
            TAG_PRD,
            Encoder::new()
                .u32(self.cur_prd.base)
                .u16(self.cur_prd.count)
                .u16(self.cur_prd.flags)
                .finish(),
        );
        w.field_u64(TAG_PRD_CURSOR, self.prd_cursor);
        w.field_u32(TAG_CMD_BYTES_LEFT, self.cmd_bytes_left);
        w.field_u32(TAG_DRQ_BYTES_LEFT, self.drq_bytes_left);
        w.field_u32(TAG_CUR_SECTOR, self.cur_sector);
        w.field_u8(TAG_CUR_COMMAND, self.cur_command);
        w.field_u8(
            TAG_DMA_DIRECTION,
            match self.dma_direction {
                DmaDirection::FromDisk => 0,
                DmaDirection::ToDisk => 1,
            },
        );
        w.field_u32(TAG_DMA_INTERFACE_BYTES, self.dma_interface_bytes);
        w.field_bool(TAG_INTR_PENDING, self.intr_pending);
        w.field_u8(TAG_DEV_STATE, self.dev_state.to_u8());
        w.field_u8(TAG_DMA_STATE, self.dma_state.to_u8());
        w.field_bytes(TAG_BUFFER, self.buffer.clone());
        let timer = match self.timer {
            Some(t) => Encoder::new().bool(true).u8(t.kind.to_u8()).u64(t.deadline),
            None => Encoder::new().bool(false).u8(0).u64(0),
        };
        w.field_bytes(TAG_TIMER, timer.finish());
        w.field_bool(TAG_DEFERRED_INTR, self.deferred_intr);
        w.field_bytes(
            TAG_SECTOR_CARRY,
            Encoder::new()
                .u32(self.sector_fill)
                .bytes(&self.sector_carry)
                .finish(),
        );
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let mut next = Self::default();
        if let Some(buf) = r.bytes(TAG_REGS) {
            let raw: [u8; CommandRegisters::ENCODED_LEN] = buf
                .try_into()
                .map_err(|_| SnapshotError::InvalidFieldEncoding("register file length"))?;
            next.regs = CommandRegisters::decode(raw);
        }
        next.nien = r.bool(TAG_NIEN)?.unwrap_or(false);
        if let Some(idx) = r.u8(TAG_DRIVE)? {
            next.drive = DriveId::from_index(idx)
                .ok_or(SnapshotError::InvalidFieldEncoding("drive id"))?;
        }
        if let Some(buf) = r.bytes(TAG_PRD) {
            let mut d = Decoder::new(buf);
            next.cur_prd = PrdEntry {
                base: d.u32()?,
                count: d.u16()?,
                flags: d.u16()?,
            };
            d.finish()?;
        }
        next.prd_cursor = r.u64(TAG_PRD_CURSOR)?.unwrap_or(0);
        next.cmd_bytes_left = r.u32(TAG_CMD_BYTES_LEFT)?.unwrap_or(0);
        next.drq_bytes_left = r.u32(TAG_DRQ_BYTES_LEFT)?.unwrap_or(0);
        next.cur_sector = r.u32(TAG_CUR_SECTOR)?.unwrap_or(0);
        next.cur_command = r.u8(TAG_CUR_COMMAND)?.unwrap_or(0);
        next.dma_direction = match r.u8(TAG_DMA_DIRECTION)?.unwrap_or(0) {
            0 => DmaDirection::FromDisk,
            1 => DmaDirection::ToDisk,
            _ => return Err(SnapshotError::InvalidFieldEncoding("dma direction")),
        };
        next.dma_interface_bytes = r.u32(TAG_DMA_INTERFACE_BYTES)?.unwrap_or(0);
        next.intr_pending = r.bool(TAG_INTR_PENDING)?.unwrap_or(false);
        if let Some(v) = r.u8(TAG_DEV_STATE)? {
            next.dev_state =
                DeviceState::from_u8(v).ok_or(SnapshotError::InvalidFieldEncoding("device state"))?;
        }
        if let Some(v) = r.u8(TAG_DMA_STATE)? {
            next.dma_state =
                DmaState::from_u8(v).ok_or(SnapshotError::InvalidFieldEncoding("dma state"))?;
        }
        if let Some(buf) = r.bytes(TAG_BUFFER) {
            next.buffer = buf.to_vec();
        }
        if let Some(buf) = r.bytes(TAG_TIMER) {
            let mut d = Decoder::new(buf);
            let present = d.bool()?;
            let kind = d.u8()?;
            let deadline = d.u64()?;
            d.finish()?;
            if present {
                let kind = TimerKind::from_u8(kind)
                    .ok_or(SnapshotError::InvalidFieldEncoding("timer kind"))?;
                next.timer = Some(PendingTimer { kind, deadline });
            }
        }
        next.deferred_intr = r.bool(TAG_DEFERRED_INTR)?.unwrap_or(false);
        if let Some(buf) = r.bytes(TAG_SECTOR_CARRY) {
            let mut d = Decoder::new(buf);
            next.sector_fill = d.u32()?;
            next.sector_carry = d
                .bytes(SECTOR_SIZE)?
                .try_into()
                .map_err(|_| SnapshotError::InvalidFieldEncoding("sector carry length"))?;
            d.finish()?;
        }

        next.validate()?;
        *self = next;
        Ok(())
    }
}

impl IdeDisk {
    pub fn snapshot_state(&self) -> IdeDiskState {
        IdeDiskState {
            regs: self.regs,
            nien: self.nien,
            drive: self.drive,
            cur_prd: self.cur_prd,
            prd_cursor: self.prd_cursor,
            cmd_bytes_left: self.cmd_bytes_left,
            drq_bytes_left: self.drq_bytes_left,
            cur_sector: self.cur_sector,
            cur_command: self.cur_command,
            dma_direction: self.dma_direction,
            dma_interface_bytes: self.dma_interface_bytes,
            sector_carry: self.sector_carry,
            sector_fill: self.sector_fill,
            intr_pending: self.intr_pending,
            deferred_intr: self.deferred_intr,
            dev_state: self.dev_state,
            dma_state: self.dma_state,
            buffer: self.buffer.to_vec(),
            timer: self.timer.map(|t| PendingTimer {
                kind: t.kind,
                deadline: t.deadline,
            }),
        }
    }

    /// Replace the drive's state, cancelling its current timer and re-arming
    /// the recorded one at its original deadline.
    pub fn restore_state(
        &mut self,
        state: &IdeDiskState,
        timers: &mut TimerQueue<DiskEvent>,
    ) -> IdeResult<()> {
        state.validate()?;
        if state.drive != self.drive {
            return Err(SnapshotError::InvalidFieldEncoding("drive slot mismatch").into());
        }
        if let Some(old) = self.timer.take() {
            timers.cancel(old.id);
        }

        self.regs = state.regs;
        self.nien = state.nien;
        self.cur_prd = state.cur_prd;
        self.prd_cursor = state.prd_cursor;
        self.cmd_bytes_left = state.cmd_bytes_left;
        self.drq_bytes_left = state.drq_bytes_left;
        self.cur_sector = state.cur_sector;
        self.cur_command = state.cur_command;
        self.dma_direction = state.dma_direction;
        self.dma_interface_bytes = state.dma_interface_bytes;
        self.sector_carry = state.sector_carry;
        self.sector_fill = state.sector_fill;
        self.intr_pending = state.intr_pending;
        self.deferred_intr = state.deferred_intr;
        self.dev_state = state.dev_state;
        self.dma_state = state.dma_state;
        self.buffer.copy_from_slice(&state.buffer);

        if let Some(t) = state.timer {
            self.arm(t.kind, t.deadline, timers)?;
        }
        tracing::debug!(
            drive = ?self.drive,
            state = ?self.dev_state,
            dma = ?self.dma_state,
            timer = ?state.timer,
            "ide disk restored"
        );
        Ok(())
    }

    pub fn save_state(&self) -> Vec<u8> {
        self.snapshot_state().save_state()
    }

    pub fn load_state(
        &mut self,
        bytes: &[u8],
        timers: &mut TimerQueue<DiskEvent>,
    ) -> IdeResult<()> {
        let mut state = IdeDiskState::default();
        state.load_state(bytes)?;
        self.restore_state(&state, timers)
    }
}
