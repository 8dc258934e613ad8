//! One IDE channel: up to two drives behind a shared register decode, plus
//! the channel's bus-master DMA register block.

use sim_io_snapshot::io::state::codec::{Decoder, Encoder};
use sim_io_snapshot::io::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotVersion, SnapshotWriter,
};
use sim_memory::MemoryBus;
use sim_time::{Interrupt, InterruptSink, Tick, TimerQueue};
use tracing::debug;

use crate::config::DriveId;
use crate::disk::{IdeContext, IdeDisk, IdeHost};
use crate::dma_bus::DmaBus;
use crate::error::{IdeError, IdeResult};
use crate::regs::{AccessWidth, RegisterBlock, DRIVE_DEV, REG_DRIVE_HEAD};
use crate::snapshot::IdeDiskState;
use crate::state::{DiskEvent, DmaState};

pub const IDE_CHANNEL_DEVICE_ID: [u8; 4] = *b"IDEC";
const IDE_CHANNEL_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

const TAG_BUS_MASTER: u16 = 1;
const TAG_SELECTED: u16 = 2;
const TAG_POSTED: u16 = 3;
const TAG_DRIVE_MASTER: u16 = 4;
const TAG_DRIVE_SLAVE: u16 = 5;

pub const BM_REG_COMMAND: u64 = 0;
pub const BM_REG_STATUS: u64 = 2;
pub const BM_REG_PRD_TABLE: u64 = 4;

pub const BM_CMD_START: u8 = 0x01;
/// Set when the bus master writes guest memory (READ DMA).
pub const BM_CMD_WRITE: u8 = 0x08;
pub const BM_STATUS_ACTIVE: u8 = 0x01;
pub const BM_STATUS_ERROR: u8 = 0x02;
pub const BM_STATUS_IRQ: u8 = 0x04;
const BM_STATUS_DRIVE_DMA_CAPABLE: u8 = 0x60;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BusMasterRegs {
    command: u8,
    status: u8,
    prd_table: u32,
}

/// Platform collaborators for one channel access.
pub struct PlatformBus<'a> {
    pub now: Tick,
    pub mem: &'a mut dyn MemoryBus,
    pub dma: &'a mut dyn DmaBus,
    pub timers: &'a mut TimerQueue<DiskEvent>,
    pub irq: &'a mut dyn InterruptSink,
}

/// The channel as seen by one of its drives during a callback.
struct ChannelLink<'a> {
    bus_master: &'a mut BusMasterRegs,
    posted: &'a mut [bool; 2],
    line: Interrupt,
    irq: &'a mut dyn InterruptSink,
    now: Tick,
}

impl IdeHost for ChannelLink<'_> {
    fn intr_post(&mut self, drive: DriveId) {
        let was_asserted = self.posted.iter().any(|p| *p);
        self.posted[drive.index()] = true;
        self.bus_master.status |= BM_STATUS_IRQ;
        if !was_asserted {
            self.irq.raise(self.line, self.now);
        }
    }

    fn intr_clear(&mut self, drive: DriveId) {
        self.posted[drive.index()] = false;
        if !self.posted.iter().any(|p| *p) {
            self.irq.lower(self.line, self.now);
        }
    }

    fn dma_complete(&mut self, drive: DriveId) {
        debug!(?drive, "bus master transfer complete");
        self.bus_master.status &= !BM_STATUS_ACTIVE;
        self.bus_master.status |= BM_STATUS_IRQ;
    }
}

/// A decoded and validated channel checkpoint.
#[derive(Debug)]
pub(crate) struct ChannelState {
    bus_master: BusMasterRegs,
    selected: DriveId,
    posted: [bool; 2],
    drives: [Option<IdeDiskState>; 2],
}

#[derive(Debug)]
pub struct IdeChannel {
    drives: [Option<IdeDisk>; 2],
    selected: DriveId,
    bus_master: BusMasterRegs,
    posted: [bool; 2],
    line: Interrupt,
}

impl IdeChannel {
    pub fn new(line: Interrupt) -> Self {
        Self {
            drives: [None, None],
            selected: DriveId::Master,
            bus_master: BusMasterRegs::default(),
            posted: [false; 2],
            line,
        }
    }

    /// Attach a drive in the slot named by its configuration.
    pub fn attach(&mut self, disk: IdeDisk) -> IdeResult<()> {
        let id = disk.drive();
        let slot = &mut self.drives[id.index()];
        if slot.is_some() {
            return Err(IdeError::DriveSlotTaken(id));
        }
        *slot = Some(disk);
        self.bus_master.status |= match id {
            DriveId::Master => 0x20,
            DriveId::Slave => 0x40,
        };
        Ok(())
    }

    pub fn drive(&self, id: DriveId) -> Option<&IdeDisk> {
        self.drives[id.index()].as_ref()
    }

    pub fn drive_mut(&mut self, id: DriveId) -> Option<&mut IdeDisk> {
        self.drives[id.index()].as_mut()
    }

    pub fn selected(&self) -> DriveId {
        self.selected
    }

    pub fn irq_line(&self) -> Interrupt {
        self.line
    }

    pub fn irq_asserted(&self) -> bool {
        self.posted.iter().any(|p| *p)
    }

    fn with_drive<R>(
        &mut self,
        id: DriveId,
        bus: &mut PlatformBus<'_>,
        f: impl FnOnce(&mut IdeDisk, &mut IdeContext<'_>) -> IdeResult<R>,
    ) -> IdeResult<R> {
        let Self {
            drives,
            bus_master,
            posted,
            line,
            ..
        } = self;
        let disk = drives[id.index()].as_mut().ok_or(IdeError::NoDrive(id))?;
        let mut link = ChannelLink {
            bus_master,
            posted,
            line: *line,
            irq: &mut *bus.irq,
            now: bus.now,
        };
        let mut ctx = IdeContext {
            now: bus.now,
            mem: &mut *bus.mem,
            dma: &mut *bus.dma,
            timers: &mut *bus.timers,
            host: &mut link,
        };
        f(disk, &mut ctx)
    }

    /// Command-block read from the selected drive. An empty slot floats high.
    pub fn cmd_read(
        &mut self,
        offset: u64,
        width: AccessWidth,
        bus: &mut PlatformBus<'_>,
    ) -> IdeResult<u16> {
        let sel = self.selected;
        if self.drives[sel.index()].is_none() {
            return Ok(match width {
                AccessWidth::Byte => 0xFF,
                AccessWidth::Word => 0xFFFF,
            });
        }
        self.with_drive(sel, bus, |d, ctx| {
            d.read(RegisterBlock::Command, offset, width, ctx)
        })
    }

    /// Command-block write. The drive/head register is latched by both drives.
    pub fn cmd_write(
        &mut self,
        offset: u64,
        width: AccessWidth,
        value: u16,
        bus: &mut PlatformBus<'_>,
    ) -> IdeResult<()> {
        if offset == REG_DRIVE_HEAD && width == AccessWidth::Byte {
            self.selected = if value as u8 & DRIVE_DEV != 0 {
                DriveId::Slave
            } else {
                DriveId::Master
            };
            for id in [DriveId::Master, DriveId::Slave] {
                if self.drives[id.index()].is_some() {
                    self.with_drive(id, bus, |d, ctx| {
                        d.write(RegisterBlock::Command, offset, width, value, ctx)
                    })?;
                }
            }
            return Ok(());
        }

        let sel = self.selected;
        if self.drives[sel.index()].is_none() {
            return Ok(());
        }
        self.with_drive(sel, bus, |d, ctx| {
            d.write(RegisterBlock::Command, offset, width, value, ctx)
        })
    }

    pub fn ctrl_read(
        &mut self,
        offset: u64,
        width: AccessWidth,
        bus: &mut PlatformBus<'_>,
    ) -> IdeResult<u16> {
        let sel = self.selected;
        if self.drives[sel.index()].is_none() {
            return Ok(0xFF);
        }
        self.with_drive(sel, bus, |d, ctx| {
            d.read(RegisterBlock::Control, offset, width, ctx)
        })
    }

    pub fn ctrl_write(
        &mut self,
        offset: u64,
        width: AccessWidth,
        value: u16,
        bus: &mut PlatformBus<'_>,
    ) -> IdeResult<()> {
        let sel = self.selected;
        if self.drives[sel.index()].is_none() {
            return Ok(());
        }
        self.with_drive(sel, bus, |d, ctx| {
            d.write(RegisterBlock::Control, offset, width, value, ctx)
        })
    }

    pub fn bm_read(&self, offset: u64, size: u8) -> u32 {
        let bm = &self.bus_master;
        match (offset, size) {
            (_, 0) => 0,
            (BM_REG_COMMAND, _) => bm.command.into(),
            (BM_REG_STATUS, _) => bm.status.into(),
            (BM_REG_PRD_TABLE, 4) => bm.prd_table,
            (BM_REG_PRD_TABLE, 2) => bm.prd_table & 0xFFFF,
            (4..=7, 1) => (bm.prd_table >> ((offset - 4) * 8)) & 0xFF,
            _ => 0,
        }
    }

    pub fn bm_write(
        &mut self,
        offset: u64,
        size: u8,
        value: u32,
        bus: &mut PlatformBus<'_>,
    ) -> IdeResult<()> {
        match offset {
            BM_REG_COMMAND => self.bm_command(value as u8, bus)?,
            BM_REG_STATUS => {
                let v = value as u8;
                let bm = &mut self.bus_master;
                bm.status &= !(v & (BM_STATUS_IRQ | BM_STATUS_ERROR));
                bm.status = (bm.status & !BM_STATUS_DRIVE_DMA_CAPABLE)
                    | (v & BM_STATUS_DRIVE_DMA_CAPABLE);
            }
            BM_REG_PRD_TABLE if size == 4 => self.bus_master.prd_table = value & !0x3,
            4..=7 if size == 1 => {
                let shift = (offset - 4) * 8;
                let prd = &mut self.bus_master.prd_table;
                *prd = (*prd & !(0xFF << shift)) | ((value & 0xFF) << shift);
                *prd &= !0x3;
            }
            _ => {}
        }
        Ok(())
    }

    fn bm_command(&mut self, val: u8, bus: &mut PlatformBus<'_>) -> IdeResult<()> {
        let old = self.bus_master.command;
        let new = val & (BM_CMD_START | BM_CMD_WRITE);
        self.bus_master.command = new;
        let sel = self.selected;

        if new & BM_CMD_START != 0 && old & BM_CMD_START == 0 {
            self.bus_master.status |= BM_STATUS_ACTIVE;
            let prd_table = self.bus_master.prd_table;
            debug!(drive = ?sel, prd_table, "bus master start");
            self.with_drive(sel, bus, |d, ctx| d.start_dma(prd_table, ctx))?;
        } else if new & BM_CMD_START == 0 && old & BM_CMD_START != 0 {
            let in_flight = self.drives[sel.index()]
                .as_ref()
                .is_some_and(|d| d.dma_state() != DmaState::Idle);
            if in_flight {
                self.with_drive(sel, bus, |d, ctx| d.abort_dma(ctx))?;
            }
            self.bus_master.status &= !BM_STATUS_ACTIVE;
        }
        Ok(())
    }

    /// Deliver a timer popped from the queue to the drive that armed it.
    pub fn handle_event(&mut self, event: DiskEvent, bus: &mut PlatformBus<'_>) -> IdeResult<()> {
        self.with_drive(event.drive, bus, |d, ctx| d.handle_timer(event.kind, ctx))
    }

    pub fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(IDE_CHANNEL_DEVICE_ID, IDE_CHANNEL_VERSION);
        let bm = &self.bus_master;
        w.field_bytes(
            TAG_BUS_MASTER,
            Encoder::new()
                .u8(bm.command)
                .u8(bm.status)
                .u32(bm.prd_table)
                .finish(),
        );
        w.field_u8(TAG_SELECTED, self.selected.index() as u8);
        w.field_bytes(
            TAG_POSTED,
            Encoder::new()
                .bool(self.posted[0])
                .bool(self.posted[1])
                .finish(),
        );
        for (tag, slot) in [TAG_DRIVE_MASTER, TAG_DRIVE_SLAVE].into_iter().zip(&self.drives) {
            if let Some(disk) = slot {
                w.field_bytes(tag, disk.save_state());
            }
        }
        w.finish()
    }

    /// Restore channel registers and every attached drive, then drive the
    /// interrupt line to match the restored pending interrupts. The set of
    /// attached drives must match the checkpoint. Nothing changes unless the
    /// whole checkpoint is valid.
    pub fn load_state(
        &mut self,
        bytes: &[u8],
        timers: &mut TimerQueue<DiskEvent>,
        irq: &mut dyn InterruptSink,
        now: Tick,
    ) -> IdeResult<()> {
        let state = self.decode_state(bytes)?;
        self.apply_state(state, timers, irq, now)
    }

    pub(crate) fn decode_state(&self, bytes: &[u8]) -> IdeResult<ChannelState> {
        let r = SnapshotReader::parse(bytes, IDE_CHANNEL_DEVICE_ID)?;
        r.ensure_device_major(IDE_CHANNEL_VERSION.major)?;

        let mut drives = [None, None];
        for ((tag, slot), decoded) in [TAG_DRIVE_MASTER, TAG_DRIVE_SLAVE]
            .into_iter()
            .zip(&self.drives)
            .zip(drives.iter_mut())
        {
            match (slot, r.bytes(tag)) {
                (Some(disk), Some(blob)) => {
                    let mut state = IdeDiskState::default();
                    state.load_state(blob)?;
                    if state.drive != disk.drive() {
                        let err = SnapshotError::InvalidFieldEncoding("drive slot mismatch");
                        return Err(err.into());
                    }
                    *decoded = Some(state);
                }
                (None, None) => {}
                _ => {
                    let err = SnapshotError::InvalidFieldEncoding("attached drives differ");
                    return Err(err.into());
                }
            }
        }

        let mut bus_master = BusMasterRegs::default();
        if let Some(buf) = r.bytes(TAG_BUS_MASTER) {
            let mut d = Decoder::new(buf);
            bus_master.command = d.u8()?;
            bus_master.status = d.u8()?;
            bus_master.prd_table = d.u32()?;
            d.finish()?;
        }
        let selected = match r.u8(TAG_SELECTED)? {
            Some(idx) => DriveId::from_index(idx)
                .ok_or(SnapshotError::InvalidFieldEncoding("selected drive"))?,
            None => DriveId::Master,
        };
        let mut posted = [false; 2];
        if let Some(buf) = r.bytes(TAG_POSTED) {
            let mut d = Decoder::new(buf);
            posted = [d.bool()?, d.bool()?];
            d.finish()?;
        }

        Ok(ChannelState {
            bus_master,
            selected,
            posted,
            drives,
        })
    }

    pub(crate) fn apply_state(
        &mut self,
        state: ChannelState,
        timers: &mut TimerQueue<DiskEvent>,
        irq: &mut dyn InterruptSink,
        now: Tick,
    ) -> IdeResult<()> {
        for (slot, decoded) in self.drives.iter_mut().zip(&state.drives) {
            if let (Some(disk), Some(decoded)) = (slot.as_mut(), decoded) {
                disk.restore_state(decoded, timers)?;
            }
        }

        let was_asserted = self.irq_asserted();
        self.bus_master = state.bus_master;
        self.selected = state.selected;
        self.posted = state.posted;
        match (was_asserted, self.irq_asserted()) {
            (false, true) => irq.raise(self.line, now),
            (true, false) => irq.lower(self.line, now),
            _ => {}
        }
        Ok(())
    }
}
