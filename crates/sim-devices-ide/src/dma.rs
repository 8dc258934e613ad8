//! PRD-driven DMA engine.
//!
//! A transfer walks the guest's PRD table one entry at a time. Each entry is
//! moved over the shared bus in sub-transfers that never cross a page
//! boundary; only once the whole entry has been "transferred" on the bus is
//! the data actually copied between guest memory, the staging buffer and the
//! disk image. Every wait (PRD fetch, bus backoff, sub-transfer completion)
//! is the drive's single armed timer.

use sim_memory::MemoryBus;
use sim_time::{Tick, TimerQueue};
use tracing::{debug, trace};

use crate::disk::{IdeContext, IdeDisk};
use crate::dma_bus::BusOp;
use crate::error::{IdeError, IdeResult};
use crate::image::SECTOR_SIZE;
use crate::regs::Action;
use crate::state::{ArmedTimer, DeviceState, DiskEvent, DmaState, TimerKind};

/// Largest transfer a single PRD entry can describe, and the staging buffer size.
pub const MAX_DMA_SIZE: usize = 0x10000;
pub const PRD_ENTRY_SIZE: u64 = 8;

const PRD_BASE_MASK: u32 = 0xFFFF_FFFE;
const PRD_COUNT_MASK: u16 = 0xFFFE;
const PRD_EOT: u16 = 0x8000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// READ DMA: disk to guest memory.
    #[default]
    FromDisk,
    /// WRITE DMA: guest memory to disk.
    ToDisk,
}

/// One physical region descriptor, as laid out in guest memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrdEntry {
    pub base: u32,
    pub count: u16,
    pub flags: u16,
}

impl PrdEntry {
    pub fn read_from(mem: &mut dyn MemoryBus, paddr: u64) -> Self {
        Self {
            base: mem.read_u32(paddr),
            count: mem.read_u16(paddr.wrapping_add(4)),
            flags: mem.read_u16(paddr.wrapping_add(6)),
        }
    }

    pub fn write_to(&self, mem: &mut dyn MemoryBus, paddr: u64) {
        mem.write_u32(paddr, self.base);
        mem.write_u16(paddr.wrapping_add(4), self.count);
        mem.write_u16(paddr.wrapping_add(6), self.flags);
    }

    pub fn base_addr(&self) -> u64 {
        u64::from(self.base & PRD_BASE_MASK)
    }

    /// A raw count of zero encodes 64 KiB; bit 0 is ignored.
    pub fn byte_count(&self) -> u32 {
        if self.count == 0 {
            MAX_DMA_SIZE as u32
        } else {
            u32::from(self.count & PRD_COUNT_MASK)
        }
    }

    pub fn eot(&self) -> bool {
        self.flags & PRD_EOT != 0
    }
}

/// Bytes that can move starting at `cur_addr` before the next page boundary,
/// capped at `bytes_left`. `page_size` must be a power of two.
pub fn bytes_in_dma_page(cur_addr: u64, bytes_left: u32, page_size: u64) -> u32 {
    let mut n = u64::from(bytes_left).min(page_size);
    let page_bound = (cur_addr & !(page_size - 1)) + page_size;
    if cur_addr + n >= page_bound {
        n = page_bound - cur_addr;
    }
    n as u32
}

impl IdeDisk {
    /// Host set the bus-master start bit for this drive.
    pub fn start_dma(&mut self, prd_table_base: u32, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        if self.dma_state != DmaState::Start || self.dev_state != DeviceState::TransferDataDma {
            return Err(self.inconsistent("start_dma"));
        }
        self.prd_cursor = ctx.host.pci_to_dma(u64::from(prd_table_base));
        self.dma_state = DmaState::Transfer;
        debug!(
            drive = ?self.drive,
            prd_table = self.prd_cursor,
            direction = ?self.dma_direction,
            bytes = self.cmd_bytes_left,
            "dma started"
        );
        self.arm(TimerKind::Kickoff, ctx.now + 1, ctx.timers)
    }

    /// Host cleared the start bit before the transfer finished.
    pub fn abort_dma(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        if self.dma_state == DmaState::Idle || !self.dev_state.is_dma() {
            return Err(self.inconsistent("abort_dma"));
        }
        if let Some(timer) = self.timer.take() {
            ctx.timers.cancel(timer.id);
        }
        self.dma_state = DmaState::Idle;
        debug!(drive = ?self.drive, left = self.cmd_bytes_left, "dma aborted");
        self.update_state(Action::CommandError, ctx)
    }

    /// Resume the DMA engine when its timer fires.
    pub fn handle_timer(&mut self, kind: TimerKind, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        let armed = self.timer.map(|t| t.kind);
        if armed != Some(kind) {
            return Err(IdeError::UnexpectedTimer { fired: kind, armed });
        }
        self.timer = None;
        match kind {
            TimerKind::Kickoff => self.fetch_prd(ctx),
            TimerKind::PrdFetch => self.prd_fetched(ctx),
            TimerKind::MemReadWait | TimerKind::MemWriteWait => self.start_prd_data(ctx),
            TimerKind::MemReadChunk | TimerKind::MemWriteChunk => self.chunk_done(ctx),
        }
    }

    pub(crate) fn arm(
        &mut self,
        kind: TimerKind,
        deadline: Tick,
        timers: &mut TimerQueue<DiskEvent>,
    ) -> IdeResult<()> {
        if let Some(outstanding) = self.timer {
            return Err(IdeError::TimerAlreadyArmed {
                new: kind,
                outstanding: outstanding.kind,
            });
        }
        let id = timers.schedule(
            deadline,
            DiskEvent {
                drive: self.drive,
                kind,
            },
        );
        self.timer = Some(ArmedTimer { kind, deadline, id });
        Ok(())
    }

    fn backoff(&mut self, kind: TimerKind, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        trace!(drive = ?self.drive, ?kind, "dma bus busy, backing off");
        let deadline = ctx.now + self.config.dma_backoff_ticks;
        self.arm(kind, deadline, ctx.timers)
    }

    fn fetch_prd(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        if self.dma_state != DmaState::Transfer || self.dev_state != DeviceState::TransferDataDma {
            return Err(self.inconsistent("dma transfer"));
        }
        if ctx.dma.busy(ctx.now) {
            return self.backoff(TimerKind::Kickoff, ctx);
        }
        let done = ctx
            .dma
            .issue(BusOp::Read, self.prd_cursor, PRD_ENTRY_SIZE as u32, ctx.now);
        self.arm(TimerKind::PrdFetch, done, ctx.timers)
    }

    fn prd_fetched(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        self.cur_prd = PrdEntry::read_from(ctx.mem, self.prd_cursor);
        self.prd_cursor += PRD_ENTRY_SIZE;
        trace!(
            drive = ?self.drive,
            base = self.cur_prd.base_addr(),
            count = self.cur_prd.byte_count(),
            eot = self.cur_prd.eot(),
            "prd fetched"
        );
        self.start_prd_data(ctx)
    }

    /// Bus operation plus the wait/chunk timers for the current direction.
    fn bus_plan(&self) -> (BusOp, TimerKind, TimerKind) {
        match self.dma_direction {
            DmaDirection::ToDisk => (BusOp::Read, TimerKind::MemReadWait, TimerKind::MemReadChunk),
            DmaDirection::FromDisk => (
                BusOp::WriteInvalidate,
                TimerKind::MemWriteWait,
                TimerKind::MemWriteChunk,
            ),
        }
    }

    /// First sub-transfer of a PRD; it carries the disk delay.
    fn start_prd_data(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        let (op, wait, chunk) = self.bus_plan();
        if ctx.dma.busy(ctx.now) {
            return self.backoff(wait, ctx);
        }
        let count = self.cur_prd.byte_count();
        let total_delay = self.disk_delay + u64::from(count / SECTOR_SIZE as u32);
        let base = self.cur_prd.base_addr();
        let n = bytes_in_dma_page(base, count, self.config.dma_page_size);
        self.dma_interface_bytes = n;
        let done = ctx
            .dma
            .issue(op, ctx.host.pci_to_dma(base), n, ctx.now + total_delay);
        self.arm(chunk, done, ctx.timers)
    }

    fn chunk_done(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        let count = self.cur_prd.byte_count();
        if self.dma_interface_bytes < count {
            let (op, _, chunk) = self.bus_plan();
            if ctx.dma.busy(ctx.now) {
                return self.backoff(chunk, ctx);
            }
            let cur = self.cur_prd.base_addr() + u64::from(self.dma_interface_bytes);
            let n = bytes_in_dma_page(
                cur,
                count - self.dma_interface_bytes,
                self.config.dma_page_size,
            );
            self.dma_interface_bytes += n;
            let done = ctx.dma.issue(op, ctx.host.pci_to_dma(cur), n, ctx.now);
            return self.arm(chunk, done, ctx.timers);
        }

        match self.dma_direction {
            DmaDirection::ToDisk => self.copy_prd_to_disk(ctx)?,
            DmaDirection::FromDisk => self.copy_prd_from_disk(ctx)?,
        }
        self.finish_prd(ctx)
    }

    /// Stage the entry from guest memory, then write every sector it
    /// completes. A trailing partial sector waits in the carry for the next
    /// entry.
    fn copy_prd_to_disk(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        let count = self.cur_prd.byte_count();
        let base = self.cur_prd.base_addr();
        self.buffer.fill(0);

        let mut staged = 0u32;
        while staged < count {
            let cur = base + u64::from(staged);
            let n = bytes_in_dma_page(cur, count - staged, self.config.dma_page_size);
            self.cmd_bytes_left = self
                .cmd_bytes_left
                .checked_sub(n)
                .ok_or(IdeError::DmaOverrun)?;
            let dst = &mut self.buffer[staged as usize..(staged + n) as usize];
            ctx.mem.read_physical(ctx.host.pci_to_dma(cur), dst);
            staged += n;
        }

        let count = count as usize;
        let mut off = 0;
        if self.sector_fill != 0 {
            let fill = self.sector_fill as usize;
            let take = (SECTOR_SIZE - fill).min(count);
            self.sector_carry[fill..fill + take].copy_from_slice(&self.buffer[..take]);
            self.sector_fill += take as u32;
            off = take;
            if self.sector_fill as usize == SECTOR_SIZE {
                self.write_carry()?;
            }
        }
        while count - off >= SECTOR_SIZE {
            self.write_disk(self.cur_sector, off)?;
            self.cur_sector += 1;
            off += SECTOR_SIZE;
        }
        if off < count {
            let rest = count - off;
            self.sector_carry[..rest].copy_from_slice(&self.buffer[off..count]);
            self.sector_fill = rest as u32;
        }
        Ok(())
    }

    /// Assemble the entry in the staging buffer (the unread tail of a sector
    /// opened by the previous entry, then fresh sectors) and copy it to guest
    /// memory in chunks that never cross a page boundary.
    fn copy_prd_from_disk(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        let count = self.cur_prd.byte_count();
        let base = self.cur_prd.base_addr();
        self.cmd_bytes_left = self
            .cmd_bytes_left
            .checked_sub(count)
            .ok_or(IdeError::DmaOverrun)?;
        self.buffer.fill(0);

        let len = count as usize;
        let mut filled = 0;
        if self.sector_fill != 0 {
            let fill = self.sector_fill as usize;
            let take = (SECTOR_SIZE - fill).min(len);
            self.buffer[..take].copy_from_slice(&self.sector_carry[fill..fill + take]);
            self.sector_fill = ((fill + take) % SECTOR_SIZE) as u32;
            filled = take;
        }
        while len - filled >= SECTOR_SIZE {
            self.read_disk(self.cur_sector, filled)?;
            self.cur_sector += 1;
            filled += SECTOR_SIZE;
        }
        if filled < len {
            let rest = len - filled;
            self.read_carry()?;
            self.buffer[filled..len].copy_from_slice(&self.sector_carry[..rest]);
            self.sector_fill = rest as u32;
        }

        let mut flushed = 0u32;
        while flushed < count {
            let cur = base + u64::from(flushed);
            let n = bytes_in_dma_page(cur, count - flushed, self.config.dma_page_size);
            let src = &self.buffer[flushed as usize..(flushed + n) as usize];
            ctx.mem.write_physical(ctx.host.pci_to_dma(cur), src);
            flushed += n;
        }
        Ok(())
    }

    fn read_carry(&mut self) -> IdeResult<()> {
        let sector = self.cur_sector;
        let got = self.image.read_sector(u64::from(sector), &mut self.sector_carry);
        if got != SECTOR_SIZE {
            return Err(IdeError::ShortRead {
                sector: sector.into(),
                got,
            });
        }
        self.cur_sector += 1;
        Ok(())
    }

    fn write_carry(&mut self) -> IdeResult<()> {
        let sector = self.cur_sector;
        let got = self.image.write_sector(u64::from(sector), &self.sector_carry);
        if got != SECTOR_SIZE {
            return Err(IdeError::ShortWrite {
                sector: sector.into(),
                got,
            });
        }
        self.cur_sector += 1;
        self.sector_fill = 0;
        Ok(())
    }

    fn finish_prd(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        if !self.cur_prd.eot() {
            return self.fetch_prd(ctx);
        }
        if self.cmd_bytes_left != 0 {
            return Err(IdeError::PrdTableShort(self.cmd_bytes_left));
        }
        self.dma_state = DmaState::Idle;
        debug!(drive = ?self.drive, "dma complete");
        self.update_state(Action::DmaDone, ctx)
    }
}
