use sim_io_snapshot::io::state::{SnapshotError, SnapshotReader, SnapshotVersion, SnapshotWriter};
use sim_memory::Bus;
use sim_time::{Interrupt, IrqLog, Tick, TimerQueue};

use crate::channel::{IdeChannel, PlatformBus};
use crate::disk::IdeDisk;
use crate::dma_bus::SharedDmaBus;
use crate::error::IdeResult;
use crate::regs::{AccessWidth, REG_ALT_STATUS_CONTROL, REG_STATUS_COMMAND};
use crate::state::DiskEvent;

const SYSTEM_DEVICE_ID: [u8; 4] = *b"IDES";
const SYSTEM_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);
const TAG_NOW: u16 = 1;
const TAG_CHANNEL: u16 = 2;

/// Legacy primary-channel IRQ.
pub const PRIMARY_IDE_IRQ: u8 = 14;

/// A self-contained machine: guest RAM, one shared DMA bus, one IDE channel
/// and the event queue that drives them.
#[derive(Debug)]
pub struct IdeSystem {
    pub mem: Bus,
    pub dma: SharedDmaBus,
    pub irq: IrqLog,
    pub channel: IdeChannel,
    timers: TimerQueue<DiskEvent>,
    now: Tick,
}

impl IdeSystem {
    pub fn new(mem_size: usize, dma: SharedDmaBus) -> Self {
        Self {
            mem: Bus::new(mem_size),
            dma,
            irq: IrqLog::new(),
            channel: IdeChannel::new(Interrupt::Irq(PRIMARY_IDE_IRQ)),
            timers: TimerQueue::new(),
            now: 0,
        }
    }

    pub fn attach(&mut self, disk: IdeDisk) -> IdeResult<()> {
        self.channel.attach(disk)
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn pending_events(&self) -> usize {
        self.timers.len()
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq.is_asserted(self.channel.irq_line())
    }

    fn split(&mut self) -> (&mut IdeChannel, PlatformBus<'_>) {
        (
            &mut self.channel,
            PlatformBus {
                now: self.now,
                mem: &mut self.mem,
                dma: &mut self.dma,
                timers: &mut self.timers,
                irq: &mut self.irq,
            },
        )
    }

    pub fn cmd_read(&mut self, offset: u64, width: AccessWidth) -> IdeResult<u16> {
        let (channel, mut bus) = self.split();
        channel.cmd_read(offset, width, &mut bus)
    }

    pub fn cmd_write(&mut self, offset: u64, width: AccessWidth, value: u16) -> IdeResult<()> {
        let (channel, mut bus) = self.split();
        channel.cmd_write(offset, width, value, &mut bus)
    }

    pub fn ctrl_read(&mut self) -> IdeResult<u8> {
        let (channel, mut bus) = self.split();
        channel
            .ctrl_read(REG_ALT_STATUS_CONTROL, AccessWidth::Byte, &mut bus)
            .map(|v| v as u8)
    }

    pub fn ctrl_write(&mut self, value: u8) -> IdeResult<()> {
        let (channel, mut bus) = self.split();
        channel.ctrl_write(
            REG_ALT_STATUS_CONTROL,
            AccessWidth::Byte,
            value.into(),
            &mut bus,
        )
    }

    pub fn bm_read(&self, offset: u64, size: u8) -> u32 {
        self.channel.bm_read(offset, size)
    }

    pub fn bm_write(&mut self, offset: u64, size: u8, value: u32) -> IdeResult<()> {
        let (channel, mut bus) = self.split();
        channel.bm_write(offset, size, value, &mut bus)
    }

    /// Read the status register, acknowledging any pending interrupt.
    pub fn read_status(&mut self) -> IdeResult<u8> {
        self.cmd_read(REG_STATUS_COMMAND, AccessWidth::Byte)
            .map(|v| v as u8)
    }

    /// Advance to the next event and deliver it. Returns `false` when the
    /// queue is empty.
    pub fn step(&mut self) -> IdeResult<bool> {
        let Some(deadline) = self.timers.next_deadline() else {
            return Ok(false);
        };
        self.now = self.now.max(deadline);
        let Some(event) = self.timers.pop_due(self.now) else {
            return Ok(false);
        };
        let (channel, mut bus) = self.split();
        channel.handle_event(event.payload, &mut bus)?;
        Ok(true)
    }

    /// Deliver every event due at or before `until`, then park the clock there.
    pub fn run_until(&mut self, until: Tick) -> IdeResult<()> {
        while let Some(deadline) = self.timers.next_deadline() {
            if deadline > until {
                break;
            }
            self.step()?;
        }
        self.now = self.now.max(until);
        Ok(())
    }

    /// Run until no events remain. Returns the number of events delivered.
    pub fn run_until_idle(&mut self) -> IdeResult<usize> {
        let mut delivered = 0;
        while self.step()? {
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Checkpoint the clock and the channel (with its drives). Guest memory,
    /// the DMA bus and disk images are owned by the caller.
    pub fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(SYSTEM_DEVICE_ID, SYSTEM_VERSION);
        w.field_u64(TAG_NOW, self.now);
        w.field_bytes(TAG_CHANNEL, self.channel.save_state());
        w.finish()
    }

    /// Restore a checkpoint taken by [`IdeSystem::save_state`]. The whole
    /// checkpoint is validated before anything changes; queued events are
    /// then discarded and drives re-arm their recorded timers.
    pub fn load_state(&mut self, bytes: &[u8]) -> IdeResult<()> {
        let r = SnapshotReader::parse(bytes, SYSTEM_DEVICE_ID)?;
        r.ensure_device_major(SYSTEM_VERSION.major)?;
        let now = r.u64(TAG_NOW)?.unwrap_or(0);
        let channel = r
            .bytes(TAG_CHANNEL)
            .ok_or(SnapshotError::InvalidFieldEncoding("missing channel"))?;
        let channel = self.channel.decode_state(channel)?;

        self.timers.clear();
        self.now = now;
        self.channel
            .apply_state(channel, &mut self.timers, &mut self.irq, now)
    }
}
