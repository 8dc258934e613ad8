#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use sim_devices_ide::regs::{
    DRIVE_DEV, DRIVE_LBA, REG_CYLINDER_HIGH, REG_CYLINDER_LOW, REG_DATA, REG_DRIVE_HEAD,
    REG_SECTOR_COUNT, REG_SECTOR_NUMBER, REG_STATUS_COMMAND, STATUS_BSY, STATUS_DRQ,
};
use sim_devices_ide::{
    AccessWidth, BusOp, DiskEvent, DiskImage, DmaBus, DriveId, IdeContext, IdeDisk,
    IdeDiskConfig, IdeHost, IdeResult, IdeSystem, MemDisk, PrdEntry, RegisterBlock,
    SharedDmaBus, SECTOR_SIZE,
};
use sim_memory::{Bus, MemoryBus};
use sim_time::{Tick, TimerQueue};

pub fn pattern(lba: u64, i: usize) -> u8 {
    (lba as usize).wrapping_mul(31).wrapping_add(i.wrapping_mul(7)) as u8
}

pub fn sector_pattern(lba: u64) -> Vec<u8> {
    (0..SECTOR_SIZE).map(|i| pattern(lba, i)).collect()
}

/// Image whose every sector holds a recognisable pattern.
pub fn patterned_disk(sectors: u64) -> MemDisk {
    let mut disk = MemDisk::new(sectors);
    for lba in 0..sectors {
        disk.write_sector(lba, &sector_pattern(lba));
    }
    disk
}

pub fn dump_image(image: &mut dyn DiskImage) -> Vec<u8> {
    let mut out = vec![0u8; image.sectors() as usize * SECTOR_SIZE];
    for (lba, chunk) in out.chunks_exact_mut(SECTOR_SIZE).enumerate() {
        assert_eq!(image.read_sector(lba as u64, chunk), SECTOR_SIZE);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOp {
    Read(u64),
    Write(u64),
}

/// MemDisk that records every sector access.
pub struct RecordingDisk {
    pub inner: MemDisk,
    pub log: Rc<RefCell<Vec<DiskOp>>>,
}

impl RecordingDisk {
    pub fn new(inner: MemDisk) -> (Self, Rc<RefCell<Vec<DiskOp>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                inner,
                log: log.clone(),
            },
            log,
        )
    }
}

impl DiskImage for RecordingDisk {
    fn sectors(&self) -> u64 {
        self.inner.sectors()
    }

    fn read_sector(&mut self, lba: u64, buf: &mut [u8]) -> usize {
        self.log.borrow_mut().push(DiskOp::Read(lba));
        self.inner.read_sector(lba, buf)
    }

    fn write_sector(&mut self, lba: u64, data: &[u8]) -> usize {
        self.log.borrow_mut().push(DiskOp::Write(lba));
        self.inner.write_sector(lba, data)
    }
}

#[derive(Debug, Default)]
pub struct CountingHost {
    pub posts: usize,
    pub clears: usize,
    pub dma_done: usize,
}

impl IdeHost for CountingHost {
    fn intr_post(&mut self, _drive: DriveId) {
        self.posts += 1;
    }

    fn intr_clear(&mut self, _drive: DriveId) {
        self.clears += 1;
    }

    fn dma_complete(&mut self, _drive: DriveId) {
        self.dma_done += 1;
    }
}

/// Bus that reports itself busy on chosen `busy()` polls.
pub struct FlakyBus {
    pub inner: SharedDmaBus,
    pub busy_polls: Vec<usize>,
    polls: Cell<usize>,
}

impl FlakyBus {
    pub fn new(busy_polls: Vec<usize>) -> Self {
        Self {
            inner: SharedDmaBus::default(),
            busy_polls,
            polls: Cell::new(0),
        }
    }
}

impl DmaBus for FlakyBus {
    fn busy(&self, now: Tick) -> bool {
        let n = self.polls.get();
        self.polls.set(n + 1);
        self.busy_polls.contains(&n) || self.inner.busy(now)
    }

    fn issue(&mut self, op: BusOp, addr: u64, len: u32, ready_at: Tick) -> Tick {
        self.inner.issue(op, addr, len, ready_at)
    }
}

/// A single drive wired straight to in-memory collaborators.
pub struct Rig<B: DmaBus = SharedDmaBus> {
    pub disk: IdeDisk,
    pub mem: Bus,
    pub dma: B,
    pub timers: TimerQueue<DiskEvent>,
    pub host: CountingHost,
    pub now: Tick,
}

impl Rig<SharedDmaBus> {
    pub fn new(image: impl DiskImage + 'static) -> Self {
        Self::with_bus(image, IdeDiskConfig::default(), SharedDmaBus::default())
    }
}

impl<B: DmaBus> Rig<B> {
    pub fn with_bus(image: impl DiskImage + 'static, config: IdeDiskConfig, dma: B) -> Self {
        Self {
            disk: IdeDisk::new(Box::new(image), config).unwrap(),
            mem: Bus::new(0x4_0000),
            dma,
            timers: TimerQueue::new(),
            host: CountingHost::default(),
            now: 0,
        }
    }

    pub fn split(&mut self) -> (&mut IdeDisk, IdeContext<'_>) {
        (
            &mut self.disk,
            IdeContext {
                now: self.now,
                mem: &mut self.mem,
                dma: &mut self.dma,
                timers: &mut self.timers,
                host: &mut self.host,
            },
        )
    }

    pub fn read_reg(&mut self, offset: u64) -> IdeResult<u8> {
        let (disk, mut ctx) = self.split();
        disk.read(RegisterBlock::Command, offset, AccessWidth::Byte, &mut ctx)
            .map(|v| v as u8)
    }

    pub fn write_reg(&mut self, offset: u64, value: u8) -> IdeResult<()> {
        let (disk, mut ctx) = self.split();
        disk.write(
            RegisterBlock::Command,
            offset,
            AccessWidth::Byte,
            value.into(),
            &mut ctx,
        )
    }

    pub fn read_data(&mut self) -> IdeResult<u16> {
        let (disk, mut ctx) = self.split();
        disk.read(RegisterBlock::Command, REG_DATA, AccessWidth::Word, &mut ctx)
    }

    pub fn write_data(&mut self, value: u16) -> IdeResult<()> {
        let (disk, mut ctx) = self.split();
        disk.write(
            RegisterBlock::Command,
            REG_DATA,
            AccessWidth::Word,
            value,
            &mut ctx,
        )
    }

    pub fn status(&mut self) -> u8 {
        self.read_reg(REG_STATUS_COMMAND).unwrap()
    }

    /// Program an LBA command for this drive and write the opcode.
    pub fn command(&mut self, opcode: u8, lba: u32, count: u8) -> IdeResult<()> {
        let dev = match self.disk.drive() {
            DriveId::Master => 0,
            DriveId::Slave => DRIVE_DEV,
        };
        let [b0, b1, b2, b3] = lba.to_le_bytes();
        self.write_reg(REG_DRIVE_HEAD, DRIVE_LBA | dev | (b3 & 0x0F))?;
        self.write_reg(REG_SECTOR_COUNT, count)?;
        self.write_reg(REG_SECTOR_NUMBER, b0)?;
        self.write_reg(REG_CYLINDER_LOW, b1)?;
        self.write_reg(REG_CYLINDER_HIGH, b2)?;
        self.write_reg(REG_STATUS_COMMAND, opcode)
    }

    /// Poll status until the drive requests data.
    pub fn wait_drq(&mut self) {
        for _ in 0..4 {
            let st = self.status();
            if st & (STATUS_BSY | STATUS_DRQ) == STATUS_DRQ {
                return;
            }
        }
        panic!("drive never raised DRQ (state {:?})", self.disk.device_state());
    }

    pub fn start_dma(&mut self, prd_table: u32) -> IdeResult<()> {
        let (disk, mut ctx) = self.split();
        disk.start_dma(prd_table, &mut ctx)
    }

    /// Deliver queued timers until none remain.
    pub fn run(&mut self) -> IdeResult<usize> {
        let mut delivered = 0;
        while let Some(deadline) = self.timers.next_deadline() {
            self.now = self.now.max(deadline);
            let event = self.timers.pop_due(self.now).expect("head event is due");
            let (disk, mut ctx) = self.split();
            disk.handle_timer(event.payload.kind, &mut ctx)?;
            delivered += 1;
        }
        Ok(delivered)
    }
}

pub fn write_prd_table(mem: &mut dyn MemoryBus, table: u64, entries: &[(u32, u16, bool)]) {
    for (i, &(base, count, eot)) in entries.iter().enumerate() {
        PrdEntry {
            base,
            count,
            flags: if eot { 0x8000 } else { 0 },
        }
        .write_to(mem, table + i as u64 * 8);
    }
}

pub fn drive(image: impl DiskImage + 'static, drive: DriveId) -> IdeDisk {
    let config = IdeDiskConfig {
        drive,
        ..IdeDiskConfig::default()
    };
    IdeDisk::new(Box::new(image), config).unwrap()
}

pub fn system_with(drives: Vec<IdeDisk>) -> IdeSystem {
    let mut sys = IdeSystem::new(0x4_0000, SharedDmaBus::default());
    for d in drives {
        sys.attach(d).unwrap();
    }
    sys
}

/// Select `drive`, poll its status once, then issue an LBA command.
pub fn sys_command(
    sys: &mut IdeSystem,
    drive: DriveId,
    opcode: u8,
    lba: u32,
    count: u8,
) -> IdeResult<()> {
    let dev = match drive {
        DriveId::Master => 0,
        DriveId::Slave => DRIVE_DEV,
    };
    let [b0, b1, b2, b3] = lba.to_le_bytes();
    let byte = AccessWidth::Byte;
    sys.cmd_write(REG_DRIVE_HEAD, byte, u16::from(DRIVE_LBA | dev | (b3 & 0x0F)))?;
    sys.read_status()?;
    sys.cmd_write(REG_SECTOR_COUNT, byte, count.into())?;
    sys.cmd_write(REG_SECTOR_NUMBER, byte, b0.into())?;
    sys.cmd_write(REG_CYLINDER_LOW, byte, b1.into())?;
    sys.cmd_write(REG_CYLINDER_HIGH, byte, b2.into())?;
    sys.cmd_write(REG_STATUS_COMMAND, byte, opcode.into())
}

/// Poll status until DRQ, then read `words` data words.
pub fn sys_read_words(sys: &mut IdeSystem, words: usize) -> Vec<u8> {
    let mut ready = false;
    for _ in 0..4 {
        if sys.read_status().unwrap() & (STATUS_BSY | STATUS_DRQ) == STATUS_DRQ {
            ready = true;
            break;
        }
    }
    assert!(ready, "drive never raised DRQ");
    let mut out = Vec::with_capacity(words * 2);
    for _ in 0..words {
        let w = sys.cmd_read(REG_DATA, AccessWidth::Word).unwrap();
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

pub fn image_of(sys: &mut IdeSystem, id: DriveId) -> Vec<u8> {
    let disk = sys.channel.drive_mut(id).expect("drive attached");
    dump_image(disk.image_mut())
}
