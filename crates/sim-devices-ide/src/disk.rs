use sim_memory::MemoryBus;
use sim_time::{Tick, TimerQueue};
use tracing::{debug, trace, warn};

use crate::command::{self, AtaCommand, TransferClass};
use crate::config::{DriveId, IdeDiskConfig};
use crate::dma::{DmaDirection, PrdEntry, MAX_DMA_SIZE};
use crate::dma_bus::DmaBus;
use crate::error::{IdeError, IdeResult};
use crate::identify::{DriveIdentity, IDENTIFY_LEN};
use crate::image::{DiskImage, SECTOR_SIZE};
use crate::regs::{
    self, AccessWidth, Action, CommandRegisters, RegisterBlock, COMMAND_BLOCK_LEN, CONTROL_NIEN,
    CONTROL_SRST, REG_ALT_STATUS_CONTROL, REG_DATA, STATUS_BSY, STATUS_DRDY, STATUS_DRQ,
    STATUS_DSC,
};
use crate::state::{ArmedTimer, DeviceState, DiskEvent, DmaState};

/// The owning controller, as seen by a drive.
///
/// Passed into every call rather than stored, so the drive never holds a
/// reference back to its channel.
pub trait IdeHost {
    fn intr_post(&mut self, drive: DriveId);
    fn intr_clear(&mut self, drive: DriveId);
    /// The drive's DMA command finished (normally or by abort).
    fn dma_complete(&mut self, drive: DriveId);

    /// Translate a bus-master (PCI) address into a guest-physical one.
    fn pci_to_dma(&self, pci_addr: u64) -> u64 {
        pci_addr
    }
}

/// Collaborators available to a drive for the duration of one callback.
pub struct IdeContext<'a> {
    pub now: Tick,
    pub mem: &'a mut dyn MemoryBus,
    pub dma: &'a mut dyn DmaBus,
    pub timers: &'a mut TimerQueue<DiskEvent>,
    pub host: &'a mut dyn IdeHost,
}

/// One ATA hard disk: register file, protocol state machine and DMA engine.
pub struct IdeDisk {
    pub(crate) config: IdeDiskConfig,
    pub(crate) disk_delay: Tick,
    pub(crate) image: Box<dyn DiskImage>,
    pub(crate) identity: DriveIdentity,

    pub(crate) regs: CommandRegisters,
    pub(crate) nien: bool,
    pub(crate) drive: DriveId,

    pub(crate) cur_prd: PrdEntry,
    pub(crate) prd_cursor: u64,
    pub(crate) cmd_bytes_left: u32,
    pub(crate) drq_bytes_left: u32,
    pub(crate) cur_sector: u32,
    pub(crate) cur_command: u8,
    pub(crate) dma_direction: DmaDirection,
    /// Bytes of the current PRD already handed to the DMA bus.
    pub(crate) dma_interface_bytes: u32,
    /// Sector split across PRD entries and how many of its bytes have moved.
    pub(crate) sector_carry: [u8; SECTOR_SIZE],
    pub(crate) sector_fill: u32,

    pub(crate) intr_pending: bool,
    /// Interrupt that was pending when the drive lost selection.
    pub(crate) deferred_intr: bool,
    pub(crate) dev_state: DeviceState,
    pub(crate) dma_state: DmaState,

    pub(crate) buffer: Box<[u8]>,
    pub(crate) timer: Option<ArmedTimer>,
}

impl std::fmt::Debug for IdeDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdeDisk")
            .field("drive", &self.drive)
            .field("dev_state", &self.dev_state)
            .field("dma_state", &self.dma_state)
            .field("regs", &self.regs)
            .field("cmd_bytes_left", &self.cmd_bytes_left)
            .field("drq_bytes_left", &self.drq_bytes_left)
            .field("intr_pending", &self.intr_pending)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

impl IdeDisk {
    pub fn new(image: Box<dyn DiskImage>, config: IdeDiskConfig) -> IdeResult<Self> {
        config.validate()?;
        let sectors = image.sectors();
        if sectors == 0 {
            return Err(IdeError::EmptyImage);
        }
        let identity = DriveIdentity::new(sectors, &config.model);
        let drive = config.drive;
        let disk_delay = config.disk_delay_ticks();
        debug!(
            ?drive,
            sectors,
            geometry = ?identity.geometry(),
            "ide disk attached"
        );

        Ok(Self {
            config,
            disk_delay,
            image,
            identity,
            regs: CommandRegisters {
                status: STATUS_DRDY,
                ..Default::default()
            },
            nien: false,
            drive,
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
            dev_state: match drive {
                DriveId::Master => DeviceState::IdleSelected,
                DriveId::Slave => DeviceState::IdleNotSelected,
            },
            dma_state: DmaState::Idle,
            buffer: vec![0; MAX_DMA_SIZE].into_boxed_slice(),
            timer: None,
        })
    }

    pub fn drive(&self) -> DriveId {
        self.drive
    }

    pub fn config(&self) -> &IdeDiskConfig {
        &self.config
    }

    pub fn identity(&self) -> &DriveIdentity {
        &self.identity
    }

    pub fn registers(&self) -> &CommandRegisters {
        &self.regs
    }

    pub fn status(&self) -> u8 {
        self.regs.status
    }

    pub fn device_state(&self) -> DeviceState {
        self.dev_state
    }

    pub fn dma_state(&self) -> DmaState {
        self.dma_state
    }

    pub fn interrupt_pending(&self) -> bool {
        self.intr_pending
    }

    pub fn interrupts_enabled(&self) -> bool {
        !self.nien
    }

    pub fn cmd_bytes_left(&self) -> u32 {
        self.cmd_bytes_left
    }

    pub fn drq_bytes_left(&self) -> u32 {
        self.drq_bytes_left
    }

    /// The outstanding DMA timer, if any, as `(kind, deadline)`.
    pub fn pending_timer(&self) -> Option<(crate::state::TimerKind, Tick)> {
        self.timer.map(|t| (t.kind, t.deadline))
    }

    pub fn image(&self) -> &dyn DiskImage {
        self.image.as_ref()
    }

    pub fn image_mut(&mut self) -> &mut dyn DiskImage {
        self.image.as_mut()
    }

    pub fn is_selected(&self) -> bool {
        self.regs.selected_drive() == self.drive
    }

    /// Register read. Command-block data and status reads feed the state
    /// machine after the value has been sampled.
    pub fn read(
        &mut self,
        block: RegisterBlock,
        offset: u64,
        width: AccessWidth,
        ctx: &mut IdeContext<'_>,
    ) -> IdeResult<u16> {
        let (value, action) = match block {
            RegisterBlock::Command => {
                check_command_access(offset, width)?;
                let value = match width {
                    AccessWidth::Word => self.regs.data_word(),
                    AccessWidth::Byte => u16::from(self.regs.read_byte(offset)),
                };
                (value, regs::read_action(offset, width))
            }
            RegisterBlock::Control => {
                check_control_access(offset, width)?;
                (u16::from(self.regs.status), None)
            }
        };

        if let Some(action) = action {
            self.update_state(action, ctx)?;
        }
        Ok(value)
    }

    pub fn write(
        &mut self,
        block: RegisterBlock,
        offset: u64,
        width: AccessWidth,
        value: u16,
        ctx: &mut IdeContext<'_>,
    ) -> IdeResult<()> {
        match block {
            RegisterBlock::Command => {
                check_command_access(offset, width)?;
                match width {
                    AccessWidth::Word => self.regs.set_data_word(value),
                    AccessWidth::Byte => self.regs.write_byte(offset, value as u8),
                }
                if let Some(action) = regs::write_action(offset, width) {
                    self.update_state(action, ctx)?;
                }
            }
            RegisterBlock::Control => {
                check_control_access(offset, width)?;
                let val = value as u8;
                if val & CONTROL_SRST != 0 {
                    return Err(IdeError::SoftwareReset);
                }
                self.nien = val & CONTROL_NIEN != 0;
                trace!(drive = ?self.drive, nien = self.nien, "device control written");
            }
        }
        Ok(())
    }

    pub(crate) fn update_state(
        &mut self,
        action: Action,
        ctx: &mut IdeContext<'_>,
    ) -> IdeResult<()> {
        let before = self.dev_state;
        self.step(action, ctx)?;
        if self.dev_state != before {
            trace!(
                drive = ?self.drive,
                ?action,
                from = ?before,
                to = ?self.dev_state,
                "ide state transition"
            );
        }
        Ok(())
    }

    fn step(&mut self, action: Action, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        use DeviceState::*;

        match self.dev_state {
            IdleSelected => {
                if !self.is_selected() {
                    self.dev_state = IdleNotSelected;
                } else if action == Action::CommandWrite {
                    self.start_command(ctx)?;
                } else {
                    self.ignore(action);
                }
            }
            IdleSelectedIntrPending => {
                if !self.is_selected() {
                    self.intr_clear(ctx)?;
                    self.deferred_intr = true;
                    self.dev_state = IdleNotSelected;
                } else if action == Action::StatusRead || !self.interrupts_enabled() {
                    self.dev_state = IdleSelected;
                    self.intr_clear(ctx)?;
                } else if action == Action::CommandWrite {
                    self.intr_clear(ctx)?;
                    self.start_command(ctx)?;
                } else {
                    self.ignore(action);
                }
            }
            IdleNotSelected => {
                if self.is_selected() {
                    let repost = std::mem::take(&mut self.deferred_intr);
                    if repost && self.interrupts_enabled() {
                        self.dev_state = IdleSelectedIntrPending;
                        self.intr_post(ctx)?;
                    } else {
                        self.dev_state = IdleSelected;
                    }
                }
            }
            CommandExecution => match action {
                Action::CommandComplete => self.complete_command(ctx)?,
                Action::CommandError => self.abort_command(ctx)?,
                _ => self.ignore(action),
            },
            PrepareDataIn => match action {
                Action::DataReady => self.prepare_data_in(ctx)?,
                Action::CommandError => self.abort_command(ctx)?,
                _ => self.ignore(action),
            },
            DataReadyIntrIn => match action {
                Action::StatusRead => {
                    self.dev_state = TransferDataIn;
                    self.intr_clear(ctx)?;
                }
                Action::CommandError => self.abort_command(ctx)?,
                _ => self.ignore(action),
            },
            TransferDataIn => match action {
                Action::DataReadWord => self.transfer_word_in(ctx)?,
                Action::DataReadByte => return Err(IdeError::BytePioTransfer),
                Action::CommandError => self.abort_command(ctx)?,
                _ => self.ignore(action),
            },
            // Entered on dispatch and after each flushed block; whatever
            // action arrives next moves the command along.
            PrepareDataOut => {
                if action == Action::CommandError || self.cmd_bytes_left == 0 {
                    self.complete_command(ctx)?;
                } else {
                    self.prepare_data_out(ctx)?;
                }
            }
            DataReadyIntrOut => match action {
                Action::StatusRead => {
                    self.dev_state = TransferDataOut;
                    self.intr_clear(ctx)?;
                }
                Action::CommandError => self.abort_command(ctx)?,
                _ => self.ignore(action),
            },
            TransferDataOut => match action {
                Action::DataWriteWord => self.transfer_word_out()?,
                Action::DataWriteByte => return Err(IdeError::BytePioTransfer),
                Action::CommandError => self.abort_command(ctx)?,
                _ => self.ignore(action),
            },
            PrepareDataDma => match action {
                Action::DmaReady => self.await_dma_start()?,
                Action::CommandError => self.abort_command(ctx)?,
                _ => self.ignore(action),
            },
            TransferDataDma => match action {
                Action::DmaDone | Action::CommandError => self.finish_dma_command(ctx)?,
                _ => self.ignore(action),
            },
        }
        Ok(())
    }

    fn ignore(&self, action: Action) {
        if action == Action::StatusRead {
            trace!(drive = ?self.drive, state = ?self.dev_state, "status polled");
        } else {
            warn!(drive = ?self.drive, state = ?self.dev_state, ?action, "action ignored");
        }
    }

    fn start_command(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        let decoded = command::decode(&self.regs)?;
        self.cur_command = decoded.command.opcode();
        self.cmd_bytes_left = decoded.byte_count;
        self.dma_direction = DmaDirection::FromDisk;
        self.sector_fill = 0;
        if let Some(lba) = decoded.start_lba {
            self.cur_sector = lba;
        }
        match decoded.class {
            TransferClass::NonData if decoded.command == AtaCommand::ReadNativeMaxAddress => {
                let max = (self.image.sectors() - 1).min(0x0FFF_FFFF) as u32;
                self.regs.set_lba(max);
            }
            TransferClass::Dma(direction) => self.dma_direction = direction,
            _ => {}
        }
        debug!(
            drive = ?self.drive,
            command = ?decoded.command,
            lba = ?decoded.start_lba,
            bytes = decoded.byte_count,
            "ata command dispatched"
        );

        self.dev_state = decoded.next_state();
        self.set_busy();
        self.update_state(decoded.action(), ctx)
    }

    fn prepare_data_in(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        self.set_data_request();
        if self.cur_command == AtaCommand::IdentifyDevice.opcode() {
            self.buffer[..IDENTIFY_LEN].copy_from_slice(&self.identity.to_bytes());
            self.drq_bytes_left = IDENTIFY_LEN as u32;
        } else {
            self.read_disk(self.cur_sector, 0)?;
            self.cur_sector += 1;
            self.drq_bytes_left = SECTOR_SIZE as u32;
        }
        self.expose_data_word(0);

        if self.interrupts_enabled() {
            self.dev_state = DeviceState::DataReadyIntrIn;
            self.intr_post(ctx)
        } else {
            self.dev_state = DeviceState::TransferDataIn;
            Ok(())
        }
    }

    fn transfer_word_in(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        self.consume_pio_word()?;
        if self.drq_bytes_left != 0 {
            self.expose_data_word(SECTOR_SIZE - self.drq_bytes_left as usize);
            return Ok(());
        }
        if self.cmd_bytes_left == 0 {
            self.set_complete();
            self.dev_state = DeviceState::IdleSelected;
            Ok(())
        } else {
            self.set_busy();
            self.dev_state = DeviceState::PrepareDataIn;
            self.update_state(Action::DataReady, ctx)
        }
    }

    fn prepare_data_out(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        self.set_data_request();
        self.buffer.fill(0);
        self.drq_bytes_left = SECTOR_SIZE as u32;

        if self.interrupts_enabled() {
            self.dev_state = DeviceState::DataReadyIntrOut;
            self.intr_post(ctx)
        } else {
            self.dev_state = DeviceState::TransferDataOut;
            Ok(())
        }
    }

    fn transfer_word_out(&mut self) -> IdeResult<()> {
        let off = SECTOR_SIZE - self.drq_bytes_left as usize;
        self.buffer[off..off + 2].copy_from_slice(&self.regs.data_word().to_le_bytes());
        self.consume_pio_word()?;
        if self.drq_bytes_left == 0 {
            self.write_disk(self.cur_sector, 0)?;
            self.cur_sector += 1;
            self.set_busy();
            self.dev_state = DeviceState::PrepareDataOut;
        }
        Ok(())
    }

    fn consume_pio_word(&mut self) -> IdeResult<()> {
        match (
            self.drq_bytes_left.checked_sub(2),
            self.cmd_bytes_left.checked_sub(2),
        ) {
            (Some(drq), Some(cmd)) => {
                self.drq_bytes_left = drq;
                self.cmd_bytes_left = cmd;
                Ok(())
            }
            _ => Err(IdeError::CounterMismatch {
                cmd_bytes_left: self.cmd_bytes_left,
                drq_bytes_left: self.drq_bytes_left,
            }),
        }
    }

    fn await_dma_start(&mut self) -> IdeResult<()> {
        if self.dma_state != DmaState::Idle {
            return Err(self.inconsistent("dma ready"));
        }
        self.set_data_request();
        self.dev_state = DeviceState::TransferDataDma;
        self.dma_state = DmaState::Start;
        Ok(())
    }

    fn finish_dma_command(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        self.set_complete();
        self.regs.status |= STATUS_DSC;
        ctx.host.dma_complete(self.drive);
        self.signal_completion(ctx)
    }

    /// Command finished: clear BSY and either interrupt or go idle.
    fn complete_command(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        self.set_complete();
        self.signal_completion(ctx)
    }

    fn abort_command(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        debug!(drive = ?self.drive, state = ?self.dev_state, "ata command aborted");
        if self.intr_pending {
            self.intr_clear(ctx)?;
        }
        self.complete_command(ctx)
    }

    fn signal_completion(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        if self.interrupts_enabled() {
            self.dev_state = DeviceState::IdleSelectedIntrPending;
            self.intr_post(ctx)
        } else {
            self.dev_state = DeviceState::IdleSelected;
            Ok(())
        }
    }

    fn set_complete(&mut self) {
        self.regs.status = STATUS_DRDY;
    }

    fn set_busy(&mut self) {
        self.regs.status |= STATUS_BSY;
        self.regs.status &= !STATUS_DRQ;
    }

    fn set_data_request(&mut self) {
        self.regs.status &= !STATUS_BSY;
        self.regs.status |= STATUS_DRQ;
    }

    fn expose_data_word(&mut self, offset: usize) {
        self.regs.data0 = self.buffer[offset];
        self.regs.data1 = self.buffer[offset + 1];
    }

    pub(crate) fn read_disk(&mut self, sector: u32, offset: usize) -> IdeResult<()> {
        let buf = &mut self.buffer[offset..offset + SECTOR_SIZE];
        let got = self.image.read_sector(u64::from(sector), buf);
        if got != SECTOR_SIZE {
            return Err(IdeError::ShortRead {
                sector: sector.into(),
                got,
            });
        }
        Ok(())
    }

    pub(crate) fn write_disk(&mut self, sector: u32, offset: usize) -> IdeResult<()> {
        let data = &self.buffer[offset..offset + SECTOR_SIZE];
        let got = self.image.write_sector(u64::from(sector), data);
        if got != SECTOR_SIZE {
            return Err(IdeError::ShortWrite {
                sector: sector.into(),
                got,
            });
        }
        Ok(())
    }

    pub(crate) fn intr_post(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        if self.intr_pending {
            return Err(IdeError::InterruptAlreadyPending);
        }
        self.intr_pending = true;
        debug!(drive = ?self.drive, "interrupt posted");
        ctx.host.intr_post(self.drive);
        Ok(())
    }

    pub(crate) fn intr_clear(&mut self, ctx: &mut IdeContext<'_>) -> IdeResult<()> {
        if !self.intr_pending {
            return Err(IdeError::NoInterruptPending);
        }
        self.intr_pending = false;
        debug!(drive = ?self.drive, "interrupt cleared");
        ctx.host.intr_clear(self.drive);
        Ok(())
    }

    pub(crate) fn inconsistent(&self, op: &'static str) -> IdeError {
        IdeError::InconsistentDmaState {
            op,
            device: self.dev_state,
            dma: self.dma_state,
        }
    }
}

fn check_command_access(offset: u64, width: AccessWidth) -> IdeResult<()> {
    if offset >= COMMAND_BLOCK_LEN {
        return Err(IdeError::InvalidCommandOffset(offset));
    }
    if width == AccessWidth::Word && offset != REG_DATA {
        return Err(IdeError::InvalidWordAccess(offset));
    }
    Ok(())
}

fn check_control_access(offset: u64, width: AccessWidth) -> IdeResult<()> {
    if offset != REG_ALT_STATUS_CONTROL {
        return Err(IdeError::InvalidControlOffset(offset));
    }
    if width == AccessWidth::Word {
        return Err(IdeError::ControlWordAccess);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma_bus::SharedDmaBus;
    use crate::image::MemDisk;
    use crate::regs::{
        DRIVE_DEV, DRIVE_LBA, REG_DRIVE_HEAD, REG_SECTOR_COUNT, REG_SECTOR_NUMBER,
        REG_STATUS_COMMAND,
    };
    use sim_memory::Bus;

    #[derive(Default)]
    struct Host {
        posts: Vec<DriveId>,
        clears: Vec<DriveId>,
        dma_done: Vec<DriveId>,
    }

    impl IdeHost for Host {
        fn intr_post(&mut self, drive: DriveId) {
            self.posts.push(drive);
        }
        fn intr_clear(&mut self, drive: DriveId) {
            self.clears.push(drive);
        }
        fn dma_complete(&mut self, drive: DriveId) {
            self.dma_done.push(drive);
        }
    }

    struct Rig {
        disk: IdeDisk,
        mem: Bus,
        dma: SharedDmaBus,
        timers: TimerQueue<DiskEvent>,
        host: Host,
    }

    impl Rig {
        fn new(drive: DriveId) -> Self {
            let mut image = MemDisk::new(16);
            for lba in 0..16u64 {
                image.write_sector(lba, &[lba as u8; SECTOR_SIZE]);
            }
            let config = IdeDiskConfig {
                drive,
                ..Default::default()
            };
            Self {
                disk: IdeDisk::new(Box::new(image), config).unwrap(),
                mem: Bus::new(0x1000),
                dma: SharedDmaBus::default(),
                timers: TimerQueue::new(),
                host: Host::default(),
            }
        }

        fn read(&mut self, offset: u64, width: AccessWidth) -> IdeResult<u16> {
            let mut ctx = IdeContext {
                now: 0,
                mem: &mut self.mem,
                dma: &mut self.dma,
                timers: &mut self.timers,
                host: &mut self.host,
            };
            self.disk.read(RegisterBlock::Command, offset, width, &mut ctx)
        }

        fn write(&mut self, offset: u64, width: AccessWidth, value: u16) -> IdeResult<()> {
            let mut ctx = IdeContext {
                now: 0,
                mem: &mut self.mem,
                dma: &mut self.dma,
                timers: &mut self.timers,
                host: &mut self.host,
            };
            self.disk
                .write(RegisterBlock::Command, offset, width, value, &mut ctx)
        }

        fn control(&mut self, value: u8) -> IdeResult<()> {
            let mut ctx = IdeContext {
                now: 0,
                mem: &mut self.mem,
                dma: &mut self.dma,
                timers: &mut self.timers,
                host: &mut self.host,
            };
            self.disk.write(
                RegisterBlock::Control,
                REG_ALT_STATUS_CONTROL,
                AccessWidth::Byte,
                value.into(),
                &mut ctx,
            )
        }

        fn status(&mut self) -> u8 {
            self.read(REG_STATUS_COMMAND, AccessWidth::Byte).unwrap() as u8
        }

        fn command(&mut self, op: u8) -> IdeResult<()> {
            self.write(REG_STATUS_COMMAND, AccessWidth::Byte, op.into())
        }
    }

    #[test]
    fn invalid_offsets_and_widths_are_fatal() {
        let mut rig = Rig::new(DriveId::Master);
        assert!(matches!(
            rig.read(8, AccessWidth::Byte),
            Err(IdeError::InvalidCommandOffset(8))
        ));
        assert!(matches!(
            rig.write(REG_SECTOR_COUNT, AccessWidth::Word, 1),
            Err(IdeError::InvalidWordAccess(2))
        ));
        assert!(matches!(rig.control(CONTROL_SRST), Err(IdeError::SoftwareReset)));
    }

    #[test]
    fn slave_starts_deselected_and_follows_dev_bit() {
        let mut rig = Rig::new(DriveId::Slave);
        assert_eq!(rig.disk.device_state(), DeviceState::IdleNotSelected);
        rig.write(REG_DRIVE_HEAD, AccessWidth::Byte, DRIVE_DEV.into())
            .unwrap();
        rig.status();
        assert_eq!(rig.disk.device_state(), DeviceState::IdleSelected);
    }

    #[test]
    fn non_data_command_posts_then_status_read_clears() {
        let mut rig = Rig::new(DriveId::Master);
        rig.command(0xE7).unwrap();
        assert_eq!(rig.disk.device_state(), DeviceState::IdleSelectedIntrPending);
        assert_eq!(rig.host.posts, vec![DriveId::Master]);
        assert_eq!(rig.status(), STATUS_DRDY);
        assert_eq!(rig.disk.device_state(), DeviceState::IdleSelected);
        assert_eq!(rig.host.clears, vec![DriveId::Master]);
    }

    #[test]
    fn nien_suppresses_completion_interrupt() {
        let mut rig = Rig::new(DriveId::Master);
        rig.control(CONTROL_NIEN).unwrap();
        rig.command(0x10).unwrap();
        assert_eq!(rig.disk.device_state(), DeviceState::IdleSelected);
        assert!(rig.host.posts.is_empty());
    }

    #[test]
    fn read_native_max_keeps_drive_select_bits() {
        let mut rig = Rig::new(DriveId::Master);
        rig.write(REG_DRIVE_HEAD, AccessWidth::Byte, DRIVE_LBA.into())
            .unwrap();
        rig.command(0xF8).unwrap();
        assert_eq!(rig.disk.registers().lba(), 15);
        assert_eq!(rig.disk.registers().drive_head, DRIVE_LBA);
    }

    #[test]
    fn byte_wide_data_read_during_transfer_is_fatal() {
        let mut rig = Rig::new(DriveId::Master);
        rig.command(0xEC).unwrap();
        rig.status();
        assert_eq!(rig.disk.device_state(), DeviceState::TransferDataIn);
        assert!(matches!(
            rig.read(REG_DATA, AccessWidth::Byte),
            Err(IdeError::BytePioTransfer)
        ));
    }

    #[test]
    fn byte_wide_data_access_while_idle_is_ignored() {
        let mut rig = Rig::new(DriveId::Master);
        rig.read(REG_DATA, AccessWidth::Byte).unwrap();
        rig.write(REG_DATA, AccessWidth::Byte, 0x55).unwrap();
        assert_eq!(rig.disk.device_state(), DeviceState::IdleSelected);
    }

    #[test]
    fn pio_read_delivers_sector_words() {
        let mut rig = Rig::new(DriveId::Master);
        rig.write(REG_DRIVE_HEAD, AccessWidth::Byte, DRIVE_LBA.into())
            .unwrap();
        rig.write(REG_SECTOR_NUMBER, AccessWidth::Byte, 3).unwrap();
        rig.write(REG_SECTOR_COUNT, AccessWidth::Byte, 2).unwrap();
        rig.command(0x20).unwrap();
        assert_eq!(rig.status() & (STATUS_BSY | STATUS_DRQ), STATUS_DRQ);

        let mut data = Vec::new();
        for _ in 0..256 {
            data.extend_from_slice(&rig.read(REG_DATA, AccessWidth::Word).unwrap().to_le_bytes());
        }
        // Second block raises a fresh interrupt.
        assert_eq!(rig.disk.device_state(), DeviceState::DataReadyIntrIn);
        rig.status();
        for _ in 0..256 {
            data.extend_from_slice(&rig.read(REG_DATA, AccessWidth::Word).unwrap().to_le_bytes());
        }
        assert!(data[..512].iter().all(|&b| b == 3));
        assert!(data[512..].iter().all(|&b| b == 4));
        assert_eq!(rig.disk.device_state(), DeviceState::IdleSelected);
        assert_eq!(rig.disk.cmd_bytes_left(), 0);
        assert_eq!(rig.disk.drq_bytes_left(), 0);
        assert_eq!(rig.disk.status(), STATUS_DRDY);
    }

    #[test]
    fn pio_write_completes_on_next_action() {
        let mut rig = Rig::new(DriveId::Master);
        rig.control(CONTROL_NIEN).unwrap();
        rig.write(REG_DRIVE_HEAD, AccessWidth::Byte, DRIVE_LBA.into())
            .unwrap();
        rig.write(REG_SECTOR_NUMBER, AccessWidth::Byte, 9).unwrap();
        rig.write(REG_SECTOR_COUNT, AccessWidth::Byte, 1).unwrap();
        rig.command(0x30).unwrap();
        assert_eq!(rig.disk.device_state(), DeviceState::TransferDataOut);
        for i in 0..256u16 {
            rig.write(REG_DATA, AccessWidth::Word, i).unwrap();
        }
        assert_eq!(rig.disk.device_state(), DeviceState::PrepareDataOut);
        assert_eq!(rig.status() & STATUS_BSY, STATUS_BSY);
        assert_eq!(rig.disk.device_state(), DeviceState::IdleSelected);

        let mut sector = [0u8; SECTOR_SIZE];
        rig.disk.image_mut().read_sector(9, &mut sector);
        assert_eq!(&sector[..4], &[0, 0, 1, 0]);
        assert_eq!(&sector[510..], &[255, 0]);
    }

    #[test]
    fn deselect_defers_pending_interrupt_until_reselected() {
        let mut rig = Rig::new(DriveId::Master);
        rig.command(0xE7).unwrap();
        assert!(rig.disk.interrupt_pending());

        rig.write(REG_DRIVE_HEAD, AccessWidth::Byte, DRIVE_DEV.into())
            .unwrap();
        rig.status();
        assert_eq!(rig.disk.device_state(), DeviceState::IdleNotSelected);
        assert!(!rig.disk.interrupt_pending());

        rig.write(REG_DRIVE_HEAD, AccessWidth::Byte, 0).unwrap();
        rig.status();
        assert_eq!(rig.disk.device_state(), DeviceState::IdleSelectedIntrPending);
        assert_eq!(rig.host.posts.len(), 2);
        assert_eq!(rig.host.clears.len(), 1);
    }

    #[test]
    fn double_post_and_spurious_clear_are_fatal() {
        let mut rig = Rig::new(DriveId::Master);
        let mut ctx = IdeContext {
            now: 0,
            mem: &mut rig.mem,
            dma: &mut rig.dma,
            timers: &mut rig.timers,
            host: &mut rig.host,
        };
        assert!(matches!(
            rig.disk.intr_clear(&mut ctx),
            Err(IdeError::NoInterruptPending)
        ));
        rig.disk.intr_post(&mut ctx).unwrap();
        assert!(matches!(
            rig.disk.intr_post(&mut ctx),
            Err(IdeError::InterruptAlreadyPending)
        ));
    }

    #[test]
    fn dma_command_waits_for_start_bit() {
        let mut rig = Rig::new(DriveId::Master);
        rig.write(REG_DRIVE_HEAD, AccessWidth::Byte, DRIVE_LBA.into())
            .unwrap();
        rig.write(REG_SECTOR_COUNT, AccessWidth::Byte, 1).unwrap();
        rig.command(0xC8).unwrap();
        assert_eq!(rig.disk.device_state(), DeviceState::TransferDataDma);
        assert_eq!(rig.disk.dma_state(), DmaState::Start);
        assert_eq!(rig.disk.status() & (STATUS_BSY | STATUS_DRQ), STATUS_DRQ);
        assert!(rig.timers.is_empty());
    }
}
