mod common;

use common::{drive, patterned_disk, sector_pattern, sys_command, sys_read_words, system_with};
use sim_devices_ide::regs::{DRIVE_DEV, REG_DATA, REG_DRIVE_HEAD, REG_STATUS_COMMAND, STATUS_DRDY};
use sim_devices_ide::{
    AccessWidth, DeviceState, DmaState, DriveId, IdeDisk, IdeDiskConfig, IdeError, MemDisk,
    PrdEntry, BM_CMD_START, BM_CMD_WRITE, BM_REG_COMMAND, BM_REG_PRD_TABLE, BM_REG_STATUS,
    BM_STATUS_ACTIVE, BM_STATUS_ERROR, BM_STATUS_IRQ,
};
use sim_memory::MemoryBus;

#[test]
fn empty_slot_floats_high_and_ignores_writes() {
    let mut sys = system_with(vec![drive(MemDisk::new(8), DriveId::Master)]);
    sys.cmd_write(REG_DRIVE_HEAD, AccessWidth::Byte, DRIVE_DEV.into())
        .unwrap();
    assert_eq!(sys.channel.selected(), DriveId::Slave);

    assert_eq!(sys.read_status().unwrap(), 0xFF);
    assert_eq!(sys.cmd_read(REG_DATA, AccessWidth::Word).unwrap(), 0xFFFF);
    assert_eq!(sys.ctrl_read().unwrap(), 0xFF);
    sys.cmd_write(REG_STATUS_COMMAND, AccessWidth::Byte, 0xEC)
        .unwrap();

    let master = sys.channel.drive(DriveId::Master).unwrap();
    assert_eq!(master.device_state(), DeviceState::IdleSelected);
    assert!(!sys.irq_asserted());
}

#[test]
fn second_drive_in_the_same_slot_is_rejected() {
    let mut sys = system_with(vec![drive(MemDisk::new(8), DriveId::Slave)]);
    let err = sys.attach(drive(MemDisk::new(8), DriveId::Slave)).unwrap_err();
    assert!(matches!(err, IdeError::DriveSlotTaken(DriveId::Slave)));
}

#[test]
fn slave_answers_identify_once_selected() {
    let slave = IdeDisk::new(
        Box::new(MemDisk::new(4096)),
        IdeDiskConfig {
            drive: DriveId::Slave,
            model: "SECOND DISK".into(),
            ..IdeDiskConfig::default()
        },
    )
    .unwrap();
    let mut sys = system_with(vec![drive(MemDisk::new(8), DriveId::Master), slave]);

    sys_command(&mut sys, DriveId::Slave, 0xEC, 0, 0).unwrap();
    assert!(sys.irq_asserted());
    let data = sys_read_words(&mut sys, 256);
    assert!(!sys.irq_asserted());

    let slave = sys.channel.drive(DriveId::Slave).unwrap();
    assert_eq!(data, slave.identity().to_bytes().to_vec());
    assert_eq!(&data[54..60], b"ESOCDN");

    let master = sys.channel.drive(DriveId::Master).unwrap();
    assert!(!master.interrupt_pending());
    assert!(!master.is_selected());
}

#[test]
fn shared_line_drops_only_when_both_drives_are_acknowledged() {
    let mut sys = system_with(vec![
        drive(MemDisk::new(8), DriveId::Master),
        drive(MemDisk::new(8), DriveId::Slave),
    ]);
    let line = sys.channel.irq_line();

    sys_command(&mut sys, DriveId::Master, 0x70, 0, 0).unwrap();
    assert!(sys.irq_asserted());
    sys_command(&mut sys, DriveId::Slave, 0x70, 0, 0).unwrap();
    assert_eq!(sys.irq.raised_count(line), 1);

    // Acknowledge the slave; the master still holds the line.
    assert_eq!(sys.read_status().unwrap(), STATUS_DRDY);
    assert!(sys.irq_asserted());
    assert!(sys.channel.irq_asserted());

    sys.cmd_write(REG_DRIVE_HEAD, AccessWidth::Byte, 0).unwrap();
    assert_eq!(sys.read_status().unwrap(), STATUS_DRDY);
    assert!(!sys.irq_asserted());
    assert_eq!(sys.irq.raised_count(line), 1);
    assert_eq!(sys.irq.lowered_count(line), 1);
}

#[test]
fn bus_master_registers_follow_piix_layout() {
    let mut sys = system_with(vec![
        drive(MemDisk::new(8), DriveId::Master),
        drive(MemDisk::new(8), DriveId::Slave),
    ]);
    assert_eq!(sys.bm_read(BM_REG_STATUS, 1), 0x60);

    sys.bm_write(BM_REG_PRD_TABLE, 4, 0x1234_5677).unwrap();
    assert_eq!(sys.bm_read(BM_REG_PRD_TABLE, 4), 0x1234_5674);
    assert_eq!(sys.bm_read(BM_REG_PRD_TABLE, 2), 0x5674);
    assert_eq!(sys.bm_read(5, 1), 0x56);
    sys.bm_write(7, 1, 0xAB).unwrap();
    assert_eq!(sys.bm_read(BM_REG_PRD_TABLE, 4), 0xAB34_5674);

    // Only start and direction are writable in the command register.
    sys.bm_write(BM_REG_COMMAND, 1, u32::from(0xF6 & !BM_CMD_START))
        .unwrap();
    assert_eq!(sys.bm_read(BM_REG_COMMAND, 1), u32::from(BM_CMD_WRITE));

    // Status: capability bits are plain read/write; IRQ and ERROR are
    // write-one-to-clear and never set by software.
    sys.bm_write(BM_REG_STATUS, 1, u32::from(BM_STATUS_IRQ | BM_STATUS_ERROR | 0x20))
        .unwrap();
    assert_eq!(sys.bm_read(BM_REG_STATUS, 1), 0x20);
}

#[test]
fn read_dma_through_bus_master_sets_irq_status() {
    let mut sys = system_with(vec![drive(patterned_disk(32), DriveId::Master)]);
    PrdEntry {
        base: 0x8000,
        count: 1024,
        flags: 0x8000,
    }
    .write_to(&mut sys.mem, 0x1000);

    sys_command(&mut sys, DriveId::Master, 0xC8, 7, 2).unwrap();
    sys.bm_write(BM_REG_PRD_TABLE, 4, 0x1000).unwrap();
    sys.bm_write(BM_REG_COMMAND, 1, u32::from(BM_CMD_START | BM_CMD_WRITE))
        .unwrap();
    assert_ne!(sys.bm_read(BM_REG_STATUS, 1) as u8 & BM_STATUS_ACTIVE, 0);

    assert!(sys.run_until_idle().unwrap() > 0);
    let bm_status = sys.bm_read(BM_REG_STATUS, 1) as u8;
    assert_eq!(bm_status & (BM_STATUS_ACTIVE | BM_STATUS_IRQ), BM_STATUS_IRQ);
    assert!(sys.irq_asserted());
    assert_eq!(sys.mem.read_vec(0x8000, 512), sector_pattern(7));
    assert_eq!(sys.mem.read_vec(0x8200, 512), sector_pattern(8));

    sys.bm_write(BM_REG_COMMAND, 1, 0).unwrap();
    sys.read_status().unwrap();
    assert!(!sys.irq_asserted());
}

#[test]
fn clearing_start_mid_transfer_aborts_the_command() {
    let mut sys = system_with(vec![drive(patterned_disk(32), DriveId::Master)]);
    PrdEntry {
        base: 0x8000,
        count: 512,
        flags: 0x8000,
    }
    .write_to(&mut sys.mem, 0x1000);

    sys_command(&mut sys, DriveId::Master, 0xC8, 0, 1).unwrap();
    sys.bm_write(BM_REG_PRD_TABLE, 4, 0x1000).unwrap();
    sys.bm_write(BM_REG_COMMAND, 1, u32::from(BM_CMD_START | BM_CMD_WRITE))
        .unwrap();
    assert!(sys.step().unwrap());

    sys.bm_write(BM_REG_COMMAND, 1, u32::from(BM_CMD_WRITE))
        .unwrap();
    let master = sys.channel.drive(DriveId::Master).unwrap();
    assert_eq!(master.dma_state(), DmaState::Idle);
    assert_eq!(master.device_state(), DeviceState::IdleSelectedIntrPending);
    assert_eq!(master.pending_timer(), None);
    assert_eq!(sys.pending_events(), 0);
    let bm_status = sys.bm_read(BM_REG_STATUS, 1) as u8;
    assert_eq!(bm_status & (BM_STATUS_ACTIVE | BM_STATUS_IRQ), BM_STATUS_IRQ);
    assert!(sys.irq_asserted());
}
