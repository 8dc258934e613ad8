//! Command-block and control-block register file.

use crate::config::DriveId;

pub const REG_DATA: u64 = 0;
pub const REG_DATA_HIGH: u64 = 1;
pub const REG_SECTOR_COUNT: u64 = 2;
pub const REG_SECTOR_NUMBER: u64 = 3;
pub const REG_CYLINDER_LOW: u64 = 4;
pub const REG_CYLINDER_HIGH: u64 = 5;
pub const REG_DRIVE_HEAD: u64 = 6;
/// Status on read, command on write.
pub const REG_STATUS_COMMAND: u64 = 7;
pub const COMMAND_BLOCK_LEN: u64 = 8;

/// Alternate status on read, device control on write.
pub const REG_ALT_STATUS_CONTROL: u64 = 2;

pub const STATUS_BSY: u8 = 0x80;
pub const STATUS_DRDY: u8 = 0x40;
pub const STATUS_DSC: u8 = 0x10;
pub const STATUS_DRQ: u8 = 0x08;

pub const CONTROL_SRST: u8 = 0x04;
pub const CONTROL_NIEN: u8 = 0x02;

pub const DRIVE_LBA: u8 = 0x40;
pub const DRIVE_DEV: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterBlock {
    Command,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
}

/// Input token of the protocol state machine.
///
/// The first six are produced by register accesses; the rest are raised
/// internally by command dispatch, the DMA engine, and explicit aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StatusRead,
    DataReadByte,
    DataReadWord,
    CommandWrite,
    DataWriteByte,
    DataWriteWord,
    CommandComplete,
    DataReady,
    DmaReady,
    DmaDone,
    CommandError,
}

/// Action emitted by a command-block read, if any.
pub fn read_action(offset: u64, width: AccessWidth) -> Option<Action> {
    match (offset, width) {
        (REG_DATA, AccessWidth::Word) => Some(Action::DataReadWord),
        (REG_DATA | REG_DATA_HIGH, AccessWidth::Byte) => Some(Action::DataReadByte),
        (REG_STATUS_COMMAND, _) => Some(Action::StatusRead),
        _ => None,
    }
}

/// Action emitted by a command-block write, if any.
pub fn write_action(offset: u64, width: AccessWidth) -> Option<Action> {
    match (offset, width) {
        (REG_DATA, AccessWidth::Word) => Some(Action::DataWriteWord),
        (REG_DATA | REG_DATA_HIGH, AccessWidth::Byte) => Some(Action::DataWriteByte),
        (REG_STATUS_COMMAND, _) => Some(Action::CommandWrite),
        _ => None,
    }
}

/// The eight command-block registers. `command` shares offset 7 with
/// `status` but is only ever written by the guest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommandRegisters {
    pub data0: u8,
    pub data1: u8,
    pub sector_count: u8,
    pub sector_number: u8,
    pub cylinder_low: u8,
    pub cylinder_high: u8,
    pub drive_head: u8,
    pub status: u8,
    pub command: u8,
}

impl CommandRegisters {
    pub const ENCODED_LEN: usize = 9;

    pub fn read_byte(&self, offset: u64) -> u8 {
        match offset {
            REG_DATA => self.data0,
            REG_DATA_HIGH => self.data1,
            REG_SECTOR_COUNT => self.sector_count,
            REG_SECTOR_NUMBER => self.sector_number,
            REG_CYLINDER_LOW => self.cylinder_low,
            REG_CYLINDER_HIGH => self.cylinder_high,
            REG_DRIVE_HEAD => self.drive_head,
            _ => self.status,
        }
    }

    pub fn write_byte(&mut self, offset: u64, val: u8) {
        match offset {
            REG_DATA => self.data0 = val,
            REG_DATA_HIGH => self.data1 = val,
            REG_SECTOR_COUNT => self.sector_count = val,
            REG_SECTOR_NUMBER => self.sector_number = val,
            REG_CYLINDER_LOW => self.cylinder_low = val,
            REG_CYLINDER_HIGH => self.cylinder_high = val,
            REG_DRIVE_HEAD => self.drive_head = val,
            _ => self.command = val,
        }
    }

    pub fn data_word(&self) -> u16 {
        u16::from_le_bytes([self.data0, self.data1])
    }

    pub fn set_data_word(&mut self, val: u16) {
        [self.data0, self.data1] = val.to_le_bytes();
    }

    pub fn lba_mode(&self) -> bool {
        self.drive_head & DRIVE_LBA != 0
    }

    /// Drive addressed by the DEV bit.
    pub fn selected_drive(&self) -> DriveId {
        if self.drive_head & DRIVE_DEV != 0 {
            DriveId::Slave
        } else {
            DriveId::Master
        }
    }

    /// 28-bit LBA assembled from the shadow registers.
    pub fn lba(&self) -> u32 {
        (u32::from(self.drive_head & 0x0F) << 24)
            | (u32::from(self.cylinder_high) << 16)
            | (u32::from(self.cylinder_low) << 8)
            | u32::from(self.sector_number)
    }

    /// Store a 28-bit LBA into the shadow registers, leaving the mode and
    /// device-select bits of the drive/head register untouched.
    pub fn set_lba(&mut self, lba: u32) {
        let [b0, b1, b2, b3] = lba.to_le_bytes();
        self.sector_number = b0;
        self.cylinder_low = b1;
        self.cylinder_high = b2;
        self.drive_head = (self.drive_head & 0xF0) | (b3 & 0x0F);
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        [
            self.data0,
            self.data1,
            self.sector_count,
            self.sector_number,
            self.cylinder_low,
            self.cylinder_high,
            self.drive_head,
            self.status,
            self.command,
        ]
    }

    pub fn decode(bytes: [u8; Self::ENCODED_LEN]) -> Self {
        let [
            data0,
            data1,
            sector_count,
            sector_number,
            cylinder_low,
            cylinder_high,
            drive_head,
            status,
            command,
        ] = bytes;
        Self {
            data0,
            data1,
            sector_count,
            sector_number,
            cylinder_low,
            cylinder_high,
            drive_head,
            status,
            command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_seven_splits_status_and_command() {
        let mut regs = CommandRegisters {
            status: STATUS_DRDY,
            ..Default::default()
        };
        regs.write_byte(REG_STATUS_COMMAND, 0xEC);
        assert_eq!(regs.command, 0xEC);
        assert_eq!(regs.read_byte(REG_STATUS_COMMAND), STATUS_DRDY);
    }

    #[test]
    fn lba_round_trips_through_shadow_registers() {
        let mut regs = CommandRegisters {
            drive_head: DRIVE_LBA | DRIVE_DEV | 0x0F,
            ..Default::default()
        };
        regs.set_lba(0x0123_4567);
        assert_eq!(regs.lba(), 0x0123_4567);
        assert_eq!(regs.drive_head, DRIVE_LBA | DRIVE_DEV | 0x01);
        assert_eq!(regs.selected_drive(), DriveId::Slave);
    }

    #[test]
    fn only_data_and_status_offsets_emit_actions() {
        assert_eq!(read_action(0, AccessWidth::Word), Some(Action::DataReadWord));
        assert_eq!(read_action(1, AccessWidth::Byte), Some(Action::DataReadByte));
        assert_eq!(read_action(7, AccessWidth::Byte), Some(Action::StatusRead));
        assert_eq!(write_action(7, AccessWidth::Byte), Some(Action::CommandWrite));
        assert_eq!(write_action(0, AccessWidth::Byte), Some(Action::DataWriteByte));
        for off in 2..=6 {
            assert_eq!(read_action(off, AccessWidth::Byte), None);
            assert_eq!(write_action(off, AccessWidth::Byte), None);
        }
    }

    #[test]
    fn data_word_is_little_endian() {
        let mut regs = CommandRegisters::default();
        regs.set_data_word(0xBEEF);
        assert_eq!((regs.data0, regs.data1), (0xEF, 0xBE));
        assert_eq!(regs.data_word(), 0xBEEF);
    }
}
