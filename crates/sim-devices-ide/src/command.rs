use crate::dma::DmaDirection;
use crate::error::{IdeError, IdeResult};
use crate::identify::IDENTIFY_LEN;
use crate::image::SECTOR_SIZE;
use crate::regs::{Action, CommandRegisters};
use crate::state::DeviceState;

/// The ATA command subset the disk implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtaCommand {
    Recalibrate,
    Read,
    Write,
    Verify,
    Seek,
    Specify,
    ReadMultiple,
    WriteMultiple,
    SetMultiple,
    ReadDma,
    WriteDma,
    FlushCache,
    IdentifyDevice,
    SetFeatures,
    ReadNativeMaxAddress,
}

impl AtaCommand {
    pub fn from_opcode(op: u8) -> Option<Self> {
        Some(match op {
            0x10 => Self::Recalibrate,
            0x20 => Self::Read,
            0x30 => Self::Write,
            0x40 => Self::Verify,
            0x70 => Self::Seek,
            0x91 => Self::Specify,
            0xC4 => Self::ReadMultiple,
            0xC5 => Self::WriteMultiple,
            0xC6 => Self::SetMultiple,
            0xC8 => Self::ReadDma,
            0xCA => Self::WriteDma,
            0xE7 => Self::FlushCache,
            0xEC => Self::IdentifyDevice,
            0xEF => Self::SetFeatures,
            0xF8 => Self::ReadNativeMaxAddress,
            _ => return None,
        })
    }

    pub fn opcode(self) -> u8 {
        match self {
            Self::Recalibrate => 0x10,
            Self::Read => 0x20,
            Self::Write => 0x30,
            Self::Verify => 0x40,
            Self::Seek => 0x70,
            Self::Specify => 0x91,
            Self::ReadMultiple => 0xC4,
            Self::WriteMultiple => 0xC5,
            Self::SetMultiple => 0xC6,
            Self::ReadDma => 0xC8,
            Self::WriteDma => 0xCA,
            Self::FlushCache => 0xE7,
            Self::IdentifyDevice => 0xEC,
            Self::SetFeatures => 0xEF,
            Self::ReadNativeMaxAddress => 0xF8,
        }
    }

    pub fn transfer_class(self) -> TransferClass {
        match self {
            Self::IdentifyDevice | Self::Read | Self::ReadMultiple => TransferClass::PioIn,
            Self::Write | Self::WriteMultiple => TransferClass::PioOut,
            Self::ReadDma => TransferClass::Dma(DmaDirection::FromDisk),
            Self::WriteDma => TransferClass::Dma(DmaDirection::ToDisk),
            _ => TransferClass::NonData,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferClass {
    NonData,
    PioIn,
    PioOut,
    Dma(DmaDirection),
}

/// Everything the state machine needs to start a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCommand {
    pub command: AtaCommand,
    pub class: TransferClass,
    pub byte_count: u32,
    /// First sector for sector-addressed transfers.
    pub start_lba: Option<u32>,
}

impl DecodedCommand {
    /// State entered once the command is dispatched.
    pub fn next_state(&self) -> DeviceState {
        match self.class {
            TransferClass::NonData => DeviceState::CommandExecution,
            TransferClass::PioIn => DeviceState::PrepareDataIn,
            TransferClass::PioOut => DeviceState::PrepareDataOut,
            TransferClass::Dma(_) => DeviceState::PrepareDataDma,
        }
    }

    /// Action that advances the state machine out of [`Self::next_state`].
    pub fn action(&self) -> Action {
        match self.class {
            TransferClass::NonData => Action::CommandComplete,
            TransferClass::PioIn | TransferClass::PioOut => Action::DataReady,
            TransferClass::Dma(_) => Action::DmaReady,
        }
    }
}

/// Classify the opcode in the command register.
pub fn decode(regs: &CommandRegisters) -> IdeResult<DecodedCommand> {
    let op = regs.command;
    let command = AtaCommand::from_opcode(op).ok_or(IdeError::UnsupportedCommand(op))?;
    let class = command.transfer_class();

    let (byte_count, start_lba) = match (command, class) {
        (_, TransferClass::NonData) => (0, None),
        (AtaCommand::IdentifyDevice, _) => (IDENTIFY_LEN as u32, None),
        _ => {
            if !regs.lba_mode() {
                return Err(IdeError::ChsAddressing(op));
            }
            (sector_bytes(regs.sector_count), Some(regs.lba()))
        }
    };

    Ok(DecodedCommand {
        command,
        class,
        byte_count,
        start_lba,
    })
}

/// A sector count of zero requests 256 sectors.
fn sector_bytes(count: u8) -> u32 {
    let sectors = if count == 0 { 256 } else { u32::from(count) };
    sectors * SECTOR_SIZE as u32
}
