#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use sim_devices_ide::regs::{
    DRIVE_DEV, DRIVE_LBA, REG_CYLINDER_HIGH, REG_CYLINDER_LOW, REG_DATA, REG_DRIVE_HEAD,
    REG_SECTOR_COUNT, REG_SECTOR_NUMBER, REG_STATUS_COMMAND, STATUS_BSY, STATUS_DRQ,
};
use sim_devices_ide::{
    AccessWidth, AtaCommand, DriveId, FileDisk, IdeDisk, IdeDiskConfig, IdeSystem, PrdEntry,
    SharedDmaBus, BM_CMD_START, BM_CMD_WRITE, BM_REG_COMMAND, BM_REG_PRD_TABLE, MAX_DMA_SIZE,
    SECTOR_SIZE,
};
use sim_memory::MemoryBus;

const PRD_TABLE: u64 = 0x1000;
const DATA_BASE: u64 = 0x10000;
/// Status polls allowed before a PIO phase is declared stuck.
const POLL_LIMIT: usize = 16;

#[derive(Debug, Parser)]
#[command(about = "Drive a simulated IDE disk against a raw image file")]
struct Cli {
    /// Raw disk image (length is truncated to whole 512-byte sectors).
    #[arg(long)]
    disk: PathBuf,

    /// JSON `IdeDiskConfig`; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Attach the disk as the channel's slave drive.
    #[arg(long)]
    slave: bool,

    /// Open the image read-only; guest writes become fatal short writes.
    #[arg(long)]
    read_only: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Issue IDENTIFY DEVICE and print the decoded identity as JSON.
    Identify,
    /// Read sectors into a file (or stdout).
    Read {
        #[command(flatten)]
        xfer: Transfer,
        /// Destination for the sector data; stdout when absent.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write sectors from a file; short input is zero padded.
    Write {
        #[command(flatten)]
        xfer: Transfer,
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(Debug, Args)]
struct Transfer {
    #[arg(long, default_value_t = 0)]
    lba: u32,

    /// Sector count, 1..=256.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=256))]
    count: u16,

    /// Use READ/WRITE DMA through the bus master instead of PIO.
    #[arg(long)]
    dma: bool,

    /// Save a system checkpoint once simulated time reaches this tick.
    #[arg(long, requires = "checkpoint_out")]
    checkpoint_at: Option<u64>,

    #[arg(long, requires = "checkpoint_at")]
    checkpoint_out: Option<PathBuf>,
}

impl Transfer {
    fn bytes(&self) -> usize {
        usize::from(self.count) * SECTOR_SIZE
    }

    fn check(&self) -> Result<()> {
        ensure!(
            self.dma || self.checkpoint_at.is_none(),
            "--checkpoint-at needs --dma; PIO transfers do not advance simulated time"
        );
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<IdeDiskConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open config {}", path.display()))?;
            serde_json::from_reader(file)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => IdeDiskConfig::default(),
    };
    if cli.slave {
        config.drive = DriveId::Slave;
    }
    config.validate()?;
    Ok(config)
}

fn build_system(cli: &Cli, config: IdeDiskConfig, mem_size: usize) -> Result<IdeSystem> {
    let image = FileDisk::open(&cli.disk, cli.read_only)
        .with_context(|| format!("failed to open disk image {}", cli.disk.display()))?;
    let disk = IdeDisk::new(Box::new(image), config)
        .with_context(|| format!("cannot attach {}", cli.disk.display()))?;
    let mut sys = IdeSystem::new(mem_size, SharedDmaBus::default());
    sys.attach(disk)?;
    Ok(sys)
}

/// Select the drive, then program an LBA28 command.
fn issue(
    sys: &mut IdeSystem,
    drive: DriveId,
    command: AtaCommand,
    lba: u32,
    count: u16,
) -> Result<()> {
    ensure!(lba < 1 << 28, "lba {lba:#x} does not fit in 28 bits");
    let dev = match drive {
        DriveId::Master => 0,
        DriveId::Slave => DRIVE_DEV,
    };
    let [b0, b1, b2, b3] = lba.to_le_bytes();
    let byte = AccessWidth::Byte;
    sys.cmd_write(REG_DRIVE_HEAD, byte, u16::from(DRIVE_LBA | dev | (b3 & 0x0F)))?;
    sys.read_status()?;
    // 256 sectors is encoded as zero.
    sys.cmd_write(REG_SECTOR_COUNT, byte, count & 0xFF)?;
    sys.cmd_write(REG_SECTOR_NUMBER, byte, b0.into())?;
    sys.cmd_write(REG_CYLINDER_LOW, byte, b1.into())?;
    sys.cmd_write(REG_CYLINDER_HIGH, byte, b2.into())?;
    tracing::info!(?command, lba, count, "issuing command");
    sys.cmd_write(REG_STATUS_COMMAND, byte, command.opcode().into())?;
    Ok(())
}

fn wait_drq(sys: &mut IdeSystem) -> Result<()> {
    for _ in 0..POLL_LIMIT {
        if sys.read_status()? & (STATUS_BSY | STATUS_DRQ) == STATUS_DRQ {
            return Ok(());
        }
    }
    bail!("drive never requested data");
}

fn wait_not_busy(sys: &mut IdeSystem) -> Result<u8> {
    for _ in 0..POLL_LIMIT {
        let status = sys.read_status()?;
        if status & STATUS_BSY == 0 {
            return Ok(status);
        }
    }
    bail!("drive stayed busy");
}

fn pio_in(sys: &mut IdeSystem, bytes: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes);
    while out.len() < bytes {
        wait_drq(sys)?;
        for _ in 0..SECTOR_SIZE / 2 {
            let w = sys.cmd_read(REG_DATA, AccessWidth::Word)?;
            out.extend_from_slice(&w.to_le_bytes());
        }
    }
    Ok(out)
}

fn pio_out(sys: &mut IdeSystem, data: &[u8]) -> Result<()> {
    for sector in data.chunks_exact(SECTOR_SIZE) {
        wait_drq(sys)?;
        for w in sector.chunks_exact(2) {
            sys.cmd_write(REG_DATA, AccessWidth::Word, u16::from_le_bytes([w[0], w[1]]))?;
        }
    }
    wait_not_busy(sys)?;
    Ok(())
}

/// Lay out a PRD table covering `bytes` at `DATA_BASE`.
fn write_prd_table(mem: &mut dyn MemoryBus, bytes: usize) {
    let chunks = bytes.div_ceil(MAX_DMA_SIZE);
    for i in 0..chunks {
        let len = (bytes - i * MAX_DMA_SIZE).min(MAX_DMA_SIZE);
        PrdEntry {
            base: (DATA_BASE + (i * MAX_DMA_SIZE) as u64) as u32,
            // A full 64 KiB entry is encoded as zero.
            count: (len % MAX_DMA_SIZE) as u16,
            flags: if i + 1 == chunks { 0x8000 } else { 0 },
        }
        .write_to(mem, PRD_TABLE + i as u64 * 8);
    }
}

fn run_dma(sys: &mut IdeSystem, to_memory: bool, xfer: &Transfer) -> Result<()> {
    write_prd_table(&mut sys.mem, xfer.bytes());
    sys.bm_write(BM_REG_PRD_TABLE, 4, PRD_TABLE as u32)?;
    let dir = if to_memory { BM_CMD_WRITE } else { 0 };
    sys.bm_write(BM_REG_COMMAND, 1, u32::from(BM_CMD_START | dir))?;

    if let (Some(at), Some(path)) = (xfer.checkpoint_at, &xfer.checkpoint_out) {
        sys.run_until(at)?;
        save_checkpoint(sys, path)?;
    }
    let events = sys.run_until_idle()?;
    tracing::debug!(events, now = sys.now(), "dma finished");

    sys.bm_write(BM_REG_COMMAND, 1, u32::from(dir))?;
    wait_not_busy(sys)?;
    Ok(())
}

fn save_checkpoint(sys: &IdeSystem, path: &Path) -> Result<()> {
    let blob = sys.save_state();
    fs::write(path, &blob)
        .with_context(|| format!("failed to write checkpoint {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        tick = sys.now(),
        bytes = blob.len(),
        "checkpoint saved"
    );
    Ok(())
}

fn identify(sys: &mut IdeSystem, drive: DriveId) -> Result<serde_json::Value> {
    issue(sys, drive, AtaCommand::IdentifyDevice, 0, 0)?;
    let block = pio_in(sys, SECTOR_SIZE)?;
    let word = |i: usize| u16::from_le_bytes([block[2 * i], block[2 * i + 1]]);

    let model: String = (27..47)
        .flat_map(|i| word(i).to_be_bytes())
        .map(char::from)
        .collect();
    let lba_capacity = u32::from(word(60)) | u32::from(word(61)) << 16;
    Ok(serde_json::json!({
        "model": model.trim_end(),
        "cylinders": word(1),
        "heads": word(3),
        "sectors_per_track": word(6),
        "lba_capacity": lba_capacity,
        "max_multsect": word(47) & 0xFF,
    }))
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let drive = config.drive;

    match &cli.command {
        Cmd::Identify => {
            let mut sys = build_system(&cli, config, DATA_BASE as usize)?;
            let info = identify(&mut sys, drive)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Cmd::Read { xfer, out } => {
            xfer.check()?;
            let mut sys = build_system(&cli, config, DATA_BASE as usize + xfer.bytes())?;
            let data = if xfer.dma {
                issue(&mut sys, drive, AtaCommand::ReadDma, xfer.lba, xfer.count)?;
                run_dma(&mut sys, true, xfer)?;
                sys.mem.read_vec(DATA_BASE, xfer.bytes())
            } else {
                issue(&mut sys, drive, AtaCommand::Read, xfer.lba, xfer.count)?;
                pio_in(&mut sys, xfer.bytes())?
            };
            match out {
                Some(path) => fs::write(path, &data)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => io::stdout().lock().write_all(&data)?,
            }
        }
        Cmd::Write { xfer, input } => {
            xfer.check()?;
            let mut data = fs::read(input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            ensure!(
                data.len() <= xfer.bytes(),
                "input is {} bytes but {} sectors hold only {}",
                data.len(),
                xfer.count,
                xfer.bytes()
            );
            data.resize(xfer.bytes(), 0);

            let mut sys = build_system(&cli, config, DATA_BASE as usize + xfer.bytes())?;
            if xfer.dma {
                sys.mem.write_physical(DATA_BASE, &data);
                issue(&mut sys, drive, AtaCommand::WriteDma, xfer.lba, xfer.count)?;
                run_dma(&mut sys, false, xfer)?;
            } else {
                issue(&mut sys, drive, AtaCommand::Write, xfer.lba, xfer.count)?;
                pio_out(&mut sys, &data)?;
            }
            tracing::info!(lba = xfer.lba, count = xfer.count, "write complete");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    run(Cli::parse())
}
