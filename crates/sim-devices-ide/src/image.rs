use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const SECTOR_SIZE: usize = 512;

/// Sector-addressed backing store for a disk.
///
/// Both transfer methods return the number of bytes actually moved; anything
/// short of [`SECTOR_SIZE`] is treated as fatal by the disk.
pub trait DiskImage {
    fn sectors(&self) -> u64;
    fn read_sector(&mut self, lba: u64, buf: &mut [u8]) -> usize;
    fn write_sector(&mut self, lba: u64, data: &[u8]) -> usize;
}

impl<T: DiskImage + ?Sized> DiskImage for Box<T> {
    fn sectors(&self) -> u64 {
        (**self).sectors()
    }

    fn read_sector(&mut self, lba: u64, buf: &mut [u8]) -> usize {
        (**self).read_sector(lba, buf)
    }

    fn write_sector(&mut self, lba: u64, data: &[u8]) -> usize {
        (**self).write_sector(lba, data)
    }
}

/// RAM-backed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0; sectors as usize * SECTOR_SIZE],
        }
    }

    /// Wrap existing bytes, zero-padding the tail to a whole sector.
    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        let rem = data.len() % SECTOR_SIZE;
        if rem != 0 {
            data.resize(data.len() + SECTOR_SIZE - rem, 0);
        }
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Borrow one sector, or `None` past the end of the image.
    pub fn sector(&self, lba: u64) -> Option<&[u8]> {
        let start = usize::try_from(lba).ok()?.checked_mul(SECTOR_SIZE)?;
        self.data.get(start..start + SECTOR_SIZE)
    }

    fn sector_range(&self, lba: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(lba).ok()?.checked_mul(SECTOR_SIZE)?;
        let end = start.checked_add(len.min(SECTOR_SIZE))?.min(self.data.len());
        (start < end).then_some(start..end)
    }
}

impl DiskImage for MemDisk {
    fn sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&mut self, lba: u64, buf: &mut [u8]) -> usize {
        let Some(range) = self.sector_range(lba, buf.len()) else {
            return 0;
        };
        let n = range.len();
        buf[..n].copy_from_slice(&self.data[range]);
        n
    }

    fn write_sector(&mut self, lba: u64, data: &[u8]) -> usize {
        let Some(range) = self.sector_range(lba, data.len()) else {
            return 0;
        };
        let n = range.len();
        self.data[range].copy_from_slice(&data[..n]);
        n
    }
}

/// Raw image file on the host.
///
/// I/O errors are logged and reported to the disk as a zero-length transfer.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    sectors: u64,
    read_only: bool,
}

impl FileDisk {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;
        let sectors = file.metadata()?.len() / SECTOR_SIZE as u64;
        Ok(Self {
            file,
            sectors,
            read_only,
        })
    }

    fn seek_to(&mut self, lba: u64) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))
            .map(|_| ())
    }

    fn try_read(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek_to(lba)?;
        let want = buf.len().min(SECTOR_SIZE);
        let mut done = 0;
        while done < want {
            match self.file.read(&mut buf[done..want])? {
                0 => break,
                n => done += n,
            }
        }
        Ok(done)
    }

    fn try_write(&mut self, lba: u64, data: &[u8]) -> io::Result<usize> {
        self.seek_to(lba)?;
        let len = data.len().min(SECTOR_SIZE);
        self.file.write_all(&data[..len])?;
        Ok(len)
    }
}

impl DiskImage for FileDisk {
    fn sectors(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&mut self, lba: u64, buf: &mut [u8]) -> usize {
        if lba >= self.sectors {
            return 0;
        }
        self.try_read(lba, buf).unwrap_or_else(|err| {
            tracing::error!(lba, %err, "disk image read failed");
            0
        })
    }

    fn write_sector(&mut self, lba: u64, data: &[u8]) -> usize {
        if self.read_only || lba >= self.sectors {
            return 0;
        }
        self.try_write(lba, data).unwrap_or_else(|err| {
            tracing::error!(lba, %err, "disk image write failed");
            0
        })
    }
}
