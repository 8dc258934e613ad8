use crate::bus::MemoryBus;

/// Flat guest RAM starting at physical address 0.
///
/// Bytes outside the RAM window read as `0xFF` (open bus) and writes to them
/// are dropped, so a stray guest pointer can never panic the host.
#[derive(Debug, Clone)]
pub struct Bus {
    ram: Vec<u8>,
    reads: u64,
    writes: u64,
}

impl Bus {
    pub fn new(size: usize) -> Self {
        Self {
            ram: vec![0; size],
            reads: 0,
            writes: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.ram.len() as u64
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    /// Number of `read_physical` calls observed so far.
    pub fn read_count(&self) -> u64 {
        self.reads
    }

    /// Number of `write_physical` calls observed so far.
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    fn in_ram(&self, paddr: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(paddr).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.ram.len()).then_some(start..end)
    }
}

impl MemoryBus for Bus {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        self.reads += 1;
        match self.in_ram(paddr, buf.len()) {
            Some(range) => buf.copy_from_slice(&self.ram[range]),
            None => {
                // Straddling accesses keep the in-RAM prefix and float the rest.
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = paddr
                        .checked_add(i as u64)
                        .and_then(|a| usize::try_from(a).ok())
                        .and_then(|a| self.ram.get(a).copied())
                        .unwrap_or(0xFF);
                }
            }
        }
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        self.writes += 1;
        match self.in_ram(paddr, buf.len()) {
            Some(range) => self.ram[range].copy_from_slice(buf),
            None => {
                for (i, b) in buf.iter().enumerate() {
                    let slot = paddr
                        .checked_add(i as u64)
                        .and_then(|a| usize::try_from(a).ok())
                        .and_then(|a| self.ram.get_mut(a));
                    if let Some(slot) = slot {
                        *slot = *b;
                    }
                }
            }
        }
    }
}
