pub const IDENTIFY_LEN: usize = 512;
pub const MAX_MULTSECT: u8 = 128;

const MAX_CHS_SECTORS: u64 = 16383 * 16 * 63;

const WORD_CYLINDERS: usize = 1;
const WORD_HEADS: usize = 3;
const WORD_SECTORS: usize = 6;
const WORD_MODEL: std::ops::Range<usize> = 27..47;
const WORD_MAX_MULTSECT: usize = 47;
const WORD_CAPABILITY: usize = 49;
const WORD_FIELD_VALID: usize = 53;
const WORD_MULTSECT: usize = 59;
const WORD_LBA_CAPACITY: usize = 60;
const WORD_DMA_MWORD: usize = 63;
const WORD_PIO_MODES: usize = 64;
const WORD_DMA_ULTRA: usize = 88;
const WORD_HW_CONFIG: usize = 93;

/// Legacy CHS geometry reported to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl Geometry {
    /// Derive a geometry for `total` sectors. `total` must be non-zero.
    pub fn from_sectors(total: u64) -> Self {
        if total >= MAX_CHS_SECTORS {
            return Self {
                cylinders: 16383,
                heads: 16,
                sectors: 63,
            };
        }
        let sectors = total.min(63);
        let heads = (total / sectors).min(16);
        let cylinders = total / (heads * sectors);
        Self {
            cylinders: cylinders as u16,
            heads: heads as u8,
            sectors: sectors as u8,
        }
    }
}

/// The 512-byte IDENTIFY DEVICE block, fixed at construction.
#[derive(Clone, PartialEq, Eq)]
pub struct DriveIdentity {
    words: [u16; IDENTIFY_LEN / 2],
    geometry: Geometry,
}

impl std::fmt::Debug for DriveIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveIdentity")
            .field("geometry", &self.geometry)
            .field("lba_capacity", &self.lba_capacity())
            .finish_non_exhaustive()
    }
}

impl DriveIdentity {
    pub fn new(total_sectors: u64, model: &str) -> Self {
        let geometry = Geometry::from_sectors(total_sectors);
        let lba_capacity = u32::try_from(total_sectors).unwrap_or(u32::MAX);

        let mut words = [0u16; IDENTIFY_LEN / 2];
        words[WORD_CYLINDERS] = geometry.cylinders;
        words[WORD_HEADS] = geometry.heads.into();
        words[WORD_SECTORS] = geometry.sectors.into();
        write_ata_string(&mut words[WORD_MODEL], model);
        words[WORD_MAX_MULTSECT] = MAX_MULTSECT.into();
        // IORDY, LBA and DMA supported.
        words[WORD_CAPABILITY] = 0x07 << 8;
        words[WORD_FIELD_VALID] = 0x06;
        words[WORD_MULTSECT] = (1 << 8) | u16::from(MAX_MULTSECT);
        words[WORD_LBA_CAPACITY] = lba_capacity as u16;
        words[WORD_LBA_CAPACITY + 1] = (lba_capacity >> 16) as u16;
        // Multiword DMA mode 2 selected.
        words[WORD_DMA_MWORD] = 0x0400;
        words[WORD_PIO_MODES] = 0x03;
        words[WORD_DMA_ULTRA] = 0x10;
        words[WORD_HW_CONFIG] = 0x4001;

        Self { words, geometry }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn lba_capacity(&self) -> u32 {
        u32::from(self.words[WORD_LBA_CAPACITY])
            | (u32::from(self.words[WORD_LBA_CAPACITY + 1]) << 16)
    }

    pub fn word(&self, idx: usize) -> u16 {
        self.words[idx]
    }

    /// The block as it appears on the data port: little-endian words.
    pub fn to_bytes(&self) -> [u8; IDENTIFY_LEN] {
        let mut out = [0u8; IDENTIFY_LEN];
        for (chunk, w) in out.chunks_exact_mut(2).zip(self.words.iter()) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }
}

/// ATA strings store the first character of each pair in the high byte.
fn write_ata_string(dst_words: &mut [u16], src: &str) {
    let mut bytes = vec![b' '; dst_words.len() * 2];
    let copy_len = src.len().min(bytes.len());
    bytes[..copy_len].copy_from_slice(&src.as_bytes()[..copy_len]);
    for (word, pair) in dst_words.iter_mut().zip(bytes.chunks_exact(2)) {
        *word = u16::from_be_bytes([pair[0], pair[1]]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_image_geometry() {
        assert_eq!(
            Geometry::from_sectors(10),
            Geometry {
                cylinders: 1,
                heads: 1,
                sectors: 10
            }
        );
        assert_eq!(
            Geometry::from_sectors(2048),
            Geometry {
                cylinders: 2,
                heads: 16,
                sectors: 63
            }
        );
        assert_eq!(
            Geometry::from_sectors(500),
            Geometry {
                cylinders: 1,
                heads: 7,
                sectors: 63
            }
        );
    }

    #[test]
    fn large_image_geometry_saturates() {
        let g = Geometry::from_sectors(1 << 30);
        assert_eq!((g.cylinders, g.heads, g.sectors), (16383, 16, 63));
    }

    #[test]
    fn identity_words_match_ata_layout() {
        let id = DriveIdentity::new(0x0001_2345, "SIM IDE DISK");
        assert_eq!(id.word(WORD_MAX_MULTSECT) & 0xFF, 128);
        assert_eq!(id.word(WORD_CAPABILITY) >> 8, 0x07);
        assert_eq!(id.word(WORD_FIELD_VALID), 0x06);
        assert_eq!(id.word(WORD_MULTSECT), 0x0180);
        assert_eq!(id.word(60), 0x2345);
        assert_eq!(id.word(61), 0x0001);
        assert_eq!(id.lba_capacity(), 0x0001_2345);
        assert_eq!(id.word(63), 0x0400);
        assert_eq!(id.word(64), 0x0003);
        assert_eq!(id.word(88), 0x0010);
        assert_eq!(id.word(93), 0x4001);

        let bytes = id.to_bytes();
        // "SI" stored as 'I','S' on the wire.
        assert_eq!(&bytes[54..58], b"IS M");
        assert_eq!(bytes[93], b' ');
    }
}
