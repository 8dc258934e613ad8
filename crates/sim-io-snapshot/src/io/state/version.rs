use std::collections::BTreeMap;

use thiserror::Error;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"SIMS";
pub const SNAPSHOT_FORMAT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

const HEADER_LEN: usize = 4 + 4 + 4 + 4;
const FIELD_HEADER_LEN: usize = 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("unexpected end of snapshot data")]
    UnexpectedEof,
    #[error("invalid snapshot magic")]
    InvalidMagic,
    #[error("unsupported snapshot format version {0}.{1}")]
    UnsupportedFormatVersion(u16, u16),
    #[error("device id mismatch: expected {expected:?}, found {found:?}")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported device major version {found} (supported: {supported})")]
    UnsupportedDeviceMajorVersion { found: u16, supported: u16 },
    #[error("duplicate field tag {0}")]
    DuplicateFieldTag(u16),
    #[error("invalid field encoding: {0}")]
    InvalidFieldEncoding(&'static str),
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: SnapshotVersion,
    pub device_id: [u8; 4],
    pub device_version: SnapshotVersion,
}

/// Builds one device snapshot: a header followed by tagged fields.
#[derive(Debug)]
pub struct SnapshotWriter {
    device_id: [u8; 4],
    device_version: SnapshotVersion,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        Self {
            device_id,
            device_version,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field. Writing the same tag twice is a bug in the device encoder; the
    /// later value wins in release builds.
    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        let prev = self.fields.insert(tag, bytes);
        debug_assert!(prev.is_none(), "snapshot tag {tag} written twice");
    }

    pub fn field_u8(&mut self, tag: u16, val: u8) {
        self.field_bytes(tag, vec![val]);
    }

    pub fn field_bool(&mut self, tag: u16, val: bool) {
        self.field_u8(tag, val as u8);
    }

    pub fn field_u16(&mut self, tag: u16, val: u16) {
        self.field_bytes(tag, val.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, val: u32) {
        self.field_bytes(tag, val.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, val: u64) {
        self.field_bytes(tag, val.to_le_bytes().to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        let body: usize = self
            .fields
            .values()
            .map(|v| FIELD_HEADER_LEN + v.len())
            .sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body);
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.major.to_le_bytes());
        out.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.minor.to_le_bytes());
        out.extend_from_slice(&self.device_id);
        out.extend_from_slice(&self.device_version.major.to_le_bytes());
        out.extend_from_slice(&self.device_version.minor.to_le_bytes());
        for (tag, payload) in self.fields {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&payload);
        }
        out
    }
}

/// Parsed view over a device snapshot produced by [`SnapshotWriter`].
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    header: SnapshotHeader,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], expected_device_id: [u8; 4]) -> SnapshotResult<Self> {
        let mut d = codec::Decoder::new(bytes);
        if d.bytes(4)? != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let format_version = SnapshotVersion::new(d.u16()?, d.u16()?);
        if format_version.major != SNAPSHOT_FORMAT_VERSION.major {
            return Err(SnapshotError::UnsupportedFormatVersion(
                format_version.major,
                format_version.minor,
            ));
        }
        let mut device_id = [0u8; 4];
        device_id.copy_from_slice(d.bytes(4)?);
        if device_id != expected_device_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: expected_device_id,
                found: device_id,
            });
        }
        let device_version = SnapshotVersion::new(d.u16()?, d.u16()?);

        let mut fields = BTreeMap::new();
        while !d.is_empty() {
            let tag = d.u16()?;
            let len = d.u32()? as usize;
            let payload = d.bytes(len)?;
            if fields.insert(tag, payload).is_some() {
                return Err(SnapshotError::DuplicateFieldTag(tag));
            }
        }

        Ok(Self {
            header: SnapshotHeader {
                format_version,
                device_id,
                device_version,
            },
            fields,
        })
    }

    pub fn header(&self) -> SnapshotHeader {
        self.header
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        let found = self.header.device_version.major;
        if found != supported {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion { found, supported });
        }
        Ok(())
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        self.fixed::<1>(tag).map(|v| v.map(|b| b[0]))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.u8(tag)? {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("bool")),
        }
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        self.fixed::<2>(tag).map(|v| v.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        self.fixed::<4>(tag).map(|v| v.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        self.fixed::<8>(tag).map(|v| v.map(u64::from_le_bytes))
    }

    pub fn iter_fields(&self) -> impl Iterator<Item = (u16, &'a [u8])> + '_ {
        self.fields.iter().map(|(tag, v)| (*tag, *v))
    }

    fn fixed<const N: usize>(&self, tag: u16) -> SnapshotResult<Option<[u8; N]>> {
        let Some(bytes) = self.bytes(tag) else {
            return Ok(None);
        };
        let arr: [u8; N] = bytes
            .try_into()
            .map_err(|_| SnapshotError::InvalidFieldEncoding("fixed-width field length"))?;
        Ok(Some(arr))
    }
}

/// Little-endian builders for the payload of a single composite field.
pub mod codec {
    use super::{SnapshotError, SnapshotResult};

    #[derive(Debug, Default)]
    pub struct Encoder {
        buf: Vec<u8>,
    }

    impl Encoder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn u8(mut self, v: u8) -> Self {
            self.buf.push(v);
            self
        }

        pub fn bool(self, v: bool) -> Self {
            self.u8(v as u8)
        }

        pub fn u16(mut self, v: u16) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u32(mut self, v: u32) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u64(mut self, v: u64) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn bytes(mut self, v: &[u8]) -> Self {
            self.buf.extend_from_slice(v);
            self
        }

        /// Length-prefixed (u32) byte string.
        pub fn vec_u8(self, v: &[u8]) -> Self {
            self.u32(v.len() as u32).bytes(v)
        }

        pub fn finish(self) -> Vec<u8> {
            self.buf
        }
    }

    #[derive(Debug)]
    pub struct Decoder<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Decoder<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, pos: 0 }
        }

        pub fn is_empty(&self) -> bool {
            self.pos >= self.buf.len()
        }

        pub fn remaining(&self) -> usize {
            self.buf.len() - self.pos
        }

        pub fn bytes(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
            if self.remaining() < len {
                return Err(SnapshotError::UnexpectedEof);
            }
            let out = &self.buf[self.pos..self.pos + len];
            self.pos += len;
            Ok(out)
        }

        pub fn u8(&mut self) -> SnapshotResult<u8> {
            Ok(self.bytes(1)?[0])
        }

        pub fn bool(&mut self) -> SnapshotResult<bool> {
            match self.u8()? {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(SnapshotError::InvalidFieldEncoding("bool")),
            }
        }

        pub fn u16(&mut self) -> SnapshotResult<u16> {
            let b = self.bytes(2)?;
            Ok(u16::from_le_bytes([b[0], b[1]]))
        }

        pub fn u32(&mut self) -> SnapshotResult<u32> {
            let b = self.bytes(4)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        pub fn u64(&mut self) -> SnapshotResult<u64> {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(self.bytes(8)?);
            Ok(u64::from_le_bytes(arr))
        }

        /// Length-prefixed byte string, bounded by `max_len` so corrupt input cannot
        /// force a huge allocation.
        pub fn vec_u8(&mut self, max_len: usize) -> SnapshotResult<Vec<u8>> {
            let len = self.u32()? as usize;
            if len > max_len {
                return Err(SnapshotError::InvalidFieldEncoding("byte string too long"));
            }
            Ok(self.bytes(len)?.to_vec())
        }

        /// Require that the whole payload was consumed.
        pub fn finish(self) -> SnapshotResult<()> {
            if !self.is_empty() {
                return Err(SnapshotError::InvalidFieldEncoding("trailing bytes"));
            }
            Ok(())
        }
    }
}
