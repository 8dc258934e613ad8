//! Deterministic snapshot encoding for I/O devices.
//!
//! Device state is written as an explicit list of tagged fields (tag-length-value) behind a
//! small header, rather than as a raw memory image of the device struct:
//! - output bytes are canonical (fields are emitted in ascending tag order)
//! - unknown tags are skipped, so minor versions can add fields freely
//! - both the container format and each device carry a major/minor version

mod version;

pub use version::{
    codec, SnapshotError, SnapshotHeader, SnapshotReader, SnapshotResult, SnapshotVersion,
    SnapshotWriter, SNAPSHOT_FORMAT_VERSION, SNAPSHOT_MAGIC,
};

/// Snapshotting contract for emulated devices.
///
/// `DEVICE_ID` must never change once published. Within one major version only
/// forward-compatible changes are allowed, i.e. adding new tags.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}
