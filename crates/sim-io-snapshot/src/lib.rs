//! Versioned, deterministic snapshot encoding for simulated I/O devices.

#![forbid(unsafe_code)]

pub mod io;
