//! Guest physical memory model used by DMA-capable devices.

#![forbid(unsafe_code)]

mod bus;
mod phys;

pub use bus::MemoryBus;
pub use phys::Bus;
