//! Simulated time and event scheduling primitives.
//!
//! All device models run against a single monotonic simulated clock measured in
//! [`Tick`]s. Nothing here ever sleeps: "waiting" is always expressed by
//! scheduling a payload on a [`TimerQueue`] and returning to the caller, who
//! later pops it once simulated time has advanced far enough.

#![forbid(unsafe_code)]

mod interrupt;
mod timer_queue;

pub use interrupt::{Interrupt, InterruptSink, IrqLog, IrqTransition};
pub use timer_queue::{TimerEvent, TimerId, TimerQueue};

/// Simulated time, in ticks since reset.
pub type Tick = u64;
