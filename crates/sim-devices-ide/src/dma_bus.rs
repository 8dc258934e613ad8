use sim_time::Tick;

/// Direction of a bus transaction, from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    /// Device reads guest memory.
    Read,
    /// Device writes (and invalidates) guest memory.
    WriteInvalidate,
}

/// Shared DMA bus arbitration.
///
/// The disk only uses the bus for timing: data is moved through
/// [`sim_memory::MemoryBus`] when the returned completion tick fires.
pub trait DmaBus {
    fn busy(&self, now: Tick) -> bool;

    /// Start a transaction that may begin no earlier than `ready_at` and
    /// return the tick at which it completes.
    fn issue(&mut self, op: BusOp, addr: u64, len: u32, ready_at: Tick) -> Tick;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTransfer {
    pub op: BusOp,
    pub addr: u64,
    pub len: u32,
    pub ready_at: Tick,
    pub completes_at: Tick,
}

/// Single shared bus with fixed latency and width.
///
/// The bus is busy from the moment a transaction is issued until it
/// completes; other masters can be modelled with [`SharedDmaBus::occupy_until`].
#[derive(Debug, Clone)]
pub struct SharedDmaBus {
    latency: Tick,
    bytes_per_tick: u32,
    busy_until: Tick,
    log: Vec<BusTransfer>,
}

impl Default for SharedDmaBus {
    fn default() -> Self {
        Self::new(0, u32::MAX)
    }
}

impl SharedDmaBus {
    pub fn new(latency: Tick, bytes_per_tick: u32) -> Self {
        Self {
            latency,
            bytes_per_tick: bytes_per_tick.max(1),
            busy_until: 0,
            log: Vec::new(),
        }
    }

    /// Hold the bus for another master until `until`.
    pub fn occupy_until(&mut self, until: Tick) {
        self.busy_until = self.busy_until.max(until);
    }

    pub fn busy_until(&self) -> Tick {
        self.busy_until
    }

    pub fn transfers(&self) -> &[BusTransfer] {
        &self.log
    }

    pub fn take_transfers(&mut self) -> Vec<BusTransfer> {
        std::mem::take(&mut self.log)
    }
}

impl DmaBus for SharedDmaBus {
    fn busy(&self, now: Tick) -> bool {
        now < self.busy_until
    }

    fn issue(&mut self, op: BusOp, addr: u64, len: u32, ready_at: Tick) -> Tick {
        let start = ready_at.max(self.busy_until);
        let cycles = Tick::from(len.div_ceil(self.bytes_per_tick));
        let completes_at = start + self.latency + cycles;
        self.busy_until = completes_at;
        tracing::trace!(?op, addr, len, ready_at, completes_at, "dma bus transfer");
        self.log.push(BusTransfer {
            op,
            addr,
            len,
            ready_at,
            completes_at,
        });
        completes_at
    }
}
