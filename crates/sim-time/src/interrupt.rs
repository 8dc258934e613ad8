use crate::Tick;

/// An interrupt request line on the platform interrupt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interrupt {
    Irq(u8),
}

/// Platform interrupt controller as seen by devices.
pub trait InterruptSink {
    fn raise(&mut self, irq: Interrupt, at: Tick);
    fn lower(&mut self, irq: Interrupt, at: Tick);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqTransition {
    Raised,
    Lowered,
}

/// Interrupt sink that records every edge, for tests and tracing tools.
#[derive(Debug, Default, Clone)]
pub struct IrqLog {
    events: Vec<(Tick, Interrupt, IrqTransition)>,
}

impl IrqLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[(Tick, Interrupt, IrqTransition)] {
        &self.events
    }

    pub fn raised_count(&self, irq: Interrupt) -> usize {
        self.count(irq, IrqTransition::Raised)
    }

    pub fn lowered_count(&self, irq: Interrupt) -> usize {
        self.count(irq, IrqTransition::Lowered)
    }

    /// Whether the line is currently asserted (last recorded edge was a raise).
    pub fn is_asserted(&self, irq: Interrupt) -> bool {
        self.events
            .iter()
            .rev()
            .find(|(_, i, _)| *i == irq)
            .is_some_and(|(_, _, t)| *t == IrqTransition::Raised)
    }

    fn count(&self, irq: Interrupt, what: IrqTransition) -> usize {
        self.events
            .iter()
            .filter(|(_, i, t)| *i == irq && *t == what)
            .count()
    }
}

impl InterruptSink for IrqLog {
    fn raise(&mut self, irq: Interrupt, at: Tick) {
        self.events.push((at, irq, IrqTransition::Raised));
    }

    fn lower(&mut self, irq: Interrupt, at: Tick) {
        self.events.push((at, irq, IrqTransition::Lowered));
    }
}
