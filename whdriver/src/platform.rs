/// Everything the driver needs from its host: register mappings, interrupt
/// attachment and sleeping. The Linux implementation talks to real
/// hardware; the simulated board implements the same trait for tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::regs::RegisterWindow;

/// Outcome of an interrupt handler, shared-line convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    Handled,
    NotHandled,
}

impl IrqReturn {
    pub fn from_count(serviced: usize) -> Self {
        if serviced > 0 {
            IrqReturn::Handled
        } else {
            IrqReturn::NotHandled
        }
    }
}

/// Interrupt source to attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrqLine {
    /// Edge interrupt of a GPIO input
    Gpio(u8),
    /// Platform interrupt number, as listed in /proc/interrupts
    Number(u32),
}

impl fmt::Display for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrqLine::Gpio(pin) => write!(f, "gpio{}", pin),
            IrqLine::Number(n) => write!(f, "irq{}", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    FallingEdge,
    /// Level high, line may be shared with other devices
    LevelHigh,
}

/// Token returned by `request_irq`, passed back to `free_irq`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrqHandle {
    pub id: u64,
    pub line: IrqLine,
}

pub type IrqHandler = Arc<dyn Fn() -> IrqReturn + Send + Sync + 'static>;

pub trait Platform: Send + Sync {
    /// Map `len` bytes of physical register space at `base`. The mapping is
    /// released when the last reference to the window is dropped.
    fn map(&self, base: u64, len: usize) -> Result<Arc<dyn RegisterWindow>>;

    fn request_irq(
        &self,
        line: IrqLine,
        trigger: Trigger,
        name: &str,
        handler: IrqHandler,
    ) -> Result<IrqHandle>;

    /// Detach a handler. On return the handler no longer runs.
    fn free_irq(&self, handle: IrqHandle);

    fn delay(&self, duration: Duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_return_from_count() {
        assert_eq!(IrqReturn::from_count(0), IrqReturn::NotHandled);
        assert_eq!(IrqReturn::from_count(2), IrqReturn::Handled);
    }

    #[test]
    fn test_line_display() {
        assert_eq!(IrqLine::Gpio(10).to_string(), "gpio10");
        assert_eq!(IrqLine::Number(57).to_string(), "irq57");
    }
}
