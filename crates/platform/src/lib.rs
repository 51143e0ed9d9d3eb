//! Platform fabric: the I/O-port dispatch bus and IRQ-line plumbing that
//! connect device models to the CPU core.

pub mod io;
pub mod irq;

pub use io::{IoPortBus, IoPortDevice};
pub use irq::IrqLine;
