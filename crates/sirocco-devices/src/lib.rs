//! Device-side plumbing shared by the emulated peripherals: the interrupt
//! wire and console contracts the simulator implements, the SiFive UART
//! model, and the `key=value` device-argument grammar used at construction.

pub mod args;
pub mod console;
pub mod irq;
pub mod uart;

pub use args::{ArgsError, DeviceArgs};
pub use console::{Console, StdioConsole};
pub use irq::{IrqLine, NoIrq};
pub use uart::SifiveUart;
