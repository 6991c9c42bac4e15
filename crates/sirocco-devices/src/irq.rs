/// A single level-triggered interrupt wire into the platform interrupt
/// controller.
///
/// The device drives the line; it does not own the controller. Each device
/// gets its own wire, identified on the controller side by an integer line
/// id the device never sees.
pub trait IrqLine {
    fn set_level(&self, level: bool);
}

/// Interrupt wire that goes nowhere. Useful for devices constructed before
/// the interrupt controller, and in tests that do not care about interrupts.
#[derive(Clone, Copy, Default)]
pub struct NoIrq;

impl IrqLine for NoIrq {
    fn set_level(&self, _level: bool) {}
}
