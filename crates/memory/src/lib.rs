//! Guest physical memory access for device models.
//!
//! Emulated peripherals never touch simulator RAM directly; they go through
//! the [`GuestMemory`] accessor, which the simulator implements on top of its
//! physical-memory fabric. The contract is a typed little-endian load/store
//! at a guest physical address. [`DenseMemory`] is the contiguous reference
//! backend used by tests and by simple machine configurations.

pub mod phys;

pub use phys::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult};
