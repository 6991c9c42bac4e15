//! VirtIO MMIO device runtime.
//!
//! Each emulated peripheral is a [`VirtioMmio`] register window wrapped
//! around a device front-end implementing [`VirtioDevice`]. The guest driver
//! configures virtqueues through the register file; QUEUE_NOTIFY drives the
//! virtqueue engine, which walks guest-resident descriptor chains and hands
//! each one to the front-end. Front-ends move payload bytes with the
//! scatter/gather helpers on [`QueueIo`] and publish completions into the
//! used ring, which raises the device's interrupt line.
//!
//! Only the modern (version 2) MMIO transport is implemented, with a single
//! 32-bit feature word. Indirect descriptors and the v1.2 registers (shared
//! memory, queue reset) are not supported.

pub mod devices;
pub mod mmio;
pub mod queue;
pub mod user_net;

pub use devices::blk::VirtioBlk;
pub use devices::net::{NetBackend, VirtioNet};
pub use devices::{ChainRequest, RecvStatus, VirtioDevice};
pub use mmio::VirtioMmio;
pub use queue::{ChainError, Descriptor, QueueIo, QueueState};
pub use user_net::{
    HostForward, HostStack, UserNetBackend, UserNetConfig, UserNetError, USER_NET_MAC,
};

use sirocco_devices::ArgsError;
use sirocco_storage::DiskError;
use thiserror::Error;

pub const MAX_QUEUE: usize = 8;
pub const MAX_QUEUE_NUM: u32 = 16;
pub const MAX_CONFIG_SPACE_SIZE: usize = 256;

/// `INTERRUPT_STATUS` bit 0: a used-ring entry was published.
pub const INT_STATUS_USED_BUFFER: u32 = 1 << 0;
/// `INTERRUPT_STATUS` bit 1: the device configuration changed.
pub const INT_STATUS_CONFIG_CHANGE: u32 = 1 << 1;

/// Device construction failures. These are fatal: the registration glue
/// reports them and aborts, per the simulator's device plugin contract.
#[derive(Debug, Error)]
pub enum DeviceInitError {
    #[error(transparent)]
    Args(#[from] ArgsError),

    #[error("cannot open block image: {0}")]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Net(#[from] UserNetError),

    #[error("unsupported network driver `{0}` (only `user` is available)")]
    UnknownNetDriver(String),
}
