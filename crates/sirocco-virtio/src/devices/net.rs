//! virtio-net front-end.
//!
//! Queue 0 is RX (device writes frames into guest-posted write-only chains),
//! queue 1 is TX (the guest posts read-only chains of header + frame). The
//! 12-byte virtio-net header carries no offloads here; the device zeroes it
//! on RX apart from `num_buffers = 1` and ignores its contents on TX.

use memory::GuestMemory;
use sirocco_devices::DeviceArgs;

use crate::devices::{ChainRequest, RecvStatus, VirtioDevice};
use crate::queue::QueueIo;
use crate::user_net::{HostStack, UserNetBackend, UserNetConfig, USER_NET_MAC};
use crate::{DeviceInitError, VirtioMmio};

/// VIRTIO_NET_F_MAC: the device supplies a stable MAC in config space.
pub const VIRTIO_NET_F_MAC: u32 = 1 << 5;

pub const QUEUE_RX: usize = 0;
pub const QUEUE_TX: usize = 1;

/// flags, gso_type, hdr_len, gso_size, csum_start, csum_offset, num_buffers.
pub const NET_HEADER_SIZE: usize = 12;

/// Offset of `num_buffers` within the header.
const NUM_BUFFERS_OFFSET: usize = 10;

/// Host-side ethernet backend consumed by the net device.
///
/// Frames flow guest to host through [`transmit`](Self::transmit). Frames
/// flow host to guest by the device *pulling* [`recv_frame`](Self::recv_frame)
/// whenever it has an RX buffer available, which is the backpressure point:
/// the backend keeps undelivered frames queued until asked.
pub trait NetBackend {
    fn transmit(&mut self, frame: &[u8]);

    fn recv_frame(&mut self) -> Option<Vec<u8>>;

    /// Host-side housekeeping (socket polling and the like), driven from the
    /// simulator's event loop.
    fn poll(&mut self) {}
}

pub struct VirtioNet<B> {
    backend: B,
    mac: [u8; 6],
}

impl<B> std::fmt::Debug for VirtioNet<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtioNet").field("mac", &self.mac).finish()
    }
}

impl<B: NetBackend> VirtioNet<B> {
    pub fn new(backend: B, mac: [u8; 6]) -> Self {
        Self { backend, mac }
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl VirtioNet<UserNetBackend> {
    /// Builds the device from `driver=user,hostfwd=<spec>` arguments, wiring
    /// the user-mode backend around the supplied host stack.
    pub fn from_args(
        args: &DeviceArgs,
        stack: Box<dyn HostStack>,
    ) -> Result<Self, DeviceInitError> {
        let driver = args.require("driver")?;
        if driver != "user" {
            return Err(DeviceInitError::UnknownNetDriver(driver.to_owned()));
        }
        let hostfwd = args.require("hostfwd")?;
        let backend = UserNetBackend::open(UserNetConfig::default(), hostfwd, stack)?;
        Ok(Self::new(backend, USER_NET_MAC))
    }
}

impl<B: NetBackend> VirtioDevice for VirtioNet<B> {
    fn device_id(&self) -> u32 {
        1
    }

    fn device_features(&self) -> u32 {
        VIRTIO_NET_F_MAC
    }

    /// MAC address followed by the 16-bit status word.
    fn config_space(&self) -> Vec<u8> {
        let mut config = self.mac.to_vec();
        config.extend_from_slice(&[0, 0]);
        config
    }

    fn recv<M: GuestMemory>(
        &mut self,
        io: &mut QueueIo<'_, M>,
        request: ChainRequest,
    ) -> RecvStatus {
        if request.queue_idx != QUEUE_TX {
            return RecvStatus::Done;
        }
        let read_size = request.read_size as usize;
        if read_size < NET_HEADER_SIZE {
            return RecvStatus::Done;
        }
        let mut frame = vec![0u8; read_size - NET_HEADER_SIZE];
        if io
            .read_from_chain(
                request.queue_idx,
                request.head,
                NET_HEADER_SIZE as u32,
                &mut frame,
            )
            .is_err()
        {
            return RecvStatus::Done;
        }
        tracing::trace!(len = frame.len(), "net tx");
        self.backend.transmit(&frame);
        let _ = io.consume(request.queue_idx, request.head, 0);
        RecvStatus::Done
    }
}

impl<B: NetBackend> VirtioMmio<VirtioNet<B>> {
    /// Whether the guest has an RX buffer posted. The backend's backpressure
    /// hook: frames must not be delivered when this is false.
    pub fn can_write_packet<M: GuestMemory>(&self, mem: &M) -> bool {
        let qs = self.queue_state(QUEUE_RX);
        if qs.ready == 0 {
            return false;
        }
        match mem.read_u16(qs.avail_addr.wrapping_add(2)) {
            Ok(avail_idx) => avail_idx != qs.last_avail_idx,
            Err(_) => false,
        }
    }

    /// Delivers one host frame into the next posted RX chain. Frames that do
    /// not fit the posted buffer are dropped; the buffer stays posted.
    pub fn write_packet<M: GuestMemory>(&mut self, mem: &mut M, frame: &[u8]) {
        let mut header = [0u8; NET_HEADER_SIZE];
        header[NUM_BUFFERS_OFFSET..NUM_BUFFERS_OFFSET + 2].copy_from_slice(&1u16.to_le_bytes());

        self.with_queue_io(mem, |_, io| {
            if io.queue(QUEUE_RX).ready == 0 {
                return;
            }
            let last_avail_idx = io.queue(QUEUE_RX).last_avail_idx;
            let Ok(avail_idx) = io.avail_idx(QUEUE_RX) else {
                return;
            };
            if last_avail_idx == avail_idx {
                return;
            }
            let Ok(head) = io.next_avail_head(QUEUE_RX) else {
                return;
            };
            let Ok((_, write_size)) = io.chain_rw_size(QUEUE_RX, head) else {
                return;
            };
            let total = NET_HEADER_SIZE + frame.len();
            if total > write_size as usize {
                tracing::debug!(
                    len = frame.len(),
                    write_size,
                    "dropping rx frame larger than posted buffer"
                );
                return;
            }

            let _ = io.write_to_chain(QUEUE_RX, head, 0, &header);
            let _ = io.write_to_chain(QUEUE_RX, head, NET_HEADER_SIZE as u32, frame);
            let _ = io.consume(QUEUE_RX, head, total as u32);
            io.advance_avail(QUEUE_RX);
        });
    }

    /// Event-loop hook: lets the backend poll its host side, then drains
    /// pending host frames into posted RX buffers.
    pub fn poll<M: GuestMemory>(&mut self, mem: &mut M) {
        self.device_mut().backend.poll();
        while self.can_write_packet(mem) {
            let Some(frame) = self.device_mut().backend.recv_frame() else {
                return;
            };
            self.write_packet(mem, &frame);
        }
    }
}
