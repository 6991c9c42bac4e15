//! virtio-blk front-end.
//!
//! Requests arrive as a 16-byte header in the read sub-chain (type, ioprio,
//! sector), payload descriptors, and a trailing status byte the device
//! writes. One request is in flight at a time; while the backend holds one,
//! further chains are backpressured and redelivered after completion.

use memory::GuestMemory;
use sirocco_devices::DeviceArgs;
use sirocco_storage::{
    BlockBackend, BlockMode, FileDisk, Result as DiskResult, Submission, SECTOR_SIZE,
};

use crate::devices::{ChainRequest, RecvStatus, VirtioDevice};
use crate::queue::QueueIo;
use crate::{DeviceInitError, VirtioMmio};

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// type (u32) + ioprio (u32) + sector (u64).
const REQUEST_HEADER_SIZE: u32 = 16;

#[derive(Debug)]
struct BlockRequest {
    req_type: u32,
    /// IN only: response buffer, status byte last.
    buf: Vec<u8>,
    write_size: u32,
    queue_idx: usize,
    head: u16,
}

pub struct VirtioBlk<B> {
    backend: B,
    inflight: Option<BlockRequest>,
}

impl<B: BlockBackend> VirtioBlk<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            inflight: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn request_in_progress(&self) -> bool {
        self.inflight.is_some()
    }

    fn submit<M: GuestMemory>(
        &mut self,
        io: &mut QueueIo<'_, M>,
        request: BlockRequest,
        submission: Submission,
    ) {
        match submission {
            Submission::Complete(result) => {
                if let Err(err) = &result {
                    tracing::warn!(%err, "block request failed");
                }
                Self::req_end(io, request, result.is_ok());
            }
            Submission::Pending => self.inflight = Some(request),
        }
    }

    /// Writes the status byte, publishes the chain and raises the interrupt.
    fn req_end<M: GuestMemory>(io: &mut QueueIo<'_, M>, request: BlockRequest, ok: bool) {
        let status = if ok { VIRTIO_BLK_S_OK } else { VIRTIO_BLK_S_IOERR };
        match request.req_type {
            VIRTIO_BLK_T_IN => {
                let mut buf = request.buf;
                let write_size = request.write_size as usize;
                buf[write_size - 1] = status;
                let _ = io.write_to_chain(request.queue_idx, request.head, 0, &buf[..write_size]);
                let _ = io.consume(request.queue_idx, request.head, request.write_size);
            }
            VIRTIO_BLK_T_OUT => {
                let _ = io.write_to_chain(request.queue_idx, request.head, 0, &[status]);
                let _ = io.consume(request.queue_idx, request.head, 1);
            }
            _ => {}
        }
    }

    /// Backend completion. Returns the queue to resume, or `None` when no
    /// request is in flight (e.g. the device was reset while the backend was
    /// working; the late completion must have no guest-visible effect).
    fn complete<M: GuestMemory>(
        &mut self,
        io: &mut QueueIo<'_, M>,
        result: DiskResult<()>,
    ) -> Option<usize> {
        let request = self.inflight.take()?;
        let queue_idx = request.queue_idx;
        if let Err(err) = &result {
            tracing::warn!(%err, "block request failed");
        }
        Self::req_end(io, request, result.is_ok());
        Some(queue_idx)
    }
}

impl VirtioBlk<FileDisk> {
    /// Builds the device from `img=<path>[,mode=ro|rw|snapshot]` arguments.
    pub fn from_args(args: &DeviceArgs) -> Result<Self, DeviceInitError> {
        let img = args.require("img")?;
        let mode = args
            .get("mode")
            .map(BlockMode::from_arg)
            .unwrap_or(BlockMode::ReadWrite);
        Ok(Self::new(FileDisk::open(img, mode)?))
    }
}

impl<B: BlockBackend> VirtioDevice for VirtioBlk<B> {
    fn device_id(&self) -> u32 {
        2
    }

    /// 64-bit sector count.
    fn config_space(&self) -> Vec<u8> {
        self.backend.sector_count().to_le_bytes().to_vec()
    }

    fn recv<M: GuestMemory>(
        &mut self,
        io: &mut QueueIo<'_, M>,
        request: ChainRequest,
    ) -> RecvStatus {
        if self.inflight.is_some() {
            return RecvStatus::Backpressure;
        }

        let mut header = [0u8; REQUEST_HEADER_SIZE as usize];
        if io
            .read_from_chain(request.queue_idx, request.head, 0, &mut header)
            .is_err()
        {
            return RecvStatus::Done;
        }
        let req_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let sector = u64::from_le_bytes([
            header[8], header[9], header[10], header[11], header[12], header[13], header[14],
            header[15],
        ]);

        match req_type {
            VIRTIO_BLK_T_IN => {
                let write_size = request.write_size as usize;
                if write_size == 0 {
                    return RecvStatus::Done;
                }
                let mut buf = vec![0u8; write_size];
                let sectors = (write_size - 1) / SECTOR_SIZE;
                let submission = self
                    .backend
                    .read_sectors(sector, &mut buf[..sectors * SECTOR_SIZE]);
                let pending = BlockRequest {
                    req_type,
                    buf,
                    write_size: request.write_size,
                    queue_idx: request.queue_idx,
                    head: request.head,
                };
                self.submit(io, pending, submission);
            }
            VIRTIO_BLK_T_OUT => {
                if request.write_size == 0 || request.read_size < REQUEST_HEADER_SIZE {
                    return RecvStatus::Done;
                }
                let len = (request.read_size - REQUEST_HEADER_SIZE) as usize;
                let mut buf = vec![0u8; len];
                if io
                    .read_from_chain(request.queue_idx, request.head, REQUEST_HEADER_SIZE, &mut buf)
                    .is_err()
                {
                    return RecvStatus::Done;
                }
                let sectors = len / SECTOR_SIZE;
                let submission = self
                    .backend
                    .write_sectors(sector, &buf[..sectors * SECTOR_SIZE]);
                let pending = BlockRequest {
                    req_type,
                    buf: Vec::new(),
                    write_size: request.write_size,
                    queue_idx: request.queue_idx,
                    head: request.head,
                };
                self.submit(io, pending, submission);
            }
            other => {
                tracing::trace!(other, "unsupported block request type");
            }
        }
        RecvStatus::Done
    }

    fn reset(&mut self) {
        self.inflight = None;
    }
}

impl<B: BlockBackend> VirtioMmio<VirtioBlk<B>> {
    /// Completion entry point for asynchronous backends. Publishes the
    /// response for the in-flight request and resumes draining the queue.
    /// Safe to call after a device reset: a completion with no request in
    /// flight has no guest-visible effect.
    pub fn complete_request<M: GuestMemory>(&mut self, mem: &mut M, result: DiskResult<()>) {
        let resume = self.with_queue_io(mem, |device, io| device.complete(io, result));
        if let Some(queue_idx) = resume {
            self.queue_notify(mem, queue_idx);
        }
    }
}
