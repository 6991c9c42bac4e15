//! VirtIO MMIO transport (version 2) register file.
//!
//! One 4 KiB window per device. Control registers (`< 0x100`) answer only
//! naturally-aligned 32-bit accesses; other sizes read as 0 and writes are
//! ignored. The config window (`>= 0x100`) honours 1/2/4-byte accesses.

use memory::GuestMemory;
use sirocco_devices::IrqLine;

use crate::devices::{ChainRequest, RecvStatus, VirtioDevice};
use crate::queue::{QueueIo, QueueState};
use crate::{INT_STATUS_CONFIG_CHANGE, MAX_CONFIG_SPACE_SIZE, MAX_QUEUE, MAX_QUEUE_NUM};

pub const VIRTIO_MMIO_MAGIC_VALUE: u64 = 0x000;
pub const VIRTIO_MMIO_VERSION: u64 = 0x004;
pub const VIRTIO_MMIO_DEVICE_ID: u64 = 0x008;
pub const VIRTIO_MMIO_VENDOR_ID: u64 = 0x00c;
pub const VIRTIO_MMIO_DEVICE_FEATURES: u64 = 0x010;
pub const VIRTIO_MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const VIRTIO_MMIO_DRIVER_FEATURES: u64 = 0x020;
pub const VIRTIO_MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const VIRTIO_MMIO_QUEUE_SEL: u64 = 0x030;
pub const VIRTIO_MMIO_QUEUE_NUM_MAX: u64 = 0x034;
pub const VIRTIO_MMIO_QUEUE_NUM: u64 = 0x038;
pub const VIRTIO_MMIO_QUEUE_READY: u64 = 0x044;
pub const VIRTIO_MMIO_QUEUE_NOTIFY: u64 = 0x050;
pub const VIRTIO_MMIO_INTERRUPT_STATUS: u64 = 0x060;
pub const VIRTIO_MMIO_INTERRUPT_ACK: u64 = 0x064;
pub const VIRTIO_MMIO_STATUS: u64 = 0x070;
pub const VIRTIO_MMIO_QUEUE_DESC_LOW: u64 = 0x080;
pub const VIRTIO_MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
pub const VIRTIO_MMIO_QUEUE_AVAIL_LOW: u64 = 0x090;
pub const VIRTIO_MMIO_QUEUE_AVAIL_HIGH: u64 = 0x094;
pub const VIRTIO_MMIO_QUEUE_USED_LOW: u64 = 0x0a0;
pub const VIRTIO_MMIO_QUEUE_USED_HIGH: u64 = 0x0a4;
pub const VIRTIO_MMIO_CONFIG_GENERATION: u64 = 0x0fc;
pub const VIRTIO_MMIO_CONFIG: u64 = 0x100;

/// "virt", little-endian.
const VIRTIO_MAGIC: u32 = 0x7472_6976;
const VIRTIO_VERSION: u32 = 2;
const VIRTIO_VENDOR_ID: u32 = 0xffff;

fn set_low32(addr: &mut u64, value: u32) {
    *addr = (*addr & !0xffff_ffff) | u64::from(value);
}

fn set_high32(addr: &mut u64, value: u32) {
    *addr = (*addr & 0xffff_ffff) | (u64::from(value) << 32);
}

/// A VirtIO device behind an MMIO register window.
pub struct VirtioMmio<D> {
    device: D,
    irq: Box<dyn IrqLine>,
    device_id: u32,
    vendor_id: u32,
    device_features: u32,
    device_features_sel: u32,
    queue_sel: u32,
    status: u32,
    int_status: u32,
    config_space: [u8; MAX_CONFIG_SPACE_SIZE],
    config_space_size: usize,
    queues: [QueueState; MAX_QUEUE],
}

impl<D: VirtioDevice> VirtioMmio<D> {
    pub fn new(device: D, irq: Box<dyn IrqLine>) -> Self {
        let init = device.config_space();
        let config_space_size = init.len().min(MAX_CONFIG_SPACE_SIZE);
        let mut config_space = [0u8; MAX_CONFIG_SPACE_SIZE];
        config_space[..config_space_size].copy_from_slice(&init[..config_space_size]);

        Self {
            device_id: device.device_id(),
            vendor_id: VIRTIO_VENDOR_ID,
            device_features: device.device_features(),
            device_features_sel: 0,
            queue_sel: 0,
            status: 0,
            int_status: 0,
            config_space,
            config_space_size,
            queues: std::array::from_fn(|_| QueueState::default()),
            irq,
            device,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn queue_state(&self, queue_idx: usize) -> &QueueState {
        &self.queues[queue_idx]
    }

    pub fn set_manual_recv(&mut self, queue_idx: usize, manual_recv: bool) {
        self.queues[queue_idx].manual_recv = manual_recv;
    }

    pub fn int_status(&self) -> u32 {
        self.int_status
    }

    /// Handles a bus load from the device window. 8-byte accesses are split
    /// into two 32-bit register reads.
    pub fn load(&self, offset: u64, dst: &mut [u8]) -> bool {
        match dst.len() {
            1 | 2 | 4 => {
                let value = self.read(offset, dst.len());
                dst.copy_from_slice(&value.to_le_bytes()[..dst.len()]);
                true
            }
            8 => {
                let low = u64::from(self.read(offset, 4));
                let high = u64::from(self.read(offset + 4, 4));
                dst.copy_from_slice(&(low | (high << 32)).to_le_bytes());
                true
            }
            _ => false,
        }
    }

    /// Handles a bus store to the device window.
    pub fn store<M: GuestMemory>(&mut self, mem: &mut M, offset: u64, src: &[u8]) -> bool {
        match src.len() {
            1 | 2 | 4 => {
                let mut bytes = [0u8; 4];
                bytes[..src.len()].copy_from_slice(src);
                self.write(mem, offset, u32::from_le_bytes(bytes), src.len());
                true
            }
            8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(src);
                let value = u64::from_le_bytes(bytes);
                self.write(mem, offset, value as u32, 4);
                self.write(mem, offset + 4, (value >> 32) as u32, 4);
                true
            }
            _ => false,
        }
    }

    /// Register read of 1, 2 or 4 bytes.
    pub fn read(&self, offset: u64, size: usize) -> u32 {
        if offset >= VIRTIO_MMIO_CONFIG {
            return self.config_read(offset - VIRTIO_MMIO_CONFIG, size);
        }
        if size != 4 {
            return 0;
        }
        let selected = &self.queues[self.queue_sel as usize];
        let value = match offset {
            VIRTIO_MMIO_MAGIC_VALUE => VIRTIO_MAGIC,
            VIRTIO_MMIO_VERSION => VIRTIO_VERSION,
            VIRTIO_MMIO_DEVICE_ID => self.device_id,
            VIRTIO_MMIO_VENDOR_ID => self.vendor_id,
            VIRTIO_MMIO_DEVICE_FEATURES => match self.device_features_sel {
                0 => self.device_features,
                1 => 1, // VIRTIO_F_VERSION_1
                _ => 0,
            },
            VIRTIO_MMIO_DEVICE_FEATURES_SEL => self.device_features_sel,
            VIRTIO_MMIO_QUEUE_SEL => self.queue_sel,
            VIRTIO_MMIO_QUEUE_NUM_MAX => MAX_QUEUE_NUM,
            VIRTIO_MMIO_QUEUE_NUM => selected.num,
            VIRTIO_MMIO_QUEUE_READY => selected.ready,
            VIRTIO_MMIO_QUEUE_DESC_LOW => selected.desc_addr as u32,
            VIRTIO_MMIO_QUEUE_DESC_HIGH => (selected.desc_addr >> 32) as u32,
            VIRTIO_MMIO_QUEUE_AVAIL_LOW => selected.avail_addr as u32,
            VIRTIO_MMIO_QUEUE_AVAIL_HIGH => (selected.avail_addr >> 32) as u32,
            VIRTIO_MMIO_QUEUE_USED_LOW => selected.used_addr as u32,
            VIRTIO_MMIO_QUEUE_USED_HIGH => (selected.used_addr >> 32) as u32,
            VIRTIO_MMIO_INTERRUPT_STATUS => self.int_status,
            VIRTIO_MMIO_STATUS => self.status,
            VIRTIO_MMIO_CONFIG_GENERATION => 0,
            _ => 0,
        };
        tracing::trace!(offset, value, "mmio read");
        value
    }

    /// Register write of 1, 2 or 4 bytes.
    pub fn write<M: GuestMemory>(&mut self, mem: &mut M, offset: u64, value: u32, size: usize) {
        tracing::trace!(offset, value, size, "mmio write");
        if offset >= VIRTIO_MMIO_CONFIG {
            self.config_write(offset - VIRTIO_MMIO_CONFIG, value, size);
            return;
        }
        if size != 4 {
            return;
        }
        match offset {
            VIRTIO_MMIO_DEVICE_FEATURES_SEL => self.device_features_sel = value,
            VIRTIO_MMIO_QUEUE_SEL => {
                if (value as usize) < MAX_QUEUE {
                    self.queue_sel = value;
                }
            }
            VIRTIO_MMIO_QUEUE_NUM => {
                if value.is_power_of_two() {
                    self.selected_mut().num = value;
                }
            }
            VIRTIO_MMIO_QUEUE_DESC_LOW => set_low32(&mut self.selected_mut().desc_addr, value),
            VIRTIO_MMIO_QUEUE_DESC_HIGH => set_high32(&mut self.selected_mut().desc_addr, value),
            VIRTIO_MMIO_QUEUE_AVAIL_LOW => set_low32(&mut self.selected_mut().avail_addr, value),
            VIRTIO_MMIO_QUEUE_AVAIL_HIGH => set_high32(&mut self.selected_mut().avail_addr, value),
            VIRTIO_MMIO_QUEUE_USED_LOW => set_low32(&mut self.selected_mut().used_addr, value),
            VIRTIO_MMIO_QUEUE_USED_HIGH => set_high32(&mut self.selected_mut().used_addr, value),
            VIRTIO_MMIO_QUEUE_READY => self.selected_mut().ready = value & 1,
            VIRTIO_MMIO_QUEUE_NOTIFY => {
                if (value as usize) < MAX_QUEUE {
                    self.queue_notify(mem, value as usize);
                }
            }
            VIRTIO_MMIO_STATUS => {
                self.status = value;
                if value == 0 {
                    self.irq.set_level(false);
                    self.reset();
                }
            }
            VIRTIO_MMIO_INTERRUPT_ACK => {
                self.int_status &= !value;
                if self.int_status == 0 {
                    self.irq.set_level(false);
                }
            }
            _ => {}
        }
    }

    /// Drains the queue's available ring, handing each well-formed chain to
    /// the front-end. A backpressure return stops the drain with the current
    /// chain still pending, so a later notify (or the backend completion
    /// path) redelivers it. Malformed chains are consumed without being
    /// published.
    pub fn queue_notify<M: GuestMemory>(&mut self, mem: &mut M, queue_idx: usize) {
        if queue_idx >= MAX_QUEUE || self.queues[queue_idx].manual_recv {
            return;
        }
        let avail_addr = self.queues[queue_idx].avail_addr;
        let Ok(avail_idx) = mem.read_u16(avail_addr.wrapping_add(2)) else {
            return;
        };

        while self.queues[queue_idx].last_avail_idx != avail_idx {
            let qs = &self.queues[queue_idx];
            let slot = avail_addr
                .wrapping_add(4 + u64::from(qs.last_avail_idx & (qs.num as u16).wrapping_sub(1)) * 2);
            let Ok(head) = mem.read_u16(slot) else {
                return;
            };

            match qs.chain_rw_size(mem, head) {
                Ok((read_size, write_size)) => {
                    tracing::trace!(queue_idx, head, read_size, write_size, "queue notify");
                    let request = ChainRequest {
                        queue_idx,
                        head,
                        read_size,
                        write_size,
                    };
                    let status = self.with_queue_io(mem, |device, io| device.recv(io, request));
                    if status == RecvStatus::Backpressure {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(queue_idx, head, %err, "dropping malformed descriptor chain");
                }
            }

            let qs = &mut self.queues[queue_idx];
            qs.last_avail_idx = qs.last_avail_idx.wrapping_add(1);
        }
    }

    /// Raises the config-change interrupt.
    pub fn config_change_notify(&mut self) {
        self.int_status |= INT_STATUS_CONFIG_CHANGE;
        self.irq.set_level(true);
    }

    pub(crate) fn with_queue_io<M: GuestMemory, R>(
        &mut self,
        mem: &mut M,
        f: impl FnOnce(&mut D, &mut QueueIo<'_, M>) -> R,
    ) -> R {
        let VirtioMmio {
            device,
            irq,
            int_status,
            queues,
            ..
        } = self;
        let mut io = QueueIo {
            mem,
            queues,
            int_status,
            irq: irq.as_ref(),
        };
        f(device, &mut io)
    }

    fn selected_mut(&mut self) -> &mut QueueState {
        &mut self.queues[self.queue_sel as usize]
    }

    fn reset(&mut self) {
        self.status = 0;
        self.queue_sel = 0;
        self.device_features_sel = 0;
        self.int_status = 0;
        for qs in &mut self.queues {
            qs.ready = 0;
            qs.num = MAX_QUEUE_NUM;
            qs.desc_addr = 0;
            qs.avail_addr = 0;
            qs.used_addr = 0;
            qs.last_avail_idx = 0;
        }
        self.device.reset();
    }

    fn config_read(&self, offset: u64, size: usize) -> u32 {
        let Ok(offset) = usize::try_from(offset) else {
            return 0;
        };
        if !matches!(size, 1 | 2 | 4) {
            return 0;
        }
        match offset.checked_add(size) {
            Some(end) if end <= self.config_space_size => {
                let mut bytes = [0u8; 4];
                bytes[..size].copy_from_slice(&self.config_space[offset..end]);
                u32::from_le_bytes(bytes)
            }
            _ => 0,
        }
    }

    fn config_write(&mut self, offset: u64, value: u32, size: usize) {
        let Ok(offset) = usize::try_from(offset) else {
            return;
        };
        if !matches!(size, 1 | 2 | 4) {
            return;
        }
        match offset.checked_add(size) {
            Some(end) if end <= self.config_space_size => {
                self.config_space[offset..end].copy_from_slice(&value.to_le_bytes()[..size]);
                let config = &self.config_space[..self.config_space_size];
                self.device.config_write(config);
            }
            _ => {}
        }
    }
}
