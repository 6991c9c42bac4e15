//! Split-virtqueue engine.
//!
//! The three ring components live in guest memory at driver-chosen physical
//! addresses; the device side keeps only [`QueueState`]. Descriptor chains
//! are classified into a read-only prefix (driver to device) and a
//! write-only suffix (device to driver); the scatter/gather helpers copy at
//! byte offsets within one of the two sub-chains.

use memory::{GuestMemory, GuestMemoryError};
use thiserror::Error;

use crate::{MAX_QUEUE, MAX_QUEUE_NUM};

pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;
pub const VRING_DESC_F_INDIRECT: u16 = 4;

/// Guest copies are chunked so no chunk crosses a page boundary, and issued
/// byte-by-byte through the typed accessor within a chunk.
pub const VIRTIO_PAGE_SIZE: u64 = 4096;

const DESC_SIZE: u64 = 16;

/// A descriptor-chain walk or copy failed. Either way the chain is treated
/// as malformed: silently dropped by the engine, no used-ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("descriptor chain touches faulting guest memory: {0}")]
    Memory(#[from] GuestMemoryError),

    #[error("malformed descriptor chain")]
    Malformed,
}

/// One descriptor-table entry, as fetched from guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    fn is_write(&self) -> bool {
        self.flags & VRING_DESC_F_WRITE != 0
    }

    fn has_next(&self) -> bool {
        self.flags & VRING_DESC_F_NEXT != 0
    }
}

/// Device-side state of one virtqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueState {
    pub ready: u32,
    /// Ring size; a positive power of two. The driver reads the ceiling from
    /// QUEUE_NUM_MAX and is trusted to stay at or below it.
    pub num: u32,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    /// Next available-ring slot the device will consume.
    pub last_avail_idx: u16,
    /// When set, QUEUE_NOTIFY does not drive `device_recv`; the device pulls
    /// chains at its own pace.
    pub manual_recv: bool,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            ready: 0,
            num: MAX_QUEUE_NUM,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            last_avail_idx: 0,
            manual_recv: false,
        }
    }
}

impl QueueState {
    fn ring_mask(&self) -> u16 {
        (self.num as u16).wrapping_sub(1)
    }

    fn desc<M: GuestMemory>(&self, mem: &M, idx: u16) -> Result<Descriptor, ChainError> {
        let base = self.desc_addr.wrapping_add(u64::from(idx) * DESC_SIZE);
        Ok(Descriptor {
            addr: mem.read_u64(base)?,
            len: mem.read_u32(base.wrapping_add(8))?,
            flags: mem.read_u16(base.wrapping_add(12))?,
            next: mem.read_u16(base.wrapping_add(14))?,
        })
    }

    /// Classifies the chain at `head` into `(read_size, write_size)`.
    ///
    /// The read-only prefix is accumulated until the first WRITE descriptor;
    /// from there every descriptor must be WRITE. A read descriptor after a
    /// write one, an INDIRECT flag anywhere, or a walk longer than the ring
    /// all classify as malformed.
    pub fn chain_rw_size<M: GuestMemory>(
        &self,
        mem: &M,
        head: u16,
    ) -> Result<(u32, u32), ChainError> {
        let mut read_size: u32 = 0;
        let mut write_size: u32 = 0;
        let mut steps: u32 = 0;
        let mut desc = self.desc(mem, head)?;

        loop {
            if desc.flags & VRING_DESC_F_INDIRECT != 0 {
                return Err(ChainError::Malformed);
            }
            if desc.is_write() {
                break;
            }
            read_size = read_size
                .checked_add(desc.len)
                .ok_or(ChainError::Malformed)?;
            if !desc.has_next() {
                return Ok((read_size, write_size));
            }
            steps += 1;
            if steps > self.num {
                return Err(ChainError::Malformed);
            }
            desc = self.desc(mem, desc.next)?;
        }

        loop {
            if desc.flags & VRING_DESC_F_INDIRECT != 0 || !desc.is_write() {
                return Err(ChainError::Malformed);
            }
            write_size = write_size
                .checked_add(desc.len)
                .ok_or(ChainError::Malformed)?;
            if !desc.has_next() {
                break;
            }
            steps += 1;
            if steps > self.num {
                return Err(ChainError::Malformed);
            }
            desc = self.desc(mem, desc.next)?;
        }

        Ok((read_size, write_size))
    }

    /// Seeks to the descriptor containing byte `offset` of the requested
    /// sub-chain, returning it together with the in-descriptor offset.
    fn seek<M: GuestMemory>(
        &self,
        mem: &M,
        head: u16,
        mut offset: u32,
        write_dir: bool,
    ) -> Result<(Descriptor, u32), ChainError> {
        let mut desc = self.desc(mem, head)?;
        let mut steps: u32 = 0;

        if write_dir {
            // Skip the read-only prefix.
            while !desc.is_write() {
                if !desc.has_next() {
                    return Err(ChainError::Malformed);
                }
                steps += 1;
                if steps > self.num {
                    return Err(ChainError::Malformed);
                }
                desc = self.desc(mem, desc.next)?;
            }
        }

        loop {
            if desc.is_write() != write_dir {
                return Err(ChainError::Malformed);
            }
            if offset < desc.len {
                return Ok((desc, offset));
            }
            if !desc.has_next() {
                return Err(ChainError::Malformed);
            }
            offset -= desc.len;
            steps += 1;
            if steps > self.num {
                return Err(ChainError::Malformed);
            }
            desc = self.desc(mem, desc.next)?;
        }
    }

    /// Copies `dst.len()` bytes out of the chain's read-only sub-chain,
    /// starting `offset` bytes in.
    pub fn copy_from_chain<M: GuestMemory>(
        &self,
        mem: &M,
        head: u16,
        offset: u32,
        dst: &mut [u8],
    ) -> Result<(), ChainError> {
        if dst.is_empty() {
            return Ok(());
        }
        let (mut desc, mut offset) = self.seek(mem, head, offset, false)?;
        let mut pos = 0usize;
        let mut steps: u32 = 0;
        loop {
            let chunk = usize::min(dst.len() - pos, (desc.len - offset) as usize);
            guest_read(
                mem,
                desc.addr.wrapping_add(u64::from(offset)),
                &mut dst[pos..pos + chunk],
            )?;
            pos += chunk;
            if pos == dst.len() {
                return Ok(());
            }
            offset += chunk as u32;
            if offset == desc.len {
                if !desc.has_next() {
                    return Err(ChainError::Malformed);
                }
                steps += 1;
                if steps > self.num {
                    return Err(ChainError::Malformed);
                }
                desc = self.desc(mem, desc.next)?;
                if desc.is_write() {
                    return Err(ChainError::Malformed);
                }
                offset = 0;
            }
        }
    }

    /// Copies `src` into the chain's write-only sub-chain, starting `offset`
    /// bytes in.
    pub fn copy_to_chain<M: GuestMemory>(
        &self,
        mem: &mut M,
        head: u16,
        offset: u32,
        src: &[u8],
    ) -> Result<(), ChainError> {
        if src.is_empty() {
            return Ok(());
        }
        let (mut desc, mut offset) = self.seek(mem, head, offset, true)?;
        let mut pos = 0usize;
        let mut steps: u32 = 0;
        loop {
            let chunk = usize::min(src.len() - pos, (desc.len - offset) as usize);
            guest_write(
                mem,
                desc.addr.wrapping_add(u64::from(offset)),
                &src[pos..pos + chunk],
            )?;
            pos += chunk;
            if pos == src.len() {
                return Ok(());
            }
            offset += chunk as u32;
            if offset == desc.len {
                if !desc.has_next() {
                    return Err(ChainError::Malformed);
                }
                steps += 1;
                if steps > self.num {
                    return Err(ChainError::Malformed);
                }
                desc = self.desc(mem, desc.next)?;
                if !desc.is_write() {
                    return Err(ChainError::Malformed);
                }
                offset = 0;
            }
        }
    }
}

/// Byte-wise guest read, chunked at page boundaries.
fn guest_read<M: GuestMemory>(
    mem: &M,
    mut addr: u64,
    buf: &mut [u8],
) -> Result<(), GuestMemoryError> {
    let mut pos = 0usize;
    while pos < buf.len() {
        let in_page = (VIRTIO_PAGE_SIZE - (addr & (VIRTIO_PAGE_SIZE - 1))) as usize;
        let chunk = usize::min(buf.len() - pos, in_page);
        for i in 0..chunk {
            buf[pos + i] = mem.read_u8(addr.wrapping_add(i as u64))?;
        }
        addr = addr.wrapping_add(chunk as u64);
        pos += chunk;
    }
    Ok(())
}

/// Byte-wise guest write, chunked at page boundaries.
fn guest_write<M: GuestMemory>(
    mem: &mut M,
    mut addr: u64,
    buf: &[u8],
) -> Result<(), GuestMemoryError> {
    let mut pos = 0usize;
    while pos < buf.len() {
        let in_page = (VIRTIO_PAGE_SIZE - (addr & (VIRTIO_PAGE_SIZE - 1))) as usize;
        let chunk = usize::min(buf.len() - pos, in_page);
        for i in 0..chunk {
            mem.write_u8(addr.wrapping_add(i as u64), buf[pos + i])?;
        }
        addr = addr.wrapping_add(chunk as u64);
        pos += chunk;
    }
    Ok(())
}

/// Engine surface handed to a device front-end while it services a chain.
///
/// Bundles the guest memory accessor with the device's queue state and
/// interrupt plumbing so the front-end can move payload bytes and publish
/// completions.
pub struct QueueIo<'a, M: GuestMemory> {
    pub(crate) mem: &'a mut M,
    pub(crate) queues: &'a mut [QueueState; MAX_QUEUE],
    pub(crate) int_status: &'a mut u32,
    pub(crate) irq: &'a dyn sirocco_devices::IrqLine,
}

impl<'a, M: GuestMemory> QueueIo<'a, M> {
    pub fn queue(&self, queue_idx: usize) -> &QueueState {
        &self.queues[queue_idx]
    }

    pub fn read_from_chain(
        &self,
        queue_idx: usize,
        head: u16,
        offset: u32,
        dst: &mut [u8],
    ) -> Result<(), ChainError> {
        self.queues[queue_idx].copy_from_chain(&*self.mem, head, offset, dst)
    }

    pub fn write_to_chain(
        &mut self,
        queue_idx: usize,
        head: u16,
        offset: u32,
        src: &[u8],
    ) -> Result<(), ChainError> {
        let Self { mem, queues, .. } = self;
        queues[queue_idx].copy_to_chain(&mut **mem, head, offset, src)
    }

    pub fn chain_rw_size(&self, queue_idx: usize, head: u16) -> Result<(u32, u32), ChainError> {
        self.queues[queue_idx].chain_rw_size(&*self.mem, head)
    }

    /// Publishes `head` into the used ring with the given byte count, sets
    /// the used-buffer interrupt bit and asserts the line.
    pub fn consume(&mut self, queue_idx: usize, head: u16, len: u32) -> Result<(), ChainError> {
        let used_addr = self.queues[queue_idx].used_addr;
        let mask = self.queues[queue_idx].ring_mask();

        let idx_addr = used_addr.wrapping_add(2);
        let idx = self.mem.read_u16(idx_addr)?;
        self.mem.write_u16(idx_addr, idx.wrapping_add(1))?;
        let elem_addr = used_addr.wrapping_add(4 + u64::from(idx & mask) * 8);
        self.mem.write_u32(elem_addr, u32::from(head))?;
        self.mem.write_u32(elem_addr.wrapping_add(4), len)?;

        *self.int_status |= crate::INT_STATUS_USED_BUFFER;
        self.irq.set_level(true);
        Ok(())
    }

    /// Driver-published available index of the queue.
    pub fn avail_idx(&self, queue_idx: usize) -> Result<u16, ChainError> {
        let qs = &self.queues[queue_idx];
        Ok(self.mem.read_u16(qs.avail_addr.wrapping_add(2))?)
    }

    /// Chain head in the available-ring slot the device would consume next.
    pub fn next_avail_head(&self, queue_idx: usize) -> Result<u16, ChainError> {
        let qs = &self.queues[queue_idx];
        let slot = qs
            .avail_addr
            .wrapping_add(4 + u64::from(qs.last_avail_idx & qs.ring_mask()) * 2);
        Ok(self.mem.read_u16(slot)?)
    }

    pub fn advance_avail(&mut self, queue_idx: usize) {
        let qs = &mut self.queues[queue_idx];
        qs.last_avail_idx = qs.last_avail_idx.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::DenseMemory;

    const DESC_TABLE: u64 = 0x1000;

    fn write_desc(mem: &mut DenseMemory, index: u16, desc: Descriptor) {
        let base = DESC_TABLE + u64::from(index) * 16;
        mem.write_u64(base, desc.addr).unwrap();
        mem.write_u32(base + 8, desc.len).unwrap();
        mem.write_u16(base + 12, desc.flags).unwrap();
        mem.write_u16(base + 14, desc.next).unwrap();
    }

    fn queue() -> QueueState {
        QueueState {
            num: 8,
            desc_addr: DESC_TABLE,
            ..QueueState::default()
        }
    }

    #[test]
    fn classification_splits_read_and_write() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        write_desc(
            &mut mem,
            0,
            Descriptor {
                addr: 0x4000,
                len: 16,
                flags: VRING_DESC_F_NEXT,
                next: 1,
            },
        );
        write_desc(
            &mut mem,
            1,
            Descriptor {
                addr: 0x5000,
                len: 512,
                flags: VRING_DESC_F_NEXT | VRING_DESC_F_WRITE,
                next: 2,
            },
        );
        write_desc(
            &mut mem,
            2,
            Descriptor {
                addr: 0x6000,
                len: 1,
                flags: VRING_DESC_F_WRITE,
                next: 0,
            },
        );

        assert_eq!(queue().chain_rw_size(&mem, 0).unwrap(), (16, 513));
    }

    #[test]
    fn read_after_write_is_malformed() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        write_desc(
            &mut mem,
            0,
            Descriptor {
                addr: 0x4000,
                len: 4,
                flags: VRING_DESC_F_NEXT | VRING_DESC_F_WRITE,
                next: 1,
            },
        );
        write_desc(
            &mut mem,
            1,
            Descriptor {
                addr: 0x5000,
                len: 4,
                flags: 0,
                next: 0,
            },
        );

        assert_eq!(
            queue().chain_rw_size(&mem, 0),
            Err(ChainError::Malformed)
        );
    }

    #[test]
    fn indirect_descriptors_are_rejected() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        write_desc(
            &mut mem,
            0,
            Descriptor {
                addr: 0x4000,
                len: 32,
                flags: VRING_DESC_F_INDIRECT,
                next: 0,
            },
        );
        assert_eq!(
            queue().chain_rw_size(&mem, 0),
            Err(ChainError::Malformed)
        );
    }

    #[test]
    fn chain_loops_are_bounded() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        write_desc(
            &mut mem,
            0,
            Descriptor {
                addr: 0x4000,
                len: 4,
                flags: VRING_DESC_F_NEXT,
                next: 1,
            },
        );
        write_desc(
            &mut mem,
            1,
            Descriptor {
                addr: 0x5000,
                len: 4,
                flags: VRING_DESC_F_NEXT,
                next: 0, // loops back
            },
        );
        assert_eq!(
            queue().chain_rw_size(&mem, 0),
            Err(ChainError::Malformed)
        );
    }

    #[test]
    fn copy_crosses_descriptor_boundaries_at_offset() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        write_desc(
            &mut mem,
            0,
            Descriptor {
                addr: 0x4000,
                len: 8,
                flags: VRING_DESC_F_NEXT,
                next: 1,
            },
        );
        write_desc(
            &mut mem,
            1,
            Descriptor {
                addr: 0x5000,
                len: 8,
                flags: 0,
                next: 0,
            },
        );
        mem.write_from(0x4000, b"abcdefgh").unwrap();
        mem.write_from(0x5000, b"ijklmnop").unwrap();

        let q = queue();
        let mut out = [0u8; 6];
        q.copy_from_chain(&mem, 0, 5, &mut out).unwrap();
        assert_eq!(&out, b"fghijk");

        // Running off the end of the sub-chain fails the whole copy.
        let mut too_much = [0u8; 17];
        assert_eq!(
            q.copy_from_chain(&mem, 0, 0, &mut too_much),
            Err(ChainError::Malformed)
        );
    }

    #[test]
    fn write_copy_skips_read_prefix() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        write_desc(
            &mut mem,
            0,
            Descriptor {
                addr: 0x4000,
                len: 16,
                flags: VRING_DESC_F_NEXT,
                next: 1,
            },
        );
        write_desc(
            &mut mem,
            1,
            Descriptor {
                addr: 0x5000,
                len: 8,
                flags: VRING_DESC_F_WRITE,
                next: 0,
            },
        );

        let q = queue();
        q.copy_to_chain(&mut mem, 0, 2, b"xyz").unwrap();
        let mut back = [0u8; 8];
        mem.read_into(0x5000, &mut back).unwrap();
        assert_eq!(&back[2..5], b"xyz");
        // The read-only descriptor was not touched.
        let mut head = [0u8; 16];
        mem.read_into(0x4000, &mut head).unwrap();
        assert_eq!(head, [0u8; 16]);
    }

    #[test]
    fn guest_copies_span_page_boundaries() {
        let mut mem = DenseMemory::new(0x4000).unwrap();
        let data: Vec<u8> = (0..64u8).collect();
        guest_write(&mut mem, 0x0ff0, &data).unwrap();
        let mut back = vec![0u8; 64];
        guest_read(&mem, 0x0ff0, &mut back).unwrap();
        assert_eq!(back, data);
    }
}
