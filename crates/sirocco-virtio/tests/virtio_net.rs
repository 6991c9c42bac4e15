use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use memory::{DenseMemory, GuestMemory};
use pretty_assertions::assert_eq;
use sirocco_devices::{DeviceArgs, IrqLine};
use sirocco_virtio::mmio::{
    VIRTIO_MMIO_CONFIG, VIRTIO_MMIO_DEVICE_FEATURES, VIRTIO_MMIO_DEVICE_ID,
    VIRTIO_MMIO_QUEUE_AVAIL_LOW, VIRTIO_MMIO_QUEUE_DESC_LOW, VIRTIO_MMIO_QUEUE_NOTIFY,
    VIRTIO_MMIO_QUEUE_NUM, VIRTIO_MMIO_QUEUE_READY, VIRTIO_MMIO_QUEUE_SEL,
    VIRTIO_MMIO_QUEUE_USED_LOW,
};
use sirocco_virtio::queue::{VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};
use sirocco_virtio::{
    DeviceInitError, HostForward, HostStack, NetBackend, UserNetError, VirtioMmio, VirtioNet,
    USER_NET_MAC,
};

const NET_HEADER_SIZE: usize = 12;

// Per-queue ring layout: queue 0 at RX_*, queue 1 at TX_*.
const RX_DESC: u64 = 0x1000;
const RX_AVAIL: u64 = 0x2000;
const RX_USED: u64 = 0x3000;
const TX_DESC: u64 = 0x1100;
const TX_AVAIL: u64 = 0x2100;
const TX_USED: u64 = 0x3100;

#[derive(Clone, Default)]
struct TestIrq(Rc<Cell<bool>>);

impl IrqLine for TestIrq {
    fn set_level(&self, level: bool) {
        self.0.set(level);
    }
}

/// Loopback-style test backend with externally scriptable RX frames.
#[derive(Clone, Default)]
struct ScriptedBackend {
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
    pending_rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
    polls: Rc<Cell<u32>>,
}

impl NetBackend for ScriptedBackend {
    fn transmit(&mut self, frame: &[u8]) {
        self.sent.borrow_mut().push(frame.to_vec());
    }
    fn recv_frame(&mut self) -> Option<Vec<u8>> {
        self.pending_rx.borrow_mut().pop_front()
    }
    fn poll(&mut self) {
        self.polls.set(self.polls.get() + 1);
    }
}

fn write_desc(mem: &mut DenseMemory, table: u64, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
    let base = table + u64::from(index) * 16;
    mem.write_u64(base, addr).unwrap();
    mem.write_u32(base + 8, len).unwrap();
    mem.write_u16(base + 12, flags).unwrap();
    mem.write_u16(base + 14, next).unwrap();
}

fn push_avail(mem: &mut DenseMemory, avail: u64, head: u16) {
    let idx = mem.read_u16(avail + 2).unwrap();
    mem.write_u16(avail + 4 + u64::from(idx % 8) * 2, head).unwrap();
    mem.write_u16(avail + 2, idx.wrapping_add(1)).unwrap();
}

fn setup_queue(
    dev: &mut VirtioMmio<VirtioNet<ScriptedBackend>>,
    mem: &mut DenseMemory,
    queue: u32,
    desc: u64,
    avail: u64,
    used: u64,
) {
    dev.write(mem, VIRTIO_MMIO_QUEUE_SEL, queue, 4);
    dev.write(mem, VIRTIO_MMIO_QUEUE_NUM, 8, 4);
    dev.write(mem, VIRTIO_MMIO_QUEUE_DESC_LOW, desc as u32, 4);
    dev.write(mem, VIRTIO_MMIO_QUEUE_AVAIL_LOW, avail as u32, 4);
    dev.write(mem, VIRTIO_MMIO_QUEUE_USED_LOW, used as u32, 4);
    dev.write(mem, VIRTIO_MMIO_QUEUE_READY, 1, 4);
}

fn setup() -> (
    VirtioMmio<VirtioNet<ScriptedBackend>>,
    DenseMemory,
    ScriptedBackend,
) {
    let backend = ScriptedBackend::default();
    let dev = VirtioMmio::new(
        VirtioNet::new(backend.clone(), USER_NET_MAC),
        Box::new(TestIrq::default()),
    );
    let mem = DenseMemory::new(0x10000).unwrap();
    (dev, mem, backend)
}

#[test]
fn identity_and_config_space() {
    let (dev, _mem, _backend) = setup();
    assert_eq!(dev.read(VIRTIO_MMIO_DEVICE_ID, 4), 1);
    // VIRTIO_NET_F_MAC
    assert_eq!(dev.read(VIRTIO_MMIO_DEVICE_FEATURES, 4), 1 << 5);
    // MAC bytes followed by the status word.
    assert_eq!(dev.read(VIRTIO_MMIO_CONFIG, 1), 0x02);
    assert_eq!(dev.read(VIRTIO_MMIO_CONFIG + 5, 1), 0x01);
    assert_eq!(dev.read(VIRTIO_MMIO_CONFIG + 6, 2), 0);
}

#[test]
fn tx_chain_reaches_the_backend() {
    let (mut dev, mut mem, backend) = setup();
    setup_queue(&mut dev, &mut mem, 1, TX_DESC, TX_AVAIL, TX_USED);

    let frame = b"\x02\x00\x00\x00\x00\x01destination--payload";
    // Header descriptor and frame descriptor, both read-only.
    mem.write_from(0x4000, &[0u8; NET_HEADER_SIZE]).unwrap();
    mem.write_from(0x5000, frame).unwrap();
    write_desc(
        &mut mem,
        TX_DESC,
        0,
        0x4000,
        NET_HEADER_SIZE as u32,
        VRING_DESC_F_NEXT,
        1,
    );
    write_desc(&mut mem, TX_DESC, 1, 0x5000, frame.len() as u32, 0, 0);
    push_avail(&mut mem, TX_AVAIL, 0);

    dev.write(&mut mem, VIRTIO_MMIO_QUEUE_NOTIFY, 1, 4);

    assert_eq!(&*backend.sent.borrow(), &[frame.to_vec()]);
    // TX chains are published with used length 0.
    assert_eq!(mem.read_u16(TX_USED + 2).unwrap(), 1);
    assert_eq!(mem.read_u32(TX_USED + 4).unwrap(), 0);
    assert_eq!(mem.read_u32(TX_USED + 8).unwrap(), 0);
}

#[test]
fn tx_chain_shorter_than_the_header_is_dropped() {
    let (mut dev, mut mem, backend) = setup();
    setup_queue(&mut dev, &mut mem, 1, TX_DESC, TX_AVAIL, TX_USED);

    write_desc(&mut mem, TX_DESC, 0, 0x4000, 4, 0, 0);
    push_avail(&mut mem, TX_AVAIL, 0);
    dev.write(&mut mem, VIRTIO_MMIO_QUEUE_NOTIFY, 1, 4);

    assert!(backend.sent.borrow().is_empty());
    assert_eq!(mem.read_u16(TX_USED + 2).unwrap(), 0);
    assert_eq!(dev.queue_state(1).last_avail_idx, 1);
}

#[test]
fn rx_frame_is_delivered_into_a_posted_buffer() {
    let (mut dev, mut mem, backend) = setup();
    setup_queue(&mut dev, &mut mem, 0, RX_DESC, RX_AVAIL, RX_USED);

    // One write-only buffer big enough for header + frame.
    write_desc(&mut mem, RX_DESC, 0, 0x7000, 1526, VRING_DESC_F_WRITE, 0);
    push_avail(&mut mem, RX_AVAIL, 0);

    let frame = vec![0xaau8; 60];
    backend.pending_rx.borrow_mut().push_back(frame.clone());

    dev.poll(&mut mem);

    assert_eq!(backend.polls.get(), 1);
    // Zeroed header except num_buffers = 1 at offset 10.
    let mut header = [0u8; NET_HEADER_SIZE];
    mem.read_into(0x7000, &mut header).unwrap();
    assert_eq!(&header[..10], &[0u8; 10]);
    assert_eq!(u16::from_le_bytes([header[10], header[11]]), 1);

    let mut delivered = vec![0u8; frame.len()];
    mem.read_into(0x7000 + NET_HEADER_SIZE as u64, &mut delivered)
        .unwrap();
    assert_eq!(delivered, frame);

    assert_eq!(mem.read_u16(RX_USED + 2).unwrap(), 1);
    assert_eq!(mem.read_u32(RX_USED + 4).unwrap(), 0);
    assert_eq!(
        mem.read_u32(RX_USED + 8).unwrap(),
        (NET_HEADER_SIZE + frame.len()) as u32
    );
    assert_eq!(dev.queue_state(0).last_avail_idx, 1);
}

#[test]
fn rx_backpressure_keeps_frames_queued_until_buffers_are_posted() {
    let (mut dev, mut mem, backend) = setup();
    setup_queue(&mut dev, &mut mem, 0, RX_DESC, RX_AVAIL, RX_USED);

    backend.pending_rx.borrow_mut().push_back(vec![0x55; 64]);

    // No buffer posted: the frame stays with the backend.
    assert!(!dev.can_write_packet(&mem));
    dev.poll(&mut mem);
    assert_eq!(backend.pending_rx.borrow().len(), 1);
    assert_eq!(mem.read_u16(RX_USED + 2).unwrap(), 0);

    // Posting a buffer lets the next poll deliver it.
    write_desc(&mut mem, RX_DESC, 0, 0x7000, 1526, VRING_DESC_F_WRITE, 0);
    push_avail(&mut mem, RX_AVAIL, 0);
    assert!(dev.can_write_packet(&mem));
    dev.poll(&mut mem);
    assert!(backend.pending_rx.borrow().is_empty());
    assert_eq!(mem.read_u16(RX_USED + 2).unwrap(), 1);
}

#[test]
fn oversize_rx_frame_is_dropped_and_the_buffer_stays_posted() {
    let (mut dev, mut mem, backend) = setup();
    setup_queue(&mut dev, &mut mem, 0, RX_DESC, RX_AVAIL, RX_USED);

    write_desc(&mut mem, RX_DESC, 0, 0x7000, 32, VRING_DESC_F_WRITE, 0);
    push_avail(&mut mem, RX_AVAIL, 0);

    backend.pending_rx.borrow_mut().push_back(vec![0x66; 100]);
    dev.poll(&mut mem);

    assert!(backend.pending_rx.borrow().is_empty());
    assert_eq!(mem.read_u16(RX_USED + 2).unwrap(), 0);
    assert_eq!(dev.queue_state(0).last_avail_idx, 0);
}

/// Minimal host stack for construction tests.
#[derive(Default)]
struct StubStack {
    forwards: Vec<HostForward>,
}

impl HostStack for StubStack {
    fn input(&mut self, _frame: &[u8]) {}
    fn output(&mut self) -> Option<Vec<u8>> {
        None
    }
    fn add_host_forward(&mut self, forward: &HostForward) -> Result<(), UserNetError> {
        self.forwards.push(forward.clone());
        Ok(())
    }
}

#[test]
fn construction_requires_driver_and_hostfwd() {
    let err = VirtioNet::from_args(&DeviceArgs::parse(["hostfwd=tcp::1-:1"]), Box::new(StubStack::default()))
        .unwrap_err();
    assert!(matches!(err, DeviceInitError::Args(_)));

    let err = VirtioNet::from_args(
        &DeviceArgs::parse(["driver=tap", "hostfwd=tcp::1-:1"]),
        Box::new(StubStack::default()),
    )
    .unwrap_err();
    assert!(matches!(err, DeviceInitError::UnknownNetDriver(_)));

    let err = VirtioNet::from_args(&DeviceArgs::parse(["driver=user"]), Box::new(StubStack::default()))
        .unwrap_err();
    assert!(matches!(err, DeviceInitError::Args(_)));
}

/// All cases that actually open a user backend live in one test: the
/// single-instance guard is process-wide state.
#[test]
fn user_backend_is_a_process_singleton() {
    let net = VirtioNet::from_args(
        &DeviceArgs::parse(["driver=user", "hostfwd=tcp::5555-:22"]),
        Box::new(StubStack::default()),
    )
    .unwrap();
    assert_eq!(net.mac(), USER_NET_MAC);

    // A second open is rejected while the first is alive.
    let err = VirtioNet::from_args(
        &DeviceArgs::parse(["driver=user", "hostfwd=tcp::5556-:22"]),
        Box::new(StubStack::default()),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        DeviceInitError::Net(UserNetError::AlreadyOpen)
    ));

    // Tearing down the backend releases the guard.
    drop(net);
    let _net = VirtioNet::from_args(
        &DeviceArgs::parse(["driver=user", "hostfwd=tcp::5557-:22"]),
        Box::new(StubStack::default()),
    )
    .unwrap();

    // A bad hostfwd spec fails construction and also releases the guard.
    drop(_net);
    let err = VirtioNet::from_args(
        &DeviceArgs::parse(["driver=user", "hostfwd=bogus"]),
        Box::new(StubStack::default()),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        DeviceInitError::Net(UserNetError::InvalidHostForward(_))
    ));
    let _net = VirtioNet::from_args(
        &DeviceArgs::parse(["driver=user", "hostfwd=udp::69-:69"]),
        Box::new(StubStack::default()),
    )
    .unwrap();
}
