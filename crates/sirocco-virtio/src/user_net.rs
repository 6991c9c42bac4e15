//! User-mode ("slirp"-style) network backend glue.
//!
//! The actual TCP/IP emulation lives in the host stack the simulator links
//! in; this module pins down the contract around it: the fixed virtual
//! subnet, the guest MAC, the `hostfwd` grammar, and the one-instance-per-
//! process rule.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::devices::net::NetBackend;

/// MAC address handed to the guest by the user-mode backend.
pub const USER_NET_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

static BACKEND_OPEN: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserNetError {
    #[error("only a single user-mode network backend is allowed per process")]
    AlreadyOpen,

    #[error("invalid hostfwd spec `{0}`")]
    InvalidHostForward(String),

    #[error("host forward rejected: {0}")]
    ForwardRejected(String),
}

/// The virtual subnet the backend emulates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNetConfig {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Host-facing gateway address inside the subnet.
    pub host: Ipv4Addr,
    /// First address handed out by the built-in DHCP server.
    pub dhcp_start: Ipv4Addr,
    pub dns: Ipv4Addr,
}

impl Default for UserNetConfig {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(10, 0, 2, 0),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            host: Ipv4Addr::new(10, 0, 2, 2),
            dhcp_start: Ipv4Addr::new(10, 0, 2, 15),
            dns: Ipv4Addr::new(10, 0, 2, 3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardProto {
    Tcp,
    Udp,
}

/// One `hostfwd` rule: `proto:[hostaddr]:hostport-[guestaddr]:guestport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostForward {
    pub proto: ForwardProto,
    pub host_addr: Ipv4Addr,
    pub host_port: u16,
    /// Defaults to the first DHCP address when unspecified.
    pub guest_addr: Option<Ipv4Addr>,
    pub guest_port: u16,
}

impl FromStr for HostForward {
    type Err = UserNetError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let bad = || UserNetError::InvalidHostForward(spec.to_owned());

        let (proto, rest) = spec.split_once(':').ok_or_else(bad)?;
        let proto = match proto {
            "tcp" => ForwardProto::Tcp,
            "udp" => ForwardProto::Udp,
            _ => return Err(bad()),
        };

        let (host_part, guest_part) = rest.split_once('-').ok_or_else(bad)?;

        let (host_addr, host_port) = host_part.rsplit_once(':').ok_or_else(bad)?;
        let host_addr = if host_addr.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            host_addr.parse().map_err(|_| bad())?
        };
        let host_port = host_port.parse().map_err(|_| bad())?;

        let (guest_addr, guest_port) = guest_part.rsplit_once(':').ok_or_else(bad)?;
        let guest_addr = if guest_addr.is_empty() {
            None
        } else {
            Some(guest_addr.parse().map_err(|_| bad())?)
        };
        let guest_port = guest_port.parse().map_err(|_| bad())?;

        Ok(Self {
            proto,
            host_addr,
            host_port,
            guest_addr,
            guest_port,
        })
    }
}

/// The host-side user-mode TCP/IP stack (the simulator links one in).
///
/// `input` feeds a guest frame into the stack; `output` returns the next
/// frame the stack has for the guest, if any. `poll` integrates the stack's
/// host sockets into the simulator's event loop.
pub trait HostStack {
    fn input(&mut self, frame: &[u8]);

    fn output(&mut self) -> Option<Vec<u8>>;

    fn poll(&mut self) {}

    fn add_host_forward(&mut self, forward: &HostForward) -> Result<(), UserNetError>;
}

/// Frame-level backend over a [`HostStack`], configured with the fixed
/// 10.0.2.0/24 subnet. At most one instance may exist per process.
pub struct UserNetBackend {
    config: UserNetConfig,
    stack: Box<dyn HostStack>,
}

impl UserNetBackend {
    pub fn open(
        config: UserNetConfig,
        hostfwd: &str,
        stack: Box<dyn HostStack>,
    ) -> Result<Self, UserNetError> {
        if BACKEND_OPEN
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UserNetError::AlreadyOpen);
        }
        match Self::open_inner(config, hostfwd, stack) {
            Ok(backend) => Ok(backend),
            Err(err) => {
                BACKEND_OPEN.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn open_inner(
        config: UserNetConfig,
        hostfwd: &str,
        mut stack: Box<dyn HostStack>,
    ) -> Result<Self, UserNetError> {
        for spec in hostfwd.split(',').filter(|spec| !spec.is_empty()) {
            let forward: HostForward = spec.parse()?;
            stack.add_host_forward(&forward)?;
        }
        tracing::info!(
            network = %config.network,
            host = %config.host,
            dns = %config.dns,
            "user-mode network backend up"
        );
        Ok(Self { config, stack })
    }

    pub fn config(&self) -> &UserNetConfig {
        &self.config
    }
}

impl Drop for UserNetBackend {
    fn drop(&mut self) {
        BACKEND_OPEN.store(false, Ordering::Release);
    }
}

impl NetBackend for UserNetBackend {
    fn transmit(&mut self, frame: &[u8]) {
        self.stack.input(frame);
    }

    fn recv_frame(&mut self) -> Option<Vec<u8>> {
        self.stack.output()
    }

    fn poll(&mut self) {
        self.stack.poll();
    }
}
