use std::collections::VecDeque;

use crate::console::Console;
use crate::irq::IrqLine;

pub const UART_TXFIFO: u64 = 0x00;
pub const UART_RXFIFO: u64 = 0x04;
pub const UART_TXCTRL: u64 = 0x08;
pub const UART_RXCTRL: u64 = 0x0c;
pub const UART_IE: u64 = 0x10;
pub const UART_IP: u64 = 0x14;
pub const UART_DIV: u64 = 0x18;

pub const UART_IP_TXWM: u32 = 1 << 0;
pub const UART_IP_RXWM: u32 = 1 << 1;

/// RXFIFO read with the empty flag set.
const RXFIFO_EMPTY: u32 = 0x8000_0000;

/// Depth of the receive FIFO. The watermark fields are 3 bits, so deeper
/// FIFOs would leave the top watermarks unreachable.
const RX_FIFO_DEPTH: usize = 8;

/// SiFive-compatible UART.
///
/// A 4 KiB register window of 32-bit registers. TX is write-through to the
/// host console; RX is a bounded FIFO refilled from the console by the
/// simulator's [`tick`](Self::tick). The interrupt line level is
/// `(ip & ie) != 0`, recomputed whenever either side can change.
pub struct SifiveUart<C> {
    console: C,
    irq: Box<dyn IrqLine>,
    txctrl: u32,
    rxctrl: u32,
    ie: u32,
    div: u32,
    rx_fifo: VecDeque<u8>,
}

impl<C: Console> SifiveUart<C> {
    pub fn new(console: C, irq: Box<dyn IrqLine>) -> Self {
        Self {
            console,
            irq,
            txctrl: 0,
            rxctrl: 0,
            ie: 0,
            div: 0,
            rx_fifo: VecDeque::new(),
        }
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    /// Handles a bus load from the UART window. Returns `false` for accesses
    /// the device does not decode (the bus treats those as faults).
    pub fn load(&mut self, offset: u64, dst: &mut [u8]) -> bool {
        if offset >= 0x1000 || dst.len() != 4 {
            return false;
        }
        let value = match offset {
            UART_TXFIFO => 0, // never full
            UART_RXFIFO => self.read_rxfifo(),
            UART_TXCTRL => self.txctrl,
            UART_RXCTRL => self.rxctrl,
            UART_IE => self.ie,
            UART_IP => self.ip(),
            UART_DIV => self.div,
            _ => {
                tracing::debug!(offset, "uart: unhandled load");
                return false;
            }
        };
        dst.copy_from_slice(&value.to_le_bytes());
        true
    }

    /// Handles a bus store to the UART window.
    pub fn store(&mut self, offset: u64, src: &[u8]) -> bool {
        if offset >= 0x1000 || src.len() != 4 {
            return false;
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(src);
        let value = u32::from_le_bytes(bytes);
        match offset {
            UART_TXFIFO => self.console.write_byte(value as u8),
            UART_TXCTRL => self.txctrl = value,
            UART_RXCTRL => self.rxctrl = value,
            UART_IE => {
                self.ie = value;
                self.update_interrupts();
            }
            UART_DIV => self.div = value,
            _ => {
                tracing::debug!(offset, "uart: unhandled store");
                return false;
            }
        }
        true
    }

    /// RTC tick: pull at most one byte from the console into the RX FIFO.
    pub fn tick(&mut self) {
        if self.rx_fifo.len() >= RX_FIFO_DEPTH {
            return;
        }
        let Some(byte) = self.console.read_byte() else {
            return;
        };
        self.rx_fifo.push_back(byte);
        self.update_interrupts();
    }

    fn read_rxfifo(&mut self) -> u32 {
        let Some(byte) = self.rx_fifo.pop_front() else {
            return RXFIFO_EMPTY;
        };
        self.update_interrupts();
        u32::from(byte)
    }

    fn ip(&self) -> u32 {
        let txcnt = (self.txctrl >> 16) & 0x7;
        let rxcnt = (self.rxctrl >> 16) & 0x7;
        let mut ip = 0;
        // The TX FIFO is always empty, so any nonzero watermark is satisfied.
        if txcnt > 0 {
            ip |= UART_IP_TXWM;
        }
        if self.rx_fifo.len() as u32 > rxcnt {
            ip |= UART_IP_RXWM;
        }
        ip
    }

    fn update_interrupts(&self) {
        self.irq.set_level((self.ip() & self.ie) != 0);
    }
}
