use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

/// Host terminal byte I/O consumed by the UART.
///
/// `write_byte` may block on the host terminal; `read_byte` must not block,
/// because it is polled from the simulator tick.
pub trait Console {
    fn write_byte(&mut self, byte: u8);
    fn read_byte(&mut self) -> Option<u8>;
}

/// Console over the process stdin/stdout.
///
/// stdin is drained by a background reader thread feeding a channel, so the
/// tick-side `read_byte` stays non-blocking. The thread exits when stdin
/// reaches EOF.
pub struct StdioConsole {
    rx: Receiver<u8>,
}

impl StdioConsole {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let stdin = std::io::stdin();
            for byte in stdin.lock().bytes() {
                let Ok(byte) = byte else { break };
                if tx.send(byte).is_err() {
                    break;
                }
            }
        });
        Self { rx }
    }
}

impl Default for StdioConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for StdioConsole {
    fn write_byte(&mut self, byte: u8) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    }

    fn read_byte(&mut self) -> Option<u8> {
        match self.rx.try_recv() {
            Ok(byte) => Some(byte),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
