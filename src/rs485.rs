//! RS-485 Line Interface
//!
//! The physical layer underneath MS/TP is a half-duplex EIA-485 bus driven
//! through a UART. This module owns the byte-level plumbing: a [`SerialLine`]
//! trait abstracting the raw port so tests can run over an in-memory bus, a
//! [`TtyLine`] implementation over a real serial device, and [`Rs485Port`]
//! which pumps received octets through a FIFO into the receive state machine
//! and transmits whole frames, holding the line for their duration.
//!
//! Octet pacing matters here: the receive state machine consumes one octet
//! per invocation, so `check_uart_data` surfaces exactly one octet at a time
//! even though the UART is drained in bulk.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, trace};

use crate::port::MstpPort;
use crate::timer::SilenceTimer;

/// Baud rates MS/TP permits on the wire.
pub const BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 76800, 115200];

/// Read timeout for the underlying serial device. Short enough to keep the
/// 5 ms timer granularity the reply timeouts need at 9600 baud.
const LINE_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// True when `baud` is one of the rates MS/TP allows.
pub fn valid_baud_rate(baud: u32) -> bool {
    BAUD_RATES.contains(&baud)
}

/// Raw byte-level serial access.
///
/// `read` returns `Ok(0)` when no octets are pending; it must not block
/// longer than a few milliseconds. Implementations are exchanged at port
/// construction, which is how the tests substitute a loopback bus for a
/// physical device.
pub trait SerialLine: Send {
    /// Read pending octets into `buf`, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf` and block until it is on the wire.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Change the line rate. Callers validate against [`BAUD_RATES`].
    fn set_baud(&mut self, baud: u32) -> io::Result<()>;

    /// The current line rate.
    fn baud(&self) -> u32;
}

/// A [`SerialLine`] over a real serial device.
pub struct TtyLine {
    port: Box<dyn serialport::SerialPort>,
    baud: u32,
}

impl TtyLine {
    /// Open `path` at `baud`, 8N1, with a short read timeout.
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(LINE_READ_TIMEOUT)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        info!("RS485: initialized {} at {} baud", path, baud);
        Ok(Self { port, baud })
    }
}

impl SerialLine for TtyLine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match io::Read::read(&mut self.port, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.port, buf)?;
        io::Write::flush(&mut self.port)
    }

    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.port
            .set_baud_rate(baud)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.baud = baud;
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }
}

/// An in-memory two-station bus used by the tests.
///
/// Octets written on one end appear on the other end's read side, as on a
/// half-duplex pair where each transceiver mutes its own receiver while
/// driving the line.
pub struct LoopbackLine {
    rx: Arc<Mutex<VecDeque<u8>>>,
    tx: Arc<Mutex<VecDeque<u8>>>,
    baud: u32,
}

impl LoopbackLine {
    /// A connected pair of line ends.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                rx: Arc::clone(&b_to_a),
                tx: Arc::clone(&a_to_b),
                baud: 38400,
            },
            Self {
                rx: a_to_b,
                tx: b_to_a,
                baud: 38400,
            },
        )
    }
}

impl SerialLine for LoopbackLine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().unwrap();
        let mut n = 0;
        while n < buf.len() {
            match rx.pop_front() {
                Some(octet) => {
                    buf[n] = octet;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.tx.lock().unwrap().extend(buf.iter().copied());
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.baud = baud;
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }
}

/// The RS-485 side of one MS/TP port: receive FIFO in, frames out.
pub struct Rs485Port {
    line: Box<dyn SerialLine>,
    fifo: VecDeque<u8>,
    silence: SilenceTimer,
}

impl Rs485Port {
    pub fn new(line: Box<dyn SerialLine>, silence: SilenceTimer) -> Self {
        Self {
            line,
            fifo: VecDeque::new(),
            silence,
        }
    }

    /// Drain the UART into the FIFO, then surface one octet to the port's
    /// data register if the state machine has consumed the previous one.
    /// Never blocks beyond the line's read timeout.
    pub fn check_uart_data(&mut self, port: &mut MstpPort) {
        let mut buf = [0u8; 256];
        loop {
            match self.line.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.fifo.extend(buf[..n].iter().copied()),
                Err(_) => break,
            }
            if self.fifo.len() >= crate::frame::MAX_FRAME_SIZE {
                break;
            }
        }
        if !port.data_available {
            if let Some(octet) = self.fifo.pop_front() {
                port.data_register = octet;
                port.data_available = true;
            }
        }
    }

    /// True while received octets are still waiting in the FIFO.
    pub fn data_pending(&self, port: &MstpPort) -> bool {
        port.data_available || !self.fifo.is_empty()
    }

    /// Transmit a complete frame, holding the line for its duration, then
    /// mark the bus busy by resetting the silence timer.
    pub fn send_frame(&mut self, buffer: &[u8]) {
        trace!(
            "RS485: TX {} octets, type {:#04x} dest {} src {}",
            buffer.len(),
            buffer.get(2).copied().unwrap_or(0),
            buffer.get(3).copied().unwrap_or(0),
            buffer.get(4).copied().unwrap_or(0),
        );
        if self.line.write_all(buffer).is_ok() {
            // hold until the last stop bit is clocked out: 10 bits per octet
            let micros = (buffer.len() as u64) * 10_000_000 / (self.line.baud() as u64).max(1);
            std::thread::sleep(Duration::from_micros(micros));
        }
        self.silence.reset();
    }

    /// Change the line rate; rates outside [`BAUD_RATES`] are ignored.
    pub fn set_baud(&mut self, baud: u32) {
        if valid_baud_rate(baud) {
            let _ = self.line.set_baud(baud);
        }
    }

    pub fn baud(&self) -> u32 {
        self.line.baud()
    }
}
