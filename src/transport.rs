//! Half-duplex byte I/O over the RS-485 adapter.
//!
//! The bus is single-writer single-reader for this process. Reads never
//! block: the engine polls for whatever bytes have arrived and otherwise
//! keeps its loop cadence. Collision avoidance is the engine's job — it
//! only transmits when [`Bus::rx_pending`] is false and no partial frame
//! is buffered.

use crate::error::Error;
use std::io::{Read, Write};
use std::time::Duration;

/// Byte transport seam. The real implementation is a serial port;
/// tests substitute an in-memory pair.
pub trait Bus {
    /// Number of received bytes waiting to be read.
    fn rx_pending(&mut self) -> Result<usize, Error>;

    /// Read whatever is available without blocking. Returns the number of
    /// bytes placed in `buf`, possibly zero.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error>;
}

/// An open RS-485 adapter, 8-N-1, no flow control.
pub struct SerialBus {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialBus {
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()?;

        Ok(Self { port })
    }
}

impl Bus for SerialBus {
    fn rx_pending(&mut self) -> Result<usize, Error> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let pending = self.rx_pending()?;

        if pending == 0 {
            return Ok(0);
        }

        let want = pending.min(buf.len());

        Ok(self.port.read(&mut buf[..want])?)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.port.write_all(bytes)?;
        self.port.flush()?;

        Ok(())
    }
}

/// Loopback transport for exercising the engine without hardware.
#[cfg(test)]
pub(crate) struct MockBus {
    /// Bytes the engine will receive.
    pub rx: std::collections::VecDeque<u8>,
    /// Everything the engine transmitted, in order.
    pub tx: Vec<u8>,
}

#[cfg(test)]
impl MockBus {
    pub fn new() -> Self {
        Self {
            rx: std::collections::VecDeque::new(),
            tx: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }
}

#[cfg(test)]
impl Bus for MockBus {
    fn rx_pending(&mut self) -> Result<usize, Error> {
        Ok(self.rx.len())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut count = 0;

        while count < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }

        Ok(count)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.tx.extend_from_slice(bytes);

        Ok(())
    }
}
