//! Controller error types.

use core::fmt;

/// A controller error.
#[derive(Debug)]
pub enum Error {
    /// A received frame failed to decode.
    Frame(FrameError),
    /// The serial port could not be opened or configured.
    Serial(serialport::Error),
    /// Byte I/O on an already-open handle failed.
    Io(std::io::Error),
    /// The configuration file is missing or invalid. Fatal at startup.
    Config(String),
    /// The web interface asked for a raw TX that is refused because it is
    /// known to damage or crash a charger.
    RefusedTx(&'static str),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Frame(e) => write!(f, "frame: {}", e),
            Error::Serial(e) => write!(f, "serial port: {}", e),
            Error::Io(e) => write!(f, "io: {}", e),
            Error::Config(e) => write!(f, "config: {}", e),
            Error::RefusedTx(reason) => write!(f, "refusing to transmit: {}", reason),
        }
    }
}

/// Low-level frame codec error.
///
/// Any of these causes the offending frame to be dropped and the byte
/// stream to resynchronize on the next `0xC0` delimiter. The bus loop
/// never aborts on them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The additive checksum over the frame body did not match the
    /// trailing checksum byte.
    Checksum {
        /// Value carried by the frame.
        expected: u8,
        /// Value computed over the received body.
        computed: u8,
    },
    /// The unescaped frame is not one of the two known lengths (14 or 16
    /// bytes including checksum).
    Length(usize),
    /// The frame is missing its `0xC0` delimiters.
    Delimiter,
    /// A payload is too long to fit the fixed frame size.
    TooLong,
}

impl std::error::Error for FrameError {}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Checksum { expected, computed } => {
                write!(
                    f,
                    "checksum {:02X} does not match received {:02X}",
                    computed, expected
                )
            }
            FrameError::Length(len) => write!(f, "unexpected frame length {}", len),
            FrameError::Delimiter => f.write_str("frame delimiters missing"),
            FrameError::TooLong => f.write_str("payload too long for frame"),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Self::Serial(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
