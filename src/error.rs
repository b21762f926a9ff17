// One error type for the whole catalogue. Each driver fails the same few
// ways: the bus transaction itself, a wrong identity byte, a bad CRC, or
// an exhausted bounded wait. Initialization failures come back through
// here instead of panicking so callers decide retry policy.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<E> {
    /// Underlying bus transaction failed.
    Bus(E),
    /// Identity register did not match the expected part.
    ChipId { expected: u8, found: u8 },
    /// CRC over a read block did not match the check byte.
    Crc { computed: u8, received: u8 },
    /// A bounded wait on a status bit ran out.
    Timeout,
    /// No device answered (One-Wire presence pulse, EEPROM ack polling).
    NoDevice,
    /// Argument outside the range the chip can represent.
    InvalidParam,
    /// Operation needs calibration/config state that `init` loads.
    NotInitialized,
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Error::Bus(e)
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus(e) => write!(f, "bus error: {e:?}"),
            Error::ChipId { expected, found } => {
                write!(f, "chip id 0x{found:02X}, expected 0x{expected:02X}")
            }
            Error::Crc { computed, received } => {
                write!(f, "crc mismatch: computed 0x{computed:02X}, read 0x{received:02X}")
            }
            Error::Timeout => write!(f, "status wait timed out"),
            Error::NoDevice => write!(f, "no device answered"),
            Error::InvalidParam => write!(f, "parameter out of range"),
            Error::NotInitialized => write!(f, "driver not initialized"),
        }
    }
}
