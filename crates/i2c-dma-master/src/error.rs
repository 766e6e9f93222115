use derive_more::From;

use crate::peripheral::ErrorFlags;

/// Synchronous rejection of a submission. The controller state is untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubmitError {
    /// A transaction is in flight, or a required DMA channel is owned by
    /// another driver.
    Busy,
    /// The descriptor is malformed (empty data, half-set preamble, address
    /// wider than 7 bits or a direction mismatch).
    InvalidValue,
}

impl core::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SubmitError::Busy => write!(f, "bus or DMA channel busy"),
            SubmitError::InvalidValue => {
                write!(f, "invalid transfer descriptor")
            }
        }
    }
}

/// Why a submitted transaction ended in
/// [`Status::Error`](crate::Status::Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// The peer did not acknowledge its address or a data byte.
    Nack,
    /// Another master won arbitration.
    ArbitrationLost,
    /// Misplaced start or stop condition on the bus.
    BusFault,
    /// A peer stretched the clock for too long.
    Timeout,
    /// Data register overrun or underrun.
    Overrun,
    /// A DMA channel reported a transfer error.
    DmaFault,
    /// The peripheral raised an error interrupt with no recognised flag.
    Unknown,
}

impl ErrorKind {
    /// Classify raw peripheral error flags.
    ///
    /// Flags are checked in a fixed priority order so a status register with
    /// several bits set always maps to the same kind.
    pub fn classify(flags: ErrorFlags) -> Self {
        if flags.contains(ErrorFlags::ACK_FAILURE) {
            ErrorKind::Nack
        } else if flags.contains(ErrorFlags::ARBITRATION_LOST) {
            ErrorKind::ArbitrationLost
        } else if flags.contains(ErrorFlags::BUS_ERROR) {
            ErrorKind::BusFault
        } else if flags.contains(ErrorFlags::TIMEOUT) {
            ErrorKind::Timeout
        } else if flags.contains(ErrorFlags::OVERRUN) {
            ErrorKind::Overrun
        } else {
            ErrorKind::Unknown
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ErrorKind::Nack => write!(f, "no acknowledge from peer"),
            ErrorKind::ArbitrationLost => write!(f, "arbitration lost"),
            ErrorKind::BusFault => write!(f, "bus fault"),
            ErrorKind::Timeout => write!(f, "clock stretch timeout"),
            ErrorKind::Overrun => write!(f, "data overrun"),
            ErrorKind::DmaFault => write!(f, "DMA transfer error"),
            ErrorKind::Unknown => write!(f, "unclassified bus error"),
        }
    }
}

/// Errors returned by the blocking/async helpers and the `embedded-hal`
/// adapter.
#[derive(From, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The transaction was never started.
    Submit(SubmitError),
    /// The transaction started and ended with a bus or DMA fault.
    Transfer(ErrorKind),
    /// The `embedded-hal` operation list has a shape this controller cannot
    /// express as a single descriptor.
    Unsupported,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Submit(err) => write!(f, "submit rejected: {}", err),
            Error::Transfer(kind) => write!(f, "transfer failed: {}", kind),
            Error::Unsupported => write!(f, "unsupported operation sequence"),
        }
    }
}

impl embedded_hal::i2c::Error for Error {
    fn kind(&self) -> embedded_hal::i2c::ErrorKind {
        use embedded_hal::i2c::{ErrorKind as Hal, NoAcknowledgeSource};

        match self {
            Error::Transfer(ErrorKind::Nack) => {
                Hal::NoAcknowledge(NoAcknowledgeSource::Unknown)
            }
            Error::Transfer(ErrorKind::ArbitrationLost) => Hal::ArbitrationLoss,
            Error::Transfer(ErrorKind::BusFault) => Hal::Bus,
            Error::Transfer(ErrorKind::Overrun) => Hal::Overrun,
            _ => Hal::Other,
        }
    }
}
