//! Transport error type.

use core::fmt;

use crate::{codec, layout};

/// A decoded structure or index failed a sanity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Violation {
    /// A device-written index points outside its ring.
    IndexOutOfRange { ring: u8, index: u16, entries: u16 },
    /// A completion claims more inline payload than its slot holds.
    LengthExceedsSlot { ring: u8, len: u32, capacity: usize },
    /// A message id was issued while an earlier request with the same id is still pending.
    DuplicateMessageId { msg_id: u16 },
    /// A pipe refers to a completion ring that has not been opened.
    UnknownCompletionRing { ring: u8 },
    /// A completion names a pipe beyond the configured transfer rings.
    PipeOutOfRange { ring: u8, pipe: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Device, region or DMA setup failed.
    ResourceUnavailable,
    /// Every wait slot holds an in-flight request. Retry once one completes.
    TooManyInFlight,
    /// Advancing the transfer head would run into the device's tail.
    RingFull { pipe: u8 },
    /// No completion arrived within the request timeout.
    RequestTimeout { msg_id: u16 },
    /// A completion arrived for a message id nobody waits for.
    UnexpectedCompletion { msg_id: u16 },
    ProtocolViolation(Violation),
    /// The pipe is not open or its ring lives in device memory.
    InvalidPipe { pipe: u8 },
    /// The payload does not fit in a slot or in the control buffer.
    PayloadTooLarge { len: usize, max: usize },
    /// The transport has been torn down.
    Shutdown,
    Layout(layout::Error),
    Codec(codec::Error),
}

impl From<layout::Error> for Error {
    fn from(e: layout::Error) -> Self {
        Error::Layout(e)
    }
}

impl From<codec::Error> for Error {
    fn from(e: codec::Error) -> Self {
        Error::Codec(e)
    }
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self {
        Error::ProtocolViolation(v)
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::IndexOutOfRange { ring, index, entries } => {
                write!(f, "ring {} index {} outside 0..{}", ring, index, entries)
            }
            Violation::LengthExceedsSlot { ring, len, capacity } => {
                write!(f, "ring {} entry length {} exceeds slot capacity {}", ring, len, capacity)
            }
            Violation::DuplicateMessageId { msg_id } => write!(f, "message id {:#06x} already pending", msg_id),
            Violation::UnknownCompletionRing { ring } => write!(f, "completion ring {} is not open", ring),
            Violation::PipeOutOfRange { ring, pipe } => write!(f, "ring {} entry names unknown pipe {}", ring, pipe),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceUnavailable => f.write_str("resource unavailable"),
            Error::TooManyInFlight => f.write_str("too many requests in flight"),
            Error::RingFull { pipe } => write!(f, "transfer ring of pipe {} is full", pipe),
            Error::RequestTimeout { msg_id } => write!(f, "request {:#06x} timed out", msg_id),
            Error::UnexpectedCompletion { msg_id } => write!(f, "unexpected completion for {:#06x}", msg_id),
            Error::ProtocolViolation(v) => write!(f, "protocol violation: {}", v),
            Error::InvalidPipe { pipe } => write!(f, "pipe {} cannot carry requests", pipe),
            Error::PayloadTooLarge { len, max } => write!(f, "payload of {} bytes exceeds {}", len, max),
            Error::Shutdown => f.write_str("transport shut down"),
            Error::Layout(e) => write!(f, "layout: {:?}", e),
            Error::Codec(e) => write!(f, "codec: {:?}", e),
        }
    }
}

impl core::error::Error for Error {}
