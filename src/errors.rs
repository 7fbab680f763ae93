//! Error taxonomy shared by the pipeline, the server, and the client.
//!
//! Every error has a stable negative wire code (`ET_OK` = 0 stays implicit
//! in `Result::Ok`). Session replies carry the code as a big-endian i32;
//! `from_code` restores the variant on the client side.

use std::io;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EtError {
    /// Deadline expired in a wait or I/O; caller may retry.
    #[error("timed out")]
    Timeout,

    /// Blocking call woken by a cooperative quit; semantic, not a fault.
    #[error("woken up while waiting")]
    Wakeup,

    /// Async get/new with nothing available.
    #[error("nothing available")]
    Empty,

    /// Single-user station already has an attachment.
    #[error("station is busy")]
    Busy,

    /// System marked dead.
    #[error("system is dead")]
    Dead,

    #[error("socket read failed")]
    Read,

    #[error("socket write failed")]
    Write,

    #[error("network failure")]
    Network,

    #[error("socket setup failed")]
    Socket,

    /// Discovery found more than one distinct responder under ERROR
    /// policy, or an attachment/station limit was reached.
    #[error("too many")]
    TooMany,

    /// Station name already in use; carries the existing station id.
    #[error("station already exists (id {0})")]
    Exists(usize),

    /// Event size exceeds what the peer's word width can safely carry,
    /// or the oversized-event budget is spent.
    #[error("event too big")]
    TooBig,

    /// Allocation failure in the remote peer.
    #[error("out of memory")]
    NoMem,

    #[error("bad argument")]
    BadArg,

    /// Operation on a system after close.
    #[error("system is closed")]
    Closed,

    /// Remote-only limitation hit.
    #[error("remote operation failed")]
    Remote,

    /// Operation unsupported over a remote session.
    #[error("not supported remotely")]
    NoRemote,

    /// Unclassified failure.
    #[error("ET error")]
    Error,
}

pub const ET_OK: i32 = 0;

impl EtError {
    /// Stable wire code, always negative.
    pub fn code(&self) -> i32 {
        match self {
            EtError::Error => -1,
            EtError::TooMany => -2,
            EtError::Exists(_) => -3,
            EtError::Wakeup => -4,
            EtError::Timeout => -5,
            EtError::Empty => -6,
            EtError::Busy => -7,
            EtError::Dead => -8,
            EtError::Read => -9,
            EtError::Write => -10,
            EtError::Remote => -11,
            EtError::NoRemote => -12,
            EtError::TooBig => -13,
            EtError::NoMem => -14,
            EtError::BadArg => -15,
            EtError::Socket => -16,
            EtError::Network => -17,
            EtError::Closed => -18,
        }
    }

    /// Decode a wire code. Unknown negative codes collapse into `Error`;
    /// `Exists` loses its id on the wire (the reply carries it separately).
    pub fn from_code(code: i32) -> Option<EtError> {
        match code {
            0.. => None,
            -2 => Some(EtError::TooMany),
            -3 => Some(EtError::Exists(0)),
            -4 => Some(EtError::Wakeup),
            -5 => Some(EtError::Timeout),
            -6 => Some(EtError::Empty),
            -7 => Some(EtError::Busy),
            -8 => Some(EtError::Dead),
            -9 => Some(EtError::Read),
            -10 => Some(EtError::Write),
            -11 => Some(EtError::Remote),
            -12 => Some(EtError::NoRemote),
            -13 => Some(EtError::TooBig),
            -14 => Some(EtError::NoMem),
            -15 => Some(EtError::BadArg),
            -16 => Some(EtError::Socket),
            -17 => Some(EtError::Network),
            -18 => Some(EtError::Closed),
            _ => Some(EtError::Error),
        }
    }
}

impl From<io::Error> for EtError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => EtError::Timeout,
            io::ErrorKind::UnexpectedEof => EtError::Read,
            io::ErrorKind::BrokenPipe | io::ErrorKind::WriteZero => EtError::Write,
            io::ErrorKind::OutOfMemory => EtError::NoMem,
            _ => EtError::Network,
        }
    }
}

pub type Result<T> = std::result::Result<T, EtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let all = [
            EtError::Error,
            EtError::TooMany,
            EtError::Exists(0),
            EtError::Wakeup,
            EtError::Timeout,
            EtError::Empty,
            EtError::Busy,
            EtError::Dead,
            EtError::Read,
            EtError::Write,
            EtError::Remote,
            EtError::NoRemote,
            EtError::TooBig,
            EtError::NoMem,
            EtError::BadArg,
            EtError::Socket,
            EtError::Network,
            EtError::Closed,
        ];
        for e in all {
            assert!(e.code() < 0);
            assert_eq!(EtError::from_code(e.code()), Some(e));
        }
        assert_eq!(EtError::from_code(0), None);
        assert_eq!(EtError::from_code(7), None);
        assert_eq!(EtError::from_code(-99), Some(EtError::Error));
    }
}
