//! The error type shared by every layer of the engine

use crate::nand::NandError;
use crate::Pnum;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("no free physical eraseblocks")]
    NoSpace,

    #[error("device is read-only")]
    ReadOnly,

    #[error("PEB {0} is not tracked by wear-leveling")]
    NotFound(Pnum),

    #[error("PEB {0} out of range")]
    OutOfRange(Pnum),

    #[error("resource busy")]
    Busy,

    #[error("operation interrupted")]
    Interrupted,

    #[error("try again")]
    TryAgain,

    #[error("erase counter of PEB {pnum} overflowed ({ec})")]
    EcOverflow { pnum: Pnum, ec: u64 },

    #[error("too many erroneous PEBs")]
    TooManyErroneous,

    #[error("no reserved PEBs left for bad block handling")]
    NoReserve,

    #[error("PEB {0} is not erased")]
    NotErased(Pnum),

    #[error("PEB {0} has a corrupt header")]
    CorruptHeader(Pnum),

    #[error("PEB {0} still holds live LEBs")]
    StillReferenced(Pnum),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Nand(#[from] NandError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Transient failures are retried instead of being treated as fatal
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::Interrupted | Self::TryAgain | Self::Nand(NandError::Busy)
        )
    }

    /// Did the media itself fail? Blocks failing this way are candidates for bad-block marking.
    pub fn is_hard_io(&self) -> bool {
        matches!(self, Self::Nand(err) if err.is_media_error())
    }

    /// Errno-style code for reporting across an FFI or process boundary
    pub fn code(&self) -> i32 {
        match self {
            Error::NoSpace => 28,             // ENOSPC
            Error::ReadOnly => 30,            // EROFS
            Error::NotFound(_) => 2,          // ENOENT
            Error::OutOfRange(_) => 22,       // EINVAL
            Error::Busy => 16,                // EBUSY
            Error::Interrupted => 4,          // EINTR
            Error::TryAgain => 11,            // EAGAIN
            Error::EcOverflow { .. } => 22,   // EINVAL
            Error::TooManyErroneous => 5,     // EIO
            Error::NoReserve => 30,           // EROFS
            Error::NotErased(_) => 5,         // EIO
            Error::CorruptHeader(_) => 74,    // EBADMSG
            Error::StillReferenced(_) => 16,  // EBUSY
            Error::Invalid(_) => 22,          // EINVAL
            Error::Nand(NandError::Busy) => 16,
            Error::Nand(_) => 5,
        }
    }
}

#[test]
fn test_classification() {
    assert!(Error::Busy.is_transient());
    assert!(Error::Nand(NandError::Busy).is_transient());
    assert!(!Error::NoSpace.is_transient());

    assert!(Error::Nand(NandError::EraseFailed(3)).is_hard_io());
    assert!(!Error::Nand(NandError::Misuse("x".into())).is_hard_io());
    assert!(!Error::ReadOnly.is_hard_io());

    assert_eq!(Error::NoSpace.code(), 28);
    assert_eq!(Error::Nand(NandError::EraseFailed(3)).code(), 5);
}
