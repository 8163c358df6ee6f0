//! Error taxonomy shared by every subsystem.
//!
//! Hand-rolled rather than derived: this crate is `no_std` with no
//! allocator, so a `Display` impl cannot format into an owned `String`.

use core::fmt;

/// Errors surfaced by the SFCB engine, the settings façade, and the swap
/// engine. Generic over the flash driver's own error type so `IoError`
/// never needs to box it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<E = core::convert::Infallible> {
    /// Null, zero-length, or range-violating input.
    InvalidArgument,
    /// No matching entry (SFCB lookup) or no command in SWPSTAT.
    NotFound,
    /// No space left to reserve a region after a full rotation.
    OutOfSpace,
    /// No valid sector start found at mount.
    NoFilesystem,
    /// Signature, hash, or header-field mismatch in an image.
    InvalidImage,
    /// Attempted to close or advance a location that is no longer the
    /// write cursor.
    PermissionDenied,
    /// Mount attempted on an already-mounted filesystem.
    Busy,
    /// Underlying flash driver error, propagated verbatim.
    IoError(E),
    /// Dependency violation detected during a swap.
    Tampering,
}

impl<E> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NotFound => write!(f, "not found"),
            Error::OutOfSpace => write!(f, "out of space"),
            Error::NoFilesystem => write!(f, "no valid filesystem"),
            Error::InvalidImage => write!(f, "invalid image"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::Busy => write!(f, "filesystem busy"),
            Error::IoError(_) => write!(f, "flash I/O error"),
            Error::Tampering => write!(f, "tampering detected"),
        }
    }
}

impl<E: fmt::Debug> core::error::Error for Error<E> {}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Error::IoError(e)
    }
}
