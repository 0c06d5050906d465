// vim: tw=80
//! Common type definitions used throughout zbc-core

use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Indexes a logical block.  The size of a block is device-dependent; see
/// [`DeviceInfo::logical_block_size`](crate::DeviceInfo).
pub type LbaT = u64;

/// Indexes a device's zones, in ascending order of start LBA.
pub type ZoneT = u32;

/// zbc-core's error type.
///
/// Validation errors are detected before any I/O is issued.  Everything the
/// underlying file or device reports ends up in `IoFailure`, which keeps the
/// original errno.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("No such file or directory")]
    NotFound,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Not a zoned block device")]
    NotAZonedDevice,
    #[error("Address out of range")]
    OutOfRange,
    #[error("Write does not begin at the zone's write pointer")]
    SequentialOrderViolation,
    #[error("Zone is full")]
    ZoneFull,
    #[error("Zone is read-only or offline")]
    ReadOnlyZone,
    #[error("Zone has no write pointer")]
    NotResettable,
    #[error("Operation not supported by this device")]
    Unsupported,
    #[error("Invalid zone layout")]
    InvalidLayout,
    #[error("Transfer length is not a multiple of the logical block size")]
    Unaligned,
    #[error("I/O failure: {0}")]
    IoFailure(Errno),
}

impl Error {
    /// Classify an error returned while opening a path.
    ///
    /// Unlike the blanket `From<io::Error>`, this recognizes the failures
    /// that have their own error kinds at open time.
    pub fn from_open(e: io::Error) -> Self {
        match e.raw_os_error().map(Errno::from_raw) {
            Some(Errno::ENOENT) | Some(Errno::ENOTDIR) => Error::NotFound,
            Some(Errno::EACCES) | Some(Errno::EPERM) | Some(Errno::EROFS) =>
                Error::PermissionDenied,
            _ => Error::from(e)
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let errno = e.raw_os_error()
            .map(Errno::from_raw)
            .unwrap_or(Errno::EIO);
        Error::IoFailure(errno)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::IoFailure(e)
    }
}

/// Translate back into a plain errno, for callers that speak C.
impl From<Error> for Errno {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound => Errno::ENOENT,
            Error::PermissionDenied => Errno::EACCES,
            Error::NotAZonedDevice => Errno::ENXIO,
            Error::OutOfRange => Errno::EINVAL,
            Error::SequentialOrderViolation => Errno::EIO,
            Error::ZoneFull => Errno::ENOSPC,
            Error::ReadOnlyZone => Errno::EROFS,
            Error::NotResettable => Errno::EINVAL,
            Error::Unsupported => Errno::EOPNOTSUPP,
            Error::InvalidLayout => Errno::EINVAL,
            Error::Unaligned => Errno::EINVAL,
            Error::IoFailure(errno) => errno,
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

// LCOV_EXCL_STOP
