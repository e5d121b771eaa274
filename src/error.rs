use std::io;

use thiserror::Error;

/// Error kinds returned by this crate.
///
/// These mirror the small, closed set of error conditions a USB host stack
/// can report to an application: there is no attempt to carry OS-specific
/// detail beyond what `std::io::Error` already gives us.
#[derive(Error, Debug)]
pub enum Error {
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied (insufficient permissions)")]
    Access,
    #[error("no such device (it may have been disconnected)")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("pipe error")]
    Pipe,
    #[error("system call interrupted")]
    Interrupted,
    #[error("insufficient memory")]
    NoMem,
    #[error("operation not supported on this platform")]
    NotSupported,
    #[error("other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::PermissionDenied => Error::Access,
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::Interrupted => Error::Interrupted,
            io::ErrorKind::OutOfMemory => Error::NoMem,
            io::ErrorKind::Unsupported => Error::NotSupported,
            io::ErrorKind::BrokenPipe => Error::Pipe,
            _ => match err.raw_os_error() {
                Some(libc::ENODEV) => Error::NoDevice,
                Some(libc::ENOMEM) => Error::NoMem,
                Some(libc::EBUSY) => Error::Busy,
                Some(libc::EPIPE) => Error::Pipe,
                Some(libc::EOVERFLOW) => Error::Overflow,
                _ => Error::Io,
            },
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Error {
        Error::from(io::Error::from(err))
    }
}
