//! POSIX error codes returned across the library boundary.
//!
//! The core never panics on a reachable error path (see the error handling
//! design in SPEC_FULL.md §7); every fallible operation returns
//! `Result<T, Errno>` with one of the codes below.

use std::fmt;
use std::io;

/// The bounded set of POSIX error codes the core is allowed to surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Errno {
    /// Invalid argument.
    Invalid,
    /// I/O error, generally from a translator or the simulated transport.
    Io,
    /// Allocation failure. Never a panic; always this instead.
    NoMem,
    /// Bad file descriptor.
    BadFd,
    /// File descriptor exists but is in the wrong lifecycle state (see
    /// [`crate::fd::FdState`]).
    BadFdState,
    /// Target already exists (`O_CREAT | O_EXCL`, `link`, `rename`…).
    Exist,
    /// Operation requires a non-directory but got one.
    IsDir,
    /// Operation requires a directory but didn't get one.
    NotDir,
    /// No such file or directory.
    NoEnt,
    /// Supplied buffer too small for the result.
    Range,
    /// Requested extended attribute does not exist.
    NoData,
    /// The inode handle the caller presented is no longer valid on the
    /// current graph generation and could not be recovered.
    Stale,
    /// Symlink resolution exceeded the bounded recursion depth.
    Loop,
    /// Operation not permitted.
    Perm,
    /// Operation is recognized but not supported (e.g. unknown transport).
    NotSupported,
}

impl Errno {
    /// Maps to the `libc` errno constant an application-facing wrapper
    /// would set in `errno`.
    pub fn to_raw(self) -> libc::c_int {
        match self {
            Errno::Invalid => libc::EINVAL,
            Errno::Io => libc::EIO,
            Errno::NoMem => libc::ENOMEM,
            Errno::BadFd => libc::EBADF,
            Errno::BadFdState => libc::EBADFD,
            Errno::Exist => libc::EEXIST,
            Errno::IsDir => libc::EISDIR,
            Errno::NotDir => libc::ENOTDIR,
            Errno::NoEnt => libc::ENOENT,
            Errno::Range => libc::ERANGE,
            Errno::NoData => libc::ENODATA,
            Errno::Stale => libc::ESTALE,
            Errno::Loop => libc::ELOOP,
            Errno::Perm => libc::EPERM,
            Errno::NotSupported => libc::ENOTSUP,
        }
    }

    /// Reverse of [`Errno::to_raw`]; unrecognized codes collapse to `Io`,
    /// since the core only ever needs to classify errors it already knows
    /// how to act on (retry, abort migration, surface to caller).
    pub fn from_raw(raw: libc::c_int) -> Self {
        match raw {
            libc::EINVAL => Errno::Invalid,
            libc::ENOMEM => Errno::NoMem,
            libc::EBADF => Errno::BadFd,
            libc::EBADFD => Errno::BadFdState,
            libc::EEXIST => Errno::Exist,
            libc::EISDIR => Errno::IsDir,
            libc::ENOTDIR => Errno::NotDir,
            libc::ENOENT => Errno::NoEnt,
            libc::ERANGE => Errno::Range,
            libc::ENODATA => Errno::NoData,
            libc::ESTALE => Errno::Stale,
            libc::ELOOP => Errno::Loop,
            libc::EPERM => Errno::Perm,
            libc::ENOTSUP => Errno::NotSupported,
            _ => Errno::Io,
        }
    }

    /// True for the one error class the resolver and graph migration retry
    /// internally before ever surfacing it to a caller.
    pub fn is_stale(self) -> bool {
        matches!(self, Errno::Stale)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Errno::Invalid => "invalid argument",
            Errno::Io => "I/O error",
            Errno::NoMem => "out of memory",
            Errno::BadFd => "bad file descriptor",
            Errno::BadFdState => "file descriptor in wrong state",
            Errno::Exist => "already exists",
            Errno::IsDir => "is a directory",
            Errno::NotDir => "not a directory",
            Errno::NoEnt => "no such file or directory",
            Errno::Range => "result too large for buffer",
            Errno::NoData => "no such attribute",
            Errno::Stale => "stale handle",
            Errno::Loop => "too many levels of symbolic links",
            Errno::Perm => "operation not permitted",
            Errno::NotSupported => "not supported",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(raw) => Errno::from_raw(raw),
            None => Errno::Io,
        }
    }
}

/// Result alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, Errno>;
