//! 9P2000 error representations.
//!
//! In 9P2000, errors cross the wire as strings carried by `Rerror`.
//! The canonical strings below are imported from include/net/9p/error.c
//! of the Linux kernel.

use std::io::ErrorKind::*;
use std::{fmt, io};

fn ename_from_ioerror(e: &io::Error) -> &'static str {
    use crate::error::string::*;

    match e.kind() {
        NotFound => ENOENT_FILE,
        PermissionDenied => EACCES,
        AlreadyExists => EEXIST,
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe => {
            ECONNRESET
        }
        InvalidInput | InvalidData => EINVAL,
        TimedOut => ETIMEDOUT,
        Interrupted => EINTR,
        ReadOnlyFilesystem => EROFS,
        DirectoryNotEmpty => ENOTEMPTY,
        NotADirectory => ENOTDIR,
        IsADirectory => EISDIR,
        StorageFull => ENOSPC,
        _ => EIO,
    }
}

/// 9P error type which is convertible to an ename.
///
/// The value of `Error::ename()` will be used for `Rerror`.
#[derive(Debug)]
pub enum Error {
    /// Protocol-level error carrying the ename to put on the wire
    Proto(String),
    /// I/O error
    Io(io::Error),
}

impl Error {
    /// Shorthand for a protocol error with a fixed ename
    pub fn proto(ename: impl Into<String>) -> Error {
        Error::Proto(ename.into())
    }

    /// Get the string representation sent back in `Rerror`
    pub fn ename(&self) -> String {
        match *self {
            Error::Proto(ref ename) => ename.clone(),
            Error::Io(ref e) => ename_from_ioerror(e).to_owned(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Proto(ref ename) => write!(f, "{}", ename),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Proto(_) => None,
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<String> for Error {
    fn from(ename: String) -> Self {
        Error::Proto(ename)
    }
}

impl From<&str> for Error {
    fn from(ename: &str) -> Self {
        Error::Proto(ename.to_owned())
    }
}

/// 9P error strings
///
/// # Protocol
/// 9P2000
pub mod string {
    pub const EACCES: &str = "permission denied";
    pub const EBADF: &str = "fid unknown or out of range";
    pub const EBADF_IN_USE: &str = "fid already in use";
    pub const EBADF_USE: &str = "bad use of fid";
    pub const ECONNRESET: &str = "Connection reset by peer";
    pub const EEXIST: &str = "file already exists";
    pub const EINTR: &str = "Interrupted system call";
    pub const EINVAL: &str = "Invalid argument";
    pub const EIO: &str = "i/o error";
    pub const EISDIR: &str = "Is a directory";
    pub const ENAMETOOLONG: &str = "illegal name";
    pub const ENOENT: &str = "Not found.";
    pub const ENOENT_FILE: &str = "file not found";
    pub const ENOSPC: &str = "file system is full";
    pub const ENOTDIR: &str = "not a directory";
    pub const ENOTEMPTY: &str = "directory is not empty";
    pub const EOPEN: &str = "file already open for I/O";
    pub const EPERM_RMROOT: &str = "cannot remove root";
    pub const EPERM_WSTAT: &str = "wstat prohibited";
    pub const EROFS: &str = "read only file system";
    pub const ETIMEDOUT: &str = "Connection timed out";

    pub const EAUTH: &str = "authentication not required";
    pub const ECANNOT_CREATE: &str = "Cannot create file.";
    pub const ECANNOT_OPEN: &str = "Cannot open file.";
    pub const ENOT_A_FILE: &str = "Not a file.";
    pub const EREAD_ONLY: &str = "Read only.";
    pub const EROOT: &str = "Root not found.";
    pub const EUNSUPPORTED: &str = "Unsupported message.";
    pub const EWRITE_FAILED: &str = "Failed to write data.";
}
