//! Error types shared across the codec, storage gateway, and handlers.
//!
//! 9P2000.u reports failures as a wire-format string (`Rerror.ename`), not
//! the numeric `ecode` that 9P2000.L's `Rlerror` uses. `errno` groups the
//! driver-side failure categories the storage gateway classifies storage
//! errors into (see spec §4.2); `string` holds the exact wire strings a
//! handler places in an `Rerror` reply.

use std::fmt;

/// Coarse classification of a storage driver failure, used only to pick
/// the matching string in [`string`]. Not sent on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverErrno {
    NotFound,
    NotADirectory,
    NotAFile,
    Exists,
    DiskFull,
    InvalidPath,
    NotMounted,
    ReadFailed,
    WriteFailed,
}

/// Canonical 9P2000.u error strings. Every `Rerror` the server emits uses
/// one of these, per spec §4.2 and §7.
pub mod string {
    pub const FILE_NOT_FOUND: &str = "file not found";
    pub const NOT_A_DIRECTORY: &str = "not a directory";
    pub const NOT_A_FILE: &str = "not a file";
    pub const FILE_EXISTS: &str = "file exists";
    pub const DISK_FULL: &str = "disk full";
    pub const INVALID_PATH: &str = "invalid path";
    pub const NOT_MOUNTED: &str = "not mounted";
    pub const READ_FAILED: &str = "read failed";
    pub const WRITE_FAILED: &str = "write failed";
    pub const UNKNOWN_FID: &str = "unknown fid";
    pub const FID_IN_USE: &str = "fid in use";
    pub const OUT_OF_FIDS: &str = "out of fids";
    pub const OUT_OF_SESSIONS: &str = "out of resources";
    pub const STORAGE_BUSY: &str = "storage busy";
    pub const AUTH_NOT_REQUIRED: &str = "authentication not required";
    pub const CANNOT_WRITE_DIRECTORY: &str = "cannot write to directory";
    pub const NOT_A_DIRECTORY_FID: &str = "not a directory";
    pub const UNSUPPORTED: &str = "operation not supported";
    pub const NOT_ATTACHED: &str = "not attached";
    pub const BAD_MESSAGE: &str = "malformed request";
    pub const ALREADY_OPEN: &str = "fid already open";
}

impl DriverErrno {
    /// Map to the wire string a handler sends back verbatim.
    pub fn as_str(self) -> &'static str {
        use DriverErrno::*;
        match self {
            NotFound => string::FILE_NOT_FOUND,
            NotADirectory => string::NOT_A_DIRECTORY,
            NotAFile => string::NOT_A_FILE,
            Exists => string::FILE_EXISTS,
            DiskFull => string::DISK_FULL,
            InvalidPath => string::INVALID_PATH,
            NotMounted => string::NOT_MOUNTED,
            ReadFailed => string::READ_FAILED,
            WriteFailed => string::WRITE_FAILED,
        }
    }
}

/// Error type threaded through the codec and handler layers.
///
/// Handlers never propagate an `Error` past their own return path (spec
/// §7): the session turns an `Err` into an `Rerror { ename }` reply for
/// everything except [`Error::Fatal`], which tears the session down.
#[derive(Debug)]
pub enum Error {
    /// Framing or I/O failure; fatal to the session (spec §7.1).
    Fatal(String),
    /// A regular protocol/resource/storage/policy error; replied as
    /// `Rerror` and the session continues.
    Proto(String),
    /// Underlying I/O error, folded into `Proto` with its message.
    Io(std::io::Error),
}

impl Error {
    pub fn proto(msg: impl Into<String>) -> Self {
        Error::Proto(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// The string to place in an `Rerror` reply, if this error is
    /// repliable (i.e. not fatal).
    pub fn as_reply_string(&self) -> String {
        match self {
            Error::Fatal(m) => m.clone(),
            Error::Proto(m) => m.clone(),
            Error::Io(e) => e.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

impl From<DriverErrno> for Error {
    fn from(e: DriverErrno) -> Self {
        Error::Proto(e.as_str().to_owned())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_reply_string())
    }
}

impl std::error::Error for Error {}

pub type Result<T> = ::std::result::Result<T, Error>;
