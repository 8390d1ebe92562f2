//! Error representations for the 9P2000 protocol stack.
//!
//! Two kinds of failure flow through this crate: protocol errors, which are
//! reported to the client as an `RError` message and never abort the
//! connection, and transport errors, which tear the connection down.

use thiserror::Error;

/// Canonical `RError` ename strings produced by this implementation.
pub mod ename {
    pub const UNKNOWN_FID: &str = "unknown fid";
    pub const DUP_FID: &str = "duplicate fid";
    pub const NOT_A_DIR: &str = "not a directory";
    pub const CREATE_NON_DIR: &str = "create in non-directory";
    pub const NO_FILE_OPEN: &str = "no file open";
    pub const ALREADY_OPEN: &str = "already open";
    pub const ILLEGAL_NAME: &str = "illegal filename";
    pub const INVALID_PATH: &str = "invalid path";
    pub const AUTH_REQUIRED: &str = "auth required";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NO_AUTH: &str = "no auth";
    pub const CANNOT_REMOVE_ROOT: &str = "cannot remove root";
    pub const BAD_OFFSET: &str = "bad offset";
    pub const READ_TOO_SMALL: &str = "read count too small";
    pub const INVALID_WRITE: &str = "invalid";
    pub const DUP_NAME: &str = "duplicate file name";
    pub const NO_READ: &str = "no read";
    pub const NO_WRITE: &str = "no write";
    pub const NO_CREATE: &str = "no create";
    pub const NO_REMOVE: &str = "no remove";
    pub const NO_WSTAT: &str = "no wstat";
    pub const NOT_IMPLEMENTED: &str = "not implemented";
    pub const INVALID_RESULT: &str = "invalid result";
    pub const UNKNOWN_MSG: &str = "unknown message";
    pub const MSG_TOO_LARGE: &str = "message too large";
}

/// The error type threaded through every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol-level failure, sent to the peer as `RError { ename }`.
    #[error("{0}")]
    Proto(String),

    /// Transport-level failure; the connection is not recoverable.
    #[error(transparent)]
    Io(#[from] ::std::io::Error),
}

impl Error {
    /// Build a protocol error carrying the given ename.
    pub fn proto(ename: impl Into<String>) -> Error {
        Error::Proto(ename.into())
    }

    /// The string to place in an outgoing `RError`.
    pub fn ename(&self) -> String {
        match self {
            Error::Proto(s) => s.clone(),
            Error::Io(e) => e.to_string(),
        }
    }
}

/// Flatten two teardown results into one, joining both messages with `/`
/// so that neither error is lost.
pub fn combine_errors(
    first: ::std::result::Result<(), Error>,
    second: ::std::result::Result<(), Error>,
) -> ::std::result::Result<(), Error> {
    match (first, second) {
        (Ok(()), second) => second,
        (first, Ok(())) => first,
        (Err(e), Err(e2)) => Err(Error::Proto(format!("{}/{}", e.ename(), e2.ename()))),
    }
}
