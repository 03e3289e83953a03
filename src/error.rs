//! Fixed RFC 1350 error catalogue plus the crate's typed error for
//! conditions that never make it onto the wire.

use thiserror::Error;

/// Symbolic names for the fixed RFC 1350 error codes.
///
/// The numeric code is what goes on the wire; the associated message is a
/// default that callers may override when building an ERROR packet (e.g.
/// `ErrorKind::DiskFull.packet("tsize exceeded")`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotDefined,
    UnknownOpcode,
    NoConnection,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileExists,
    NoSuchUser,
}

impl ErrorKind {
    /// The RFC 1350 numeric error code sent on the wire.
    pub const fn code(self) -> u16 {
        match self {
            ErrorKind::NotDefined => 0,
            ErrorKind::UnknownOpcode => 0,
            ErrorKind::NoConnection => 0,
            ErrorKind::FileNotFound => 1,
            ErrorKind::AccessViolation => 2,
            ErrorKind::DiskFull => 3,
            ErrorKind::IllegalOperation => 4,
            ErrorKind::UnknownTransferId => 5,
            ErrorKind::FileExists => 6,
            ErrorKind::NoSuchUser => 7,
        }
    }

    /// The default human-readable message for this error.
    pub const fn default_message(self) -> &'static str {
        match self {
            ErrorKind::NotDefined => "Not defined, see error message",
            ErrorKind::UnknownOpcode => "Unknown opcode",
            ErrorKind::NoConnection => "No connection",
            ErrorKind::FileNotFound => "File not found",
            ErrorKind::AccessViolation => "Access violation",
            ErrorKind::DiskFull => "Disk full or allocation exceeded",
            ErrorKind::IllegalOperation => "Illegal TFTP operation",
            ErrorKind::UnknownTransferId => "Unknown transfer ID",
            ErrorKind::FileExists => "File already exists",
            ErrorKind::NoSuchUser => "No such user",
        }
    }
}

/// The crate's typed error for failures that are not TFTP wire conditions:
/// socket setup, configuration, and dispatcher-level bookkeeping.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid listen address {0:?}: {1}")]
    InvalidListenSpec(String, String),

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_codes_match_rfc1350() {
        assert_eq!(ErrorKind::NotDefined.code(), 0);
        assert_eq!(ErrorKind::FileNotFound.code(), 1);
        assert_eq!(ErrorKind::AccessViolation.code(), 2);
        assert_eq!(ErrorKind::DiskFull.code(), 3);
        assert_eq!(ErrorKind::IllegalOperation.code(), 4);
        assert_eq!(ErrorKind::UnknownTransferId.code(), 5);
        assert_eq!(ErrorKind::FileExists.code(), 6);
        assert_eq!(ErrorKind::NoSuchUser.code(), 7);
    }

    #[test]
    fn unnamed_codes_share_zero() {
        assert_eq!(ErrorKind::UnknownOpcode.code(), 0);
        assert_eq!(ErrorKind::NoConnection.code(), 0);
    }
}
