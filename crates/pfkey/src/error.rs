//! Error types for SADB/SPD operations.

use std::io;

/// Result type for SADB/SPD operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or processing PF_KEY messages and
/// while operating on the policy/association stores.
///
/// Every variant maps onto the errno carried in the `sadb_msg` header of an
/// error reply; see [`Error::errno`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the delivery path.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Message was shorter than its fixed header.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message format (bad version, length mismatch, unknown type).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid extension format (duplicate, unknown type, bad length).
    #[error("invalid extension: {0}")]
    InvalidExtension(String),

    /// Invalid embedded socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Unsupported address family.
    #[error("unsupported address family: {0}")]
    AddressFamily(u8),

    /// Object already exists (duplicate SPI, duplicate policy selector,
    /// duplicate registration).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object found but does not match the request (saidx mismatch, pid
    /// mismatch, lost a race with a concurrent delete/flush).
    #[error("mismatch: {0}")]
    Mismatch(String),

    /// Operation not supported (reserved SA types).
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Protocol not supported (unknown IPsec protocol in a request record).
    #[error("protocol not supported: {0}")]
    ProtocolNotSupported(String),

    /// Resource exhaustion (identifier space exhausted, allocation failed).
    #[error("no resources: {0}")]
    NoResources(String),

    /// A delivery channel is gone.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl Error {
    /// The errno value to place in the header of an error reply.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Truncated { .. }
            | Self::InvalidMessage(_)
            | Self::InvalidExtension(_)
            | Self::InvalidAddress(_) => libc::EINVAL,
            Self::AddressFamily(_) => libc::EAFNOSUPPORT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotFound(_) => libc::ENOENT,
            Self::Mismatch(_) => libc::ESRCH,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::ProtocolNotSupported(_) => libc::EPROTONOSUPPORT,
            Self::NoResources(_) => libc::ENOBUFS,
            Self::Delivery(_) => libc::EPIPE,
        }
    }

    /// Check if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is an "already exists" error.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Check if this is a mismatch (race-lost or identity check failure).
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(
            Error::InvalidMessage("x".into()).errno(),
            libc::EINVAL
        );
        assert_eq!(Error::AlreadyExists("x".into()).errno(), libc::EEXIST);
        assert_eq!(Error::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(Error::Mismatch("x".into()).errno(), libc::ESRCH);
        assert_eq!(
            Error::ProtocolNotSupported("x".into()).errno(),
            libc::EPROTONOSUPPORT
        );
    }

    #[test]
    fn test_predicates() {
        assert!(Error::NotFound("sp".into()).is_not_found());
        assert!(Error::AlreadyExists("spi".into()).is_already_exists());
        assert!(Error::Mismatch("saidx".into()).is_mismatch());
        assert!(!Error::NotFound("sp".into()).is_already_exists());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::Truncated {
            expected: 16,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "message truncated: expected 16 bytes, got 4"
        );
    }
}
