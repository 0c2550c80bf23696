//! NNTP error types
//!
//! The dispatcher keys its retry and connection-disposition decisions on the
//! split encoded here: a [`NntpError::Status`] means the server answered with
//! an unwanted status code but the session framing is intact (the connection
//! can go back to the pool), while every other variant means the connection
//! state is unknown and the socket must be discarded.

use super::codes;
use thiserror::Error;

/// Errors from an NNTP session
#[derive(Debug, Error)]
pub enum NntpError {
    /// Transport failure; the connection must be discarded
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server answered with a status code outside the expected set.
    /// The response line was fully consumed, so the connection stays usable.
    #[error("unexpected response {code}: {message}")]
    Status { code: u16, message: String },

    /// The initial greeting was not 200/201
    #[error("bad greeting: {0}")]
    BadGreeting(String),

    /// A response line that does not parse as `NNN text`
    #[error("malformed response: {0}")]
    BadResponse(String),

    /// AUTHINFO exchange rejected
    #[error("authentication failed ({code}): {message}")]
    AuthFailed { code: u16, message: String },
}

impl NntpError {
    /// True when the session survived the error and the connection may be
    /// returned to the pool.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Status { .. })
    }

    /// True for the posting-failure responses that map to HTTP 409
    #[must_use]
    pub fn is_posting_failure(&self) -> bool {
        matches!(
            self,
            Self::Status { code, .. }
                if *code == codes::POSTING_NOT_PERMITTED || *code == codes::POSTING_FAILED
        )
    }

    /// The status code carried by a protocol-level error, if any
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}
