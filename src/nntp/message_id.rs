//! Validated NNTP Message-ID type
//!
//! Message-IDs are stored in their bracket-less `local@host` form and only
//! gain angle brackets when written to the wire. RFC 5536 §3.1.3 constrains
//! the syntax; the checks here are the subset a gateway must enforce before
//! interpolating an identifier into an NNTP command line.

use std::fmt;
use thiserror::Error;

/// Maximum accepted length of a bracket-less Message-ID.
///
/// RFC 5536 §3.1.3 limits msg-id to 250 octets including the brackets.
const MAX_LEN: usize = 248;

/// Validation errors for [`MessageId`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageIdError {
    #[error("message ID cannot be empty")]
    Empty,

    #[error("message ID exceeds {MAX_LEN} bytes")]
    TooLong,

    #[error("message ID must contain exactly one '@' with text on both sides")]
    MissingAtSign,

    #[error("message ID contains forbidden character {0:?}")]
    ForbiddenChar(char),
}

/// A validated Message-ID in its at-rest form (no angle brackets)
///
/// # Examples
/// ```
/// use nntp_gateway::nntp::MessageId;
///
/// let id = MessageId::parse("abc123@example.com").unwrap();
/// assert_eq!(id.short(), "abc123@example.com");
/// assert_eq!(id.angled(), "<abc123@example.com>");
///
/// assert!(MessageId::parse("no-at-sign").is_err());
/// assert!(MessageId::parse("a b@host").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    /// Parse and validate a bracket-less Message-ID
    pub fn parse(s: &str) -> Result<Self, MessageIdError> {
        if s.is_empty() {
            return Err(MessageIdError::Empty);
        }
        if s.len() > MAX_LEN {
            return Err(MessageIdError::TooLong);
        }
        for c in s.chars() {
            // Printable ASCII only; brackets and whitespace would break the
            // command line framing.
            if !c.is_ascii() || c.is_ascii_control() || matches!(c, ' ' | '<' | '>') {
                return Err(MessageIdError::ForbiddenChar(c));
            }
        }
        let mut parts = s.splitn(2, '@');
        let local = parts.next().unwrap_or("");
        let host = parts.next().unwrap_or("");
        if local.is_empty() || host.is_empty() || host.contains('@') {
            return Err(MessageIdError::MissingAtSign);
        }
        Ok(Self(s.to_string()))
    }

    /// The bracket-less form (identical to the at-rest representation)
    #[must_use]
    #[inline]
    pub fn short(&self) -> &str {
        &self.0
    }

    /// The wire form with surrounding angle brackets
    #[must_use]
    pub fn angled(&self) -> String {
        format!("<{}>", self.0)
    }

    /// The part before the `@`, used as a Subject fallback
    #[must_use]
    pub fn local_part(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MessageId {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}
