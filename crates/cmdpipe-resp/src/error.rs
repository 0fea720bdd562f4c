//! Framing errors.

use std::fmt;

/// A malformed request or reply. Fatal to the connection that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// `*<n>` header is not a non-negative integer or lacks `\r\n`.
    InvalidMultiBulkLength,
    /// `$<n>` header is bad or the payload is not followed by `\r\n`.
    InvalidBulkLength,
    /// Expected `$` at the start of a bulk argument.
    UnexpectedByte(u8),
    /// Inline request has an unclosed or misplaced quote.
    UnbalancedQuotes,
    /// Reply stream contains an unknown type byte or bad integer.
    InvalidReply,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Protocol error: ")?;
        match self {
            Self::InvalidMultiBulkLength => write!(f, "invalid multibulk length"),
            Self::InvalidBulkLength => write!(f, "invalid bulk length"),
            Self::UnexpectedByte(b) => write!(f, "expected '$', got '{}'", char::from(*b)),
            Self::UnbalancedQuotes => write!(f, "unbalanced quotes in request"),
            Self::InvalidReply => write!(f, "invalid reply"),
        }
    }
}

impl std::error::Error for ProtocolError {}
