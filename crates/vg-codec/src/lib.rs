//! Wire codecs for the two session protocols (C3).
//!
//! Both codecs decode into zero-copy views borrowing the caller's buffer:
//! a decoded message must not outlive the single dispatch that produced it
//! (spec §4.1). This mirrors `ipico-core::read`'s choice to parse into
//! `&str`-borrowing types rather than owned `String`s wherever the caller
//! can guarantee the buffer outlives the parse.

pub mod fix;
pub mod ilink3;

use thiserror::Error;

/// Errors shared by both codecs (spec §4.1).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("unknown template id {0}")]
    UnknownTemplate(u16),
    #[error("checksum mismatch: expected {expected:03}, computed {computed:03}")]
    ChecksumMismatch { expected: u32, computed: u32 },
}

impl CodecError {
    /// Framing violations are fatal to the session; the other two kinds are
    /// not (spec §4.1: "unknown non-session templates are passed through").
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::Malformed(_))
    }
}
