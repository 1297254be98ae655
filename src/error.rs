//! Error taxonomy returned to applications and to internal callers.
use std::fmt;

/// Errors a [`crate::Transport`] can return.
///
/// Per spec.md §7, codec and NAK-validation errors never reach here — they
/// are counted and dropped inside the NAK/receive path. Only configuration,
/// closed-transport, and argument errors surface synchronously.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum PgmError {
    /// An argument or transport precondition was violated.
    #[error("invalid argument or state: {0}")]
    Invalid(String),
    /// A configuration setter was called after `bind()`.
    #[error("configuration cannot change after bind")]
    AlreadyBound,
    /// The transport has been closed.
    #[error("transport is closed")]
    Closed,
    /// The APDU exceeds the window's total addressable capacity.
    #[error("APDU of {len} bytes exceeds the window's capacity")]
    Oversize {
        /// The APDU length that was rejected.
        len: usize,
    },
    /// The rate controller rejected the send (errno=AGAIN equivalent).
    #[error("rate limited")]
    RateLimited,
    /// The underlying write primitive would block and DONTWAIT was set.
    #[error("would block")]
    WouldBlock,
    /// A sequence was requested that is no longer inside the transmit window.
    #[error("sequence {sqn} is out of window [{trail}, {lead}]")]
    OutOfWindow {
        /// The requested sequence.
        sqn: u32,
        /// Current window trail.
        trail: u32,
        /// Current window lead.
        lead: u32,
    },
}

/// `errno`-equivalent classification for [`PgmError`], per spec.md §6's
/// return-semantics table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Errno {
    /// `EAGAIN`
    Again,
    /// `ECONNRESET`
    ConnReset,
    /// `EINVAL`
    Inval,
    /// `EMSGSIZE`
    MsgSize,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Errno::Again => "EAGAIN",
            Errno::ConnReset => "ECONNRESET",
            Errno::Inval => "EINVAL",
            Errno::MsgSize => "EMSGSIZE",
        };
        f.write_str(s)
    }
}

impl PgmError {
    /// Maps this error onto the `errno` spec.md §6 assigns it, where one
    /// applies (`OutOfWindow` and `AlreadyBound` are internal/never surface
    /// with an application-facing errno and return `None`).
    pub fn errno(&self) -> Option<Errno> {
        match self {
            PgmError::RateLimited => Some(Errno::Again),
            PgmError::Closed => Some(Errno::ConnReset),
            PgmError::Invalid(_) => Some(Errno::Inval),
            PgmError::Oversize { .. } => Some(Errno::MsgSize),
            PgmError::WouldBlock | PgmError::OutOfWindow { .. } | PgmError::AlreadyBound => None,
        }
    }
}
