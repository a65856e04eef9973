use thiserror::Error;

/// The error taxonomy of the RPC engine (spec: ERROR HANDLING DESIGN).
///
/// Each variant corresponds to one row of the error table: the string in
/// parentheses is the wire `errorCode` a peer sees in an ERROR response.
#[derive(Debug, Error, Clone)]
pub enum TenuredError {
    /// Frame is malformed: bad length accounting or invalid UTF-8.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The channel the request was bound to has been closed.
    #[error("channel closed")]
    ChannelClosed,

    /// No response arrived before the per-request deadline.
    #[error("request timed out")]
    Timeout,

    /// The handler's executor queue was full.
    #[error("[0429]overloaded")]
    Overloaded,

    /// No handler registered for the command's code.
    #[error("[0404]no handler")]
    NoHandler,

    /// A non-AUTH command arrived before the channel authenticated.
    #[error("[1000]not found auth info")]
    NotAuthed,

    /// The AUTH command's credentials were rejected.
    #[error("[1001]invalid auth")]
    InvalidAuth,

    /// The registry driver could not be reached.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// A `lookup` call against the registry failed.
    #[error("registry lookup failed: {0}")]
    RegistryLookupFailure(String),

    /// A command handler panicked.
    #[error("[0500]internal error")]
    Internal,

    /// The engine is not running (never started, or already shut down).
    #[error("engine closed")]
    Closed,

    /// Load-balance policy could not derive a target from the request.
    #[error("no target")]
    NoTarget,

    /// An ERROR response whose `errorCode` didn't match one of the known
    /// wire codes above (e.g. a business-handler-defined error).
    #[error("remote error [{0}]: {1}")]
    Remote(String, String),
}

impl TenuredError {
    /// The wire `errorCode` string carried on an ERROR response, if this
    /// variant is one that gets surfaced back to a peer as a frame.
    pub fn wire_code(&self) -> Option<&'static str> {
        match self {
            TenuredError::NotAuthed => Some("1000"),
            TenuredError::InvalidAuth => Some("1001"),
            TenuredError::NoHandler => Some("0404"),
            TenuredError::Overloaded => Some("0429"),
            TenuredError::Internal => Some("0500"),
            _ => None,
        }
    }

    /// Reconstruct a typed error from an inbound ERROR response's wire
    /// fields, recovering the dedicated variant for known codes.
    pub fn from_wire(code: &str, message: &str) -> TenuredError {
        match code {
            "1000" => TenuredError::NotAuthed,
            "1001" => TenuredError::InvalidAuth,
            "0404" => TenuredError::NoHandler,
            "0429" => TenuredError::Overloaded,
            "0500" => TenuredError::Internal,
            _ => TenuredError::Remote(code.to_string(), message.to_string()),
        }
    }
}

/// Frame-decode failures (spec: FRAME CODEC).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds max frame size {1}")]
    FrameTooLarge(u32, u32),

    #[error("section lengths ({0}) do not sum to declared total ({1})")]
    LengthMismatch(u32, u32),

    #[error("invalid utf-8 in {0} section")]
    InvalidUtf8(&'static str),

    #[error("frame too short: need at least {0} bytes, header only has {1}")]
    Truncated(usize, usize),

    #[error("{0} section of {1} bytes exceeds the 65535-byte length-prefix field")]
    SectionTooLarge(&'static str, usize),
}
