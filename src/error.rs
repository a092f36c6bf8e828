//! Error types for natswire.

use thiserror::Error;

use crate::protocol::parser::ParseState;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error (INFO and CONNECT bodies).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Fatal framing error from the wire parser.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Protocol violation outside the parser (bad handshake sequence,
    /// malformed header block, invalid server URL).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Subject failed local validation (empty, or contains whitespace/CRLF).
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    /// Payload exceeds the server-announced maximum.
    #[error("payload size {size} exceeds server maximum {max_payload}")]
    MaxPayloadExceeded { size: usize, max_payload: usize },

    /// Authorization or authentication rejected by the server.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The server denied a publish or subscribe on a specific subject.
    #[error("permissions violation for {operation} on {subject:?}")]
    Permissions {
        operation: PermissionOperation,
        subject: String,
    },

    /// A request found no responders on its subject.
    #[error("no responders available for request")]
    NoResponders,

    /// A request or flush did not complete within its deadline.
    #[error("timed out")]
    Timeout,

    /// Generic `-ERR` from the server that maps to no narrower variant.
    #[error("server error: {0}")]
    Server(String),

    /// Heartbeat monitor declared the connection unresponsive.
    #[error("stale connection")]
    StaleConnection,

    /// The connection dropped; the operation may be retried after reconnect.
    #[error("connection lost")]
    Disconnected,

    /// The connection is shutting down and refuses new work.
    #[error("connection draining")]
    Draining,

    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Every server in the pool was tried and rejected the connection.
    #[error("no servers available for connection")]
    NoServersAvailable,
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal framing error raised by the wire parser.
///
/// Carries the parser state at the point of failure and a small window of
/// the offending bytes, escaped for display. Parse errors are never
/// recoverable mid-stream; the connection must be torn down.
#[derive(Debug, Error)]
#[error("parse error in {state:?}: {message} near [{window}]")]
pub struct ParseError {
    /// Parser state when the error was raised.
    pub state: ParseState,
    /// Human-readable description of the violation.
    pub message: String,
    /// Escaped view of the bytes around the failure offset.
    pub window: String,
}

impl ParseError {
    /// Build a parse error with a byte window around `pos` in `chunk`.
    pub(crate) fn new(
        state: ParseState,
        message: impl Into<String>,
        chunk: &[u8],
        pos: usize,
    ) -> Self {
        let start = pos.saturating_sub(8);
        let end = (pos + 8).min(chunk.len());
        let window = chunk[start..end]
            .iter()
            .flat_map(|b| b.escape_ascii())
            .map(char::from)
            .collect();
        Self {
            state,
            message: message.into(),
            window,
        }
    }
}

/// The operation a server permission error applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOperation {
    /// Publish to a subject was denied.
    Publish,
    /// Subscription to a subject was denied.
    Subscription,
}

impl std::fmt::Display for PermissionOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publish => f.write_str("publish"),
            Self::Subscription => f.write_str("subscription"),
        }
    }
}

/// Classified form of a server `-ERR` line.
///
/// The server sends free-text descriptions; routing depends on the class:
/// permission errors go to the specific subscription or pending request,
/// auth errors feed the reconnect abort heuristic, staleness forces a
/// reconnect, and the rest are recorded as the connection's last error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Permissions violation for a publish or subscription.
    Permissions {
        operation: PermissionOperation,
        subject: String,
        queue: Option<String>,
    },
    /// Credentials rejected, expired, or not presented in time.
    Authentication(String),
    /// Server-side staleness probe gave up on this connection.
    StaleConnection,
    /// Anything else.
    Other(String),
}

impl ServerError {
    /// Classify the description text of a `-ERR` line.
    pub fn classify(description: &str) -> Self {
        let lowered = description.to_ascii_lowercase();
        if lowered.starts_with("permissions violation") {
            let operation = if lowered.contains("subscription") {
                PermissionOperation::Subscription
            } else {
                PermissionOperation::Publish
            };
            return Self::Permissions {
                operation,
                subject: quoted_segment(description, 0).unwrap_or_default(),
                queue: quoted_segment(description, 1),
            };
        }
        if lowered.contains("authorization violation")
            || lowered.contains("authentication expired")
            || lowered.contains("authentication timeout")
        {
            return Self::Authentication(description.to_string());
        }
        if lowered.contains("stale connection") {
            return Self::StaleConnection;
        }
        Self::Other(description.to_string())
    }

    /// True for errors that feed the consecutive-auth-failure abort check.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Extract the nth double-quoted segment from an error description.
///
/// The server quotes subjects and queue names, e.g.
/// `Permissions Violation for Subscription to "foo.bar" using queue "q"`.
fn quoted_segment(text: &str, n: usize) -> Option<String> {
    let mut parts = text.split('"');
    parts.next()?;
    for _ in 0..n {
        parts.next()?;
        parts.next()?;
    }
    parts.next().map(str::to_string)
}
