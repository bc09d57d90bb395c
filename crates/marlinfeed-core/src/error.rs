//! Error handling for Marlinfeed
//!
//! Provides error types for all layers of the application:
//! - Channel errors (file descriptor / serial line related)
//! - Protocol errors (Marlin dialect violations and timeouts)
//! - Job errors (outcome of one print job with its recovery class)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Channel error type
///
/// Represents errors on the byte channel that connects Marlinfeed to a
/// printer device, a source file or a peer socket. The channel itself keeps
/// a sticky `std::io::Error`; this type is the form it takes once an
/// operation sequence has been checked.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// An OS-level operation failed. `action` is a phrase like
    /// "opening printer device" that was current when the error hit.
    #[error("Error {action} {path}: {source}")]
    Io {
        /// What the channel was doing when the error occurred.
        action: String,
        /// The path the channel was constructed with.
        path: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The peer closed the connection.
    #[error("EOF on {path}")]
    EndOfFile {
        /// The path the channel was constructed with.
        path: String,
    },
}

/// Protocol error type
///
/// Represents violations of the Marlin serial dialect or missed protocol
/// deadlines while a job is streaming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The printer requested a resend of a line that is not in the send window.
    #[error("Illegal 'Resend' received from printer")]
    IllegalResend,

    /// More resend requests than the per-job budget allows.
    #[error("Too many 'Resend's received from printer")]
    TooManyResends,

    /// The printer kept replying with errors past the error budget.
    #[error("Persistent error state on printer => abort current job")]
    PersistentErrorState,

    /// No reply at all while at least one line was waiting for its ack.
    #[error("Printer timeout waiting for ack")]
    AckTimeout,

    /// The reply stream ended.
    #[error("EOF on printer connection")]
    ReplyStreamEnded,

    /// The handshake never produced an `ok`.
    #[error("Failed to establish connection with printer")]
    HandshakeFailed,
}

/// Recovery class of a failed job
///
/// Decides what the driver does next: advance to the next source, ignore,
/// reconnect, or reconnect after a back-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Error on the G-Code source. The printer link is still good.
    Source,
    /// Error echoing to stdout. Ignored, echoing is best effort.
    Echo,
    /// Hard printer error (open/stat failure, unreachable device).
    /// No automatic reconnect; the driver backs off first.
    PrinterHard,
    /// Soft printer error. The link is closed and reconnected on the
    /// next job.
    PrinterSoft,
}

/// Error returned by a print job, tagging the failure with its
/// recovery class.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct JobError {
    /// How the driver should recover.
    pub class: ErrorClass,
    /// What actually went wrong.
    #[source]
    pub source: Error,
}

impl JobError {
    /// Wrap an error with its recovery class.
    pub fn new(class: ErrorClass, source: impl Into<Error>) -> Self {
        JobError {
            class,
            source: source.into(),
        }
    }

    /// Convenience constructor for protocol failures, which are always
    /// soft printer errors.
    pub fn protocol(err: ProtocolError) -> Self {
        JobError::new(ErrorClass::PrinterSoft, Error::Protocol(err))
    }
}

/// Main error type for Marlinfeed
///
/// A unified error type that can represent any error from all layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Channel error
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if this is a channel error
    pub fn is_channel_error(&self) -> bool {
        matches!(self, Error::Channel(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
