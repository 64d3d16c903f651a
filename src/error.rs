//! # Error taxonomy
//!
//! Every fallible operation in this crate returns one of the variants
//! below. `Kind::is_fatal` decides whether the caller should abandon the
//! current frame and carry on (non-fatal) or tear the session down
//! (fatal).

use std::fmt;
use std::io;

use thiserror::Error;

/// Top level error type returned by every public API in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Dial or `ConnectToMe` timed out.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Algorithm identifiers differ in key agreement, or a wire value is
    /// out of the range the protocol defines for it.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// A single frame could not be carried through a pipeline stage.  The
    /// frame is dropped; downstream stages skip its id and the session
    /// continues.
    #[error("frame {frame_id} abandoned: {reason}")]
    FrameAbandoned { frame_id: u64, reason: String },

    /// A sifter received a basis list whose length does not match the
    /// local kept qubits.
    #[error("length mismatch for frame {frame_id}: expected {expected}, got {actual}")]
    LengthMismatch {
        frame_id: u64,
        expected: usize,
        actual: usize,
    },

    /// Error correction could not converge within the protocol's QBER
    /// threshold.
    #[error("reconciliation failed for sift sequence {sift_seq}: {reason}")]
    ReconciliationFailed { sift_seq: u64, reason: String },

    /// The session controller detected an unrecoverable condition.  This
    /// is fatal and triggers teardown to `Ending -> Connected`.
    #[error("session faulted: {0}")]
    SessionFaulted(String),

    /// An internal invariant was violated.  Fatal.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// Failure to (de)serialize a value to/from its wire representation.
    #[error("wire decode failed: {0}")]
    Decode(#[from] Box<bincode::ErrorKind>),

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification used by the session controller and by stage
/// workers to decide whether to keep running after an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Severity {
    /// The current frame is dropped; the stage continues with the next
    /// frame boundary.
    NonFatal,
    /// The session must tear down.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::NonFatal => write!(f, "non-fatal"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

impl Error {
    /// Classify this error into the fatal/non-fatal taxonomy.
    pub fn severity(&self) -> Severity {
        match self {
            Error::FrameAbandoned { .. } => Severity::NonFatal,
            Error::LengthMismatch { .. } => Severity::NonFatal,
            Error::ReconciliationFailed { .. } => Severity::NonFatal,
            Error::PeerUnreachable(_) => Severity::Fatal,
            Error::ProtocolMismatch(_) => Severity::Fatal,
            Error::SessionFaulted(_) => Severity::Fatal,
            Error::Internal(_) => Severity::Fatal,
            Error::Decode(_) => Severity::Fatal,
            Error::Io(_) => Severity::Fatal,
        }
    }

    /// Convenience predicate equivalent to `severity() == Severity::Fatal`.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    pub fn frame_abandoned(frame_id: u64, reason: impl Into<String>) -> Error {
        Error::FrameAbandoned {
            frame_id,
            reason: reason.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
