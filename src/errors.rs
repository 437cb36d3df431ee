//! Error taxonomy for the correlator core.
//!
//! Configuration errors are fatal at construction; everything else is scoped
//! to a single chunk or integration so the run can continue and account for
//! data loss precisely.

use thiserror::Error;

/// Result type for correlator operations.
pub type FxResult<T> = Result<T, FxError>;

#[derive(Error, Debug)]
pub enum FxError {
    /// Invalid configuration, rejected before any data is processed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A gap or reversal in frame sequence numbers from a source.
    /// Recoverable: the current partial integration is discarded and
    /// processing resumes from the next valid frame.
    #[error("source desynchronisation: expected frame {expected}, got {got}")]
    SourceDesync { expected: u64, got: u64 },

    /// A shape or content problem fatal to one chunk, not the run.
    #[error("processing error on frame {seq}: {reason}")]
    Processing { seq: u64, reason: String },

    /// The output sink failed to persist one integration.
    #[error("sink failed for integration {index}: {reason}")]
    Sink { index: u64, reason: String },

    /// An artifact container that cannot be decoded.
    #[error("malformed artifact file: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("attribute encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl FxError {
    pub fn config(msg: impl Into<String>) -> Self {
        FxError::Config(msg.into())
    }

    pub fn processing(seq: u64, reason: impl Into<String>) -> Self {
        FxError::Processing {
            seq,
            reason: reason.into(),
        }
    }
}
