//! Error types for the JPIP client engine

use std::io;

use thiserror::Error;

use crate::cache::descriptor::{DescriptorForm, DescriptorQualifier};

/// Result type for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a [`Transport`](crate::channel::Transport) round trip
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server could not be reached
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server answered with a non-success status
    #[error("server returned status {0}")]
    Status(u16),

    /// No answer arrived in time
    #[error("request timed out")]
    Timeout,

    /// The answer could not be interpreted
    #[error("malformed response: {0}")]
    Protocol(String),
}

/// Error types that can occur in client operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A foreground window fetch failed in transit; the caller may retry
    #[error("window fetch failed: {source}")]
    Fetch {
        #[source]
        source: TransportError,
    },

    /// The image main header could not be obtained; the session is unusable
    #[error("main header cannot be downloaded after {attempts} attempts: {source}")]
    MainHeaderUnavailable {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Requested components do not exist in the image
    #[error("invalid component range: {0}")]
    InvalidComponents(String),

    /// The view window is not a rectangle inside its frame
    #[error("invalid view window: {0}")]
    InvalidWindow(String),

    /// Illegal cache descriptor form/qualifier combination
    #[error("illegal cache descriptor: {form:?} form with {qualifier:?} qualifier")]
    InvalidCacheDescriptor {
        form: DescriptorForm,
        qualifier: DescriptorQualifier,
    },

    /// Movement probabilities out of range
    #[error("invalid movement model: {0}")]
    InvalidMovement(String),

    /// Predictive scaling model could not be loaded
    #[error("invalid scaling model: {0}")]
    InvalidScalingModel(String),

    /// Codestream geometry could not be built or queried
    #[error("codestream error: {0}")]
    Codestream(String),

    /// The decoder collaborator failed
    #[error("decode failed: {0}")]
    Decode(String),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation on a session that has been closed
    #[error("session is closed")]
    SessionClosed,

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV parsing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Whether the error leaves the session unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::MainHeaderUnavailable { .. } | Error::SessionClosed)
    }

    /// Whether repeating the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Fetch { .. })
    }
}

impl From<TransportError> for Error {
    fn from(source: TransportError) -> Self {
        Error::Fetch { source }
    }
}
