#![forbid(unsafe_code)]

// Error types for test runs and the transport collaborator

use crate::signal::Signal;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a transport backend.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Endpoint closed")]
    Closed,

    #[error("Operation rejected: {0}")]
    Rejected(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("No playable representation among: {0}")]
    UnsupportedMedia(String),
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that abort a single test run.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("Timed out after {waited:?} waiting for {channels} channels to open")]
    ChannelOpenTimeout { waited: Duration, channels: usize },

    #[error("Observed {observed} while waiting for {awaited}")]
    ClosedPrematurely { awaited: Signal, observed: Signal },

    #[error("Media source {index} exposes no stream capture capability")]
    CaptureUnsupported { index: usize },

    #[error("Echo on channel {index} did not match the payload sent")]
    EchoMismatch { index: usize },

    #[error("Timed out after {waited:?} waiting for channels to close")]
    TeardownTimeout { waited: Duration },

    #[error("Signal bus dropped while waiting for {awaited}")]
    SignalLost { awaited: Signal },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type alias for test runs
pub type HarnessResult<T> = Result<T, HarnessError>;
