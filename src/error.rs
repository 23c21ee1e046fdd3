//! Meshmap Error Types

use thiserror::Error;

use crate::member::MemberId;

/// Result type alias for meshmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Meshmap error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),

    // Channel errors
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel error: {reason} ({} faulty members)", faulty.len())]
    FaultyMembers {
        reason: String,
        faulty: Vec<MemberId>,
    },

    #[error("RPC timed out after {0:?}")]
    Timeout(std::time::Duration),

    // Value errors
    #[error("Value does not support diffs")]
    NotDiffable,

    #[error("Diff error: {0}")]
    Diff(String),

    // Lifecycle errors
    #[error("Unable to start replicated map {0}")]
    StartupFailed(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Faulty members reported by a failed group send, if any
    pub fn faulty_members(&self) -> &[MemberId] {
        match self {
            Error::FaultyMembers { faulty, .. } => faulty,
            _ => &[],
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Channel(_) | Error::FaultyMembers { .. }
        )
    }
}
