//! Error types for the ember serving core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for ember operations
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum EmberError {
    /// Slot reservation could not be satisfied
    #[error("Out of memory: requested {requested} slots, {available} free of {capacity}")]
    OutOfMemory {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    /// Request or call arguments are inconsistent (length mismatch, bad shard index)
    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    /// Handle table does not match the expected shard/card layout
    #[error("Transfer shape mismatch: {message}")]
    TransferShapeMismatch { message: String },

    /// The external model executor failed; fatal for the batch
    #[error("Model executor failure: {message}")]
    ModelExecutor { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Invalid parameters or configuration values
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Operation not valid in the current state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Not found errors
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Scheduling/queue errors
    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    /// Request was cancelled
    #[error("Request cancelled: {message}")]
    Cancelled { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EmberError {
    /// Create an out-of-memory error
    pub fn out_of_memory(requested: usize, available: usize, capacity: usize) -> Self {
        Self::OutOfMemory {
            requested,
            available,
            capacity,
        }
    }

    /// Create a malformed request error
    pub fn malformed_request(message: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: message.into(),
        }
    }

    /// Create a transfer shape mismatch error
    pub fn transfer_shape_mismatch(message: impl Into<String>) -> Self {
        Self::TransferShapeMismatch {
            message: message.into(),
        }
    }

    /// Create a model executor error
    pub fn model_executor(message: impl Into<String>) -> Self {
        Self::ModelExecutor {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a scheduler error
    pub fn scheduler(message: impl Into<String>) -> Self {
        Self::Scheduler {
            message: message.into(),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the condition clears on its own (e.g. once slots are released)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EmberError::OutOfMemory { .. })
    }

    /// Whether the error must take down the batch and be surfaced to the operator
    pub fn is_fatal(&self) -> bool {
        matches!(self, EmberError::ModelExecutor { .. } | EmberError::Internal { .. })
    }

    /// Whether the error is attributable to the caller's arguments
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            EmberError::MalformedRequest { .. }
                | EmberError::TransferShapeMismatch { .. }
                | EmberError::InvalidParameter { .. }
        )
    }
}

impl From<std::io::Error> for EmberError {
    fn from(err: std::io::Error) -> Self {
        EmberError::io(err.to_string())
    }
}

impl From<serde_json::Error> for EmberError {
    fn from(err: serde_json::Error) -> Self {
        EmberError::serialization(err.to_string())
    }
}

impl From<toml::de::Error> for EmberError {
    fn from(err: toml::de::Error) -> Self {
        EmberError::config(format!("TOML parse error: {}", err))
    }
}
