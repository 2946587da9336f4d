//! # Decode Stream Error Types
//!
//! Error types surfaced by the decoder selector and the decoder stream.
//!
//! Ordinary decode failures are *not* errors at this level: they travel through
//! [`ReadOutcome::DecodeError`](crate::decoder_stream::ReadOutcome) so the
//! consumer can react per read. The variants below cover selection failures,
//! caller contract violations and teardown.

use thiserror::Error;

/// Errors that can occur while driving a decoder stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeStreamError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// The stream configuration is missing or cannot be decoded.
    #[error("Invalid decoder configuration: {0}")]
    InvalidConfig(String),

    /// Pipeline configuration failed validation.
    #[error("Invalid pipeline configuration: {0}")]
    InvalidPipelineConfig(String),

    // ========================================================================
    // Selection Errors
    // ========================================================================
    /// Every candidate decoder failed to initialize, or the stream is
    /// encrypted and no decryption path exists.
    #[error("No decoder could be selected for the {0} stream")]
    NoDecoderSelected(String),

    /// A single decoder rejected its configuration.
    #[error("Decoder {decoder} failed to initialize: {reason}")]
    DecoderInitFailed { decoder: String, reason: String },

    /// The CDM never produced a decryptor.
    #[error("Decryptor unavailable: {0}")]
    DecryptorUnavailable(String),

    // ========================================================================
    // Contract Violations
    // ========================================================================
    /// An operation that needs a selected decoder was issued too early.
    #[error("Decoder stream not initialized")]
    NotInitialized,

    /// `initialize` was called twice.
    #[error("Decoder stream already initialized")]
    AlreadyInitialized,

    /// A second `read` was issued while one is outstanding.
    #[error("A read is already pending")]
    ReadAlreadyPending,

    /// A `read` or `reset` was issued while a reset is outstanding.
    #[error("A reset is pending")]
    ResetPending,

    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// The decoder stream was dropped before the operation completed.
    #[error("Decoder stream shut down")]
    Shutdown,

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DecodeStreamError {
    /// Returns `true` if the caller broke the read/reset contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            DecodeStreamError::NotInitialized
                | DecodeStreamError::AlreadyInitialized
                | DecodeStreamError::ReadAlreadyPending
                | DecodeStreamError::ResetPending
        )
    }

    /// Returns `true` if this error means no working decoder was found.
    pub fn is_selection_failure(&self) -> bool {
        matches!(
            self,
            DecodeStreamError::NoDecoderSelected(_)
                | DecodeStreamError::DecoderInitFailed { .. }
                | DecodeStreamError::DecryptorUnavailable(_)
        )
    }
}

/// Result type for decode stream operations.
pub type Result<T> = std::result::Result<T, DecodeStreamError>;
