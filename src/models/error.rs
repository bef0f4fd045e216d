//! Error types for privaudit.
//!
//! Taxonomy:
//! - Expected failures: bad configuration, too little data to audit
//! - Infrastructure failures: device-bound training jobs, storage IO
//! - Invariant violations: bugs, closed channels

use thiserror::Error;

/// Top-level error type for privaudit.
#[derive(Debug, Error)]
pub enum AuditError {
    // ═══════════════════════════════════════════════════════════════════
    // EXPECTED: run parameters or data cannot support the audit
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE: devices and storage
    // ═══════════════════════════════════════════════════════════════════

    #[error("Training job {job} failed on {device} after {attempts} attempts: {message}")]
    TrainingJob {
        job: String,
        device: String,
        attempts: u32,
        message: String,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INVARIANT VIOLATED: bug, should not happen
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl AuditError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Shorthand for an `InsufficientData` error.
    pub fn insufficient(message: impl Into<String>) -> Self {
        Self::InsufficientData(message.into())
    }

    /// Whether the failure was caused by configuration rather than by data or devices.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Result type alias for privaudit.
pub type Result<T> = std::result::Result<T, AuditError>;
