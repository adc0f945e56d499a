//! Error types for pledgerun.
//!
//! Taxonomy:
//! - B_i falsified: Expected failures (missing input, corrupt store)
//! - I^B materialized: Remote page failures (navigation, confirmation timeout)
//! - Hard stops: Conditions no retry can fix (verification challenge)

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::browser::CdpError;

/// Top-level error type for pledgerun.
#[derive(Debug, Error)]
pub enum PledgeError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Row source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("Checkpoint store corrupt: {path}: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Remote page misbehaved (consumes a retry)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("No success confirmation within {0:?}")]
    ConfirmationTimeout(Duration),

    #[error("Form field not found: {0}")]
    FieldNotFound(String),

    #[error("Browser error: {0}")]
    Browser(#[from] CdpError),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // HARD STOP — No safe automated way forward
    // ═══════════════════════════════════════════════════════════════════

    #[error("Human verification challenge detected: {marker}")]
    VerificationChallenge { marker: String },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PledgeError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a source error for the given path.
    pub fn source_unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable within the current row.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Navigation(_)
                | Self::ConfirmationTimeout(_)
                | Self::FieldNotFound(_)
                | Self::Browser(_)
                | Self::Io { .. }
        )
    }

    /// Check if this error must end the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. }
                | Self::VerificationChallenge { .. }
                | Self::Config(_)
                | Self::Internal(_)
        )
    }
}

/// Result type alias for pledgerun.
pub type Result<T> = std::result::Result<T, PledgeError>;
