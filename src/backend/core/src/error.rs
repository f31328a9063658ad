//! Error handling for tickq.
//!
//! This module provides:
//! - A single error type with machine-readable codes and chaining
//! - Severity classification that drives log levels
//! - User-facing vs internal messages
//! - Error counters through the `metrics` facade
//!
//! Commit conflicts on the optimistic transaction path are *not* errors; they are
//! reported as a rejected commit and retried by the caller (see [`crate::queue::retry`]).
//!
//! # Usage
//!
//! ```rust,ignore
//! use tickq_core::error::{QueueError, Result, ErrorContext, ErrorCode};
//!
//! fn parse(raw: &str) -> Result<u64> {
//!     raw.parse::<u64>().with_error_code(ErrorCode::MalformedEntry)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Queue Errors (1000-1099)
    MalformedEntry,
    MissingPayload,
    PreconditionFailed,

    // Store Errors (2000-2099)
    StoreError,
    StoreConnectionFailed,
    StoreTimeout,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Validation Errors (4100-4199)
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::MalformedEntry => 1000,
            Self::MissingPayload => 1001,
            Self::PreconditionFailed => 1002,

            Self::StoreError => 2000,
            Self::StoreConnectionFailed => 2001,
            Self::StoreTimeout => 2002,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::InvalidInput => 4100,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "queue",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, violated preconditions)
    Low,
    /// Operational issues (timeouts)
    Medium,
    /// System errors (store failures, undecodable data)
    High,
    /// Store state that no caller could have produced through the public API
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::PreconditionFailed | ErrorCode::InvalidInput => Self::Low,

            ErrorCode::StoreTimeout => Self::Medium,

            ErrorCode::StoreError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::MalformedEntry
            | ErrorCode::MissingPayload
            | ErrorCode::StoreConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for tickq.
#[derive(Error, Debug)]
pub struct QueueError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to show to callers
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl QueueError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// A Time Index member or In-Flight descriptor that does not decode.
    pub fn malformed(what: &'static str, raw: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::MalformedEntry,
            format!("Malformed {} in store", what),
            raw,
        )
    }

    /// A required argument is missing or contradicts another one.
    pub fn precondition(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PreconditionFailed, message)
    }

    /// A due entry whose payload is gone from the payload map.
    pub fn missing_payload(job_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::MissingPayload,
            format!("Payload missing for scheduled job {}", job_id),
        )
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "tickq_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Convert the error into a [`QueueError`] with the given code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| QueueError::new(code, e.to_string()).with_source(e))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::StoreConnectionFailed, "Unable to connect to store")
        } else if error.is_timeout() {
            (ErrorCode::StoreTimeout, "Store operation timed out")
        } else {
            (ErrorCode::StoreError, "A store error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            error.to_string(),
        )
        .with_source(error)
    }
}
