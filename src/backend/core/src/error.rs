//! Error handling for restraint.
//!
//! This module provides:
//! - A single error type with a machine-readable [`ErrorCode`]
//! - User-facing vs internal messages and source chaining
//! - Severity classification driving `tracing` output
//! - An error counter recorded through the `metrics` facade
//!
//! # Usage
//!
//! ```rust,ignore
//! use restraint_core::error::{RestraintError, Result, ErrorContext};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("schema.toml").context("Failed to read schema")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for restraint operations.
pub type Result<T> = std::result::Result<T, RestraintError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Configuration Errors (1000-1099)
    ConfigurationMissing,
    ConfigurationInvalid,

    // Storage Errors (2000-2099)
    StorageConflict,
    NotFound,
    DatabaseError,
    DatabaseConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Resolution Errors (3000-3099)
    PredicateFailed,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ConfigurationMissing => 1000,
            Self::ConfigurationInvalid => 1001,

            Self::StorageConflict => 2000,
            Self::NotFound => 2001,
            Self::DatabaseError => 2002,
            Self::DatabaseConnectionFailed => 2003,

            Self::SerializationError => 2200,

            Self::PredicateFailed => 3000,

            Self::InternalError => 9000,
        }
    }

    /// Whether the caller may retry the failed operation unchanged.
    ///
    /// Restraint itself never retries.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageConflict | Self::DatabaseConnectionFailed)
    }

    /// Get the error category name.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing | Self::ConfigurationInvalid => "configuration",
            Self::StorageConflict
            | Self::NotFound
            | Self::DatabaseError
            | Self::DatabaseConnectionFailed => "storage",
            Self::SerializationError => "serialization",
            Self::PredicateFailed => "resolution",
            Self::InternalError => "internal",
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
    /// Caller errors (bad configuration, missing rows)
    Low,
    /// Operational issues (write conflicts)
    Medium,
    /// System errors (database failures, failing predicates)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ConfigurationInvalid | ErrorCode::NotFound => Self::Low,

            ErrorCode::StorageConflict => Self::Medium,

            ErrorCode::ConfigurationMissing
            | ErrorCode::DatabaseError
            | ErrorCode::SerializationError
            | ErrorCode::PredicateFailed => Self::High,

            ErrorCode::DatabaseConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Offending entity name (set, permission, level)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Offending entity kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for restraint.
#[derive(Error, Debug)]
pub struct RestraintError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to show to operators
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for RestraintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl RestraintError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
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

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// No configuration has been registered.
    pub fn configuration_missing() -> Self {
        Self::new(
            ErrorCode::ConfigurationMissing,
            "No restraint configuration has been registered",
        )
    }

    /// The declared configuration is structurally invalid.
    ///
    /// `entity_type`/`name` identify the offending declaration.
    pub fn configuration_invalid(
        entity_type: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let entity_type = entity_type.into();
        let name = name.into();
        Self::new(
            ErrorCode::ConfigurationInvalid,
            format!("Invalid {} '{}': {}", entity_type, name, reason.into()),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &name))
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// A unique key is already taken, usually by a concurrent writer.
    pub fn conflict(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let key = key.into();
        Self::new(
            ErrorCode::StorageConflict,
            format!("{} already exists: {}", entity_type, key),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &key))
    }

    /// A caller-supplied level filter failed.
    pub fn predicate_failed(perm: &str, level: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::PredicateFailed,
            format!("Level filter for {}:{} failed", perm, level),
            reason,
        )
        .with_context("perm", perm)
        .with_context("level", level)
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

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

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
                    details = ?self.details,
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

    fn record_metrics(&self) {
        counter!(
            crate::telemetry::metrics::ERRORS_TOTAL,
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| RestraintError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| RestraintError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| RestraintError::new(ErrorCode::NotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| RestraintError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for RestraintError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::NotFound, "The requested record was not found"),
            sqlx::Error::Database(db_err) => {
                // 23505 unique_violation, 40001 serialization_failure
                let sqlstate = db_err.code();
                if matches!(sqlstate.as_deref(), Some("23505") | Some("40001")) {
                    let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                    return Self::with_internal(
                        ErrorCode::StorageConflict,
                        "A concurrent write conflicted with this operation",
                        format!("Constraint violation: {}", constraint),
                    )
                    .with_source(error);
                }
                (ErrorCode::DatabaseError, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for RestraintError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "Failed to apply migrations",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for RestraintError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<toml::de::Error> for RestraintError {
    fn from(error: toml::de::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to parse TOML",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for RestraintError {
    fn from(error: std::io::Error) -> Self {
        let (code, user_msg) = match error.kind() {
            std::io::ErrorKind::NotFound => (ErrorCode::NotFound, "File or resource not found"),
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for RestraintError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::ConfigurationMissing,
                "Required configuration not found",
            ),
            _ => (ErrorCode::ConfigurationInvalid, "Configuration is invalid"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::StorageConflict.is_retryable());
        assert!(ErrorCode::DatabaseConnectionFailed.is_retryable());
        assert!(!ErrorCode::ConfigurationInvalid.is_retryable());
        assert!(!ErrorCode::NotFound.is_retryable());
    }

    #[test]
    fn test_configuration_invalid_names_offender() {
        let error = RestraintError::configuration_invalid("perm", "can_edit", "no levels declared");
        assert_eq!(error.code(), ErrorCode::ConfigurationInvalid);
        assert!(error.user_message().contains("can_edit"));
        assert_eq!(error.details().entity_id.as_deref(), Some("can_edit"));
        assert_eq!(error.details().entity_type.as_deref(), Some("perm"));
    }

    #[test]
    fn test_not_found() {
        let error = RestraintError::not_found("perm_set", "staff");
        assert_eq!(error.code(), ErrorCode::NotFound);
        assert_eq!(error.severity(), ErrorSeverity::Low);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_predicate_failed_context() {
        let error = RestraintError::predicate_failed("can_edit", "own", "lookup failed");
        assert_eq!(error.code(), ErrorCode::PredicateFailed);
        assert!(error.details().context.contains_key("perm"));
        assert!(error.details().context.contains_key("level"));
        assert_eq!(error.internal_message(), Some("lookup failed"));
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.context("grant for staff").unwrap_err();
        assert_eq!(error.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ConfigurationInvalid),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StorageConflict),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseError),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = RestraintError::with_internal(
            ErrorCode::DatabaseError,
            "Database connection failed",
            "Connection refused: localhost:5432",
        );

        let display = format!("{}", error);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Database connection failed"));
        assert!(display.contains("Connection refused"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "schema.toml");
        let error = RestraintError::from(io);
        assert_eq!(error.code(), ErrorCode::NotFound);
    }
}
