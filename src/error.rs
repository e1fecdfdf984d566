//! Error types for the KNX signal bridge
//!
//! The taxonomy follows the places a failure can originate: a broken link
//! (transport), a malformed frame or line (protocol), a sample that cannot be
//! interpreted (value) and a misconfigured hysteresis (policy). Failures of the
//! outbound bus transaction have their own [`BusError`] so sessions can tell a
//! timeout from a rejected write without string matching.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure of a single outbound bus transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// No acknowledgement arrived within the configured window
    #[error("bus acknowledgement timed out after {0:?}")]
    Timeout(Duration),

    /// The bus answered with an error marker
    #[error("bus rejected write: {0}")]
    Rejected(String),

    /// The outbound connection failed or was closed by the bus
    #[error("bus connection lost: {0}")]
    ConnectionLost(String),
}

/// Error types for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Connection refused/reset/timed out on a device or bus link
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame on the bus or a malformed device line
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Sample is neither a number nor a usable symbol
    #[error("Value error: {0}")]
    Value(String),

    /// Misconfigured hysteresis setting
    #[error("Policy error: {0}")]
    Policy(String),

    /// Outbound bus transaction failed
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signal or device lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Structured error code for machine-readable error handling
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Transport errors (1000-1099)
    ConnectionRefused,
    ConnectionLost,
    ConnectionTimeout,

    // Bus errors (1100-1199)
    BusTimeout,
    BusRejected,
    BusConnectionLost,

    // Configuration errors (1200-1299)
    ConfigurationInvalid,
    PolicyInvalid,

    // Data errors (1400-1499)
    MessageMalformed,
    ValueUninterpretable,
    SignalNotFound,

    // Internal errors (1900-1999)
    InternalError,
}

impl ErrorCode {
    /// Get numeric error code
    pub fn as_number(&self) -> u32 {
        match self {
            ErrorCode::ConnectionRefused => 1001,
            ErrorCode::ConnectionLost => 1002,
            ErrorCode::ConnectionTimeout => 1003,

            ErrorCode::BusTimeout => 1101,
            ErrorCode::BusRejected => 1102,
            ErrorCode::BusConnectionLost => 1103,

            ErrorCode::ConfigurationInvalid => 1201,
            ErrorCode::PolicyInvalid => 1202,

            ErrorCode::MessageMalformed => 1401,
            ErrorCode::ValueUninterpretable => 1402,
            ErrorCode::SignalNotFound => 1403,

            ErrorCode::InternalError => 1901,
        }
    }

    /// Get error category
    pub fn category(&self) -> &'static str {
        match self.as_number() {
            1000..=1099 => "transport",
            1100..=1199 => "bus",
            1200..=1299 => "configuration",
            1400..=1499 => "data",
            1900..=1999 => "internal",
            _ => "unknown",
        }
    }
}

/// Error severity levels for log routing
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Expected, recoverable noise
    Info,
    /// Degraded but self-healing
    Warning,
    /// Needs operator attention
    Error,
    /// Process cannot continue
    Critical,
}

/// Where an error happened, for structured logs
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    /// Error code for machine processing
    pub code: ErrorCode,
    /// Component that generated the error (device name, "gateway", ...)
    pub component: String,
    /// Operation that was being performed
    pub operation: String,
    /// Additional metadata about the error
    pub metadata: HashMap<String, String>,
    /// Timestamp when error occurred
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorContext {
    /// Create new error context
    pub fn new(code: ErrorCode, component: &str, operation: &str) -> Self {
        Self {
            code,
            component: component.to_string(),
            operation: operation.to_string(),
            metadata: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Add metadata to error context
    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Error representation emitted to the log pipeline
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
    pub code: ErrorCode,
    pub code_number: u32,
    pub category: &'static str,
    pub message: String,
    pub is_retryable: bool,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: String,
    pub metadata: HashMap<String, String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl BridgeError {
    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a value error
    pub fn value<S: Into<String>>(msg: S) -> Self {
        Self::Value(msg.into())
    }

    /// Create a policy error
    pub fn policy<S: Into<String>>(msg: S) -> Self {
        Self::Policy(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Generic(anyhow::anyhow!(msg.into()))
    }

    /// Map to structured error code
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            BridgeError::Transport(_) => ErrorCode::ConnectionLost,
            BridgeError::Protocol(_) => ErrorCode::MessageMalformed,
            BridgeError::Value(_) => ErrorCode::ValueUninterpretable,
            BridgeError::Policy(_) => ErrorCode::PolicyInvalid,
            BridgeError::Bus(BusError::Timeout(_)) => ErrorCode::BusTimeout,
            BridgeError::Bus(BusError::Rejected(_)) => ErrorCode::BusRejected,
            BridgeError::Bus(BusError::ConnectionLost(_)) => ErrorCode::BusConnectionLost,
            BridgeError::Config(_) => ErrorCode::ConfigurationInvalid,
            BridgeError::NotFound(_) => ErrorCode::SignalNotFound,
            BridgeError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
                std::io::ErrorKind::TimedOut => ErrorCode::ConnectionTimeout,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => ErrorCode::ConnectionLost,
                _ => ErrorCode::InternalError,
            },
            BridgeError::Json(_) => ErrorCode::MessageMalformed,
            BridgeError::Generic(_) => ErrorCode::InternalError,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BridgeError::Config(_) => ErrorSeverity::Critical,
            BridgeError::Transport(_) | BridgeError::Io(_) => ErrorSeverity::Warning,
            BridgeError::Bus(_) => ErrorSeverity::Error,
            BridgeError::Protocol(_) | BridgeError::Json(_) => ErrorSeverity::Warning,
            BridgeError::Value(_) | BridgeError::NotFound(_) => ErrorSeverity::Info,
            BridgeError::Policy(_) => ErrorSeverity::Warning,
            BridgeError::Generic(_) => ErrorSeverity::Error,
        }
    }

    /// Check if a later attempt can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Transport(_) | BridgeError::Io(_) => true,
            BridgeError::Bus(BusError::Timeout(_) | BusError::ConnectionLost(_)) => true,
            _ => false,
        }
    }

    /// Check if error came from a broken link rather than bad data
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport(_)
                | BridgeError::Io(_)
                | BridgeError::Bus(BusError::ConnectionLost(_))
        )
    }

    /// Create a structured error from this BridgeError
    pub fn to_structured_error(&self, context: Option<ErrorContext>) -> StructuredError {
        let code = self.to_error_code();
        let context = context.unwrap_or_else(|| ErrorContext::new(code, "unknown", "unknown"));

        StructuredError {
            code,
            code_number: code.as_number(),
            category: code.category(),
            message: self.to_string(),
            is_retryable: self.is_retryable(),
            severity: self.severity(),
            component: context.component,
            operation: context.operation,
            metadata: context.metadata,
            timestamp: context.timestamp,
        }
    }
}

/// Error logging utilities
pub struct ErrorReporter;

impl ErrorReporter {
    /// Log a structured error with appropriate severity
    pub fn log_error(error: &BridgeError, context: Option<ErrorContext>) {
        let structured = error.to_structured_error(context);

        match structured.severity {
            ErrorSeverity::Critical | ErrorSeverity::Error => {
                tracing::error!(
                    error_code = structured.code_number,
                    category = structured.category,
                    component = %structured.component,
                    operation = %structured.operation,
                    retryable = structured.is_retryable,
                    "{}",
                    structured.message
                );
            }
            ErrorSeverity::Warning => {
                tracing::warn!(
                    error_code = structured.code_number,
                    category = structured.category,
                    component = %structured.component,
                    operation = %structured.operation,
                    retryable = structured.is_retryable,
                    "{}",
                    structured.message
                );
            }
            ErrorSeverity::Info => {
                tracing::debug!(
                    error_code = structured.code_number,
                    category = structured.category,
                    component = %structured.component,
                    operation = %structured.operation,
                    "{}",
                    structured.message
                );
            }
        }
    }

    /// Build a context for an error raised by `component` during `operation`
    pub fn create_context(code: ErrorCode, component: &str, operation: &str) -> ErrorContext {
        ErrorContext::new(code, component, operation)
    }
}

/// Macro for easy structured error logging
#[macro_export]
macro_rules! log_structured_error {
    ($error:expr, $component:expr, $operation:expr) => {
        $crate::error::ErrorReporter::log_error(
            &$error,
            Some($crate::error::ErrorReporter::create_context(
                $error.to_error_code(),
                $component,
                $operation,
            )),
        )
    };
}

impl From<regex::Error> for BridgeError {
    fn from(err: regex::Error) -> Self {
        BridgeError::Config(format!("Regex pattern error: {err}"))
    }
}

impl From<::config::ConfigError> for BridgeError {
    fn from(err: ::config::ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}
