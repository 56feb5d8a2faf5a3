//! Unified error handling for VoltageEMS channel access
//!
//! Contract violations and unexpected faults share one error type. Network-shaped
//! failures (timeouts, rejected writes, disconnects) are not errors at the channel
//! surface; they are typed result values owned by the channel crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ErrorInfo - rendering record
// ============================================================================

/// Standard error information for diagnostics dumps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g. `USAGE_ERROR`)
    pub code: String,
    /// Error message
    pub message: String,
    /// Detailed error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    /// Create a new ErrorInfo with just a message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Add details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ============================================================================
// ChannelError - Main error type
// ============================================================================

/// Main error type for channel access
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    // ======================================
    // Identity Errors
    // ======================================
    #[error("Invalid channel name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    // ======================================
    // Usage Errors (programmer misuse)
    // ======================================
    #[error("Usage error: {0}")]
    UsageError(String),

    #[error("Channel handle already released: {channel}")]
    AlreadyReleased { channel: String },

    #[error("Channel already exists: {channel}")]
    AlreadyExists { channel: String },

    #[error("Channel not registered: {channel}")]
    NotRegistered { channel: String },

    // ======================================
    // Transport Errors
    // ======================================
    #[error("Transport error: {0}")]
    Transport(String),

    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ======================================
    // Internal Errors
    // ======================================
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using ChannelError
pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    pub fn invalid_name(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ChannelError::InvalidName {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        ChannelError::UsageError(msg.into())
    }

    pub fn already_released(channel: impl Into<String>) -> Self {
        ChannelError::AlreadyReleased {
            channel: channel.into(),
        }
    }

    pub fn already_exists(channel: impl Into<String>) -> Self {
        ChannelError::AlreadyExists {
            channel: channel.into(),
        }
    }

    pub fn not_registered(channel: impl Into<String>) -> Self {
        ChannelError::NotRegistered {
            channel: channel.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        ChannelError::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ChannelError::Configuration(msg.into())
    }

    /// Stable error code (for logs and diagnostics)
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidName { .. } => "INVALID_NAME",
            Self::UsageError(_) => "USAGE_ERROR",
            Self::AlreadyReleased { .. } => "ALREADY_RELEASED",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::NotRegistered { .. } => "NOT_REGISTERED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Error category (for classification)
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidName { .. } => ErrorCategory::Validation,
            Self::UsageError(_)
            | Self::AlreadyReleased { .. }
            | Self::AlreadyExists { .. }
            | Self::NotRegistered { .. } => ErrorCategory::Usage,
            Self::Transport(_) => ErrorCategory::Network,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Level the error is logged at when reported to diagnostics
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Network => Level::ERROR,
            ErrorCategory::Validation => Level::INFO,
            _ => Level::WARN,
        }
    }

    /// Convert to ErrorInfo for diagnostics dumps
    pub fn to_error_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new(self.error_code(), self.to_string());
        match self {
            Self::InvalidName { reason, .. } => info.with_details(reason.clone()),
            _ => info,
        }
    }
}

/// Error category enum - used for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Usage,
    Network,
    Internal,
}

// Conversion traits for common error types
impl From<anyhow::Error> for ChannelError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", err))
    }
}

impl From<std::num::ParseIntError> for ChannelError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::UsageError(format!("Invalid integer: {}", err))
    }
}

impl From<std::num::ParseFloatError> for ChannelError {
    fn from(err: std::num::ParseFloatError) -> Self {
        Self::UsageError(format!("Invalid float: {}", err))
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! usage_error {
    ($msg:expr) => {
        $crate::ChannelError::UsageError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::ChannelError::UsageError(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::ChannelError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::ChannelError::Configuration(format!($fmt, $($arg)*))
    };
}
