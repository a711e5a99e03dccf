//! Unified error handling for the shared layer
//!
//! Configuration, validation and codec failures carry an [`ErrorContext`]
//! naming the component and operation that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub type CoreResult<T> = Result<T, CoreError>;

/// Error context providing additional information for debugging and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,
    /// Component where error originated
    pub component: String,
    /// Operation being performed when error occurred
    pub operation: Option<String>,
    /// Recovery suggestions
    pub recovery_suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: None,
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.recovery_suggestions.push(suggestion.to_string());
        self
    }
}

/// Error type for the shared layer
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        context: ErrorContext,
    },

    #[error("Codec error ({codec}): {message}")]
    Codec {
        message: String,
        codec: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },
}

impl CoreError {
    /// Create a codec error wrapping the underlying encoder/decoder failure
    pub fn codec<E>(codec: &str, operation: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Codec {
            message: format!("{} failed: {}", operation, source),
            codec: codec.to_string(),
            source: Some(Box::new(source)),
            context: ErrorContext::new("codec").with_operation(operation),
        }
    }

    /// Get the error context
    pub fn context(&self) -> &ErrorContext {
        match self {
            CoreError::Config { context, .. } => context,
            CoreError::Validation { context, .. } => context,
            CoreError::Codec { context, .. } => context,
        }
    }

    /// Log the error with appropriate level
    pub fn log(&self) {
        match self {
            CoreError::Config { .. } | CoreError::Validation { .. } => {
                error!(
                    component = %self.context().component,
                    error = %self,
                    "Configuration or validation error"
                );
            }
            CoreError::Codec { codec, .. } => {
                warn!(
                    codec = %codec,
                    operation = ?self.context().operation,
                    error = %self,
                    "Codec error"
                );
            }
        }
    }
}

/// Convenience macros for creating errors with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr, $component:expr) => {
        $crate::CoreError::Config {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file"),
        }
    };
    ($msg:expr, $component:expr, $source:expr) => {
        $crate::CoreError::Config {
            message: $msg.to_string(),
            source: Some(Box::new($source)),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file"),
        }
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr, $field:expr, $component:expr) => {
        $crate::CoreError::Validation {
            message: $msg.to_string(),
            field: Some($field.to_string()),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check the field value and format"),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_macro_carries_field() {
        let err = validation_error!("table name is empty", "table_name", "config");
        match &err {
            CoreError::Validation { field, context, .. } => {
                assert_eq!(field.as_deref(), Some("table_name"));
                assert_eq!(context.component, "config");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_codec_error_keeps_source() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = CoreError::codec("json", "decode", source);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("json"));
        assert_eq!(err.context().operation.as_deref(), Some("decode"));
        err.log();
    }
}
