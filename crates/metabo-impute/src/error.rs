//! Error types for the EM imputation engine.
//!
//! The taxonomy follows the engine contract: malformed input, numerical
//! instability of the covariance estimate, and a violated likelihood
//! monotonicity check. Hitting the iteration cap is *not* an error, see
//! [`FitStatus`](crate::types::FitStatus).
//!
//! Errors are serializable so downstream tooling (evaluation harnesses,
//! report generators) can record them next to successful fits.

use serde::Serialize;
use serde::ser::SerializeStruct;
use thiserror::Error;

/// The main error type for the imputation engine.
#[derive(Error, Debug)]
pub enum ImputationError {
    /// Malformed input matrix (shape mismatch, empty rows or features, non-finite values).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The regularized covariance is not positive definite for the current λ.
    ///
    /// Retrying with a larger regularization strength may succeed.
    #[error(
        "Numerical instability in {context}: smallest eigenvalue {min_eigenvalue:.3e} with lambda {lambda:.3e}"
    )]
    NumericalInstability {
        context: String,
        min_eigenvalue: f64,
        lambda: f64,
    },

    /// The EM objective decreased between two iterations.
    #[error(
        "Log-likelihood decreased at iteration {iteration}: {previous:.12e} -> {current:.12e}"
    )]
    ConvergenceViolation {
        iteration: usize,
        previous: f64,
        current: f64,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal invariant violation (a bug, never a user error).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Polars error wrapper.
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ImputationError>,
    },
}

impl ImputationError {
    /// Add context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ImputationError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a [`NumericalInstability`](Self::NumericalInstability) error.
    pub fn numerical(context: impl Into<String>, min_eigenvalue: f64, lambda: f64) -> Self {
        ImputationError::NumericalInstability {
            context: context.into(),
            min_eigenvalue,
            lambda,
        }
    }

    /// Get a stable error code for callers that dispatch on the failure kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NumericalInstability { .. } => "NUMERICAL_INSTABILITY",
            Self::ConvergenceViolation { .. } => "CONVERGENCE_VIOLATION",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Polars(_) => "POLARS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WithContext { source, .. } => source.error_code(),
        }
    }

    /// Whether the caller may retry the same fit with a larger λ.
    ///
    /// The engine itself never escalates λ.
    pub fn is_retryable_with_larger_lambda(&self) -> bool {
        match self {
            Self::NumericalInstability { .. } => true,
            Self::WithContext { source, .. } => source.is_retryable_with_larger_lambda(),
            _ => false,
        }
    }
}

/// Errors are serialized as a struct with `code` and `message` fields.
impl Serialize for ImputationError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("ImputationError", 2)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias for imputation operations.
pub type Result<T> = std::result::Result<T, ImputationError>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, polars::error::PolarsError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ImputationError::Polars(e).with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(
            ImputationError::InvalidInput("empty".to_string()).error_code(),
            "INVALID_INPUT"
        );
        assert_eq!(
            ImputationError::numerical("initial covariance", -1e-3, 0.0).error_code(),
            "NUMERICAL_INSTABILITY"
        );
        assert_eq!(
            ImputationError::ConvergenceViolation {
                iteration: 3,
                previous: -10.0,
                current: -11.0
            }
            .error_code(),
            "CONVERGENCE_VIOLATION"
        );
    }

    #[test]
    fn test_retryable_only_for_numerical_instability() {
        assert!(ImputationError::numerical("m-step", 0.0, 0.0).is_retryable_with_larger_lambda());
        assert!(
            ImputationError::numerical("m-step", 0.0, 0.0)
                .with_context("iteration 4")
                .is_retryable_with_larger_lambda()
        );
        assert!(!ImputationError::InvalidInput("x".to_string()).is_retryable_with_larger_lambda());
        assert!(!ImputationError::Internal("x".to_string()).is_retryable_with_larger_lambda());
    }

    #[test]
    fn test_error_serialization() {
        let error = ImputationError::InvalidInput("row 3 is entirely missing".to_string());
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("INVALID_INPUT"));
        assert!(json.contains("row 3"));
    }

    #[test]
    fn test_with_context() {
        let error = ImputationError::numerical("covariance", -0.5, 0.0).with_context("M-step 7");
        assert!(error.to_string().contains("M-step 7"));
        assert_eq!(error.error_code(), "NUMERICAL_INSTABILITY");
    }

    #[test]
    fn test_numerical_message_includes_lambda() {
        let error = ImputationError::numerical("initial covariance", 1e-14, 0.0);
        let message = error.to_string();
        assert!(message.contains("initial covariance"));
        assert!(message.contains("lambda"));
    }
}
