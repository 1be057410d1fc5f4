//! Configuration types for the EM imputation engine.
//!
//! This module provides configuration options using the builder pattern
//! for flexible and ergonomic engine setup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rule for choosing the ridge strength λ added to the covariance diagonal.
///
/// Data-driven rules are evaluated once, on the unregularized initial
/// covariance, and the resulting λ is held fixed for the whole fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Regularization {
    /// A constant λ chosen by the caller.
    Fixed(f64),
    /// λ = scale · (n_features / n_samples) · mean(diag Σ₀).
    FeatureSampleRatio { scale: f64 },
    /// λ = fraction · median eigenvalue of Σ₀ (clamped at zero).
    MedianEigenvalue { fraction: f64 },
}

impl Default for Regularization {
    fn default() -> Self {
        Regularization::Fixed(1e-3)
    }
}

/// Policy for picking the initialization strategy of μ and Σ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InitPolicy {
    /// Complete-case if enough fully-observed rows exist, pairwise otherwise.
    #[default]
    Auto,
    /// Always use the fully-observed rows.
    CompleteCase,
    /// Always use pairwise-available statistics.
    Pairwise,
}

/// Configuration for a single EM fit.
///
/// Use [`EmConfig::builder()`] to create a new configuration
/// with fluent API.
///
/// # Example
///
/// ```rust,ignore
/// use metabo_impute::config::{EmConfig, Regularization};
///
/// let config = EmConfig::builder()
///     .regularization(Regularization::Fixed(0.1))
///     .max_iter(200)
///     .build()?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmConfig {
    /// Ridge regularization rule.
    /// Default: Fixed(1e-3)
    pub regularization: Regularization,

    /// Relative log-likelihood increase below which the fit may stop.
    /// Default: 1e-6
    pub tol: f64,

    /// Relative parameter change below which the fit may stop.
    /// Both `tol` and `param_tol` must be satisfied.
    /// Default: 1e-4
    pub param_tol: f64,

    /// Relative decrease of the objective tolerated as floating-point noise.
    /// Anything larger is reported as a convergence violation.
    /// Default: 1e-8
    pub monotonicity_tol: f64,

    /// Maximum number of EM iterations (M-steps).
    /// Default: 100
    pub max_iter: usize,

    /// Initialization strategy policy.
    /// Default: Auto
    pub init_policy: InitPolicy,

    /// Minimum number of complete rows for `InitPolicy::Auto` to choose
    /// complete-case initialization. `None` means n_features + 1.
    /// Default: None
    pub min_complete_rows: Option<usize>,

    /// Run the per-pattern E-step on the rayon thread pool.
    /// Default: false
    pub parallel: bool,

    /// Wall-clock budget for the whole fit.
    /// Default: None
    pub time_budget: Option<Duration>,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            regularization: Regularization::default(),
            tol: 1e-6,
            param_tol: 1e-4,
            monotonicity_tol: 1e-8,
            max_iter: 100,
            init_policy: InitPolicy::default(),
            min_complete_rows: None,
            parallel: false,
            time_budget: None,
        }
    }
}

impl EmConfig {
    /// Create a new configuration builder.
    pub fn builder() -> EmConfigBuilder {
        EmConfigBuilder::default()
    }

    /// Shorthand for the default configuration with a fixed λ.
    pub fn with_lambda(lambda: f64) -> Self {
        Self {
            regularization: Regularization::Fixed(lambda),
            ..Self::default()
        }
    }

    /// Validate the configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        match self.regularization {
            Regularization::Fixed(lambda) => check_non_negative("lambda", lambda)?,
            Regularization::FeatureSampleRatio { scale } => check_non_negative("scale", scale)?,
            Regularization::MedianEigenvalue { fraction } => {
                check_non_negative("fraction", fraction)?
            }
        }

        check_positive("tol", self.tol)?;
        check_positive("param_tol", self.param_tol)?;
        check_positive("monotonicity_tol", self.monotonicity_tol)?;

        if self.max_iter == 0 {
            return Err(ConfigValidationError::InvalidMaxIter(self.max_iter));
        }

        if self.min_complete_rows == Some(0) {
            return Err(ConfigValidationError::InvalidMinCompleteRows);
        }

        Ok(())
    }
}

fn check_non_negative(field: &str, value: f64) -> Result<(), ConfigValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigValidationError::NegativeRegularization {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

fn check_positive(field: &str, value: f64) -> Result<(), ConfigValidationError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigValidationError::InvalidTolerance {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

/// Errors that can occur during configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid regularization '{field}': {value} (must be finite and >= 0)")]
    NegativeRegularization { field: String, value: f64 },

    #[error("Invalid tolerance '{field}': {value} (must be finite and > 0)")]
    InvalidTolerance { field: String, value: f64 },

    #[error("Invalid max_iter: {0} (must be at least 1)")]
    InvalidMaxIter(usize),

    #[error("Invalid min_complete_rows: must be at least 1")]
    InvalidMinCompleteRows,
}

impl From<ConfigValidationError> for crate::error::ImputationError {
    fn from(err: ConfigValidationError) -> Self {
        crate::error::ImputationError::InvalidConfig(err.to_string())
    }
}

/// Builder for [`EmConfig`] with fluent API.
#[derive(Debug, Default)]
pub struct EmConfigBuilder {
    regularization: Option<Regularization>,
    tol: Option<f64>,
    param_tol: Option<f64>,
    monotonicity_tol: Option<f64>,
    max_iter: Option<usize>,
    init_policy: Option<InitPolicy>,
    min_complete_rows: Option<usize>,
    parallel: Option<bool>,
    time_budget: Option<Duration>,
}

impl EmConfigBuilder {
    /// Set the ridge regularization rule.
    pub fn regularization(mut self, rule: Regularization) -> Self {
        self.regularization = Some(rule);
        self
    }

    /// Shorthand for `regularization(Regularization::Fixed(lambda))`.
    pub fn lambda(self, lambda: f64) -> Self {
        self.regularization(Regularization::Fixed(lambda))
    }

    /// Set the relative log-likelihood tolerance.
    pub fn tol(mut self, tol: f64) -> Self {
        self.tol = Some(tol);
        self
    }

    /// Set the relative parameter-change tolerance.
    pub fn param_tol(mut self, tol: f64) -> Self {
        self.param_tol = Some(tol);
        self
    }

    /// Set the tolerated relative decrease of the objective.
    pub fn monotonicity_tol(mut self, tol: f64) -> Self {
        self.monotonicity_tol = Some(tol);
        self
    }

    /// Set the maximum number of EM iterations.
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = Some(max_iter);
        self
    }

    /// Set the initialization policy.
    pub fn init_policy(mut self, policy: InitPolicy) -> Self {
        self.init_policy = Some(policy);
        self
    }

    /// Set the complete-row threshold used by [`InitPolicy::Auto`].
    pub fn min_complete_rows(mut self, rows: usize) -> Self {
        self.min_complete_rows = Some(rows);
        self
    }

    /// Enable or disable the parallel E-step.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = Some(parallel);
        self
    }

    /// Set a wall-clock budget for the fit.
    ///
    /// When the budget runs out the fit stops with
    /// [`FitStatus::MaxIterationsReached`](crate::types::FitStatus).
    pub fn time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    /// Build the configuration.
    ///
    /// Returns a validated `EmConfig` or an error if validation fails.
    pub fn build(self) -> Result<EmConfig, ConfigValidationError> {
        let defaults = EmConfig::default();
        let config = EmConfig {
            regularization: self.regularization.unwrap_or_default(),
            tol: self.tol.unwrap_or(defaults.tol),
            param_tol: self.param_tol.unwrap_or(defaults.param_tol),
            monotonicity_tol: self.monotonicity_tol.unwrap_or(defaults.monotonicity_tol),
            max_iter: self.max_iter.unwrap_or(defaults.max_iter),
            init_policy: self.init_policy.unwrap_or_default(),
            min_complete_rows: self.min_complete_rows,
            parallel: self.parallel.unwrap_or(false),
            time_budget: self.time_budget,
        };

        config.validate()?;
        Ok(config)
    }
}
