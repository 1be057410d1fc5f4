//! Imputation engine facade.
//!
//! This module provides the `ImputationEngine` struct and builder, plus the
//! free functions [`fit_impute`] and [`fit_impute_masked`] for one-off fits.

use crate::config::{ConfigValidationError, EmConfig};
use crate::em::{EmDriver, FitContext};
use crate::error::Result;
use crate::progress::{CancellationToken, ClosureProgressReporter, ProgressReporter, ProgressUpdate};
use crate::types::{ImputationResult, IntensityMatrix};
use nalgebra::DMatrix;
use std::sync::Arc;
use tracing::{error, info};

/// Fits a regularized multivariate Gaussian by EM and completes the matrix.
///
/// Use [`ImputationEngine::builder()`] to attach a configuration, a progress
/// reporter or a cancellation token. The engine holds no state between calls;
/// one engine can serve many fits, including concurrent ones.
///
/// # Example
///
/// ```rust,ignore
/// use metabo_impute::{EmConfig, ImputationEngine, IntensityMatrix};
///
/// let matrix = IntensityMatrix::from_rows(&rows)?;
/// let result = ImputationEngine::builder()
///     .config(EmConfig::with_lambda(0.1))
///     .on_progress(|update| println!("{}", update.message))
///     .build()?
///     .fit_impute(&matrix)?;
///
/// if result.warning {
///     eprintln!("EM stopped early: {:?}", result.status);
/// }
/// ```
pub struct ImputationEngine {
    config: EmConfig,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
    cancellation_token: Option<CancellationToken>,
}

static_assertions::assert_impl_all!(ImputationEngine: Send, Sync);

impl ImputationEngine {
    /// Create a new engine builder.
    pub fn builder() -> ImputationEngineBuilder {
        ImputationEngineBuilder::default()
    }

    pub fn config(&self) -> &EmConfig {
        &self.config
    }

    /// Fit the model to `matrix` and return the completed matrix with
    /// diagnostics.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for an empty matrix, a fully missing row or feature,
    ///   or a forced complete-case start without complete rows;
    /// - `NumericalInstability` when the regularized covariance is not
    ///   positive definite for the configured λ;
    /// - `ConvergenceViolation` when the objective decreases.
    ///
    /// Running out of iterations, time or being cancelled is not an error;
    /// see [`FitStatus`](crate::types::FitStatus).
    pub fn fit_impute(&self, matrix: &IntensityMatrix) -> Result<ImputationResult> {
        let mut context = FitContext::new(self.config.time_budget);
        if let Some(token) = &self.cancellation_token {
            context = context.with_cancellation(token.clone());
        }
        if let Some(reporter) = &self.progress_reporter {
            context = context.with_reporter(reporter.clone());
        }

        let outcome = match EmDriver::new(matrix, &self.config, &context).run() {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Imputation failed: {}", e);
                return Err(e);
            }
        };
        let duration = context.elapsed();

        info!(
            "Imputation finished in {:.2?}: {:?} after {} iterations (lambda = {:.3e}, {} conditional rows)",
            duration,
            outcome.status,
            outcome.iterations,
            outcome.lambda,
            outcome.conditional_predictions
        );

        Ok(ImputationResult {
            completed: outcome.completed,
            parameters: outcome.parameters,
            trace: outcome.trace,
            warning: !outcome.status.is_converged(),
            status: outcome.status,
            lambda: outcome.lambda,
            init_strategy: outcome.init_strategy,
            n_patterns: outcome.n_patterns,
            conditional_predictions: outcome.conditional_predictions,
            iterations: outcome.iterations,
            duration,
        })
    }
}

/// Builder for [`ImputationEngine`].
#[derive(Default)]
pub struct ImputationEngineBuilder {
    config: Option<EmConfig>,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
    cancellation_token: Option<CancellationToken>,
}

static_assertions::assert_impl_all!(ImputationEngineBuilder: Send);

impl ImputationEngineBuilder {
    /// Set the EM configuration.
    pub fn config(mut self, config: EmConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set a progress reporter for receiving updates during fitting.
    pub fn progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    /// Set a progress callback closure.
    ///
    /// This is a convenience method for simple progress handling.
    /// For more complex scenarios, use [`progress_reporter`](Self::progress_reporter).
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_reporter = Some(Arc::new(ClosureProgressReporter::new(callback)));
        self
    }

    /// Set a cancellation token for stopping fits early.
    ///
    /// A cancelled fit returns the parameters reached so far with
    /// `FitStatus::MaxIterationsReached { budget: Cancelled }`.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> std::result::Result<ImputationEngine, ConfigValidationError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        Ok(ImputationEngine {
            config,
            progress_reporter: self.progress_reporter,
            cancellation_token: self.cancellation_token,
        })
    }
}

/// Fit and impute with a one-off engine.
pub fn fit_impute(matrix: &IntensityMatrix, config: &EmConfig) -> Result<ImputationResult> {
    ImputationEngine::builder()
        .config(config.clone())
        .build()?
        .fit_impute(matrix)
}

/// [`fit_impute`] for a raw value matrix and observation mask (`true` = observed).
pub fn fit_impute_masked(
    values: &DMatrix<f64>,
    mask: &DMatrix<bool>,
    config: &EmConfig,
) -> Result<ImputationResult> {
    let matrix = IntensityMatrix::new(values.clone(), mask.clone())?;
    fit_impute(&matrix, config)
}
