//! Metabolomics Missing-Value Imputation Library
//!
//! Regularized expectation-maximization for a multivariate Gaussian model of
//! metabolite intensities, built with Rust and nalgebra.
//!
//! # Overview
//!
//! Given a samples × features intensity matrix with missing entries, the
//! engine fits a mean vector and a ridge-regularized covariance matrix by EM
//! and replaces every missing entry with its conditional expectation given
//! the observed entries of the same sample.
//!
//! - **Pattern Grouping**: rows sharing a missingness pattern share one
//!   Cholesky factorization per E-step
//! - **Ridge Regularization**: `Σ + λI` keeps the covariance positive definite
//!   when features outnumber samples
//! - **Self-Checking**: the penalized objective must never decrease; a
//!   decrease is reported as an error, not hidden
//! - **Progress Reporting**: per-iteration updates with cancellation and
//!   wall-clock budgets
//! - **Polars Interop**: build matrices from DataFrames and write imputed
//!   values back
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use metabo_impute::{EmConfig, ImputationEngine, IntensityMatrix};
//!
//! let matrix = IntensityMatrix::from_rows(&[
//!     vec![Some(10.2), Some(8.1), Some(12.0)],
//!     vec![Some(11.0), None, Some(13.1)],
//!     vec![Some(9.5), Some(7.4), None],
//!     vec![Some(12.1), Some(9.8), Some(14.2)],
//! ])?;
//!
//! let result = metabo_impute::fit_impute(&matrix, &EmConfig::with_lambda(0.1))?;
//!
//! println!("Status: {:?}", result.status);
//! println!("Iterations: {}", result.iterations);
//! println!("Completed matrix: {}", result.completed);
//! ```
//!
//! # Configuration
//!
//! Use [`EmConfig`] to customize the fit:
//!
//! ```rust,ignore
//! use metabo_impute::config::*;
//!
//! let config = EmConfig::builder()
//!     .regularization(Regularization::FeatureSampleRatio { scale: 0.5 })
//!     .tol(1e-8)
//!     .max_iter(500)
//!     .init_policy(InitPolicy::Pairwise)
//!     .parallel(true)
//!     .build()?;
//! ```
//!
//! # Errors and early stops
//!
//! [`ImputationError`] distinguishes malformed input, a covariance that is not
//! positive definite for the chosen λ (retry with a larger λ), and a violated
//! monotonicity check. Running out of iterations, time, or being cancelled is
//! not an error: the result carries [`FitStatus::MaxIterationsReached`] and
//! its `warning` flag is set.
//!
//! # Progress Reporting
//!
//! ```rust,ignore
//! use metabo_impute::{CancellationToken, ImputationEngine};
//!
//! let token = CancellationToken::new();
//! let engine = ImputationEngine::builder()
//!     .cancellation_token(token.clone())
//!     .on_progress(|update| {
//!         println!("[{}] {}", update.stage.display_name(), update.message);
//!     })
//!     .build()?;
//!
//! let result = engine.fit_impute(&matrix)?;
//! ```

pub mod conditional;
pub mod config;
pub mod em;
pub mod engine;
pub mod error;
pub mod frame;
pub mod patterns;
pub mod profile;
pub mod progress;
pub mod regularizer;
pub mod simulate;
pub mod types;

// Re-exports for convenient access
pub use config::{ConfigValidationError, EmConfig, EmConfigBuilder, InitPolicy, Regularization};
pub use engine::{ImputationEngine, ImputationEngineBuilder, fit_impute, fit_impute_masked};
pub use error::{ImputationError, ResultExt};
pub use patterns::{MissingnessPattern, PatternGroup, PatternIndex};
pub use profile::{FeatureMissingness, MissingnessProfile};
pub use progress::{
    CancellationToken, ClosureProgressReporter, FitStage, ProgressReporter, ProgressUpdate,
};
pub use types::{
    BudgetExhausted, ConvergenceTrace, FitStatus, GaussianParameters, ImputationResult,
    InitStrategy, IntensityMatrix, TraceEntry,
};
