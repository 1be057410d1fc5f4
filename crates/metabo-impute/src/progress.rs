//! Progress reporting and cancellation support for EM fits.
//!
//! This module provides types for tracking fit progress and supporting
//! cancellation from external threads (e.g., a scheduler that aborts a
//! batch of imputations).
//!
//! # Example
//!
//! ```rust,ignore
//! use metabo_impute::{ImputationEngine, CancellationToken};
//!
//! let token = CancellationToken::new();
//! let token_clone = token.clone();
//!
//! // In another thread
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     token_clone.cancel();
//! });
//!
//! let result = ImputationEngine::builder()
//!     .cancellation_token(token)
//!     .on_progress(|update| {
//!         println!("[{:?}] {}", update.stage, update.message);
//!     })
//!     .build()?
//!     .fit_impute(&matrix)?;
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// States of the EM driver.
///
/// `Initialized → Iterating → Converged | MaxIterationsReached | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStage {
    /// Patterns indexed and starting parameters estimated
    Initialized,
    /// Alternating E- and M-steps
    Iterating,
    /// Both tolerances satisfied
    Converged,
    /// Iteration cap, deadline or cancellation hit before convergence
    MaxIterationsReached,
    /// The fit returned an error
    Failed,
}

impl FitStage {
    /// Returns a human-readable name for the stage.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Iterating => "Iterating",
            Self::Converged => "Converged",
            Self::MaxIterationsReached => "Max Iterations Reached",
            Self::Failed => "Failed",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Converged | Self::MaxIterationsReached | Self::Failed
        )
    }

    /// Whether `next` is a legal successor of this stage.
    pub fn can_transition_to(&self, next: FitStage) -> bool {
        match self {
            // a budget may run out before the first iteration
            Self::Initialized => matches!(
                next,
                Self::Iterating | Self::MaxIterationsReached | Self::Failed
            ),
            Self::Iterating => matches!(
                next,
                Self::Iterating | Self::Converged | Self::MaxIterationsReached | Self::Failed
            ),
            _ => false,
        }
    }
}

/// A progress update emitted by the EM driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Current driver stage
    pub stage: FitStage,

    /// Completed M-steps (0 before the first)
    pub iteration: usize,

    /// Iteration cap of the fit
    pub max_iter: usize,

    /// Penalized objective at the current parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objective: Option<f64>,

    /// Relative parameter change of the last M-step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_change: Option<f64>,

    /// Human-readable message describing current activity
    pub message: String,
}

impl ProgressUpdate {
    /// Creates a progress update without numeric diagnostics.
    pub fn new(stage: FitStage, iteration: usize, max_iter: usize, message: impl Into<String>) -> Self {
        Self {
            stage,
            iteration,
            max_iter,
            objective: None,
            parameter_change: None,
            message: message.into(),
        }
    }

    /// Creates an update for a completed iteration.
    pub fn iteration(
        iteration: usize,
        max_iter: usize,
        objective: f64,
        parameter_change: Option<f64>,
    ) -> Self {
        Self {
            stage: FitStage::Iterating,
            iteration,
            max_iter,
            objective: Some(objective),
            parameter_change,
            message: format!("Iteration {}/{}: objective {:.6e}", iteration, max_iter, objective),
        }
    }

    /// Fraction of the iteration budget used (0.0 - 1.0).
    pub fn progress(&self) -> f32 {
        if self.stage.is_terminal() && self.stage != FitStage::Failed {
            return 1.0;
        }
        if self.max_iter == 0 {
            0.0
        } else {
            (self.iteration as f32 / self.max_iter as f32).clamp(0.0, 1.0)
        }
    }
}

/// Trait for receiving progress updates during fitting.
///
/// Implementations must be `Send + Sync` so a single reporter can be shared
/// by fits running on different threads.
pub trait ProgressReporter: Send + Sync {
    /// Called once per state transition and once per EM iteration.
    ///
    /// Implementations should be cheap and non-blocking.
    fn report(&self, update: ProgressUpdate);
}

/// Wrapper that implements [`ProgressReporter`] using a closure.
///
/// # Example
///
/// ```rust,ignore
/// ImputationEngine::builder()
///     .on_progress(|update| {
///         println!("[{:.0}%] {}", update.progress() * 100.0, update.message);
///     })
///     .build()?
///     .fit_impute(&matrix);
/// ```
pub struct ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    callback: F,
}

impl<F> ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    /// Creates a new closure-based progress reporter.
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressReporter for ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate) {
        (self.callback)(update);
    }
}

/// Token for stopping a running fit early.
///
/// The driver checks the token before every iteration. A cancelled fit is
/// not an error: it ends in [`FitStatus::MaxIterationsReached`] with the
/// parameters reached so far, flagged with
/// [`BudgetExhausted::Cancelled`](crate::types::BudgetExhausted::Cancelled).
///
/// [`FitStatus::MaxIterationsReached`]: crate::types::FitStatus::MaxIterationsReached
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(CancellationToken: Send, Sync);
static_assertions::assert_impl_all!(ProgressUpdate: Send, Sync);

impl CancellationToken {
    /// Creates a new cancellation token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Thread-safe.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if [`cancel()`](Self::cancel) has been called on this
    /// token or any of its clones.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused for another fit.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}
