//! The EM loop.
//!
//! ```text
//! index patterns → initialize μ₀, Σ₀ → resolve λ → E-step
//!   repeat: M-step → E-step → convergence check
//! ```
//!
//! The completed matrix always comes from the E-step run under the final
//! parameters, so imputed values and reported parameters agree.

use crate::conditional::{ConditionalPredictor, EStep};
use crate::config::EmConfig;
use crate::em::convergence::{ConvergenceMonitor, Verdict};
use crate::em::init;
use crate::error::{ImputationError, Result, ResultExt};
use crate::patterns::{self, PatternIndex};
use crate::progress::{CancellationToken, FitStage, ProgressReporter, ProgressUpdate};
use crate::regularizer::{RegularizedCovariance, resolve_lambda};
use crate::types::{
    BudgetExhausted, ConvergenceTrace, FitStatus, GaussianParameters, InitStrategy,
    IntensityMatrix, relative_parameter_change,
};
use nalgebra::{DMatrix, DVector};
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Per-call state of a fit: clock, budgets and observers.
///
/// A fresh context is created for every call, so concurrent fits never share
/// anything mutable.
#[derive(Clone)]
pub struct FitContext {
    started: Instant,
    time_budget: Option<Duration>,
    cancellation: Option<CancellationToken>,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl FitContext {
    pub fn new(time_budget: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            time_budget,
            cancellation: None,
            reporter: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The budget that has run out, if any. Cancellation wins over the deadline.
    pub fn exhausted_budget(&self) -> Option<BudgetExhausted> {
        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Some(BudgetExhausted::Cancelled);
        }
        match self.time_budget {
            Some(budget) if self.elapsed() >= budget => Some(BudgetExhausted::Deadline),
            _ => None,
        }
    }

    fn report(&self, update: ProgressUpdate) {
        if let Some(reporter) = &self.reporter {
            reporter.report(update);
        }
    }
}

impl std::fmt::Debug for FitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitContext")
            .field("elapsed", &self.elapsed())
            .field("time_budget", &self.time_budget)
            .field("cancellable", &self.cancellation.is_some())
            .field("has_reporter", &self.reporter.is_some())
            .finish()
    }
}

/// Everything the driver produces; the engine adds timing and the warning flag.
#[derive(Debug, Clone)]
pub struct EmOutcome {
    pub completed: DMatrix<f64>,
    pub parameters: GaussianParameters,
    pub trace: ConvergenceTrace,
    pub status: FitStatus,
    pub lambda: f64,
    pub init_strategy: InitStrategy,
    pub n_patterns: usize,
    pub conditional_predictions: usize,
    pub iterations: usize,
}

/// Runs one EM fit over a validated matrix.
pub struct EmDriver<'a> {
    data: &'a IntensityMatrix,
    config: &'a EmConfig,
    context: &'a FitContext,
    /// Iteration in progress, 0 during initialization.
    iteration: Cell<usize>,
}

impl<'a> EmDriver<'a> {
    pub fn new(data: &'a IntensityMatrix, config: &'a EmConfig, context: &'a FitContext) -> Self {
        Self {
            data,
            config,
            context,
            iteration: Cell::new(0),
        }
    }

    /// Fit the model and complete the matrix.
    pub fn run(&self) -> Result<EmOutcome> {
        let outcome = self.fit();
        if let Err(e) = &outcome {
            self.context.report(self.failure_update(e));
        }
        outcome
    }

    fn failure_update(&self, error: &ImputationError) -> ProgressUpdate {
        let iteration = match error {
            ImputationError::ConvergenceViolation { iteration, .. } => *iteration,
            _ => self.iteration.get(),
        };
        ProgressUpdate::new(
            FitStage::Failed,
            iteration,
            self.config.max_iter,
            error.to_string(),
        )
    }

    fn fit(&self) -> Result<EmOutcome> {
        let config = self.config;
        let values = self.data.values();
        let index = patterns::index(self.data.mask())?;
        let n_samples = index.n_samples();
        let init_strategy =
            init::choose_strategy(config.init_policy, &index, config.min_complete_rows)?;
        let (initial_mean, initial_raw) =
            init::initial_moments(init_strategy, self.data, &index)?;
        let lambda = resolve_lambda(config.regularization, &initial_raw, n_samples);

        info!(
            "Starting EM fit: {} samples x {} features, {} patterns, {:.1}% missing, {:?} init, lambda = {:.3e}",
            n_samples,
            self.data.n_features(),
            index.n_patterns(),
            self.data.missing_fraction() * 100.0,
            init_strategy,
            lambda
        );

        let mut mean = initial_mean;
        let mut covariance =
            RegularizedCovariance::new(&initial_raw, lambda).context("initial covariance")?;
        let mut e_step = self.e_step(&mean, &covariance, &index)?;

        let mut monitor =
            ConvergenceMonitor::new(config.tol, config.param_tol, config.monotonicity_tol);
        let objective = penalized_objective(&e_step, &covariance, n_samples);
        monitor.record_initial(e_step.statistics.log_likelihood, objective);

        self.context.report(ProgressUpdate::new(
            FitStage::Initialized,
            0,
            config.max_iter,
            format!("Initialized with {:?}", init_strategy),
        ));

        let mut status = None;
        let mut iterations = 0;

        for iteration in 1..=config.max_iter {
            if let Some(budget) = self.context.exhausted_budget() {
                warn!(
                    "EM stopped before iteration {}: {:?} budget exhausted",
                    iteration, budget
                );
                status = Some(FitStatus::MaxIterationsReached { budget });
                break;
            }
            self.iteration.set(iteration);

            // M-step
            let (next_mean, raw) = e_step.statistics.moments()?;
            let next_covariance = RegularizedCovariance::new(&raw, lambda)
                .context(format!("M-step {}", iteration))?;
            let change = relative_parameter_change(
                (&next_mean, next_covariance.matrix()),
                (&mean, covariance.matrix()),
            );
            mean = next_mean;
            covariance = next_covariance;
            iterations = iteration;

            e_step = self.e_step(&mean, &covariance, &index)?;
            let log_likelihood = e_step.statistics.log_likelihood;
            let objective = penalized_objective(&e_step, &covariance, n_samples);

            debug!(
                "Iteration {}: log-likelihood {:.10e}, objective {:.10e}, change {:.3e}",
                iteration, log_likelihood, objective, change
            );
            self.context.report(ProgressUpdate::iteration(
                iteration,
                config.max_iter,
                objective,
                Some(change),
            ));

            match monitor.observe(iteration, log_likelihood, objective, change) {
                Verdict::Continue => {}
                Verdict::Converged => {
                    status = Some(FitStatus::Converged);
                    break;
                }
                Verdict::Violation { previous, current } => {
                    error!(
                        "Objective decreased at iteration {}: {:.12e} -> {:.12e}",
                        iteration, previous, current
                    );
                    return Err(ImputationError::ConvergenceViolation {
                        iteration,
                        previous,
                        current,
                    });
                }
            }
        }

        let status = status.unwrap_or(FitStatus::MaxIterationsReached {
            budget: BudgetExhausted::Iterations,
        });

        match status {
            FitStatus::Converged => {
                info!("EM converged after {} iterations", iterations);
                self.context.report(ProgressUpdate::new(
                    FitStage::Converged,
                    iterations,
                    config.max_iter,
                    format!("Converged after {} iterations", iterations),
                ));
            }
            FitStatus::MaxIterationsReached { budget } => {
                warn!(
                    "EM did not converge after {} iterations ({:?}); returning best-effort estimate",
                    iterations, budget
                );
                self.context.report(ProgressUpdate::new(
                    FitStage::MaxIterationsReached,
                    iterations,
                    config.max_iter,
                    format!("Stopped after {} iterations ({:?})", iterations, budget),
                ));
            }
        }

        let completed = e_step.complete(values);
        let conditional_predictions = e_step.statistics.conditional_rows;

        Ok(EmOutcome {
            completed,
            parameters: GaussianParameters::new(mean, covariance.into_matrix()),
            trace: monitor.into_trace(),
            status,
            lambda,
            init_strategy,
            n_patterns: index.n_patterns(),
            conditional_predictions,
            iterations,
        })
    }

    fn e_step(
        &self,
        mean: &DVector<f64>,
        covariance: &RegularizedCovariance,
        index: &PatternIndex,
    ) -> Result<EStep> {
        ConditionalPredictor::new(mean, covariance).e_step(
            self.data.values(),
            index,
            self.config.parallel,
        )
    }
}

/// `ℓ − (nλ/2)·tr(Σ⁻¹)`, the quantity EM with a ridge M-step never decreases.
fn penalized_objective(e_step: &EStep, covariance: &RegularizedCovariance, n_samples: usize) -> f64 {
    let log_likelihood = e_step.statistics.log_likelihood;
    let lambda = covariance.lambda();
    if lambda > 0.0 {
        log_likelihood - 0.5 * n_samples as f64 * lambda * covariance.trace_of_inverse()
    } else {
        log_likelihood
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ClosureProgressReporter;
    use std::sync::Mutex;

    fn data() -> IntensityMatrix {
        IntensityMatrix::from_rows(&[
            vec![Some(1.0), Some(2.1), Some(0.4)],
            vec![Some(2.0), None, Some(0.9)],
            vec![Some(3.1), Some(6.2), None],
            vec![Some(4.0), Some(7.9), Some(2.1)],
            vec![None, Some(4.1), Some(1.0)],
            vec![Some(2.5), Some(5.0), Some(1.2)],
            vec![Some(1.5), Some(3.3), Some(0.2)],
            vec![Some(3.4), Some(6.1), Some(1.9)],
        ])
        .unwrap()
    }

    #[test]
    fn test_run_produces_consistent_outcome() {
        let data = data();
        let config = EmConfig::with_lambda(0.01);
        let context = FitContext::new(None);

        let outcome = EmDriver::new(&data, &config, &context).run().unwrap();

        assert_eq!(outcome.completed.shape(), (8, 3));
        assert_eq!(outcome.init_strategy, InitStrategy::CompleteCase);
        assert!(outcome.status.is_converged());
        assert_eq!(outcome.n_patterns, 4);
        assert_eq!(outcome.conditional_predictions, 3);
        assert_eq!(outcome.trace.len(), outcome.iterations + 1);
        assert!(outcome.trace.is_monotone(config.monotonicity_tol));
        assert_eq!(outcome.completed[(0, 0)], 1.0);
        assert!(outcome.completed.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_cancelled_before_first_iteration() {
        let data = data();
        let config = EmConfig::default();
        let token = CancellationToken::new();
        token.cancel();
        let context = FitContext::new(None).with_cancellation(token);

        let outcome = EmDriver::new(&data, &config, &context).run().unwrap();

        assert_eq!(
            outcome.status,
            FitStatus::MaxIterationsReached {
                budget: BudgetExhausted::Cancelled
            }
        );
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.trace.len(), 1);
    }

    #[test]
    fn test_zero_time_budget_stops_immediately() {
        let data = data();
        let config = EmConfig::default();
        let context = FitContext::new(Some(Duration::ZERO));

        let outcome = EmDriver::new(&data, &config, &context).run().unwrap();
        assert_eq!(
            outcome.status,
            FitStatus::MaxIterationsReached {
                budget: BudgetExhausted::Deadline
            }
        );
    }

    #[test]
    fn test_reports_stage_sequence() {
        let data = data();
        let config = EmConfig::with_lambda(0.01);
        let stages = Arc::new(Mutex::new(Vec::new()));
        let sink = stages.clone();
        let reporter = ClosureProgressReporter::new(move |update: ProgressUpdate| {
            sink.lock().unwrap().push(update.stage);
        });
        let context = FitContext::new(None).with_reporter(Arc::new(reporter));

        EmDriver::new(&data, &config, &context).run().unwrap();

        let stages = stages.lock().unwrap();
        assert_eq!(stages.first(), Some(&FitStage::Initialized));
        assert!(stages.last().is_some_and(|s| s.is_terminal()));
        for pair in stages.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failure_is_reported() {
        let data = IntensityMatrix::from_rows(&[
            vec![Some(1.0), Some(2.0), Some(3.0)],
            vec![Some(2.0), Some(4.0), Some(6.0)],
        ])
        .unwrap();
        let config = EmConfig::with_lambda(0.0);
        let failed = Arc::new(Mutex::new(None));
        let sink = failed.clone();
        let reporter = ClosureProgressReporter::new(move |update: ProgressUpdate| {
            if update.stage == FitStage::Failed {
                *sink.lock().unwrap() = Some(update.iteration);
            }
        });
        let context = FitContext::new(None).with_reporter(Arc::new(reporter));

        let err = EmDriver::new(&data, &config, &context).run().unwrap_err();
        assert!(err.is_retryable_with_larger_lambda());
        // Fails while regularizing the starting covariance.
        assert_eq!(*failed.lock().unwrap(), Some(0));
    }

    #[test]
    fn test_failure_update_carries_failing_iteration() {
        let data = data();
        let config = EmConfig::with_lambda(0.01);
        let context = FitContext::new(None);
        let driver = EmDriver::new(&data, &config, &context);

        let violation = ImputationError::ConvergenceViolation {
            iteration: 7,
            previous: -1.0,
            current: -2.0,
        };
        let update = driver.failure_update(&violation);
        assert_eq!(update.stage, FitStage::Failed);
        assert_eq!(update.iteration, 7);
        assert_eq!(update.max_iter, config.max_iter);

        driver.iteration.set(4);
        let instability =
            ImputationError::numerical("covariance", -1e-3, 0.0).with_context("M-step 4");
        let update = driver.failure_update(&instability);
        assert_eq!(update.iteration, 4);
        assert!(update.message.contains("M-step 4"));
    }

    #[test]
    fn test_indefinite_pairwise_start_is_numerical_instability() {
        let data = IntensityMatrix::from_rows(&[
            vec![Some(1.0), Some(2.1), Some(0.4)],
            vec![Some(2.0), None, Some(0.9)],
            vec![Some(3.1), Some(6.2), None],
            vec![Some(4.0), Some(7.9), Some(2.1)],
            vec![None, Some(4.1), Some(1.0)],
            vec![Some(2.5), Some(5.0), Some(1.2)],
        ])
        .unwrap();
        let config = EmConfig::builder()
            .lambda(0.1)
            .init_policy(crate::config::InitPolicy::Pairwise)
            .build()
            .unwrap();
        let context = FitContext::new(None);

        let err = EmDriver::new(&data, &config, &context).run().unwrap_err();
        assert_eq!(err.error_code(), "NUMERICAL_INSTABILITY");
        assert!(err.to_string().contains("initial covariance"));

        let config = EmConfig {
            regularization: crate::config::Regularization::Fixed(1.0),
            ..config
        };
        assert!(EmDriver::new(&data, &config, &context).run().is_ok());
    }

    #[test]
    fn test_penalized_objective_equals_log_likelihood_without_ridge() {
        let data = data();
        let config = EmConfig::with_lambda(0.0);
        let context = FitContext::new(None);
        let outcome = EmDriver::new(&data, &config, &context).run().unwrap();
        for entry in outcome.trace.entries() {
            assert_eq!(entry.log_likelihood, entry.objective);
        }
    }
}
