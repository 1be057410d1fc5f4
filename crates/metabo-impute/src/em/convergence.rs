//! Stopping rule and monotonicity self-check.

use crate::types::{ConvergenceTrace, TraceEntry};

/// Outcome of observing one EM iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Continue,
    Converged,
    /// The objective dropped by more than the tolerated amount.
    Violation { previous: f64, current: f64 },
}

/// Tracks the objective across iterations and decides when to stop.
///
/// The fit converges once the relative objective increase falls below `tol`
/// and the relative parameter change falls below `param_tol`.
#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    tol: f64,
    param_tol: f64,
    monotonicity_tol: f64,
    trace: ConvergenceTrace,
}

impl ConvergenceMonitor {
    pub fn new(tol: f64, param_tol: f64, monotonicity_tol: f64) -> Self {
        Self {
            tol,
            param_tol,
            monotonicity_tol,
            trace: ConvergenceTrace::new(),
        }
    }

    /// Record the objective at the starting parameters (iteration 0).
    pub fn record_initial(&mut self, log_likelihood: f64, objective: f64) {
        self.trace.push(TraceEntry {
            iteration: 0,
            log_likelihood,
            objective,
            parameter_change: None,
        });
    }

    /// Record one completed iteration and classify it.
    pub fn observe(
        &mut self,
        iteration: usize,
        log_likelihood: f64,
        objective: f64,
        parameter_change: f64,
    ) -> Verdict {
        let previous = self.trace.last().map(|e| e.objective);
        self.trace.push(TraceEntry {
            iteration,
            log_likelihood,
            objective,
            parameter_change: Some(parameter_change),
        });

        let Some(previous) = previous else {
            return Verdict::Continue;
        };

        let scale = previous.abs().max(1.0);
        if !objective.is_finite() || previous - objective > self.monotonicity_tol * scale {
            return Verdict::Violation {
                previous,
                current: objective,
            };
        }

        let relative_increase = (objective - previous) / scale;
        if relative_increase < self.tol && parameter_change < self.param_tol {
            Verdict::Converged
        } else {
            Verdict::Continue
        }
    }

    pub fn trace(&self) -> &ConvergenceTrace {
        &self.trace
    }

    pub fn into_trace(self) -> ConvergenceTrace {
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ConvergenceMonitor {
        ConvergenceMonitor::new(1e-6, 1e-4, 1e-8)
    }

    #[test]
    fn test_continues_while_objective_rises() {
        let mut m = monitor();
        m.record_initial(-100.0, -100.0);
        assert_eq!(m.observe(1, -90.0, -90.0, 0.5), Verdict::Continue);
        assert_eq!(m.observe(2, -89.0, -89.0, 0.01), Verdict::Continue);
        assert_eq!(m.trace().len(), 3);
    }

    #[test]
    fn test_converges_when_both_tolerances_hold() {
        let mut m = monitor();
        m.record_initial(-100.0, -100.0);
        assert_eq!(m.observe(1, -100.0, -100.0, 0.0), Verdict::Converged);
    }

    #[test]
    fn test_small_objective_change_alone_is_not_enough() {
        let mut m = monitor();
        m.record_initial(-100.0, -100.0);
        assert_eq!(m.observe(1, -100.0, -100.0, 0.5), Verdict::Continue);
    }

    #[test]
    fn test_violation_on_decrease() {
        let mut m = monitor();
        m.record_initial(-100.0, -100.0);
        let verdict = m.observe(1, -101.0, -101.0, 0.1);
        assert_eq!(
            verdict,
            Verdict::Violation {
                previous: -100.0,
                current: -101.0
            }
        );
    }

    #[test]
    fn test_rounding_noise_is_tolerated() {
        let mut m = monitor();
        m.record_initial(-1000.0, -1000.0);
        let verdict = m.observe(1, -1000.0 - 1e-9, -1000.0 - 1e-9, 0.0);
        assert_eq!(verdict, Verdict::Converged);
    }

    #[test]
    fn test_non_finite_objective_is_a_violation() {
        let mut m = monitor();
        m.record_initial(-10.0, -10.0);
        assert!(matches!(
            m.observe(1, f64::NAN, f64::NAN, 0.1),
            Verdict::Violation { .. }
        ));
    }

    #[test]
    fn test_trace_entries() {
        let mut m = monitor();
        m.record_initial(-50.0, -51.0);
        m.observe(1, -40.0, -41.0, 0.2);
        let trace = m.into_trace();

        assert_eq!(trace.entries()[0].parameter_change, None);
        assert_eq!(trace.entries()[1].parameter_change, Some(0.2));
        assert_eq!(trace.log_likelihoods(), vec![-50.0, -40.0]);
        assert_eq!(trace.objectives(), vec![-51.0, -41.0]);
    }
}
