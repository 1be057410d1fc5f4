//! Expectation-maximization for a multivariate Gaussian with missing entries.

pub mod convergence;
pub mod driver;
pub mod init;

pub use convergence::{ConvergenceMonitor, Verdict};
pub use driver::{EmDriver, EmOutcome, FitContext};
pub use init::{choose_strategy, initial_moments};
