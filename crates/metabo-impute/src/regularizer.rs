//! Ridge regularization of the covariance estimate.
//!
//! Every covariance the engine works with goes through [`regularize`]:
//! exact symmetrization, then `+ λI`, then a positive-definiteness check.
//! The engine never raises λ on its own; a failed check is reported to the
//! caller as [`ImputationError::NumericalInstability`].

use crate::config::Regularization;
use crate::error::{ImputationError, Result};
use nalgebra::{Cholesky, DMatrix, Dyn};
use tracing::debug;

/// Smallest eigenvalue (relative to `max(1, λ_max)`) accepted as positive.
pub const MIN_EIGENVALUE_TOL: f64 = 1e-10;

/// `(A + Aᵀ) / 2`.
pub fn symmetrize(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    (matrix + matrix.transpose()) * 0.5
}

/// Smallest and largest eigenvalue of a symmetric matrix.
pub fn eigenvalue_range(matrix: &DMatrix<f64>) -> (f64, f64) {
    let eigenvalues = matrix.clone().symmetric_eigenvalues();
    let min = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    let max = eigenvalues.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

/// `sym(Σ_raw) + λI`, checked for positive definiteness.
pub fn regularize(raw: &DMatrix<f64>, lambda: f64) -> Result<DMatrix<f64>> {
    if !raw.is_square() {
        return Err(ImputationError::Internal(format!(
            "covariance must be square, got {:?}",
            raw.shape()
        )));
    }

    if raw.iter().any(|v| !v.is_finite()) {
        return Err(ImputationError::numerical(
            "covariance has non-finite entries",
            f64::NAN,
            lambda,
        ));
    }

    let mut regularized = symmetrize(raw);
    for i in 0..regularized.nrows() {
        regularized[(i, i)] += lambda;
    }

    let (min_eig, max_eig) = eigenvalue_range(&regularized);
    if min_eig <= MIN_EIGENVALUE_TOL * max_eig.abs().max(1.0) {
        return Err(ImputationError::numerical(
            "regularized covariance is not positive definite",
            min_eig,
            lambda,
        ));
    }

    Ok(regularized)
}

/// Cholesky factor of a regularized covariance.
///
/// Must succeed whenever [`regularize`] succeeded; a failure is reported as
/// the same numerical instability.
pub fn cholesky_factor(matrix: &DMatrix<f64>) -> Result<Cholesky<f64, Dyn>> {
    Cholesky::new(matrix.clone()).ok_or_else(|| {
        let (min_eig, _) = eigenvalue_range(matrix);
        ImputationError::numerical("Cholesky factorization failed", min_eig, f64::NAN)
    })
}

/// A regularized covariance together with its Cholesky factor.
#[derive(Debug, Clone)]
pub struct RegularizedCovariance {
    matrix: DMatrix<f64>,
    factor: Cholesky<f64, Dyn>,
    lambda: f64,
}

impl RegularizedCovariance {
    pub fn new(raw: &DMatrix<f64>, lambda: f64) -> Result<Self> {
        let matrix = regularize(raw, lambda)?;
        let factor = cholesky_factor(&matrix).map_err(|e| match e {
            ImputationError::NumericalInstability {
                context,
                min_eigenvalue,
                ..
            } => ImputationError::NumericalInstability {
                context,
                min_eigenvalue,
                lambda,
            },
            other => other,
        })?;
        Ok(Self {
            matrix,
            factor,
            lambda,
        })
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn factor(&self) -> &Cholesky<f64, Dyn> {
        &self.factor
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn into_matrix(self) -> DMatrix<f64> {
        self.matrix
    }

    /// `log |Σ|` from the diagonal of the Cholesky factor.
    pub fn log_determinant(&self) -> f64 {
        log_determinant(&self.factor)
    }

    /// `tr(Σ⁻¹)`, used by the ridge penalty of the EM objective.
    pub fn trace_of_inverse(&self) -> f64 {
        self.factor.inverse().trace()
    }
}

/// `log |A|` for `A = L Lᵀ`.
pub fn log_determinant(factor: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * factor.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// Resolve the configured rule into a concrete λ.
///
/// `initial` is the unregularized starting covariance and `n_samples` the
/// number of rows in the data.
pub fn resolve_lambda(rule: Regularization, initial: &DMatrix<f64>, n_samples: usize) -> f64 {
    let lambda = match rule {
        Regularization::Fixed(lambda) => lambda,
        Regularization::FeatureSampleRatio { scale } => {
            let p = initial.nrows() as f64;
            let mean_variance = initial.diagonal().mean();
            scale * (p / n_samples.max(1) as f64) * mean_variance.max(0.0)
        }
        Regularization::MedianEigenvalue { fraction } => {
            let mut eigenvalues: Vec<f64> = symmetrize(initial)
                .symmetric_eigenvalues()
                .iter()
                .copied()
                .collect();
            eigenvalues.sort_by(|a, b| a.total_cmp(b));
            fraction * median_of_sorted(&eigenvalues).max(0.0)
        }
    };

    debug!("Resolved regularization {:?} to lambda = {:.6e}", rule, lambda);
    lambda
}

fn median_of_sorted(values: &[f64]) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}
