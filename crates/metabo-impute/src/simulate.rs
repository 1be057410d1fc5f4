//! Synthetic data for recoverability checks: draw a complete multivariate
//! normal sample, hide a fraction of it completely at random, impute, and
//! compare against the hidden truth.

use crate::error::{ImputationError, Result};
use crate::regularizer::eigenvalue_range;
use crate::types::IntensityMatrix;
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, StandardNormal};

/// `n` rows drawn from `N(mean, covariance)` with a seeded generator.
pub fn sample_multivariate_normal(
    mean: &DVector<f64>,
    covariance: &DMatrix<f64>,
    n: usize,
    seed: u64,
) -> Result<DMatrix<f64>> {
    let p = mean.len();
    if covariance.shape() != (p, p) {
        return Err(ImputationError::InvalidInput(format!(
            "covariance has shape {:?} for a mean of length {}",
            covariance.shape(),
            p
        )));
    }

    let chol = Cholesky::new(covariance.clone()).ok_or_else(|| {
        let (min_eig, _) = eigenvalue_range(covariance);
        ImputationError::numerical("sampling covariance", min_eig, 0.0)
    })?;
    let l = chol.l();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = DMatrix::zeros(n, p);
    for i in 0..n {
        let z = DVector::<f64>::from_fn(p, |_, _| StandardNormal.sample(&mut rng));
        let x = mean + &l * z;
        samples.set_row(i, &x.transpose());
    }

    Ok(samples)
}

/// Hide `fraction` of the entries of `values` completely at random.
///
/// Entries are visited in a seeded random order and skipped when hiding them
/// would leave their row or feature with no observed value, so the result is
/// always a valid engine input. Fewer entries than requested may be hidden
/// when that constraint binds.
pub fn mask_mcar(values: &DMatrix<f64>, fraction: f64, seed: u64) -> Result<IntensityMatrix> {
    if !(0.0..1.0).contains(&fraction) {
        return Err(ImputationError::InvalidInput(format!(
            "missing fraction must be in [0, 1), got {}",
            fraction
        )));
    }

    let (n, p) = values.shape();
    let target = (fraction * (n * p) as f64).round() as usize;

    let mut cells: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| (0..p).map(move |j| (i, j)))
        .collect();
    let mut rng = StdRng::seed_from_u64(seed);
    cells.shuffle(&mut rng);

    let mut mask = DMatrix::from_element(n, p, true);
    let mut row_observed = vec![p; n];
    let mut col_observed = vec![n; p];
    let mut hidden = 0;

    for (i, j) in cells {
        if hidden == target {
            break;
        }
        if row_observed[i] > 1 && col_observed[j] > 1 {
            mask[(i, j)] = false;
            row_observed[i] -= 1;
            col_observed[j] -= 1;
            hidden += 1;
        }
    }

    IntensityMatrix::new(values.clone(), mask)
}

/// Pearson correlation between two equally long slices.
///
/// Returns `None` when either side has zero variance or fewer than two values.
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some(cov / (var_a * var_b).sqrt())
}

/// `(imputed, truth)` pairs over the entries that `masked` hides.
pub fn hidden_entries(
    masked: &IntensityMatrix,
    completed: &DMatrix<f64>,
    truth: &DMatrix<f64>,
) -> (Vec<f64>, Vec<f64>) {
    let mut imputed = Vec::new();
    let mut actual = Vec::new();
    for i in 0..masked.n_samples() {
        for j in 0..masked.n_features() {
            if !masked.is_observed(i, j) {
                imputed.push(completed[(i, j)]);
                actual.push(truth[(i, j)]);
            }
        }
    }
    (imputed, actual)
}
