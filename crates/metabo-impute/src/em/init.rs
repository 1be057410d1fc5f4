//! Starting values for μ and Σ.

use crate::config::InitPolicy;
use crate::conditional::SufficientStatistics;
use crate::error::{ImputationError, Result};
use crate::patterns::PatternIndex;
use crate::types::{InitStrategy, IntensityMatrix};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// Pick the initialization strategy for a fit.
///
/// `min_complete_rows` defaults to `n_features + 1`, the smallest number of
/// rows for which a complete-case covariance can be full rank.
pub fn choose_strategy(
    policy: InitPolicy,
    index: &PatternIndex,
    min_complete_rows: Option<usize>,
) -> Result<InitStrategy> {
    let complete = index.n_complete_rows();
    let threshold = min_complete_rows.unwrap_or(index.n_features() + 1);

    let strategy = match policy {
        InitPolicy::Auto if complete >= threshold => InitStrategy::CompleteCase,
        InitPolicy::Auto | InitPolicy::Pairwise => InitStrategy::PairwiseAvailable,
        InitPolicy::CompleteCase if complete == 0 => {
            return Err(ImputationError::InvalidInput(
                "complete-case initialization requested but no sample is fully observed"
                    .to_string(),
            ));
        }
        InitPolicy::CompleteCase => InitStrategy::CompleteCase,
    };

    debug!(
        "Initialization: {:?} ({} complete rows, threshold {})",
        strategy, complete, threshold
    );
    Ok(strategy)
}

/// Unregularized starting mean and covariance.
pub fn initial_moments(
    strategy: InitStrategy,
    data: &IntensityMatrix,
    index: &PatternIndex,
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    match strategy {
        InitStrategy::CompleteCase => complete_case(data, index),
        InitStrategy::PairwiseAvailable => Ok(pairwise_available(data)),
    }
}

/// Moments of the fully observed rows.
///
/// Rows are accumulated in ascending order through the same routine the
/// M-step uses, so on a fully observed matrix the first M-step reproduces
/// these moments bit for bit.
fn complete_case(
    data: &IntensityMatrix,
    index: &PatternIndex,
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    let rows = index.complete_rows();
    if rows.is_empty() {
        return Err(ImputationError::InvalidInput(
            "no fully observed sample for complete-case initialization".to_string(),
        ));
    }

    let mut statistics = SufficientStatistics::zeros(data.n_features());
    for row in rows {
        statistics.accumulate_row(&data.values().row(row).transpose());
    }
    statistics.moments()
}

/// Per-feature means over observed values and per-pair covariances over
/// co-observed rows. A pair never observed together gets covariance 0.
fn pairwise_available(data: &IntensityMatrix) -> (DVector<f64>, DMatrix<f64>) {
    let (n, p) = (data.n_samples(), data.n_features());
    let values = data.values();
    let mask = data.mask();

    let mean = DVector::from_fn(p, |j, _| {
        let (sum, count) = (0..n)
            .filter(|&i| mask[(i, j)])
            .fold((0.0, 0usize), |(s, c), i| (s + values[(i, j)], c + 1));
        if count == 0 { 0.0 } else { sum / count as f64 }
    });

    let mut covariance = DMatrix::zeros(p, p);
    for a in 0..p {
        for b in a..p {
            let mut sum = 0.0;
            let mut count = 0usize;
            for i in 0..n {
                if mask[(i, a)] && mask[(i, b)] {
                    sum += (values[(i, a)] - mean[a]) * (values[(i, b)] - mean[b]);
                    count += 1;
                }
            }
            let cov = if count == 0 { 0.0 } else { sum / count as f64 };
            covariance[(a, b)] = cov;
            covariance[(b, a)] = cov;
        }
    }

    (mean, covariance)
}
