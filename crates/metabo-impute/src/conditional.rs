//! Conditional-Gaussian prediction of missing entries (the E-step).
//!
//! For a pattern with observed set O and missing set M, the missing block of
//! every row in the group is replaced by
//!
//! ```text
//! μ_{M|O} = μ_M + Σ_MO Σ_OO⁻¹ (x_O − μ_O)
//! ```
//!
//! and the group's second moment receives the posterior covariance
//! `Σ_{M|O} = Σ_MM − Σ_MO Σ_OO⁻¹ Σ_OM` once per row. Σ_OO is factorized once
//! per group; `Σ_OO⁻¹ Σ_OM` is solved once per group and shared by its rows.
//!
//! # Merge order
//!
//! Each group produces its own [`SufficientStatistics`]. The parallel E-step
//! computes groups on the rayon pool but collects them in group order and
//! merges them sequentially in that order, so the floating-point summation
//! order (and therefore every bit of the result) is the same as the
//! sequential E-step regardless of the number of threads.

use crate::error::{ImputationError, Result};
use crate::patterns::{PatternGroup, PatternIndex};
use crate::regularizer::{RegularizedCovariance, log_determinant, symmetrize};
use nalgebra::{Cholesky, DMatrix, DVector};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Running sums needed by the M-step plus the observed-data log-likelihood.
#[derive(Debug, Clone, PartialEq)]
pub struct SufficientStatistics {
    /// Σ x̂ over rows (completed rows).
    pub sum_x: DVector<f64>,
    /// Σ E[x xᵀ] over rows, including posterior covariance corrections.
    pub sum_xx: DMatrix<f64>,
    pub n_rows: usize,
    pub log_likelihood: f64,
    /// Rows that needed conditioning.
    pub conditional_rows: usize,
}

impl SufficientStatistics {
    pub fn zeros(n_features: usize) -> Self {
        Self {
            sum_x: DVector::zeros(n_features),
            sum_xx: DMatrix::zeros(n_features, n_features),
            n_rows: 0,
            log_likelihood: 0.0,
            conditional_rows: 0,
        }
    }

    /// Add one completed row.
    pub fn accumulate_row(&mut self, x: &DVector<f64>) {
        self.sum_x += x;
        self.sum_xx.ger(1.0, x, x, 1.0);
        self.n_rows += 1;
    }

    /// Associative merge; callers fix the order for reproducibility.
    pub fn merge(&mut self, other: &SufficientStatistics) {
        self.sum_x += &other.sum_x;
        self.sum_xx += &other.sum_xx;
        self.n_rows += other.n_rows;
        self.log_likelihood += other.log_likelihood;
        self.conditional_rows += other.conditional_rows;
    }

    /// Maximum-likelihood mean and (unregularized) covariance.
    pub fn moments(&self) -> Result<(DVector<f64>, DMatrix<f64>)> {
        if self.n_rows == 0 {
            return Err(ImputationError::Internal(
                "cannot compute moments of zero rows".to_string(),
            ));
        }
        let n = self.n_rows as f64;
        let mean = &self.sum_x / n;
        let covariance = &self.sum_xx / n - &mean * mean.transpose();
        Ok((mean, covariance))
    }
}

/// Conditional means written back for one pattern group.
#[derive(Debug, Clone)]
pub struct GroupFill {
    pub rows: Vec<usize>,
    pub missing: Vec<usize>,
    /// `rows.len() × missing.len()`.
    pub values: DMatrix<f64>,
}

/// Per-group output of the predictor.
#[derive(Debug, Clone)]
pub struct GroupStatistics {
    pub statistics: SufficientStatistics,
    pub fill: Option<GroupFill>,
}

/// Merged output of one E-step.
#[derive(Debug, Clone)]
pub struct EStep {
    pub statistics: SufficientStatistics,
    pub fills: Vec<GroupFill>,
}

impl EStep {
    /// Copy of `values` with every missing entry replaced by its conditional mean.
    pub fn complete(&self, values: &DMatrix<f64>) -> DMatrix<f64> {
        let mut completed = values.clone();
        for fill in &self.fills {
            for (k, &row) in fill.rows.iter().enumerate() {
                for (m, &feature) in fill.missing.iter().enumerate() {
                    completed[(row, feature)] = fill.values[(k, m)];
                }
            }
        }
        completed
    }
}

/// Gaussian conditioning under a fixed (μ, Σ).
pub struct ConditionalPredictor<'a> {
    mean: &'a DVector<f64>,
    covariance: &'a RegularizedCovariance,
}

impl<'a> ConditionalPredictor<'a> {
    pub fn new(mean: &'a DVector<f64>, covariance: &'a RegularizedCovariance) -> Self {
        Self { mean, covariance }
    }

    /// Run the E-step over every pattern group of `index`.
    pub fn e_step(
        &self,
        values: &DMatrix<f64>,
        index: &PatternIndex,
        parallel: bool,
    ) -> Result<EStep> {
        let outcomes: Vec<GroupStatistics> = if parallel {
            index
                .groups()
                .par_iter()
                .map(|group| self.predict_group(values, group))
                .collect::<Result<Vec<_>>>()?
        } else {
            index
                .groups()
                .iter()
                .map(|group| self.predict_group(values, group))
                .collect::<Result<Vec<_>>>()?
        };

        let mut statistics = SufficientStatistics::zeros(index.n_features());
        let mut fills = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            statistics.merge(&outcome.statistics);
            if let Some(fill) = outcome.fill {
                fills.push(fill);
            }
        }

        Ok(EStep { statistics, fills })
    }

    /// Conditional expectations and statistics for one pattern group.
    pub fn predict_group(&self, values: &DMatrix<f64>, group: &PatternGroup) -> Result<GroupStatistics> {
        let observed = group.pattern.observed();
        let missing = group.pattern.missing();
        assert!(
            !observed.is_empty(),
            "pattern with no observed features reached the conditional predictor"
        );

        if missing.is_empty() {
            return Ok(self.complete_group(values, &group.rows));
        }

        let p = self.mean.len();
        let sigma = self.covariance.matrix();
        let k_obs = observed.len() as f64;

        let sigma_oo = submatrix(sigma, observed, observed);
        let sigma_om = submatrix(sigma, observed, missing);
        let sigma_mm = submatrix(sigma, missing, missing);

        // Principal submatrix of an SPD matrix; failure means bad block extraction.
        let chol_oo = Cholesky::new(sigma_oo).ok_or_else(|| {
            ImputationError::Internal(format!(
                "Cholesky of observed block failed for pattern missing {:?}",
                missing
            ))
        })?;
        let log_det_oo = log_determinant(&chol_oo);

        // Σ_OO⁻¹ Σ_OM, shared by every row of the group.
        let gain = chol_oo.solve(&sigma_om);
        let conditional_cov = symmetrize(&(sigma_mm - sigma_om.transpose() * &gain));

        let mu_o = subvector(self.mean, observed);
        let mu_m = subvector(self.mean, missing);

        let mut statistics = SufficientStatistics::zeros(p);
        let mut fill_values = DMatrix::zeros(group.rows.len(), missing.len());
        let mut x = DVector::zeros(p);

        for (k, &row) in group.rows.iter().enumerate() {
            let x_o = DVector::from_iterator(observed.len(), observed.iter().map(|&j| values[(row, j)]));
            let residual = &x_o - &mu_o;

            let mahalanobis = residual.dot(&chol_oo.solve(&residual));
            statistics.log_likelihood += gaussian_log_density(k_obs, log_det_oo, mahalanobis);

            let conditional_mean = &mu_m + gain.tr_mul(&residual);

            for (o, &j) in observed.iter().enumerate() {
                x[j] = x_o[o];
            }
            for (m, &j) in missing.iter().enumerate() {
                x[j] = conditional_mean[m];
                fill_values[(k, m)] = conditional_mean[m];
            }

            statistics.accumulate_row(&x);
        }

        let n_rows = group.rows.len() as f64;
        for (a, &ja) in missing.iter().enumerate() {
            for (b, &jb) in missing.iter().enumerate() {
                statistics.sum_xx[(ja, jb)] += n_rows * conditional_cov[(a, b)];
            }
        }
        statistics.conditional_rows = group.rows.len();

        Ok(GroupStatistics {
            statistics,
            fill: Some(GroupFill {
                rows: group.rows.clone(),
                missing: missing.to_vec(),
                values: fill_values,
            }),
        })
    }

    /// Fully observed rows: identity mapping, only statistics are collected.
    fn complete_group(&self, values: &DMatrix<f64>, rows: &[usize]) -> GroupStatistics {
        let p = self.mean.len();
        let factor = self.covariance.factor();
        let log_det = self.covariance.log_determinant();

        let mut statistics = SufficientStatistics::zeros(p);
        for &row in rows {
            let x = values.row(row).transpose();
            let residual = &x - self.mean;
            let mahalanobis = residual.dot(&factor.solve(&residual));
            statistics.log_likelihood += gaussian_log_density(p as f64, log_det, mahalanobis);
            statistics.accumulate_row(&x);
        }

        GroupStatistics {
            statistics,
            fill: None,
        }
    }
}

/// `log N(x; μ, Σ)` from its ingredients.
#[inline]
fn gaussian_log_density(dim: f64, log_det: f64, mahalanobis: f64) -> f64 {
    -0.5 * (dim * (2.0 * PI).ln() + log_det + mahalanobis)
}

pub(crate) fn submatrix(matrix: &DMatrix<f64>, rows: &[usize], cols: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), cols.len(), |i, j| matrix[(rows[i], cols[j])])
}

pub(crate) fn subvector(vector: &DVector<f64>, idx: &[usize]) -> DVector<f64> {
    DVector::from_iterator(idx.len(), idx.iter().map(|&i| vector[i]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns;
    use nalgebra::{dmatrix, dvector};

    fn bivariate() -> (DVector<f64>, RegularizedCovariance) {
        let mean = dvector![1.0, 2.0];
        let cov = RegularizedCovariance::new(&dmatrix![2.0, 1.0; 1.0, 2.0], 0.0).unwrap();
        (mean, cov)
    }

    #[test]
    fn test_conditional_mean_bivariate() {
        let (mean, cov) = bivariate();
        let values = dmatrix![3.0, 0.0; 1.0, 2.0];
        let mask = dmatrix![true, false; true, true];
        let index = patterns::index(&mask).unwrap();

        let predictor = ConditionalPredictor::new(&mean, &cov);
        let outcome = predictor.predict_group(&values, &index.groups()[0]).unwrap();
        let fill = outcome.fill.unwrap();

        // μ_2 + σ21/σ11 · (x1 − μ1) = 2 + 0.5 · 2
        assert!((fill.values[(0, 0)] - 3.0).abs() < 1e-12);
        assert_eq!(outcome.statistics.conditional_rows, 1);
    }

    #[test]
    fn test_second_moment_includes_conditional_variance() {
        let (mean, cov) = bivariate();
        let values = dmatrix![3.0, 0.0; 1.0, 2.0];
        let mask = dmatrix![true, false; true, true];
        let index = patterns::index(&mask).unwrap();

        let predictor = ConditionalPredictor::new(&mean, &cov);
        let stats = predictor
            .predict_group(&values, &index.groups()[0])
            .unwrap()
            .statistics;

        // E[x2²] = 3² + (2 − 1·1/2)
        assert!((stats.sum_xx[(1, 1)] - 10.5).abs() < 1e-12);
        assert!((stats.sum_xx[(0, 1)] - 9.0).abs() < 1e-12);
        assert!((stats.sum_xx[(0, 0)] - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_observed_feature_row() {
        let mean = dvector![0.0, 0.0, 0.0];
        let cov = RegularizedCovariance::new(
            &dmatrix![1.0, 0.5, 0.2; 0.5, 1.0, 0.3; 0.2, 0.3, 1.0],
            0.0,
        )
        .unwrap();
        let values = dmatrix![0.0, 2.0, 0.0; 0.1, 0.2, 0.3];
        let mask = dmatrix![false, true, false; true, true, true];
        let index = patterns::index(&mask).unwrap();

        let predictor = ConditionalPredictor::new(&mean, &cov);
        let outcome = predictor.predict_group(&values, &index.groups()[0]).unwrap();
        let fill = outcome.fill.unwrap();

        assert_eq!(fill.missing, vec![0, 2]);
        assert!((fill.values[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((fill.values[(0, 1)] - 0.6).abs() < 1e-12);
        assert!(outcome.statistics.log_likelihood.is_finite());
    }

    #[test]
    fn test_complete_group_log_likelihood() {
        let mean = dvector![0.0, 0.0];
        let cov = RegularizedCovariance::new(&dmatrix![1.0, 0.0; 0.0, 1.0], 0.0).unwrap();
        let values = dmatrix![0.0, 0.0];
        let mask = dmatrix![true, true];
        let index = patterns::index(&mask).unwrap();

        let predictor = ConditionalPredictor::new(&mean, &cov);
        let outcome = predictor.predict_group(&values, &index.groups()[0]).unwrap();

        assert!(outcome.fill.is_none());
        assert_eq!(outcome.statistics.conditional_rows, 0);
        assert!((outcome.statistics.log_likelihood + (2.0 * PI).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_e_step_parallel_matches_sequential_bitwise() {
        let mean = dvector![1.0, -1.0, 0.5];
        let cov = RegularizedCovariance::new(
            &dmatrix![1.0, 0.3, 0.1; 0.3, 2.0, 0.4; 0.1, 0.4, 1.5],
            0.01,
        )
        .unwrap();
        let values = dmatrix![
            1.2, -0.8, 0.0;
            0.0, -1.5, 0.7;
            0.9, 0.0, 0.2;
            1.1, -0.9, 0.4;
            0.0, 0.0, 0.9
        ];
        let mask = dmatrix![
            true, true, false;
            false, true, true;
            true, false, true;
            true, true, true;
            false, false, true
        ];
        let index = patterns::index(&mask).unwrap();
        let predictor = ConditionalPredictor::new(&mean, &cov);

        let sequential = predictor.e_step(&values, &index, false).unwrap();
        let parallel = predictor.e_step(&values, &index, true).unwrap();

        assert_eq!(sequential.statistics, parallel.statistics);
        assert_eq!(
            sequential.complete(&values),
            parallel.complete(&values)
        );
    }

    #[test]
    fn test_complete_keeps_observed_entries() {
        let (mean, cov) = bivariate();
        let values = dmatrix![3.0, 99.0; 1.0, 2.5];
        let mask = dmatrix![true, false; true, true];
        let index = patterns::index(&mask).unwrap();

        let e_step = ConditionalPredictor::new(&mean, &cov)
            .e_step(&values, &index, false)
            .unwrap();
        let completed = e_step.complete(&values);

        assert_eq!(completed[(0, 0)], 3.0);
        assert_eq!(completed[(1, 0)], 1.0);
        assert_eq!(completed[(1, 1)], 2.5);
        assert!((completed[(0, 1)] - 3.0).abs() < 1e-12);
        assert_eq!(e_step.statistics.n_rows, 2);
    }

    #[test]
    fn test_moments_of_accumulated_rows() {
        let mut stats = SufficientStatistics::zeros(2);
        stats.accumulate_row(&dvector![1.0, 2.0]);
        stats.accumulate_row(&dvector![3.0, 6.0]);

        let (mean, cov) = stats.moments().unwrap();
        assert_eq!(mean, dvector![2.0, 4.0]);
        assert!((cov[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((cov[(1, 1)] - 4.0).abs() < 1e-12);
        assert!((cov[(0, 1)] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_moments_of_empty_statistics_is_internal_error() {
        let stats = SufficientStatistics::zeros(3);
        assert_eq!(stats.moments().unwrap_err().error_code(), "INTERNAL_ERROR");
    }
}
