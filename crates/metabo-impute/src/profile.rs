//! Missingness summary of an intensity matrix.
//!
//! Reports where values are missing before a fit and lists the problems that
//! would make [`fit_impute`](crate::engine::fit_impute) reject the matrix.

use crate::types::IntensityMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Missing-value statistics of one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMissingness {
    pub feature: usize,
    pub n_missing: usize,
    /// 0-100.
    pub pct_missing: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingnessProfile {
    pub n_samples: usize,
    pub n_features: usize,
    /// Sorted by descending `pct_missing`, ties by feature index.
    pub features: Vec<FeatureMissingness>,
    /// Missing count per sample, in row order.
    pub sample_missing: Vec<usize>,
    pub missing_fraction: f64,
    pub complete_rows: usize,
    pub n_patterns: usize,
    pub empty_samples: Vec<usize>,
    pub empty_features: Vec<usize>,
}

impl MissingnessProfile {
    pub fn from_matrix(matrix: &IntensityMatrix) -> Self {
        let (n, p) = (matrix.n_samples(), matrix.n_features());
        let mask = matrix.mask();

        let mut features: Vec<FeatureMissingness> = (0..p)
            .map(|j| {
                let n_missing = mask.column(j).iter().filter(|o| !**o).count();
                FeatureMissingness {
                    feature: j,
                    n_missing,
                    pct_missing: if n == 0 {
                        0.0
                    } else {
                        n_missing as f64 / n as f64 * 100.0
                    },
                }
            })
            .collect();
        features.sort_by(|a, b| {
            b.pct_missing
                .total_cmp(&a.pct_missing)
                .then(a.feature.cmp(&b.feature))
        });

        let sample_missing: Vec<usize> = (0..n)
            .map(|i| mask.row(i).iter().filter(|o| !**o).count())
            .collect();

        let empty_samples = (0..n)
            .filter(|&i| p > 0 && sample_missing[i] == p)
            .collect();
        let empty_features = (0..p)
            .filter(|&j| n > 0 && mask.column(j).iter().all(|o| !*o))
            .collect();

        // Distinct patterns, counted without the validity checks of `patterns::index`.
        let n_patterns = (0..n)
            .map(|i| (0..p).filter(|&j| !mask[(i, j)]).collect::<Vec<usize>>())
            .collect::<HashSet<_>>()
            .len();

        Self {
            n_samples: n,
            n_features: p,
            features,
            sample_missing,
            missing_fraction: matrix.missing_fraction(),
            complete_rows: matrix.complete_rows().len(),
            n_patterns,
            empty_samples,
            empty_features,
        }
    }

    /// Problems that make the matrix unusable for the engine.
    ///
    /// `expected_samples` adds a sample-count check, for callers that know
    /// the size of their study design.
    pub fn validate(&self, expected_samples: Option<usize>) -> Vec<String> {
        let mut problems = Vec::new();

        if self.n_samples == 0 || self.n_features == 0 {
            problems.push(format!(
                "Matrix is empty ({} samples x {} features)",
                self.n_samples, self.n_features
            ));
        }

        if let Some(expected) = expected_samples.filter(|&e| e != self.n_samples) {
            problems.push(format!(
                "Expected {} samples, got {}",
                expected, self.n_samples
            ));
        }

        if !self.empty_features.is_empty() {
            problems.push(format!(
                "Found {} completely empty features",
                self.empty_features.len()
            ));
        }

        if !self.empty_samples.is_empty() {
            problems.push(format!(
                "Found {} completely empty samples",
                self.empty_samples.len()
            ));
        }

        problems
    }

    pub fn is_valid(&self) -> bool {
        self.validate(None).is_empty()
    }

    /// Features whose missing percentage exceeds `pct` (0-100).
    pub fn features_above(&self, pct: f64) -> Vec<usize> {
        self.features
            .iter()
            .take_while(|f| f.pct_missing > pct)
            .map(|f| f.feature)
            .collect()
    }
}
