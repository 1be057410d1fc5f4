//! Missingness pattern indexing.
//!
//! Rows that share the same set of missing features are grouped so the
//! conditional-Gaussian algebra (one Cholesky factorization of Σ_OO) is done
//! once per pattern instead of once per row.

use crate::error::{ImputationError, Result};
use nalgebra::DMatrix;
use std::collections::HashMap;

/// The observed/missing split of the feature indices for one row.
///
/// Both index lists are sorted ascending and together cover every feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MissingnessPattern {
    missing: Vec<usize>,
    observed: Vec<usize>,
}

impl MissingnessPattern {
    fn from_mask_row(mask: &DMatrix<bool>, row: usize) -> Self {
        let (observed, missing): (Vec<usize>, Vec<usize>) =
            (0..mask.ncols()).partition(|&j| mask[(row, j)]);
        Self { missing, observed }
    }

    pub fn missing(&self) -> &[usize] {
        &self.missing
    }

    pub fn observed(&self) -> &[usize] {
        &self.observed
    }

    /// True for the all-observed pattern, which needs no conditioning.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// A missingness pattern and every row that exhibits it.
#[derive(Debug, Clone)]
pub struct PatternGroup {
    pub pattern: MissingnessPattern,
    pub rows: Vec<usize>,
}

/// All pattern groups of a mask, in order of first appearance.
#[derive(Debug, Clone)]
pub struct PatternIndex {
    groups: Vec<PatternGroup>,
    n_samples: usize,
    n_features: usize,
}

impl PatternIndex {
    pub fn groups(&self) -> &[PatternGroup] {
        &self.groups
    }

    pub fn n_patterns(&self) -> usize {
        self.groups.len()
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Number of rows with no missing feature.
    pub fn n_complete_rows(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.pattern.is_complete())
            .map(|g| g.rows.len())
            .sum()
    }

    /// Rows with no missing feature, ascending.
    pub fn complete_rows(&self) -> Vec<usize> {
        self.groups
            .iter()
            .find(|g| g.pattern.is_complete())
            .map(|g| g.rows.clone())
            .unwrap_or_default()
    }
}

/// Group the rows of `mask` by missingness pattern.
///
/// Fails with [`ImputationError::InvalidInput`] for an empty mask, a row with
/// no observed feature, or a feature observed in no row.
pub fn index(mask: &DMatrix<bool>) -> Result<PatternIndex> {
    let (n_samples, n_features) = mask.shape();

    if n_samples == 0 || n_features == 0 {
        return Err(ImputationError::InvalidInput(format!(
            "matrix must have at least one sample and one feature, got {}x{}",
            n_samples, n_features
        )));
    }

    let empty_rows: Vec<usize> = (0..n_samples)
        .filter(|&i| mask.row(i).iter().all(|observed| !*observed))
        .collect();
    if !empty_rows.is_empty() {
        return Err(ImputationError::InvalidInput(format!(
            "{} sample(s) have no observed features: {:?}",
            empty_rows.len(),
            empty_rows
        )));
    }

    let empty_features: Vec<usize> = (0..n_features)
        .filter(|&j| mask.column(j).iter().all(|observed| !*observed))
        .collect();
    if !empty_features.is_empty() {
        return Err(ImputationError::InvalidInput(format!(
            "{} feature(s) are missing in every sample: {:?}",
            empty_features.len(),
            empty_features
        )));
    }

    let mut position: HashMap<MissingnessPattern, usize> = HashMap::new();
    let mut groups: Vec<PatternGroup> = Vec::new();

    for row in 0..n_samples {
        let pattern = MissingnessPattern::from_mask_row(mask, row);
        match position.get(&pattern) {
            Some(&idx) => groups[idx].rows.push(row),
            None => {
                position.insert(pattern.clone(), groups.len());
                groups.push(PatternGroup {
                    pattern,
                    rows: vec![row],
                });
            }
        }
    }

    Ok(PatternIndex {
        groups,
        n_samples,
        n_features,
    })
}
