//! Core data model: input matrices, fitted parameters, convergence trace and
//! the imputation result handed to downstream consumers.

use crate::error::{ImputationError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Input
// ============================================================================

/// A samples × features intensity matrix with a parallel observation mask.
///
/// `mask[(i, j)] == true` means the value at `(i, j)` was observed. Values
/// stored under missing entries are never read.
///
/// Deserialization goes through [`IntensityMatrix::new`], so a decoded matrix
/// satisfies the same shape and finiteness checks as a constructed one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawIntensityMatrix")]
pub struct IntensityMatrix {
    values: DMatrix<f64>,
    mask: DMatrix<bool>,
}

/// Unchecked wire form of [`IntensityMatrix`].
#[derive(Deserialize)]
struct RawIntensityMatrix {
    values: DMatrix<f64>,
    mask: DMatrix<bool>,
}

impl TryFrom<RawIntensityMatrix> for IntensityMatrix {
    type Error = ImputationError;

    fn try_from(raw: RawIntensityMatrix) -> Result<Self> {
        Self::new(raw.values, raw.mask)
    }
}

impl IntensityMatrix {
    /// Create a matrix from values and an observation mask.
    ///
    /// Fails if the shapes differ or an observed entry is not finite.
    pub fn new(values: DMatrix<f64>, mask: DMatrix<bool>) -> Result<Self> {
        if values.shape() != mask.shape() {
            return Err(ImputationError::InvalidInput(format!(
                "values have shape {:?} but mask has shape {:?}",
                values.shape(),
                mask.shape()
            )));
        }

        for i in 0..values.nrows() {
            for j in 0..values.ncols() {
                if mask[(i, j)] && !values[(i, j)].is_finite() {
                    return Err(ImputationError::InvalidInput(format!(
                        "observed value at row {}, feature {} is not finite",
                        i, j
                    )));
                }
            }
        }

        Ok(Self { values, mask })
    }

    /// Decode a matrix from JSON.
    ///
    /// Malformed JSON is a `Json` error; a well-formed matrix that fails the
    /// checks of [`new`](Self::new) is `InvalidInput`.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawIntensityMatrix = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    /// Wrap a matrix in which every entry is observed.
    pub fn fully_observed(values: DMatrix<f64>) -> Result<Self> {
        let mask = DMatrix::from_element(values.nrows(), values.ncols(), true);
        Self::new(values, mask)
    }

    /// Build a matrix from rows of optional values. `None` and NaN are missing.
    pub fn from_rows(rows: &[Vec<Option<f64>>]) -> Result<Self> {
        let n_rows = rows.len();
        let n_cols = rows.first().map(|r| r.len()).unwrap_or(0);

        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n_cols) {
            return Err(ImputationError::InvalidInput(format!(
                "row {} has {} values, expected {}",
                idx,
                row.len(),
                n_cols
            )));
        }

        let cell = |i: usize, j: usize| rows[i][j].filter(|v| !v.is_nan());
        let values = DMatrix::from_fn(n_rows, n_cols, |i, j| cell(i, j).unwrap_or(0.0));
        let mask = DMatrix::from_fn(n_rows, n_cols, |i, j| cell(i, j).is_some());

        Self::new(values, mask)
    }

    pub fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn mask(&self) -> &DMatrix<bool> {
        &self.mask
    }

    #[inline]
    pub fn is_observed(&self, row: usize, feature: usize) -> bool {
        self.mask[(row, feature)]
    }

    /// Number of missing entries.
    pub fn n_missing(&self) -> usize {
        self.mask.iter().filter(|observed| !**observed).count()
    }

    /// Fraction of missing entries (0.0 for an empty matrix).
    pub fn missing_fraction(&self) -> f64 {
        let total = self.mask.len();
        if total == 0 {
            0.0
        } else {
            self.n_missing() as f64 / total as f64
        }
    }

    /// Indices of rows in which every feature is observed.
    pub fn complete_rows(&self) -> Vec<usize> {
        (0..self.n_samples())
            .filter(|&i| self.mask.row(i).iter().all(|observed| *observed))
            .collect()
    }
}

// ============================================================================
// Fitted model
// ============================================================================

/// Mean vector and covariance matrix of the fitted multivariate Gaussian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianParameters {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

impl GaussianParameters {
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Self {
        Self { mean, covariance }
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }
}

/// Relative change between two parameter sets:
/// `sqrt(‖Δμ‖² + ‖ΔΣ‖_F²) / (1 + sqrt(‖μ‖² + ‖Σ‖_F²))`, relative to `current`.
pub(crate) fn relative_parameter_change(
    current: (&DVector<f64>, &DMatrix<f64>),
    previous: (&DVector<f64>, &DMatrix<f64>),
) -> f64 {
    let d_mean = (current.0 - previous.0).norm_squared();
    let d_cov = (current.1 - previous.1).norm_squared();
    let scale = (current.0.norm_squared() + current.1.norm_squared()).sqrt();
    (d_mean + d_cov).sqrt() / (1.0 + scale)
}

// ============================================================================
// Convergence trace
// ============================================================================

/// One row of the convergence trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// 0 for the initial parameters, then one entry per M-step.
    pub iteration: usize,
    /// Observed-data log-likelihood at this iteration's parameters.
    pub log_likelihood: f64,
    /// Penalized objective `ℓ − (nλ/2)·tr(Σ⁻¹)`; equals `log_likelihood` when λ = 0.
    pub objective: f64,
    /// Relative parameter change from the previous entry (`None` for iteration 0).
    pub parameter_change: Option<f64>,
}

/// Append-only record of a fit's progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceTrace {
    entries: Vec<TraceEntry>,
}

impl ConvergenceTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.entries.last()
    }

    pub fn log_likelihoods(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.log_likelihood).collect()
    }

    pub fn objectives(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.objective).collect()
    }

    /// Whether the objective never drops by more than `tol` (relative).
    pub fn is_monotone(&self, tol: f64) -> bool {
        self.entries.windows(2).all(|pair| {
            let (prev, cur) = (pair[0].objective, pair[1].objective);
            prev - cur <= tol * prev.abs().max(1.0)
        })
    }
}

// ============================================================================
// Result
// ============================================================================

/// Which budget ran out when a fit stopped without converging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetExhausted {
    Iterations,
    Deadline,
    Cancelled,
}

/// Terminal state of a successful fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum FitStatus {
    Converged,
    /// Best-effort result; the completed matrix is still usable.
    MaxIterationsReached { budget: BudgetExhausted },
}

impl FitStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, FitStatus::Converged)
    }
}

/// How the initial μ and Σ were estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStrategy {
    /// Mean and covariance of the fully-observed rows.
    CompleteCase,
    /// Per-feature means and per-pair covariances over available values.
    PairwiseAvailable,
}

/// Output of [`fit_impute`](crate::engine::fit_impute).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImputationResult {
    /// Same shape as the input; missing entries replaced by conditional expectations.
    pub completed: DMatrix<f64>,
    /// Final fitted parameters (regularized covariance).
    pub parameters: GaussianParameters,
    pub trace: ConvergenceTrace,
    pub status: FitStatus,
    /// Set whenever the fit did not converge.
    pub warning: bool,
    /// The λ actually used for this fit.
    pub lambda: f64,
    pub init_strategy: InitStrategy,
    /// Number of distinct missingness patterns.
    pub n_patterns: usize,
    /// Rows that required a conditional prediction in the final E-step.
    pub conditional_predictions: usize,
    /// Number of M-steps performed.
    pub iterations: usize,
    pub duration: Duration,
}

impl ImputationResult {
    pub fn final_log_likelihood(&self) -> Option<f64> {
        self.trace.last().map(|e| e.log_likelihood)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    #[test]
    fn test_deserialize_validates_shapes() {
        let matrix = IntensityMatrix::fully_observed(DMatrix::from_element(3, 2, 1.0)).unwrap();
        let mut json: serde_json::Value = serde_json::to_value(&matrix).unwrap();
        json["values"] = serde_json::to_value(DMatrix::from_element(3, 1, 1.0)).unwrap();

        let err = serde_json::from_value::<IntensityMatrix>(json).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Invalid input"), "{}", message);
        assert!(message.contains("values have shape (3, 1) but mask has shape (3, 2)"));
    }

    #[test]
    fn test_deserialize_round_trip() {
        let matrix = IntensityMatrix::from_rows(&[
            vec![Some(1.0), None],
            vec![Some(2.0), Some(4.0)],
        ])
        .unwrap();
        let json = serde_json::to_string(&matrix).unwrap();
        let decoded: IntensityMatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.values(), matrix.values());
        assert_eq!(decoded.mask(), matrix.mask());
    }

    #[test]
    fn test_new_rejects_shape_mismatch() {
        let values = DMatrix::<f64>::zeros(3, 2);
        let mask = DMatrix::from_element(2, 3, true);
        let err = IntensityMatrix::new(values, mask).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[test]
    fn test_new_rejects_non_finite_observed_value() {
        let values = dmatrix![1.0, f64::INFINITY; 2.0, 3.0];
        let mask = DMatrix::from_element(2, 2, true);
        assert!(IntensityMatrix::new(values, mask).is_err());
    }

    #[test]
    fn test_non_finite_value_under_missing_entry_is_ignored() {
        let values = dmatrix![1.0, f64::NAN; 2.0, 3.0];
        let mask = dmatrix![true, false; true, true];
        let matrix = IntensityMatrix::new(values, mask).unwrap();
        assert_eq!(matrix.n_missing(), 1);
    }

    #[test]
    fn test_from_rows_maps_none_and_nan_to_missing() {
        let matrix = IntensityMatrix::from_rows(&[
            vec![Some(1.0), None, Some(3.0)],
            vec![Some(4.0), Some(f64::NAN), Some(6.0)],
        ])
        .unwrap();

        assert_eq!(matrix.n_samples(), 2);
        assert_eq!(matrix.n_features(), 3);
        assert!(!matrix.is_observed(0, 1));
        assert!(!matrix.is_observed(1, 1));
        assert_eq!(matrix.n_missing(), 2);
        assert!((matrix.missing_fraction() - 2.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_from_rows_rejects_ragged_rows() {
        let result = IntensityMatrix::from_rows(&[vec![Some(1.0), Some(2.0)], vec![Some(3.0)]]);
        assert!(result.is_err());
    }

    #[test]
    fn test_complete_rows() {
        let matrix = IntensityMatrix::from_rows(&[
            vec![Some(1.0), Some(2.0)],
            vec![None, Some(2.0)],
            vec![Some(3.0), Some(4.0)],
        ])
        .unwrap();
        assert_eq!(matrix.complete_rows(), vec![0, 2]);
    }

    #[test]
    fn test_relative_change_is_zero_for_identical_parameters() {
        let params = GaussianParameters::new(
            DVector::from_vec(vec![1.0, 2.0]),
            dmatrix![1.0, 0.5; 0.5, 2.0],
        );
        let (mean, cov) = (&params.mean, &params.covariance);
        assert_eq!(relative_parameter_change((mean, cov), (mean, cov)), 0.0);

        let shifted = DVector::from_vec(vec![1.0, 3.0]);
        let change = relative_parameter_change((&shifted, cov), (mean, cov));
        assert!(change > 0.0 && change < 1.0);
    }

    #[test]
    fn test_trace_monotonicity() {
        let mut trace = ConvergenceTrace::new();
        for (i, obj) in [-10.0, -9.0, -8.5, -8.5].iter().enumerate() {
            trace.push(TraceEntry {
                iteration: i,
                log_likelihood: *obj,
                objective: *obj,
                parameter_change: None,
            });
        }
        assert!(trace.is_monotone(1e-8));

        trace.push(TraceEntry {
            iteration: 4,
            log_likelihood: -9.0,
            objective: -9.0,
            parameter_change: Some(0.1),
        });
        assert!(!trace.is_monotone(1e-8));
        assert_eq!(trace.len(), 5);
    }

    #[test]
    fn test_fit_status_serialization() {
        let json = serde_json::to_string(&FitStatus::MaxIterationsReached {
            budget: BudgetExhausted::Deadline,
        })
        .unwrap();
        assert!(json.contains("max_iterations_reached"));
        assert!(json.contains("deadline"));
        assert_eq!(
            serde_json::to_string(&FitStatus::Converged).unwrap(),
            r#"{"status":"converged"}"#
        );
    }
}
