//! Polars interop: build an [`IntensityMatrix`] from a DataFrame and write
//! imputed values back.

use crate::error::{ImputationError, Result, ResultExt};
use crate::types::{ImputationResult, IntensityMatrix};
use nalgebra::DMatrix;
use polars::prelude::*;
use tracing::debug;

/// Check if a DataType is numeric (integer or float).
#[inline]
pub fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}

/// Names of all numeric columns, in frame order.
pub fn numeric_columns(df: &DataFrame) -> Vec<String> {
    df.get_columns()
        .iter()
        .filter(|col| is_numeric_dtype(col.dtype()))
        .map(|col| col.name().to_string())
        .collect()
}

impl IntensityMatrix {
    /// Samples are rows of `df`, features are `columns`.
    ///
    /// Nulls and NaNs are missing. Every column must be numeric.
    pub fn from_dataframe(df: &DataFrame, columns: &[String]) -> Result<Self> {
        let n_rows = df.height();
        let n_cols = columns.len();
        let mut values = DMatrix::zeros(n_rows, n_cols);
        let mut mask = DMatrix::from_element(n_rows, n_cols, false);

        for (col_idx, col_name) in columns.iter().enumerate() {
            let series = df
                .column(col_name)
                .context(format!("feature column '{}'", col_name))?;
            if !is_numeric_dtype(series.dtype()) {
                return Err(ImputationError::InvalidInput(format!(
                    "column '{}' has non-numeric type {}",
                    col_name,
                    series.dtype()
                )));
            }

            let float_series = series.cast(&DataType::Float64)?;
            let f64_series = float_series.f64()?;

            for row_idx in 0..n_rows {
                if let Some(v) = f64_series.get(row_idx).filter(|v| !v.is_nan()) {
                    values[(row_idx, col_idx)] = v;
                    mask[(row_idx, col_idx)] = true;
                }
            }
        }

        debug!(
            "Built {}x{} intensity matrix from DataFrame",
            n_rows, n_cols
        );
        Self::new(values, mask)
    }
}

impl ImputationResult {
    /// The completed matrix as a new DataFrame, one Float64 column per feature.
    pub fn completed_dataframe(&self, columns: &[String]) -> Result<DataFrame> {
        self.check_columns(columns)?;

        let frame_columns: Vec<Column> = columns
            .iter()
            .enumerate()
            .map(|(j, name)| {
                Column::new(
                    name.as_str().into(),
                    self.completed.column(j).iter().copied().collect::<Vec<f64>>(),
                )
            })
            .collect();

        Ok(DataFrame::new(frame_columns)?)
    }

    /// Copy of `df` with the feature `columns` replaced by their completed values.
    ///
    /// Other columns (sample identifiers, group labels) are kept as they are.
    pub fn fill_dataframe(&self, df: &DataFrame, columns: &[String]) -> Result<DataFrame> {
        self.check_columns(columns)?;
        if df.height() != self.completed.nrows() {
            return Err(ImputationError::InvalidInput(format!(
                "DataFrame has {} rows but the result has {} samples",
                df.height(),
                self.completed.nrows()
            )));
        }

        let mut result_df = df.clone();
        for (j, name) in columns.iter().enumerate() {
            let series = Series::new(
                name.as_str().into(),
                self.completed.column(j).iter().copied().collect::<Vec<f64>>(),
            );
            result_df
                .replace(name, series)
                .context(format!("replacing column '{}'", name))?;
        }

        Ok(result_df)
    }

    fn check_columns(&self, columns: &[String]) -> Result<()> {
        if columns.len() != self.completed.ncols() {
            return Err(ImputationError::InvalidInput(format!(
                "{} column names given for {} features",
                columns.len(),
                self.completed.ncols()
            )));
        }
        Ok(())
    }
}
