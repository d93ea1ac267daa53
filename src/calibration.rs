//! Calibration helpers for the instrumentation-unit polynomials.
//!
//! The device evaluates `INS1`/`INS2` as `c0 + c1*x + ... + c5*x^5`. These helpers fit such a
//! polynomial to calibration points and compute the blank (baseline) value for `RATB`.

use crate::error::{AppResult, Cn0503Error};
use crate::model::channel::POLYNOMIAL_LEN;
use nalgebra::{DMatrix, DVector};

/// Highest polynomial order the firmware evaluates.
pub const MAX_ORDER: usize = POLYNOMIAL_LEN - 1;

/// Least-squares polynomial fit of `y` against `x`.
///
/// Returns [`POLYNOMIAL_LEN`] coefficients, low to high order, zero padded above `order`.
pub fn fit_polynomial(x: &[f64], y: &[f64], order: usize) -> AppResult<Vec<f64>> {
    if x.len() != y.len() {
        return Err(Cn0503Error::Calibration(format!(
            "{} x values but {} y values",
            x.len(),
            y.len()
        )));
    }
    if order > MAX_ORDER {
        return Err(Cn0503Error::Calibration(format!(
            "Only polynomials up to order {MAX_ORDER} are allowed"
        )));
    }
    if x.len() < order + 1 {
        return Err(Cn0503Error::Calibration(format!(
            "{} points cannot determine an order {order} polynomial. Please add points",
            x.len()
        )));
    }

    let vandermonde = DMatrix::from_fn(x.len(), order + 1, |row, col| x[row].powi(col as i32));
    let targets = DVector::from_column_slice(y);
    let solution = vandermonde
        .svd(true, true)
        .solve(&targets, 1e-12)
        .map_err(|e| Cn0503Error::Calibration(e.to_string()))?;

    let mut coefficients: Vec<f64> = solution.iter().copied().collect();
    coefficients.resize(POLYNOMIAL_LEN, 0.0);
    Ok(coefficients)
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Evaluate a low-to-high coefficient polynomial at `x`.
pub fn evaluate(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}
