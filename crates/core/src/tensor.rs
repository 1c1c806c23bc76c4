//! Tensor types and low-level operations.

use ndarray::{Array2, ArrayD, Axis};

/// Scalar type for trainable parameters.
pub type Scalar = f64;

/// Dynamic-dimensional tensor.
pub type Tensor = ArrayD<Scalar>;

/// Compute L2 norm of a tensor, handling NaN/inf.
pub fn l2_norm(t: &Tensor) -> f64 {
    sum_of_squares(t).sqrt()
}

/// Sum of squared entries; NaN if any entry is NaN, +inf if any is infinite.
pub fn sum_of_squares(t: &Tensor) -> f64 {
    let mut sum_sq: f64 = 0.0;
    for &v in t.iter() {
        if v.is_nan() {
            return f64::NAN;
        }
        if !v.is_finite() {
            return f64::INFINITY;
        }
        sum_sq += v * v;
    }
    sum_sq
}

/// L2-normalize each row of a feature matrix.
///
/// Rows with zero norm divide to NaN; every non-finite entry of the output is
/// replaced by zero so evaluation metrics never see NaNs.
pub fn l2_normalize_rows(features: &Array2<Scalar>) -> Array2<Scalar> {
    let mut out = features.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        row.mapv_inplace(|v| v / norm);
    }
    out.mapv_inplace(|v| if v.is_finite() { v } else { 0.0 });
    out
}
