//! Joint L2 clipping of update deltas.

use std::collections::BTreeMap;

use tracing::warn;

use crate::error::{DpError, Result};
use crate::tensor::{sum_of_squares, Tensor};

/// Additive constant in the clip divisor; keeps zero-norm deltas finite.
pub const CLIP_EPSILON: f64 = 1e-12;

/// Result of a clipping operation.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipReport {
    /// Original L2 norm before clipping.
    pub original_norm: f64,
    /// Whether clipping was applied.
    pub clipped: bool,
    /// Scale factor applied (1.0 if not clipped).
    pub scale: f64,
}

impl ClipReport {
    /// Report for an empty delta.
    pub fn untouched() -> Self {
        Self {
            original_norm: 0.0,
            clipped: false,
            scale: 1.0,
        }
    }
}

/// A per-key update restricted to shared floating-point parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Delta {
    values: BTreeMap<String, Tensor>,
}

impl Delta {
    /// Create an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a per-key update.
    pub fn insert<S: Into<String>>(&mut self, name: S, value: Tensor) -> Option<Tensor> {
        self.values.insert(name.into(), value)
    }

    /// Look up a per-key update.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name)
    }

    /// Iterate over `(name, update)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate mutably over `(name, update)` pairs in order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.values.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Parameter names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the delta has no keys.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// L2 norm of all values flattened into one vector.
    pub fn global_norm(&self) -> f64 {
        self.values
            .values()
            .map(sum_of_squares)
            .sum::<f64>()
            .sqrt()
    }

    /// Multiply every entry by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for value in self.values.values_mut() {
            value.mapv_inplace(|x| x * factor);
        }
    }

    /// Set every entry to zero, keeping keys and shapes.
    pub fn zero(&mut self) {
        for value in self.values.values_mut() {
            value.fill(0.0);
        }
    }
}

impl FromIterator<(String, Tensor)> for Delta {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Scale factor `min(1, clip_norm / (norm + CLIP_EPSILON))`.
pub fn clip_factor(norm: f64, clip_norm: f64) -> f64 {
    (clip_norm / (norm + CLIP_EPSILON)).min(1.0)
}

/// Clip a delta in place so its joint L2 norm is at most `clip_norm`.
///
/// All keys share one scale factor. A non-finite joint norm zeroes the delta.
pub fn clip_delta(delta: &mut Delta, clip_norm: f64) -> Result<ClipReport> {
    if !clip_norm.is_finite() || clip_norm <= 0.0 {
        return Err(DpError::invalid(format!(
            "clip_norm must be positive and finite, got {clip_norm}"
        )));
    }
    if delta.is_empty() {
        return Ok(ClipReport::untouched());
    }

    let norm = delta.global_norm();
    if !norm.is_finite() {
        warn!(norm, "non-finite delta norm, zeroing update");
        delta.zero();
        return Ok(ClipReport {
            original_norm: norm,
            clipped: true,
            scale: 0.0,
        });
    }

    let scale = clip_factor(norm, clip_norm);
    if scale < 1.0 {
        delta.scale(scale);
    }
    Ok(ClipReport {
        original_norm: norm,
        clipped: scale < 1.0,
        scale,
    })
}
