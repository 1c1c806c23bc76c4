//! Per-parameter gradient-norm moving averages for adaptive clipping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DpError, Result};

/// Default decay of the moving average.
pub const DEFAULT_GRAD_NORM_DECAY: f64 = 0.9;

/// Exponential moving average of gradient L2 norms, keyed by parameter name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradNormTracker {
    decay: f64,
    averages: BTreeMap<String, f64>,
}

impl Default for GradNormTracker {
    fn default() -> Self {
        Self {
            decay: DEFAULT_GRAD_NORM_DECAY,
            averages: BTreeMap::new(),
        }
    }
}

impl GradNormTracker {
    /// Create a tracker; `decay` must lie in `[0, 1)`.
    pub fn new(decay: f64) -> Result<Self> {
        if !decay.is_finite() || !(0.0..1.0).contains(&decay) {
            return Err(DpError::invalid(format!(
                "grad norm decay must be in [0, 1), got {decay}"
            )));
        }
        Ok(Self {
            decay,
            averages: BTreeMap::new(),
        })
    }

    /// Fold one observed norm into the average for `name`.
    ///
    /// The first observation initializes the average. Non-finite norms are
    /// ignored.
    pub fn observe(&mut self, name: &str, norm: f64) {
        if !norm.is_finite() {
            return;
        }
        let decay = self.decay;
        self.averages
            .entry(name.to_string())
            .and_modify(|ma| *ma = decay * *ma + (1.0 - decay) * norm)
            .or_insert(norm);
    }

    /// Current average for `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.averages.get(name).copied()
    }

    /// All averages in name order.
    pub fn averages(&self) -> impl Iterator<Item = (&str, f64)> {
        self.averages.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of tracked parameters.
    pub fn len(&self) -> usize {
        self.averages.len()
    }

    /// Whether nothing has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.averages.is_empty()
    }

    /// The `p`-th percentile (0..=100) of the averages, linearly interpolated.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.averages.is_empty() || !(0.0..=100.0).contains(&p) {
            return None;
        }
        let mut values: Vec<f64> = self.averages.values().copied().collect();
        values.sort_by(f64::total_cmp);
        let rank = p / 100.0 * (values.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        Some(values[lo] + (values[hi] - values[lo]) * (rank - lo as f64))
    }
}
