//! Server-side combination of client contributions.
//!
//! Two policy paths exist. With server-level DP every delta is re-clipped,
//! averaged without weights and perturbed with fresh Gaussian noise. Without
//! it, full client parameter sets are averaged with weights proportional to
//! their local sample counts. Both leave personalized keys untouched and both
//! compute the full update before writing, so an error never leaves the
//! global set half-updated.

use rand::Rng;
use tracing::{debug, warn};

use crate::clipping::{clip_delta, ClipReport, Delta};
use crate::error::{DpError, Result};
use crate::noise::GaussianMechanism;
use crate::params::{ParamValue, ParameterSet, PersonalizationPolicy};
use crate::tensor::Tensor;

/// Outcome of one aggregation.
#[derive(Clone, Debug, Default)]
pub struct AggregateReport {
    /// Number of contributions combined.
    pub contributors: usize,
    /// Number of global keys rewritten.
    pub keys_updated: usize,
    /// Server-side re-clip outcome per delta (DP path only).
    pub clip_reports: Vec<ClipReport>,
}

/// A client's full parameter set with its local sample count.
#[derive(Clone, Copy, Debug)]
pub struct WeightedParams<'a> {
    /// Locally trained parameters.
    pub params: &'a ParameterSet,
    /// Number of local training samples.
    pub num_samples: usize,
}

/// Combines per-client results into the global parameter set.
#[derive(Clone, Debug, Default)]
pub struct Aggregator {
    policy: PersonalizationPolicy,
}

impl Aggregator {
    /// Create an aggregator honoring `policy`.
    pub fn new(policy: PersonalizationPolicy) -> Self {
        Self { policy }
    }

    /// The exclusion policy.
    pub fn policy(&self) -> &PersonalizationPolicy {
        &self.policy
    }

    fn shared_float_keys(&self, global: &ParameterSet) -> Vec<String> {
        global
            .floats()
            .filter(|(name, _)| self.policy.is_shared(name))
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// DP aggregation: re-clip, unweighted mean, fresh noise, add to global.
    ///
    /// The noise standard deviation is `noise_multiplier * clip_norm` per
    /// output entry. Deltas are consumed.
    pub fn aggregate<R: Rng>(
        &self,
        global: &mut ParameterSet,
        deltas: Vec<Delta>,
        clip_norm: f64,
        noise_multiplier: f64,
        rng: &mut R,
    ) -> Result<AggregateReport> {
        if !noise_multiplier.is_finite() || noise_multiplier < 0.0 {
            return Err(DpError::invalid(format!(
                "noise_multiplier must be non-negative, got {noise_multiplier}"
            )));
        }
        if deltas.is_empty() {
            warn!("no deltas to aggregate, global parameters unchanged");
            return Ok(AggregateReport::default());
        }

        let mut clipped = deltas;
        let mut clip_reports = Vec::with_capacity(clipped.len());
        for delta in clipped.iter_mut() {
            clip_reports.push(clip_delta(delta, clip_norm)?);
        }

        let count = clipped.len() as f64;
        let mut update = Delta::new();
        for key in self.shared_float_keys(global) {
            let target = global.require_float(&key)?;
            let mut sum = Tensor::zeros(target.raw_dim());
            for delta in &clipped {
                let value = delta.get(&key).ok_or_else(|| DpError::missing_key(&key))?;
                if value.shape() != target.shape() {
                    return Err(DpError::ShapeMismatch {
                        key,
                        expected: target.shape().to_vec(),
                        found: value.shape().to_vec(),
                    });
                }
                sum += value;
            }
            sum.mapv_inplace(|x| x / count);
            update.insert(key, sum);
        }

        GaussianMechanism::new(noise_multiplier, clip_norm).apply_delta(&mut update, rng);

        let keys_updated = update.len();
        for (key, value) in update.iter() {
            if let Some(target) = global.float_mut(key) {
                *target += value;
            }
        }
        debug!(
            contributors = clip_reports.len(),
            keys_updated, "applied noised mean delta"
        );

        Ok(AggregateReport {
            contributors: clip_reports.len(),
            keys_updated,
            clip_reports,
        })
    }

    /// Sample-count-weighted averaging of full client parameter sets.
    ///
    /// Every shared floating-point key is replaced by the weighted sum of the
    /// clients' values. Shared counter buffers are copied from the first
    /// contribution. A zero total sample count falls back to equal weights.
    pub fn weighted_average(
        &self,
        global: &mut ParameterSet,
        clients: &[WeightedParams<'_>],
    ) -> Result<AggregateReport> {
        let first = match clients.first() {
            Some(first) => first,
            None => {
                warn!("no client parameters to average, global parameters unchanged");
                return Ok(AggregateReport::default());
            }
        };

        let total: usize = clients.iter().map(|c| c.num_samples).sum();
        let weights: Vec<f64> = if total == 0 {
            vec![1.0 / clients.len() as f64; clients.len()]
        } else {
            clients
                .iter()
                .map(|c| c.num_samples as f64 / total as f64)
                .collect()
        };

        let mut averaged = ParameterSet::new();
        for key in self.shared_float_keys(global) {
            let target = global.require_float(&key)?;
            let mut acc = Tensor::zeros(target.raw_dim());
            for (client, &w) in clients.iter().zip(weights.iter()) {
                let value = client.params.require_float(&key)?;
                if value.shape() != target.shape() {
                    return Err(DpError::ShapeMismatch {
                        key,
                        expected: target.shape().to_vec(),
                        found: value.shape().to_vec(),
                    });
                }
                acc.scaled_add(w, value);
            }
            averaged.insert_float(key, acc);
        }
        for (name, value) in first.params.iter() {
            if let ParamValue::Counter(_) = value {
                if self.policy.is_shared(name) {
                    averaged.insert(name, value.clone());
                }
            }
        }

        let keys_updated = averaged.len();
        for (name, value) in averaged.iter() {
            global.insert(name, value.clone());
        }

        Ok(AggregateReport {
            contributors: clients.len(),
            keys_updated,
            clip_reports: Vec::new(),
        })
    }
}
