//! Clipped, optionally noised differences between parameter snapshots.

use rand::Rng;

use crate::clipping::{clip_delta, ClipReport, Delta};
use crate::error::{DpError, Result};
use crate::noise::GaussianMechanism;
use crate::params::{ParamValue, ParameterSet, PersonalizationPolicy};

/// Output of [`DeltaComputer::compute_delta`].
#[derive(Clone, Debug)]
pub struct DeltaPair {
    /// Clipped delta with Gaussian noise added.
    pub noised: Delta,
    /// Copy taken after clipping and before noise.
    pub unnoised: Delta,
    /// Joint clipping outcome.
    pub clip: ClipReport,
}

/// Computes `local - global` over the shared floating-point parameters.
#[derive(Clone, Debug, Default)]
pub struct DeltaComputer {
    policy: PersonalizationPolicy,
}

impl DeltaComputer {
    /// Create a delta computer using `policy` to exclude personalized keys.
    pub fn new(policy: PersonalizationPolicy) -> Self {
        Self { policy }
    }

    /// The exclusion policy.
    pub fn policy(&self) -> &PersonalizationPolicy {
        &self.policy
    }

    /// Whether a local parameter participates in the delta.
    pub fn is_eligible(&self, name: &str, value: &ParamValue) -> bool {
        value.is_float() && self.policy.is_shared(name)
    }

    /// Unclipped `local - global` over eligible keys.
    pub fn raw_delta(&self, global: &ParameterSet, local: &ParameterSet) -> Result<Delta> {
        let mut delta = Delta::new();
        for (name, value) in local.iter() {
            if !self.is_eligible(name, value) {
                continue;
            }
            let local_t = match value.as_float() {
                Some(t) => t,
                None => continue,
            };
            let global_t = global.require_float(name)?;
            if global_t.shape() != local_t.shape() {
                return Err(DpError::ShapeMismatch {
                    key: name.to_string(),
                    expected: global_t.shape().to_vec(),
                    found: local_t.shape().to_vec(),
                });
            }
            delta.insert(name, local_t - global_t);
        }
        Ok(delta)
    }

    /// Clip `local - global` jointly to `clip_norm`, then add Gaussian noise
    /// with standard deviation `clip_norm * noise_multiplier` per entry.
    pub fn compute_delta<R: Rng>(
        &self,
        global: &ParameterSet,
        local: &ParameterSet,
        clip_norm: f64,
        noise_multiplier: f64,
        rng: &mut R,
    ) -> Result<DeltaPair> {
        if !noise_multiplier.is_finite() || noise_multiplier < 0.0 {
            return Err(DpError::invalid(format!(
                "noise_multiplier must be non-negative, got {noise_multiplier}"
            )));
        }

        let mut delta = self.raw_delta(global, local)?;
        if delta.is_empty() {
            return Ok(DeltaPair {
                noised: Delta::new(),
                unnoised: Delta::new(),
                clip: ClipReport::untouched(),
            });
        }

        let clip = clip_delta(&mut delta, clip_norm)?;
        let unnoised = delta.clone();
        GaussianMechanism::new(noise_multiplier, clip_norm).apply_delta(&mut delta, rng);

        Ok(DeltaPair {
            noised: delta,
            unnoised,
            clip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(0)
    }

    #[test]
    fn scales_difference_to_clip_norm() {
        let mut global = ParameterSet::new();
        global.insert_float("a", array![1.0, 0.0].into_dyn());
        let mut local = ParameterSet::new();
        local.insert_float("a", array![1.0, 3.0].into_dyn());

        let computer = DeltaComputer::default();
        let pair = computer
            .compute_delta(&global, &local, 1.0, 0.0, &mut rng())
            .unwrap();

        let a = pair.unnoised.get("a").unwrap();
        assert!(a[[0]].abs() < 1e-12);
        assert!((a[[1]] - 1.0).abs() < 1e-9);
        assert_eq!(pair.noised, pair.unnoised);
        assert!(pair.clip.clipped);
    }

    #[test]
    fn excludes_personal_and_counter_keys() {
        let mut global = ParameterSet::new();
        global.insert_float("encoder.w", array![0.0, 0.0].into_dyn());
        global.insert_counter("encoder.bn.count", array![1_i64].into_dyn());
        let mut local = global.clone();
        local.insert_float("encoder.w", array![0.1, 0.1].into_dyn());
        local.insert_counter("encoder.bn.count", array![7_i64].into_dyn());
        local.insert_float("transform_layer.w", array![5.0].into_dyn());

        let computer = DeltaComputer::default();
        let pair = computer
            .compute_delta(&global, &local, 1.0, 0.5, &mut rng())
            .unwrap();

        let keys: Vec<_> = pair.noised.keys().collect();
        assert_eq!(keys, vec!["encoder.w"]);
        for key in pair.unnoised.keys() {
            let value = local.get(key).unwrap();
            assert!(computer.is_eligible(key, value));
        }
    }

    #[test]
    fn fully_personal_client_gives_empty_deltas() {
        let mut local = ParameterSet::new();
        local.insert_float("transform_layer.w", array![1.0].into_dyn());
        let pair = DeltaComputer::default()
            .compute_delta(&ParameterSet::new(), &local, 1.0, 1.0, &mut rng())
            .unwrap();
        assert!(pair.noised.is_empty());
        assert!(pair.unnoised.is_empty());
    }

    #[test]
    fn noise_is_added_after_the_unnoised_copy() {
        let mut global = ParameterSet::new();
        global.insert_float("w", array![0.0, 0.0, 0.0].into_dyn());
        let mut local = ParameterSet::new();
        local.insert_float("w", array![0.1, 0.0, 0.0].into_dyn());

        let pair = DeltaComputer::default()
            .compute_delta(&global, &local, 1.0, 1.0, &mut rng())
            .unwrap();
        assert_eq!(pair.unnoised.get("w").unwrap()[[0]], 0.1);
        assert_ne!(pair.noised, pair.unnoised);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut global = ParameterSet::new();
        global.insert_float("w", array![0.0].into_dyn());
        let mut local = ParameterSet::new();
        local.insert_float("w", array![0.0, 1.0].into_dyn());
        let err = DeltaComputer::default()
            .compute_delta(&global, &local, 1.0, 0.0, &mut rng())
            .unwrap_err();
        assert!(matches!(err, DpError::ShapeMismatch { .. }));
    }

    #[test]
    fn missing_global_key_is_reported() {
        let mut local = ParameterSet::new();
        local.insert_float("w", array![0.0].into_dyn());
        let err = DeltaComputer::default()
            .compute_delta(&ParameterSet::new(), &local, 1.0, 0.0, &mut rng())
            .unwrap_err();
        assert!(matches!(err, DpError::MissingKey { .. }));
    }
}
