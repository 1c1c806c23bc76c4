//! Reference client-level DP-SGD engine.
//!
//! [`DpSgdEngine`] implements [`Instrument`] for plain [`ParameterSet`]s. The
//! instrumented form caches one gradient per example; a privatized step clips
//! each example's gradient jointly, sums, adds Gaussian noise with standard
//! deviation `noise_multiplier * clip_norm` and divides by the expected batch
//! size.
//!
//! Only parameters the [`PersonalizationPolicy`] broadcasts are hooked.
//! Personalized and task-head parameters never see clipping or noise; they
//! are updated through [`Instrumented::apply_unhooked`].

use std::collections::BTreeMap;

use rand::Rng;
use tracing::debug;

use crate::clipping::{clip_delta, Delta};
use crate::error::{DpError, Result};
use crate::grad_norm::GradNormTracker;
use crate::instrumentation::{DetachFailed, Instrument, Refused};
use crate::noise::GaussianMechanism;
use crate::params::{ParameterSet, PersonalizationPolicy};
use crate::tensor::{l2_norm, Tensor};

/// DP-SGD parameters for one client.
#[derive(Clone, Debug, PartialEq)]
pub struct DpSgdConfig {
    /// Per-example L2 clip norm.
    pub clip_norm: f64,
    /// Noise multiplier.
    pub noise_multiplier: f64,
    /// Expected number of examples per step (divisor of the noised sum).
    pub expected_batch_size: usize,
    /// Whether wrappers can be detached cleanly.
    pub detach_supported: bool,
}

impl DpSgdConfig {
    /// Create a config with clean detaching enabled.
    pub fn new(clip_norm: f64, noise_multiplier: f64, expected_batch_size: usize) -> Self {
        Self {
            clip_norm,
            noise_multiplier,
            expected_batch_size,
            detach_supported: true,
        }
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.clip_norm.is_finite() || self.clip_norm <= 0.0 {
            return Err(DpError::invalid("clip_norm must be positive"));
        }
        if !self.noise_multiplier.is_finite() || self.noise_multiplier < 0.0 {
            return Err(DpError::invalid("noise_multiplier must be non-negative"));
        }
        if self.expected_batch_size == 0 {
            return Err(DpError::invalid("expected_batch_size must be positive"));
        }
        Ok(())
    }
}

/// Registration of a per-sample gradient hook on one parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookHandle {
    param: String,
}

impl HookHandle {
    /// Name of the hooked parameter.
    pub fn param(&self) -> &str {
        &self.param
    }
}

/// A privatized gradient step.
#[derive(Clone, Debug)]
pub struct PrivateGradient {
    /// Noised, normalized gradient.
    pub gradient: Delta,
    /// Number of per-example gradients combined.
    pub num_samples: usize,
    /// How many of them were scaled down by clipping.
    pub num_clipped: usize,
}

/// A parameter set with per-sample gradient hooks attached.
#[derive(Debug)]
pub struct Instrumented {
    module: ParameterSet,
    config: DpSgdConfig,
    hooks: Vec<HookHandle>,
    samples: Vec<Delta>,
}

impl Instrumented {
    /// The wrapped parameters.
    pub fn module(&self) -> &ParameterSet {
        &self.module
    }

    /// Registered hooks.
    pub fn hooks(&self) -> &[HookHandle] {
        &self.hooks
    }

    /// Parameters used for privatized steps.
    pub fn config(&self) -> &DpSgdConfig {
        &self.config
    }

    /// Number of cached per-example gradients.
    pub fn pending_samples(&self) -> usize {
        self.samples.len()
    }

    /// Cache one example's gradient. Every key must be a hooked parameter.
    pub fn record_sample(&mut self, grads: Delta) -> Result<()> {
        for (name, grad) in grads.iter() {
            self.check_hooked(name)?;
            let param = self.module.require_float(name)?;
            if param.shape() != grad.shape() {
                return Err(DpError::ShapeMismatch {
                    key: name.to_string(),
                    expected: param.shape().to_vec(),
                    found: grad.shape().to_vec(),
                });
            }
        }
        self.samples.push(grads);
        Ok(())
    }

    fn is_hooked(&self, name: &str) -> bool {
        self.hooks.iter().any(|h| h.param == name)
    }

    fn check_hooked(&self, name: &str) -> Result<()> {
        if self.is_hooked(name) {
            return Ok(());
        }
        if self.module.float(name).is_some() {
            return Err(DpError::invalid(format!(
                "parameter `{name}` is excluded from DP-SGD"
            )));
        }
        Err(DpError::missing_key(name))
    }

    /// Clip, sum and noise the cached gradients, then clear the cache.
    ///
    /// The mean per-example norm of each parameter is folded into `tracker`
    /// before clipping.
    pub fn privatize_step<R: Rng>(
        &mut self,
        rng: &mut R,
        tracker: &mut GradNormTracker,
    ) -> Result<PrivateGradient> {
        if self.samples.is_empty() {
            return Err(DpError::invalid("no per-sample gradients recorded"));
        }
        let samples = std::mem::take(&mut self.samples);
        let num_samples = samples.len();

        let mut norm_sums: BTreeMap<String, f64> = BTreeMap::new();
        let mut sum: BTreeMap<String, Tensor> = BTreeMap::new();
        let mut num_clipped = 0;
        for mut sample in samples {
            for (name, grad) in sample.iter() {
                *norm_sums.entry(name.to_string()).or_insert(0.0) += l2_norm(grad);
            }
            if clip_delta(&mut sample, self.config.clip_norm)?.clipped {
                num_clipped += 1;
            }
            for (name, grad) in sample.iter() {
                match sum.get_mut(name) {
                    Some(acc) => *acc += grad,
                    None => {
                        sum.insert(name.to_string(), grad.clone());
                    }
                }
            }
        }
        for (name, total) in &norm_sums {
            tracker.observe(name, total / num_samples as f64);
        }

        let mut gradient: Delta = sum.into_iter().collect();
        GaussianMechanism::new(self.config.noise_multiplier, self.config.clip_norm)
            .apply_delta(&mut gradient, rng);
        gradient.scale(1.0 / self.config.expected_batch_size as f64);

        debug!(num_samples, num_clipped, "privatized DP-SGD step");
        Ok(PrivateGradient {
            gradient,
            num_samples,
            num_clipped,
        })
    }

    /// Apply `params -= learning_rate * gradient` to hooked parameters.
    pub fn apply_gradient(&mut self, gradient: &Delta, learning_rate: f64) -> Result<()> {
        for (name, _) in gradient.iter() {
            self.check_hooked(name)?;
        }
        self.step(gradient, learning_rate)
    }

    /// Plain SGD step on parameters outside DP-SGD (personalized layers and
    /// the task head). Hooked keys are rejected.
    pub fn apply_unhooked(&mut self, gradient: &Delta, learning_rate: f64) -> Result<()> {
        if let Some(name) = gradient.keys().find(|name| self.is_hooked(name)) {
            return Err(DpError::invalid(format!(
                "parameter `{name}` is trained through DP-SGD"
            )));
        }
        self.step(gradient, learning_rate)
    }

    fn step(&mut self, gradient: &Delta, learning_rate: f64) -> Result<()> {
        for (name, grad) in gradient.iter() {
            let param = self
                .module
                .float_mut(name)
                .ok_or_else(|| DpError::missing_key(name))?;
            if param.shape() != grad.shape() {
                return Err(DpError::ShapeMismatch {
                    key: name.to_string(),
                    expected: param.shape().to_vec(),
                    found: grad.shape().to_vec(),
                });
            }
            param.scaled_add(-learning_rate, grad);
        }
        Ok(())
    }
}

/// Attaches per-sample gradient hooks to the broadcast floating-point
/// parameters of a model.
#[derive(Clone, Debug)]
pub struct DpSgdEngine {
    config: DpSgdConfig,
    policy: PersonalizationPolicy,
    live: usize,
}

impl DpSgdEngine {
    /// Create an engine with the default personalization policy.
    pub fn new(config: DpSgdConfig) -> Self {
        Self {
            config,
            policy: PersonalizationPolicy::default(),
            live: 0,
        }
    }

    /// Decide which parameters are hooked by `policy`.
    pub fn with_policy(mut self, policy: PersonalizationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Policy selecting the hooked parameters.
    pub fn policy(&self) -> &PersonalizationPolicy {
        &self.policy
    }

    /// Current parameters.
    pub fn config(&self) -> &DpSgdConfig {
        &self.config
    }

    /// Replace the parameters used for wrappers created from now on.
    pub fn set_config(&mut self, config: DpSgdConfig) {
        self.config = config;
    }

    /// Number of wrappers handed out and not yet released.
    pub fn live_wrappers(&self) -> usize {
        self.live
    }
}

impl Instrument for DpSgdEngine {
    type Plain = ParameterSet;
    type Wrapped = Instrumented;

    fn enable_instrumentation(
        &mut self,
        model: ParameterSet,
    ) -> std::result::Result<Instrumented, Refused<ParameterSet>> {
        if let Err(err) = self.config.validate() {
            return Err(Refused {
                model,
                reason: err.to_string(),
            });
        }
        let hooks: Vec<HookHandle> = model
            .floats()
            .filter(|(name, _)| self.policy.is_broadcast(name))
            .map(|(name, _)| HookHandle {
                param: name.to_string(),
            })
            .collect();
        if hooks.is_empty() {
            return Err(Refused {
                model,
                reason: "model has no shared trainable parameters".into(),
            });
        }
        self.live += 1;
        Ok(Instrumented {
            module: model,
            config: self.config.clone(),
            hooks,
            samples: Vec::new(),
        })
    }

    fn disable_instrumentation(
        &mut self,
        wrapped: Instrumented,
    ) -> std::result::Result<ParameterSet, DetachFailed<Instrumented>> {
        if !self.config.detach_supported {
            return Err(DetachFailed {
                wrapped,
                reason: "engine does not support detaching".into(),
            });
        }
        self.live = self.live.saturating_sub(1);
        Ok(wrapped.module)
    }

    fn strip(&mut self, wrapped: Instrumented) -> ParameterSet {
        self.live = self.live.saturating_sub(1);
        wrapped.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::with_instrumentation;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn params() -> ParameterSet {
        let mut p = ParameterSet::new();
        p.insert_float("w", array![0.0, 0.0].into_dyn());
        p.insert_counter("steps", array![0_i64].into_dyn());
        p
    }

    fn grad(a: f64, b: f64) -> Delta {
        [("w".to_string(), array![a, b].into_dyn())]
            .into_iter()
            .collect()
    }

    #[test]
    fn hooks_cover_float_parameters_only() {
        let mut engine = DpSgdEngine::new(DpSgdConfig::new(1.0, 0.0, 2));
        let wrapped = engine.enable_instrumentation(params()).unwrap();
        assert_eq!(wrapped.hooks().len(), 1);
        assert_eq!(wrapped.hooks()[0].param(), "w");
        assert_eq!(engine.live_wrappers(), 1);
        engine.disable_instrumentation(wrapped).unwrap();
        assert_eq!(engine.live_wrappers(), 0);
    }

    #[test]
    fn noiseless_step_is_mean_of_clipped_samples() {
        let mut engine = DpSgdEngine::new(DpSgdConfig::new(1.0, 0.0, 2));
        let mut tracker = GradNormTracker::default();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let run = with_instrumentation(&mut engine, params(), |w| {
            w.record_sample(grad(3.0, 4.0))?;
            w.record_sample(grad(0.2, 0.0))?;
            let step = w.privatize_step(&mut rng, &mut tracker)?;
            w.apply_gradient(&step.gradient, 1.0)?;
            Ok(step)
        });
        let step = run.outcome.unwrap();
        assert_eq!(step.num_samples, 2);
        assert_eq!(step.num_clipped, 1);
        let w = run.model.float("w").unwrap();
        assert!((w[[0]] + 0.4).abs() < 1e-9);
        assert!((w[[1]] + 0.4).abs() < 1e-9);
        assert!((tracker.get("w").unwrap() - 2.6).abs() < 1e-12);
    }

    #[test]
    fn unknown_gradient_key_is_rejected() {
        let mut engine = DpSgdEngine::new(DpSgdConfig::new(1.0, 1.0, 1));
        let mut wrapped = engine.enable_instrumentation(params()).unwrap();
        let bad: Delta = [("steps".to_string(), array![1.0].into_dyn())]
            .into_iter()
            .collect();
        assert!(wrapped.record_sample(bad).is_err());
        engine.strip(wrapped);
    }

    fn personalized() -> ParameterSet {
        let mut p = ParameterSet::new();
        p.insert_float("encoder.w", array![0.0, 0.0].into_dyn());
        p.insert_float("transform_layer.w", array![0.0, 0.0].into_dyn());
        p.insert_float("few_classify.w", array![0.0].into_dyn());
        p
    }

    #[test]
    fn personalized_and_head_parameters_are_not_hooked() {
        let mut engine = DpSgdEngine::new(DpSgdConfig::new(1.0, 1.0, 1));
        let mut wrapped = engine.enable_instrumentation(personalized()).unwrap();
        let hooked: Vec<&str> = wrapped.hooks().iter().map(HookHandle::param).collect();
        assert_eq!(hooked, vec!["encoder.w"]);

        let mut sample = Delta::new();
        sample.insert("encoder.w", array![3.0, 0.0].into_dyn());
        sample.insert("transform_layer.w", array![4.0, 0.0].into_dyn());
        let err = wrapped.record_sample(sample).unwrap_err();
        assert!(matches!(err, DpError::InvalidParameters { .. }), "{err}");
        assert_eq!(wrapped.pending_samples(), 0);
        engine.strip(wrapped);
    }

    #[test]
    fn personal_gradient_does_not_shrink_the_shared_one() {
        let mut engine = DpSgdEngine::new(DpSgdConfig::new(1.0, 0.0, 1));
        let mut tracker = GradNormTracker::default();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let run = with_instrumentation(&mut engine, personalized(), |w| {
            let mut shared = Delta::new();
            shared.insert("encoder.w", array![3.0, 0.0].into_dyn());
            w.record_sample(shared)?;
            let step = w.privatize_step(&mut rng, &mut tracker)?;

            let mut local = Delta::new();
            local.insert("transform_layer.w", array![4.0, 0.0].into_dyn());
            w.apply_unhooked(&local, 1.0)?;
            assert!(w.apply_unhooked(&step.gradient, 1.0).is_err());
            assert!(w.apply_gradient(&local, 1.0).is_err());
            w.apply_gradient(&step.gradient, 1.0)?;
            Ok(step)
        });
        let step = run.outcome.unwrap();
        assert_eq!(step.gradient.keys().collect::<Vec<_>>(), vec!["encoder.w"]);
        assert!((step.gradient.get("encoder.w").unwrap()[[0]] - 1.0).abs() < 1e-9);
        // Updated unclipped and without noise.
        assert_eq!(run.model.float("transform_layer.w").unwrap(), &array![-4.0, 0.0].into_dyn());
        assert!((run.model.float("encoder.w").unwrap()[[0]] + 1.0).abs() < 1e-9);
        assert!(tracker.get("transform_layer.w").is_none());
    }

    #[test]
    fn invalid_config_refuses_instrumentation() {
        let mut engine = DpSgdEngine::new(DpSgdConfig::new(0.0, 1.0, 1));
        let refused = engine.enable_instrumentation(params()).unwrap_err();
        assert_eq!(refused.model, params());
    }

    #[test]
    fn unsupported_detach_is_stripped() {
        let mut config = DpSgdConfig::new(1.0, 1.0, 1);
        config.detach_supported = false;
        let mut engine = DpSgdEngine::new(config);
        let run = with_instrumentation(&mut engine, params(), |w| {
            w.record_sample(grad(1.0, 1.0))?;
            Ok(())
        });
        assert!(run.leaked);
        assert_eq!(run.model, params());
        assert_eq!(engine.live_wrappers(), 0);
    }
}
