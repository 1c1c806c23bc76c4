//! Run-wide privacy state.

use serde::{Deserialize, Serialize};
use tracing::debug;

use fedmeta_core::{DpError, GradNormTracker, Result};

use crate::accountant::PrivacyAccountant;

/// Noise, clip norm, target delta, step count and gradient-norm averages of
/// one training run.
///
/// Steps only ever grow; there is no way to roll the count back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyState {
    noise_multiplier: f64,
    clip_norm: f64,
    target_delta: f64,
    cumulative_steps: u64,
    grad_norms: GradNormTracker,
}

impl PrivacyState {
    /// Create the state at the beginning of a run.
    pub fn new(
        noise_multiplier: f64,
        clip_norm: f64,
        target_delta: f64,
        grad_norm_decay: f64,
    ) -> Result<Self> {
        if !noise_multiplier.is_finite() || noise_multiplier < 0.0 {
            return Err(DpError::invalid("noise_multiplier must be non-negative"));
        }
        if !clip_norm.is_finite() || clip_norm <= 0.0 {
            return Err(DpError::invalid("clip_norm must be positive"));
        }
        if !target_delta.is_finite() || target_delta <= 0.0 || target_delta >= 1.0 {
            return Err(DpError::invalid("target_delta must be in (0, 1)"));
        }
        Ok(Self {
            noise_multiplier,
            clip_norm,
            target_delta,
            cumulative_steps: 0,
            grad_norms: GradNormTracker::new(grad_norm_decay)?,
        })
    }

    /// Current noise multiplier.
    pub fn noise_multiplier(&self) -> f64 {
        self.noise_multiplier
    }

    /// Current clip norm.
    pub fn clip_norm(&self) -> f64 {
        self.clip_norm
    }

    /// Target delta.
    pub fn target_delta(&self) -> f64 {
        self.target_delta
    }

    /// Steps recorded so far.
    pub fn cumulative_steps(&self) -> u64 {
        self.cumulative_steps
    }

    /// Gradient-norm averages.
    pub fn grad_norms(&self) -> &GradNormTracker {
        &self.grad_norms
    }

    /// Mutable gradient-norm averages.
    pub fn grad_norms_mut(&mut self) -> &mut GradNormTracker {
        &mut self.grad_norms
    }

    /// Replace the noise multiplier, e.g. after calibration.
    pub fn set_noise_multiplier(&mut self, noise_multiplier: f64) -> Result<()> {
        if !noise_multiplier.is_finite() || noise_multiplier < 0.0 {
            return Err(DpError::invalid("noise_multiplier must be non-negative"));
        }
        self.noise_multiplier = noise_multiplier;
        Ok(())
    }

    /// Add `steps` to the step count.
    pub fn record_steps(&mut self, steps: u64) {
        self.cumulative_steps = self.cumulative_steps.saturating_add(steps);
    }

    /// Set the clip norm to the `percentile`-th percentile of the tracked
    /// gradient norms. Leaves it unchanged while nothing has been observed
    /// or when the percentile is not a positive finite value.
    pub fn retune_clip(&mut self, percentile: f64) -> Option<f64> {
        let tuned = self.grad_norms.percentile(percentile)?;
        if !tuned.is_finite() || tuned <= 0.0 {
            return None;
        }
        debug!(old = self.clip_norm, new = tuned, percentile, "retuned clip norm");
        self.clip_norm = tuned;
        Some(tuned)
    }

    /// Epsilon spent so far under `accountant`.
    pub fn epsilon(&self, accountant: &PrivacyAccountant, sampling_rate: f64) -> f64 {
        accountant.epsilon(self.cumulative_steps, self.noise_multiplier, sampling_rate)
    }

    /// Record `steps` more steps and return the updated epsilon.
    pub fn record(
        &mut self,
        accountant: &PrivacyAccountant,
        steps: u64,
        sampling_rate: f64,
    ) -> f64 {
        self.record_steps(steps);
        self.epsilon(accountant, sampling_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::AccountantKind;

    #[test]
    fn rejects_invalid_construction() {
        assert!(PrivacyState::new(-1.0, 1.0, 1e-5, 0.9).is_err());
        assert!(PrivacyState::new(1.0, 0.0, 1e-5, 0.9).is_err());
        assert!(PrivacyState::new(1.0, 1.0, 1.5, 0.9).is_err());
        assert!(PrivacyState::new(1.0, 1.0, 1e-5, 1.0).is_err());
    }

    #[test]
    fn record_accumulates_and_grows_epsilon() {
        let acc = PrivacyAccountant::new(AccountantKind::Basic, 1e-5).unwrap();
        let mut state = PrivacyState::new(1.0, 1.0, 1e-5, 0.9).unwrap();
        let mut last = 0.0;
        for round in 1..=3 {
            let eps = state.record(&acc, 1, 0.5);
            assert_eq!(state.cumulative_steps(), round);
            let expected = (2.0 * round as f64 * (1e5f64).ln()).sqrt();
            assert!((eps - expected).abs() < 1e-12);
            assert!(eps > last);
            last = eps;
        }
    }

    #[test]
    fn zero_noise_state_is_unbounded() {
        let acc = PrivacyAccountant::new(AccountantKind::Rdp, 1e-5).unwrap();
        let mut state = PrivacyState::new(0.0, 1.0, 1e-5, 0.9).unwrap();
        assert!(state.record(&acc, 4, 1.0).is_infinite());
    }

    #[test]
    fn retune_clip_follows_percentile() {
        let mut state = PrivacyState::new(1.0, 1.0, 1e-5, 0.9).unwrap();
        assert_eq!(state.retune_clip(90.0), None);
        assert_eq!(state.clip_norm(), 1.0);
        state.grad_norms_mut().observe("a", 2.0);
        state.grad_norms_mut().observe("b", 4.0);
        let tuned = state.retune_clip(50.0).unwrap();
        assert!((tuned - 3.0).abs() < 1e-12);
        assert_eq!(state.clip_norm(), tuned);
    }

    #[test]
    fn step_count_saturates() {
        let mut state = PrivacyState::new(1.0, 1.0, 1e-5, 0.9).unwrap();
        state.record_steps(u64::MAX);
        state.record_steps(5);
        assert_eq!(state.cumulative_steps(), u64::MAX);
    }
}
