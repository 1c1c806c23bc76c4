//! Calibration of the noise multiplier to a target epsilon.

use serde::{Deserialize, Serialize};
use tracing::debug;

use fedmeta_core::{DpError, Result};

use crate::accountant::{compute_epsilon, AccountantKind};

/// Search bracket and stopping rule for noise calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSearch {
    /// Smallest noise multiplier considered.
    pub sigma_min: f64,
    /// Largest noise multiplier considered.
    pub sigma_max: f64,
    /// Acceptable distance between the achieved and the target epsilon.
    pub tol: f64,
    /// Maximum number of bisection steps.
    pub max_iter: usize,
}

impl Default for NoiseSearch {
    fn default() -> Self {
        Self {
            sigma_min: 0.5,
            sigma_max: 10.0,
            tol: 0.05,
            max_iter: 50,
        }
    }
}

impl NoiseSearch {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.sigma_min.is_finite() || self.sigma_min <= 0.0 {
            return Err(DpError::invalid("sigma_min must be positive"));
        }
        if !self.sigma_max.is_finite() || self.sigma_max <= self.sigma_min {
            return Err(DpError::invalid("sigma_max must exceed sigma_min"));
        }
        if !self.tol.is_finite() || self.tol <= 0.0 {
            return Err(DpError::invalid("tol must be positive"));
        }
        if self.max_iter == 0 {
            return Err(DpError::invalid("max_iter must be positive"));
        }
        Ok(())
    }
}

/// Bisect for the noise multiplier whose epsilon meets `target_eps`.
///
/// `epsilon_for` must be non-increasing in the noise multiplier. The upper
/// end of the bracket always satisfies `epsilon <= target_eps`, so the result
/// never overshoots the budget. The search stops early once a midpoint lands
/// within `tol` below the target.
///
/// The stopping rule is one-sided: `target_eps - tol <= eps <= target_eps`.
/// A midpoint within `tol` above the target is never accepted, since it would
/// spend more than the budget; bisection keeps going until one lands below.
pub fn calibrate_noise<F>(mut epsilon_for: F, target_eps: f64, search: &NoiseSearch) -> Result<f64>
where
    F: FnMut(f64) -> f64,
{
    search.validate()?;
    if !target_eps.is_finite() || target_eps <= 0.0 {
        return Err(DpError::invalid("target_eps must be positive and finite"));
    }

    let eps_at_min = epsilon_for(search.sigma_min);
    let eps_at_max = epsilon_for(search.sigma_max);
    if eps_at_min < target_eps || eps_at_max > target_eps {
        return Err(DpError::UnbracketedTarget {
            target_eps,
            sigma_min: search.sigma_min,
            sigma_max: search.sigma_max,
            eps_at_min,
            eps_at_max,
        });
    }

    let mut lo = search.sigma_min;
    let mut hi = search.sigma_max;
    for iter in 0..search.max_iter {
        let mid = 0.5 * (lo + hi);
        let eps = epsilon_for(mid);
        if eps > target_eps {
            lo = mid;
        } else {
            hi = mid;
            if target_eps - eps <= search.tol {
                debug!(iter, sigma = hi, eps, "noise calibration converged");
                return Ok(hi);
            }
        }
    }
    Ok(hi)
}

/// Noise multiplier reaching `target_eps` after `num_steps` steps.
pub fn find_noise_multiplier(
    num_steps: u64,
    target_eps: f64,
    delta: f64,
    kind: AccountantKind,
    sampling_rate: f64,
    search: &NoiseSearch,
) -> Result<f64> {
    if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
        return Err(DpError::invalid("delta must be in (0, 1)"));
    }
    calibrate_noise(
        |sigma| compute_epsilon(num_steps, sigma, delta, kind, sampling_rate),
        target_eps,
        search,
    )
}
