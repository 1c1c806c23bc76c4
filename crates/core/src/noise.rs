//! Gaussian noise for differential privacy.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::clipping::Delta;
use crate::tensor::Tensor;

/// Add Gaussian noise to a tensor in-place.
pub fn add_gaussian_noise<R: Rng>(tensor: &mut Tensor, sigma: f64, rng: &mut R) {
    if !sigma.is_finite() || sigma <= 0.0 || tensor.is_empty() {
        return;
    }

    let dist = match Normal::new(0.0, sigma) {
        Ok(d) => d,
        Err(_) => return,
    };

    tensor.mapv_inplace(|x| {
        if x.is_finite() {
            x + dist.sample(rng)
        } else {
            x
        }
    });
}

/// Add i.i.d. Gaussian noise to every entry of every key, in key order.
pub fn add_gaussian_noise_delta<R: Rng>(delta: &mut Delta, sigma: f64, rng: &mut R) {
    for (_, value) in delta.iter_mut() {
        add_gaussian_noise(value, sigma, rng);
    }
}

/// Gaussian mechanism with sensitivity calibration.
#[derive(Clone, Debug, PartialEq)]
pub struct GaussianMechanism {
    /// Noise multiplier (sigma = noise_multiplier * sensitivity).
    pub noise_multiplier: f64,
    /// L2 sensitivity bound, the clip norm.
    pub sensitivity: f64,
}

impl GaussianMechanism {
    /// Create a new Gaussian mechanism.
    pub fn new(noise_multiplier: f64, sensitivity: f64) -> Self {
        Self {
            noise_multiplier,
            sensitivity,
        }
    }

    /// Get the noise standard deviation.
    pub fn sigma(&self) -> f64 {
        self.noise_multiplier * self.sensitivity
    }

    /// Whether the mechanism adds any noise.
    pub fn is_active(&self) -> bool {
        self.sigma().is_finite() && self.sigma() > 0.0
    }

    /// Add noise to a tensor.
    pub fn apply<R: Rng>(&self, tensor: &mut Tensor, rng: &mut R) {
        add_gaussian_noise(tensor, self.sigma(), rng);
    }

    /// Add noise to every key of a delta.
    pub fn apply_delta<R: Rng>(&self, delta: &mut Delta, rng: &mut R) {
        add_gaussian_noise_delta(delta, self.sigma(), rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_gaussian_deterministic() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut t1 = Array1::zeros(100).into_dyn();
        add_gaussian_noise(&mut t1, 1.0, &mut rng);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut t2 = Array1::zeros(100).into_dyn();
        add_gaussian_noise(&mut t2, 1.0, &mut rng);

        assert_eq!(t1, t2);
    }

    #[test]
    fn test_gaussian_statistics() {
        let mut rng = ChaCha8Rng::seed_from_u64(123);
        let mut t = Array1::zeros(10_000).into_dyn();
        add_gaussian_noise(&mut t, 2.0, &mut rng);

        let mean: f64 = t.iter().sum::<f64>() / t.len() as f64;
        let var: f64 = t.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / t.len() as f64;

        assert!(mean.abs() < 0.1);
        assert!((var - 4.0).abs() < 0.3);
    }

    #[test]
    fn mechanism_sigma_scales_with_clip() {
        let m = GaussianMechanism::new(1.5, 2.0);
        assert!((m.sigma() - 3.0).abs() < 1e-12);
        assert!(m.is_active());
        assert!(!GaussianMechanism::new(0.0, 2.0).is_active());
    }

    #[test]
    fn zero_sigma_is_a_no_op() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut d: Delta = [("w".to_string(), Array1::from(vec![1.0, 2.0]).into_dyn())]
            .into_iter()
            .collect();
        let before = d.clone();
        GaussianMechanism::new(0.0, 1.0).apply_delta(&mut d, &mut rng);
        assert_eq!(d, before);
    }
}
