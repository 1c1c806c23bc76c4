//! Rényi Differential Privacy accounting.
//!
//! The per-step cost of the sub-sampled Gaussian mechanism at order `o` is
//! approximated by `q^2 * o / (2 * sigma^2)`. Costs add over steps and each
//! order is converted to an epsilon with `rdp + ln(1/delta) / (o - 1)`; the
//! reported epsilon is the minimum over the order grid.

/// RDP accountant for privacy composition.
#[derive(Clone, Debug)]
pub struct RdpAccountant {
    orders: Vec<f64>,
    rdp: Vec<f64>,
}

impl Default for RdpAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl RdpAccountant {
    /// Create an accountant over [`default_orders`].
    pub fn new() -> Self {
        Self::with_orders(default_orders())
    }

    /// Create an accountant with custom orders; orders `<= 1` are dropped.
    pub fn with_orders(orders: Vec<f64>) -> Self {
        let mut orders: Vec<f64> = orders
            .into_iter()
            .filter(|&a| a.is_finite() && a > 1.0)
            .collect();
        orders.sort_by(f64::total_cmp);
        orders.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
        if orders.is_empty() {
            orders = default_orders();
        }
        let rdp = vec![0.0; orders.len()];
        Self { orders, rdp }
    }

    /// Rényi orders in use.
    pub fn orders(&self) -> &[f64] {
        &self.orders
    }

    /// Record one step.
    pub fn step(&mut self, noise_multiplier: f64, sampling_rate: f64) {
        self.steps(noise_multiplier, sampling_rate, 1);
    }

    /// Record `n` identical steps.
    pub fn steps(&mut self, noise_multiplier: f64, sampling_rate: f64, n: u64) {
        if n == 0 {
            return;
        }
        if !noise_multiplier.is_finite() || noise_multiplier <= 0.0 {
            self.invalidate();
            return;
        }
        if !sampling_rate.is_finite() || !(0.0..=1.0).contains(&sampling_rate) {
            self.invalidate();
            return;
        }
        let n = n as f64;
        for (rdp, &order) in self.rdp.iter_mut().zip(self.orders.iter()) {
            *rdp += n * gaussian_rdp(order, noise_multiplier, sampling_rate);
        }
    }

    /// Convert to (epsilon, delta)-DP.
    pub fn epsilon(&self, delta: f64) -> f64 {
        if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
            return f64::INFINITY;
        }
        let log_delta_inv = (1.0 / delta).ln();
        self.orders
            .iter()
            .zip(self.rdp.iter())
            .filter(|(_, rdp)| rdp.is_finite())
            .map(|(&order, &rdp)| rdp + log_delta_inv / (order - 1.0))
            .fold(f64::INFINITY, f64::min)
    }

    fn invalidate(&mut self) {
        self.rdp.fill(f64::INFINITY);
    }
}

/// Default Rényi orders: 1.1 to 10.9 in steps of 0.1, then integers 12 to 63.
pub fn default_orders() -> Vec<f64> {
    let mut orders: Vec<f64> = (1..100).map(|x| 1.0 + x as f64 / 10.0).collect();
    orders.extend((12..64).map(|a| a as f64));
    orders
}

/// Per-step RDP of the sub-sampled Gaussian mechanism at `order`.
pub fn gaussian_rdp(order: f64, noise_multiplier: f64, sampling_rate: f64) -> f64 {
    sampling_rate * sampling_rate * order / (2.0 * noise_multiplier * noise_multiplier)
}

/// Epsilon after `num_steps` steps.
pub fn rdp_epsilon(num_steps: u64, noise_multiplier: f64, delta: f64, sampling_rate: f64) -> f64 {
    let mut accountant = RdpAccountant::new();
    accountant.steps(noise_multiplier, sampling_rate, num_steps);
    accountant.epsilon(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_grid_shape() {
        let orders = default_orders();
        assert_eq!(orders.len(), 99 + 52);
        assert!((orders[0] - 1.1).abs() < 1e-12);
        assert!((orders[98] - 10.9).abs() < 1e-12);
        assert_eq!(orders[99], 12.0);
        assert_eq!(*orders.last().unwrap(), 63.0);
    }

    #[test]
    fn test_epsilon_increases() {
        let mut acc = RdpAccountant::new();
        acc.step(1.0, 0.01);
        let eps1 = acc.epsilon(1e-5);
        acc.step(1.0, 0.01);
        let eps2 = acc.epsilon(1e-5);
        assert!(eps2 > eps1);
    }

    #[test]
    fn steps_matches_repeated_step() {
        let mut a = RdpAccountant::new();
        let mut b = RdpAccountant::new();
        a.steps(1.1, 0.2, 5);
        for _ in 0..5 {
            b.step(1.1, 0.2);
        }
        assert!((a.epsilon(1e-6) - b.epsilon(1e-6)).abs() < 1e-12);
    }

    #[test]
    fn matches_closed_form_minimum() {
        // 100 steps, q = 1, sigma = 10: min over o of o/2 + ln(1e5)/(o - 1).
        let eps = rdp_epsilon(100, 10.0, 1e-5, 1.0);
        let expected = default_orders()
            .into_iter()
            .map(|o| o / 2.0 + (1e5f64).ln() / (o - 1.0))
            .fold(f64::INFINITY, f64::min);
        assert!((eps - expected).abs() < 1e-9);
    }

    #[test]
    fn zero_noise_is_unbounded() {
        assert!(rdp_epsilon(3, 0.0, 1e-5, 0.5).is_infinite());
    }

    #[test]
    fn zero_steps_leaves_conversion_term() {
        let eps = rdp_epsilon(0, 1.0, 1e-5, 0.5);
        assert!(eps > 0.0 && eps.is_finite());
    }
}
