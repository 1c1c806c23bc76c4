//! Epsilon estimates under the supported composition methods.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use fedmeta_core::{DpError, Result};

use crate::pld::{CompositionAccountant, PldAccountant};
use crate::rdp::rdp_epsilon;

/// Composition method used to turn steps and noise into an epsilon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AccountantKind {
    /// Strong composition bound for the Gaussian mechanism, ignores sampling.
    Basic,
    /// Rényi DP over a fixed order grid.
    #[default]
    Rdp,
    /// Privacy random variable: convolution of the discretized loss.
    Prv,
}

impl AccountantKind {
    /// Parse a method name; unknown names fall back to [`AccountantKind::Basic`].
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "rdp" | "moments" => AccountantKind::Rdp,
            "prv" | "pld" => AccountantKind::Prv,
            "basic" => AccountantKind::Basic,
            other => {
                warn!(accountant = other, "unknown accountant, using basic composition");
                AccountantKind::Basic
            }
        }
    }

    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountantKind::Basic => "basic",
            AccountantKind::Rdp => "rdp",
            AccountantKind::Prv => "prv",
        }
    }
}

impl From<&str> for AccountantKind {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl From<String> for AccountantKind {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl From<AccountantKind> for String {
    fn from(kind: AccountantKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for AccountantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Basic composition: `sqrt(2 n ln(1/delta)) / sigma`.
pub fn basic_epsilon(num_steps: u64, noise_multiplier: f64, delta: f64) -> f64 {
    (2.0 * num_steps as f64 * (1.0 / delta).ln()).sqrt() / noise_multiplier
}

/// Epsilon after `num_steps` steps, using the default PRV backend.
///
/// A zero noise multiplier gives no protection and returns `+inf`.
pub fn compute_epsilon(
    num_steps: u64,
    noise_multiplier: f64,
    delta: f64,
    kind: AccountantKind,
    sampling_rate: f64,
) -> f64 {
    compute_epsilon_with(
        &PldAccountant::default(),
        num_steps,
        noise_multiplier,
        delta,
        kind,
        sampling_rate,
    )
}

/// Epsilon after `num_steps` steps, delegating PRV to `backend`.
pub fn compute_epsilon_with<C: CompositionAccountant + ?Sized>(
    backend: &C,
    num_steps: u64,
    noise_multiplier: f64,
    delta: f64,
    kind: AccountantKind,
    sampling_rate: f64,
) -> f64 {
    if noise_multiplier == 0.0 {
        return f64::INFINITY;
    }
    match kind {
        AccountantKind::Basic => basic_epsilon(num_steps, noise_multiplier, delta),
        AccountantKind::Rdp => rdp_epsilon(num_steps, noise_multiplier, delta, sampling_rate),
        AccountantKind::Prv => backend
            .compose_epsilon(num_steps, noise_multiplier, delta, sampling_rate)
            .estimate(),
    }
}

/// A configured accountant: method, target delta and PRV backend.
#[derive(Clone, Debug)]
pub struct PrivacyAccountant {
    kind: AccountantKind,
    delta: f64,
    backend: PldAccountant,
}

impl PrivacyAccountant {
    /// Create an accountant; `delta` must lie in `(0, 1)`.
    pub fn new(kind: AccountantKind, delta: f64) -> Result<Self> {
        if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
            return Err(DpError::invalid(format!("delta must be in (0, 1), got {delta}")));
        }
        Ok(Self {
            kind,
            delta,
            backend: PldAccountant::default(),
        })
    }

    /// Replace the PRV backend.
    pub fn with_backend(mut self, backend: PldAccountant) -> Self {
        self.backend = backend;
        self
    }

    /// Composition method.
    pub fn kind(&self) -> AccountantKind {
        self.kind
    }

    /// Target delta.
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Epsilon after `num_steps` steps.
    pub fn epsilon(&self, num_steps: u64, noise_multiplier: f64, sampling_rate: f64) -> f64 {
        compute_epsilon_with(
            &self.backend,
            num_steps,
            noise_multiplier,
            self.delta,
            self.kind,
            sampling_rate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pld::EpsilonEstimate;
    use proptest::prelude::*;

    #[test]
    fn zero_noise_is_infinite_for_every_method() {
        for kind in [AccountantKind::Basic, AccountantKind::Rdp, AccountantKind::Prv] {
            for n in [0, 1, 100] {
                assert!(compute_epsilon(n, 0.0, 1e-5, kind, 0.5).is_infinite());
            }
        }
    }

    #[test]
    fn basic_matches_formula() {
        let eps = compute_epsilon(100, 10.0, 1e-5, AccountantKind::Basic, 1.0);
        let expected = (2.0 * 100.0 * (1e5f64).ln()).sqrt() / 10.0;
        assert!((eps - expected).abs() < 1e-12);
    }

    #[test]
    fn basic_ignores_sampling_rate() {
        let a = compute_epsilon(10, 1.0, 1e-5, AccountantKind::Basic, 0.1);
        let b = compute_epsilon(10, 1.0, 1e-5, AccountantKind::Basic, 1.0);
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_names_are_basic() {
        assert_eq!(AccountantKind::parse("moments"), AccountantKind::Rdp);
        assert_eq!(AccountantKind::parse("PRV"), AccountantKind::Prv);
        assert_eq!(AccountantKind::parse("gdp"), AccountantKind::Basic);
        assert_eq!(AccountantKind::from("basic".to_string()), AccountantKind::Basic);
    }

    struct FixedBackend(EpsilonEstimate);

    impl CompositionAccountant for FixedBackend {
        fn compose_epsilon(&self, _: u64, _: f64, _: f64, _: f64) -> EpsilonEstimate {
            self.0
        }
    }

    #[test]
    fn prv_uses_point_or_middle_estimate() {
        let point = FixedBackend(EpsilonEstimate::Point(1.25));
        assert_eq!(
            compute_epsilon_with(&point, 3, 1.0, 1e-5, AccountantKind::Prv, 0.5),
            1.25
        );
        let triple = FixedBackend(EpsilonEstimate::Bounds {
            lower: 1.0,
            estimate: 2.0,
            upper: 4.0,
        });
        assert_eq!(
            compute_epsilon_with(&triple, 3, 1.0, 1e-5, AccountantKind::Prv, 0.5),
            2.0
        );
    }

    #[test]
    fn accountant_rejects_bad_delta() {
        assert!(PrivacyAccountant::new(AccountantKind::Rdp, 0.0).is_err());
        assert!(PrivacyAccountant::new(AccountantKind::Rdp, 1.0).is_err());
        let acc = PrivacyAccountant::new(AccountantKind::Basic, 1e-5).unwrap();
        assert_eq!(acc.kind(), AccountantKind::Basic);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]
        #[test]
        fn basic_and_rdp_are_monotone_in_steps(
            n1 in 0u64..2_000,
            extra in 1u64..2_000,
            noise in 0.3f64..20.0,
            q in 0.01f64..=1.0,
            rdp in any::<bool>(),
        ) {
            let kind = if rdp { AccountantKind::Rdp } else { AccountantKind::Basic };
            let e1 = compute_epsilon(n1, noise, 1e-5, kind, q);
            let e2 = compute_epsilon(n1 + extra, noise, 1e-5, kind, q);
            prop_assert!(e2 >= e1);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 8, .. ProptestConfig::default() })]
        #[test]
        fn prv_is_monotone_in_steps(
            n1 in 1u64..40,
            extra in 1u64..40,
            noise in 0.8f64..4.0,
            q in 0.05f64..=1.0,
        ) {
            let e1 = compute_epsilon(n1, noise, 1e-5, AccountantKind::Prv, q);
            let e2 = compute_epsilon(n1 + extra, noise, 1e-5, AccountantKind::Prv, q);
            prop_assert!(e1.is_finite() && e2.is_finite());
            // Discretized losses can jitter by up to one grid interval.
            let slack = PldAccountant::default().interval();
            prop_assert!(e2 >= e1 - slack, "e1 = {}, e2 = {}", e1, e2);
        }
    }
}
