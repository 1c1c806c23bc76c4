//! Privacy accounting for federated DP training.
//!
//! Epsilon under basic composition, Rényi DP and the privacy random variable
//! (a discretized privacy-loss distribution), noise calibration to a target
//! epsilon, and the run-wide [`PrivacyState`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accountant;
pub mod calibrate;
pub mod pld;
pub mod rdp;
pub mod state;

pub use accountant::{
    basic_epsilon, compute_epsilon, compute_epsilon_with, AccountantKind, PrivacyAccountant,
};
pub use calibrate::{calibrate_noise, find_noise_multiplier, NoiseSearch};
pub use pld::{CompositionAccountant, EpsilonEstimate, PldAccountant};
pub use rdp::{default_orders, gaussian_rdp, rdp_epsilon, RdpAccountant};
pub use state::PrivacyState;

/// Common imports for privacy accounting.
pub mod prelude {
    pub use crate::{
        basic_epsilon, calibrate_noise, compute_epsilon, compute_epsilon_with,
        find_noise_multiplier, AccountantKind, CompositionAccountant, EpsilonEstimate,
        NoiseSearch, PldAccountant, PrivacyAccountant, PrivacyState, RdpAccountant,
    };
}
