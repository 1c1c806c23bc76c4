//! Core primitives for differentially private federated learning.
//!
//! This crate provides framework-agnostic building blocks: named parameter
//! sets with a personalization policy, joint delta clipping, the Gaussian
//! mechanism, delta computation, DP and weighted aggregation, server
//! momentum, and client-level DP-SGD instrumentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod clipping;
pub mod delta;
pub mod dpsgd;
pub mod error;
pub mod grad_norm;
pub mod instrumentation;
pub mod momentum;
pub mod noise;
pub mod params;
pub mod tensor;

pub use aggregate::{AggregateReport, Aggregator, WeightedParams};
pub use clipping::{clip_delta, clip_factor, ClipReport, Delta, CLIP_EPSILON};
pub use delta::{DeltaComputer, DeltaPair};
pub use dpsgd::{DpSgdConfig, DpSgdEngine, HookHandle, Instrumented, PrivateGradient};
pub use error::{DpError, Result};
pub use grad_norm::{GradNormTracker, DEFAULT_GRAD_NORM_DECAY};
pub use instrumentation::{
    with_instrumentation, DetachFailed, Instrument, Refused, ScopedRun, StripHooks,
};
pub use momentum::ServerMomentum;
pub use noise::{add_gaussian_noise, add_gaussian_noise_delta, GaussianMechanism};
pub use params::{ParamValue, ParameterSet, PersonalizationPolicy};
pub use tensor::{l2_norm, l2_normalize_rows, Scalar, Tensor};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        add_gaussian_noise, add_gaussian_noise_delta, clip_delta, l2_norm, l2_normalize_rows,
        with_instrumentation, AggregateReport, Aggregator, ClipReport, Delta,
        DeltaComputer, DeltaPair, DpError, DpSgdConfig, DpSgdEngine, GaussianMechanism,
        GradNormTracker, Instrument, Instrumented, ParamValue, ParameterSet,
        PersonalizationPolicy, Result, Scalar, ScopedRun, ServerMomentum, StripHooks, Tensor,
        WeightedParams,
    };
}
