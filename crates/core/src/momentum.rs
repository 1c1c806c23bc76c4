//! Server momentum (FedAvgM).

use std::collections::BTreeMap;

use crate::error::{DpError, Result};
use crate::params::ParameterSet;
use crate::tensor::Tensor;

/// Exponential smoothing of successive global update directions.
///
/// For each floating-point key, with `old` the global value before the round
/// and `new` the aggregation result:
/// `buffer = beta * buffer + (1 - beta) * (old - new)` and `new = old - buffer`.
#[derive(Clone, Debug)]
pub struct ServerMomentum {
    beta: f64,
    buffers: BTreeMap<String, Tensor>,
}

impl ServerMomentum {
    /// Create a momentum tracker; `beta` must lie in `[0, 1)`.
    pub fn new(beta: f64) -> Result<Self> {
        if !beta.is_finite() || !(0.0..1.0).contains(&beta) {
            return Err(DpError::invalid(format!(
                "server momentum must be in [0, 1), got {beta}"
            )));
        }
        Ok(Self {
            beta,
            buffers: BTreeMap::new(),
        })
    }

    /// Momentum coefficient.
    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Current buffer for `name`, if one has been created.
    pub fn buffer(&self, name: &str) -> Option<&Tensor> {
        self.buffers.get(name)
    }

    /// Rewrite `new_global` in place using the momentum buffers.
    ///
    /// On error neither `new_global` nor the buffers are modified.
    pub fn apply(&mut self, old_global: &ParameterSet, new_global: &mut ParameterSet) -> Result<()> {
        let beta = self.beta;
        let mut staged = Vec::new();
        for (name, new) in new_global.floats() {
            let Some(old) = old_global.float(name) else {
                continue;
            };
            let mut buffer = match self.buffers.get(name) {
                Some(buffer) => buffer.clone(),
                None => Tensor::zeros(old.raw_dim()),
            };
            for found in [new.shape(), buffer.shape()] {
                if found != old.shape() {
                    return Err(DpError::ShapeMismatch {
                        key: name.to_string(),
                        expected: old.shape().to_vec(),
                        found: found.to_vec(),
                    });
                }
            }
            buffer.mapv_inplace(|m| m * beta);
            buffer.scaled_add(1.0 - beta, &(old - new));
            let value = old - &buffer;
            staged.push((name.to_string(), buffer, value));
        }
        for (name, buffer, value) in staged {
            if let Some(slot) = new_global.float_mut(&name) {
                *slot = value;
            }
            self.buffers.insert(name, buffer);
        }
        Ok(())
    }
}
