//! Error types for federated DP operations.

/// Errors that can occur during federated DP training.
#[derive(Debug, thiserror::Error)]
pub enum DpError {
    /// The target epsilon cannot be reached inside the noise search bracket.
    #[error(
        "target epsilon {target_eps} is not bracketed by noise multipliers \
         [{sigma_min}, {sigma_max}] (epsilon {eps_at_min:.4} at {sigma_min}, \
         {eps_at_max:.4} at {sigma_max})"
    )]
    UnbracketedTarget {
        /// Requested epsilon.
        target_eps: f64,
        /// Lower end of the search bracket.
        sigma_min: f64,
        /// Upper end of the search bracket.
        sigma_max: f64,
        /// Epsilon at `sigma_min`.
        eps_at_min: f64,
        /// Epsilon at `sigma_max`.
        eps_at_max: f64,
    },

    /// Invalid parameter provided.
    #[error("invalid parameter: {msg}")]
    InvalidParameters {
        /// Human-readable error description.
        msg: String,
    },

    /// Numerical computation error.
    #[error("numerical error: {msg}")]
    NumericalError {
        /// Human-readable error description.
        msg: String,
    },

    /// Configuration error.
    #[error("configuration error: {msg}")]
    ConfigError {
        /// Human-readable error description.
        msg: String,
    },

    /// A parameter expected in both snapshots is missing from one of them.
    #[error("parameter `{key}` is missing or not floating-point")]
    MissingKey {
        /// Parameter name.
        key: String,
    },

    /// Two snapshots disagree on a parameter's shape.
    #[error("parameter `{key}` has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Parameter name.
        key: String,
        /// Shape in the reference snapshot.
        expected: Vec<usize>,
        /// Shape actually found.
        found: Vec<usize>,
    },

    /// Local training failed on one client.
    #[error("local training failed on client {client}: {msg}")]
    LocalTraining {
        /// Client identifier.
        client: usize,
        /// Human-readable error description.
        msg: String,
    },

    /// Attaching or detaching per-sample gradient instrumentation failed.
    #[error("instrumentation error: {msg}")]
    Instrumentation {
        /// Human-readable error description.
        msg: String,
    },

    /// Persisting a checkpoint failed.
    #[error("checkpoint error: {msg}")]
    Checkpoint {
        /// Human-readable error description.
        msg: String,
    },

    /// Unsupported feature or configuration.
    #[error("unsupported feature: {msg}")]
    UnsupportedFeature {
        /// Human-readable error description.
        msg: String,
    },
}

/// Result type for DP operations.
pub type Result<T> = std::result::Result<T, DpError>;

impl DpError {
    /// Create an invalid parameter error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameters { msg: msg.into() }
    }

    /// Create a numerical error.
    pub fn numerical<S: Into<String>>(msg: S) -> Self {
        Self::NumericalError { msg: msg.into() }
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError { msg: msg.into() }
    }

    /// Create a missing-key error.
    pub fn missing_key<S: Into<String>>(key: S) -> Self {
        Self::MissingKey { key: key.into() }
    }

    /// Create a local-training error for `client`.
    pub fn local_training<S: Into<String>>(client: usize, msg: S) -> Self {
        Self::LocalTraining {
            client,
            msg: msg.into(),
        }
    }

    /// Create an instrumentation error.
    pub fn instrumentation<S: Into<String>>(msg: S) -> Self {
        Self::Instrumentation { msg: msg.into() }
    }

    /// Create a checkpoint error.
    pub fn checkpoint<S: Into<String>>(msg: S) -> Self {
        Self::Checkpoint { msg: msg.into() }
    }

    /// Create an unsupported feature error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::UnsupportedFeature { msg: msg.into() }
    }

    /// Whether the error is of a kind that never ends a run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LocalTraining { .. } | Self::Instrumentation { .. } | Self::Checkpoint { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbracketed_message_names_the_bracket() {
        let err = DpError::UnbracketedTarget {
            target_eps: 2.0,
            sigma_min: 0.5,
            sigma_max: 10.0,
            eps_at_min: 96.0,
            eps_at_max: 4.8,
        };
        let msg = err.to_string();
        assert!(msg.contains("2"));
        assert!(msg.contains("[0.5, 10]"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn client_errors_are_recoverable() {
        assert!(DpError::local_training(3, "boom").is_recoverable());
        assert!(DpError::instrumentation("detach").is_recoverable());
        assert!(!DpError::config("bad").is_recoverable());
        assert!(!DpError::missing_key("w").is_recoverable());
    }
}
