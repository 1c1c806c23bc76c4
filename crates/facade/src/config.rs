//! Run configuration.
//!
//! Values come from defaults, then an optional JSON file, then `FEDMETA_*`
//! environment variables. [`FederatedConfig::validate`] runs after all
//! sources have been applied.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fedmeta_accounting::{AccountantKind, NoiseSearch};
use fedmeta_core::{DpError, PersonalizationPolicy, Result, DEFAULT_GRAD_NORM_DECAY};

use crate::datasets::dataset_split;
use crate::episode::EpisodeShape;
use crate::partition::PartitionStrategy;

/// Where differential privacy is applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DpMode {
    /// Client-level DP-SGD inside local training.
    Local,
    /// Clipping and noise on the aggregated deltas.
    #[default]
    Server,
    /// No privacy protection, sample-weighted averaging.
    Off,
}

impl DpMode {
    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DpMode::Local => "local",
            DpMode::Server => "server",
            DpMode::Off => "off",
        }
    }

    /// Whether privacy accounting runs in this mode.
    pub fn is_private(&self) -> bool {
        !matches!(self, DpMode::Off)
    }
}

impl FromStr for DpMode {
    type Err = DpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(DpMode::Local),
            "server" => Ok(DpMode::Server),
            "off" => Ok(DpMode::Off),
            other => Err(DpError::config(format!(
                "dp_mode must be one of local, server, off; got `{other}`"
            ))),
        }
    }
}

impl fmt::Display for DpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of one federated training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederatedConfig {
    /// Where privacy is applied.
    pub dp_mode: DpMode,
    /// L2 clip norm.
    pub dp_clip: f64,
    /// Noise multiplier; replaced by calibration when `target_epsilon` is set.
    pub dp_noise: f64,
    /// Target delta.
    pub dp_delta: f64,
    /// Composition method for epsilon reports.
    pub dp_accountant: AccountantKind,
    /// Fraction of clients selected per round.
    pub sample_fraction: f64,
    /// FedAvgM momentum; 0 disables it.
    pub server_momentum: f64,
    /// Total communication rounds.
    pub comm_round: usize,
    /// Number of clients.
    pub n_parties: usize,
    /// Root seed for every random stream.
    pub seed: u64,
    /// Meta-training episodes per client and round.
    pub num_train_tasks: usize,
    /// Calibrate the noise multiplier to this epsilon at start-up.
    pub target_epsilon: Option<f64>,
    /// Calibration bracket and stopping rule.
    pub noise_search: NoiseSearch,
    /// Retune the clip norm from observed gradient norms (local mode).
    pub adaptive_clip: bool,
    /// Percentile used by adaptive clipping.
    pub clip_percentile: f64,
    /// Decay of the gradient-norm moving averages.
    pub grad_norm_decay: f64,
    /// Parameter-name prefixes that never leave the client.
    pub personal_prefixes: Vec<String>,
    /// Parameter-name prefixes of the classifier head (not broadcast).
    pub head_prefixes: Vec<String>,
    /// Episode shape for meta-training.
    pub episode: EpisodeShape,
    /// Support shots evaluated after each broadcast.
    pub eval_shots: Vec<usize>,
    /// Dataset identifier.
    pub dataset: String,
    /// How training samples are split across clients.
    pub partition: PartitionStrategy,
    /// Prefix of checkpoint artifacts.
    pub run_id: String,
    /// Rounds already completed by a previous run.
    pub start_round: usize,
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            dp_mode: DpMode::default(),
            dp_clip: 1.0,
            dp_noise: 0.0,
            dp_delta: 1e-5,
            dp_accountant: AccountantKind::default(),
            sample_fraction: 1.0,
            server_momentum: 0.0,
            comm_round: 5000,
            n_parties: 10,
            seed: 0,
            num_train_tasks: 50,
            target_epsilon: None,
            noise_search: NoiseSearch::default(),
            adaptive_clip: false,
            clip_percentile: 90.0,
            grad_norm_decay: DEFAULT_GRAD_NORM_DECAY,
            personal_prefixes: vec!["transform_layer".into()],
            head_prefixes: vec!["few_classify".into(), "transformer".into()],
            episode: EpisodeShape::default(),
            eval_shots: vec![1, 5],
            dataset: "FC100".into(),
            partition: PartitionStrategy::default(),
            run_id: "fedmeta".into(),
            start_round: 0,
        }
    }
}

impl FederatedConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DpError::config(format!("invalid config json: {e}")))
    }

    /// Read a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DpError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    /// Defaults, then `path` if given, then the environment; validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FEDMETA_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides looked up by variable name.
    ///
    /// Recognized: `FEDMETA_DP_MODE`, `FEDMETA_DP_CLIP`, `FEDMETA_DP_NOISE`,
    /// `FEDMETA_DP_DELTA`, `FEDMETA_DP_ACCOUNTANT`, `FEDMETA_SAMPLE_FRACTION`,
    /// `FEDMETA_SERVER_MOMENTUM`, `FEDMETA_COMM_ROUND`, `FEDMETA_N_PARTIES`,
    /// `FEDMETA_SEED`, `FEDMETA_NUM_TRAIN_TASKS`, `FEDMETA_TARGET_EPSILON`,
    /// `FEDMETA_DATASET`, `FEDMETA_RUN_ID`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FEDMETA_DP_MODE") {
            self.dp_mode = v.parse()?;
        }
        if let Some(v) = lookup("FEDMETA_DP_CLIP") {
            self.dp_clip = parse_var("FEDMETA_DP_CLIP", &v)?;
        }
        if let Some(v) = lookup("FEDMETA_DP_NOISE") {
            self.dp_noise = parse_var("FEDMETA_DP_NOISE", &v)?;
        }
        if let Some(v) = lookup("FEDMETA_DP_DELTA") {
            self.dp_delta = parse_var("FEDMETA_DP_DELTA", &v)?;
        }
        if let Some(v) = lookup("FEDMETA_DP_ACCOUNTANT") {
            self.dp_accountant = AccountantKind::parse(&v);
        }
        if let Some(v) = lookup("FEDMETA_SAMPLE_FRACTION") {
            self.sample_fraction = parse_var("FEDMETA_SAMPLE_FRACTION", &v)?;
        }
        if let Some(v) = lookup("FEDMETA_SERVER_MOMENTUM") {
            self.server_momentum = parse_var("FEDMETA_SERVER_MOMENTUM", &v)?;
        }
        if let Some(v) = lookup("FEDMETA_COMM_ROUND") {
            self.comm_round = parse_var("FEDMETA_COMM_ROUND", &v)?;
        }
        if let Some(v) = lookup("FEDMETA_N_PARTIES") {
            self.n_parties = parse_var("FEDMETA_N_PARTIES", &v)?;
        }
        if let Some(v) = lookup("FEDMETA_SEED") {
            self.seed = parse_var("FEDMETA_SEED", &v)?;
        }
        if let Some(v) = lookup("FEDMETA_NUM_TRAIN_TASKS") {
            self.num_train_tasks = parse_var("FEDMETA_NUM_TRAIN_TASKS", &v)?;
        }
        if let Some(v) = lookup("FEDMETA_TARGET_EPSILON") {
            self.target_epsilon = Some(parse_var("FEDMETA_TARGET_EPSILON", &v)?);
        }
        if let Some(v) = lookup("FEDMETA_DATASET") {
            self.dataset = v;
        }
        if let Some(v) = lookup("FEDMETA_RUN_ID") {
            self.run_id = v;
        }
        Ok(())
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.dp_clip.is_finite() || self.dp_clip <= 0.0 {
            return Err(DpError::config("dp_clip must be positive"));
        }
        if !self.dp_noise.is_finite() || self.dp_noise < 0.0 {
            return Err(DpError::config("dp_noise must be non-negative"));
        }
        if !self.dp_delta.is_finite() || self.dp_delta <= 0.0 || self.dp_delta >= 1.0 {
            return Err(DpError::config("dp_delta must be in (0, 1)"));
        }
        if !self.sample_fraction.is_finite()
            || self.sample_fraction <= 0.0
            || self.sample_fraction > 1.0
        {
            return Err(DpError::config("sample_fraction must be in (0, 1]"));
        }
        if !self.server_momentum.is_finite() || !(0.0..1.0).contains(&self.server_momentum) {
            return Err(DpError::config("server_momentum must be in [0, 1)"));
        }
        if self.comm_round == 0 {
            return Err(DpError::config("comm_round must be positive"));
        }
        if self.n_parties == 0 {
            return Err(DpError::config("n_parties must be positive"));
        }
        if self.start_round >= self.comm_round {
            return Err(DpError::config(format!(
                "start_round {} leaves no rounds out of {}",
                self.start_round, self.comm_round
            )));
        }
        if self.num_train_tasks == 0 {
            return Err(DpError::config("num_train_tasks must be positive"));
        }
        if !(0.0..=100.0).contains(&self.clip_percentile) {
            return Err(DpError::config("clip_percentile must be in [0, 100]"));
        }
        if !self.grad_norm_decay.is_finite() || !(0.0..1.0).contains(&self.grad_norm_decay) {
            return Err(DpError::config("grad_norm_decay must be in [0, 1)"));
        }
        if self.eval_shots.iter().any(|&k| k == 0) {
            return Err(DpError::config("eval_shots must be positive"));
        }
        self.episode.validate()?;
        self.noise_search.validate()?;
        if let Some(eps) = self.target_epsilon {
            if self.dp_mode == DpMode::Off {
                return Err(DpError::config("target_epsilon requires dp_mode local or server"));
            }
            if !eps.is_finite() || eps <= 0.0 {
                return Err(DpError::config("target_epsilon must be positive"));
            }
        }
        dataset_split(&self.dataset)?;
        debug!(dp_mode = %self.dp_mode, accountant = %self.dp_accountant, "config validated");
        Ok(())
    }

    /// Personalization policy built from the prefix lists.
    pub fn policy(&self) -> PersonalizationPolicy {
        PersonalizationPolicy::new(self.personal_prefixes.iter().cloned())
            .with_head_prefixes(self.head_prefixes.iter().cloned())
    }

    /// Rounds left to run.
    pub fn remaining_rounds(&self) -> usize {
        self.comm_round.saturating_sub(self.start_round)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DpError::config(format!("invalid {name}={value:?}: {e}")))
}
