//! Client state and the local-training collaborator.

use rand::Rng;

use fedmeta_core::{GradNormTracker, Instrumented, ParameterSet, Result};
use fedmeta_prng::{RunKey, Stream};

use crate::config::FederatedConfig;
use crate::datasets::DatasetSplit;
use crate::episode::EpisodeShape;
use crate::partition::partition;

/// One client: its parameters and the training samples it holds.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientState {
    /// Client id, also its index in the orchestrator.
    pub id: usize,
    /// The client's full parameter set, personalized keys included.
    pub params: ParameterSet,
    /// Indices of the client's training samples.
    pub data: Vec<usize>,
}

impl ClientState {
    /// A client starting from a copy of the global parameters.
    pub fn from_global(id: usize, global: &ParameterSet, data: Vec<usize>) -> Self {
        Self {
            id,
            params: global.clone(),
            data,
        }
    }

    /// Number of training samples, the client's FedAvg weight.
    pub fn num_samples(&self) -> usize {
        self.data.len()
    }
}

/// Partition `labels` per `config` and start every client from `global`.
pub fn init_clients(
    config: &FederatedConfig,
    labels: &[usize],
    global: &ParameterSet,
) -> Result<Vec<ClientState>> {
    let mut rng = RunKey::new(config.seed).stream(Stream::Partition).to_rng();
    let map = partition(labels, config.n_parties, &config.partition, &mut rng)?;
    Ok(map
        .into_iter()
        .map(|(id, data)| ClientState::from_global(id, global, data))
        .collect())
}

/// What local training gets to know about one client in one round.
#[derive(Clone, Copy, Debug)]
pub struct LocalTask<'a> {
    /// Client id.
    pub client_id: usize,
    /// Absolute round index.
    pub round: usize,
    /// Indices of the client's training samples.
    pub data: &'a [usize],
    /// Class split of the dataset.
    pub split: &'a DatasetSplit,
    /// Meta-training episode shape.
    pub episode: EpisodeShape,
    /// Episodes to run.
    pub num_tasks: usize,
}

/// Outcome of one client's local training.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalReport {
    /// Meta-training accuracy.
    pub accuracy: f64,
    /// Episodes actually run.
    pub num_episodes: usize,
}

/// Episodic meta-learning on one client.
///
/// Implementations own the model architecture and loss. The orchestrator only
/// sees parameter sets before and after.
pub trait LocalTrainer {
    /// Train `params` in place without per-sample instrumentation.
    fn train<R: Rng>(
        &mut self,
        task: &LocalTask<'_>,
        params: &mut ParameterSet,
        rng: &mut R,
    ) -> Result<LocalReport>;

    /// Train through DP-SGD: record per-example gradients on `model`,
    /// privatize and apply each step.
    fn train_private<R: Rng>(
        &mut self,
        task: &LocalTask<'_>,
        model: &mut Instrumented,
        grad_norms: &mut GradNormTracker,
        rng: &mut R,
    ) -> Result<LocalReport>;

    /// Accuracy on held-out test classes with `shots` support examples.
    fn evaluate<R: Rng>(
        &mut self,
        task: &LocalTask<'_>,
        params: &ParameterSet,
        shots: usize,
        rng: &mut R,
    ) -> Result<f64>;
}
