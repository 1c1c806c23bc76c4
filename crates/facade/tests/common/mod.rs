#![allow(dead_code)]

use std::collections::BTreeSet;

use fedmeta::prelude::*;
use ndarray::Array1;
use rand::Rng;

pub const DIM: usize = 4;
pub const CLASSES: usize = 20;

/// Label of every training sample; `CLASSES` classes, 20 samples each.
pub fn train_labels() -> Vec<usize> {
    (0..CLASSES * 20).map(|i| i % CLASSES).collect()
}

pub fn initial_global() -> ParameterSet {
    let mut p = ParameterSet::new();
    p.insert_float("encoder.w", Array1::zeros(DIM).into_dyn());
    p.insert_float("transform_layer.w", Array1::from_elem(DIM, 0.5).into_dyn());
    p.insert_counter("encoder.bn.num_batches_tracked", ndarray::array![0_i64].into_dyn());
    p
}

pub fn small_config(dp_mode: DpMode) -> FederatedConfig {
    FederatedConfig {
        dp_mode,
        dp_accountant: AccountantKind::Basic,
        n_parties: 4,
        sample_fraction: 0.5,
        comm_round: 3,
        num_train_tasks: 3,
        partition: PartitionStrategy::Homogeneous,
        episode: EpisodeShape {
            n_way: 5,
            k_shot: 1,
            q_query: 2,
        },
        eval_shots: vec![1, 5],
        seed: 11,
        ..FederatedConfig::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Recoverable `LocalTraining` error after touching the model.
    Recoverable,
    /// Error not marked as recoverable.
    Unrecoverable,
}

/// Pulls `encoder.w` towards a fixed target; accuracy grows as it gets close.
pub struct ToyTrainer {
    pub labels: Vec<usize>,
    pub target: Array1<f64>,
    pub lr: f64,
    pub failing: BTreeSet<usize>,
    pub failure: Failure,
    pub private_calls: usize,
}

impl ToyTrainer {
    pub fn new(labels: Vec<usize>) -> Self {
        Self {
            labels,
            target: Array1::from_elem(DIM, 1.0),
            lr: 0.3,
            failing: BTreeSet::new(),
            failure: Failure::Recoverable,
            private_calls: 0,
        }
    }

    pub fn failing(mut self, clients: &[usize], failure: Failure) -> Self {
        self.failing = clients.iter().copied().collect();
        self.failure = failure;
        self
    }

    fn fail(&self, task: &LocalTask<'_>) -> Result<()> {
        if !self.failing.contains(&task.client_id) {
            return Ok(());
        }
        Err(match self.failure {
            Failure::Recoverable => DpError::local_training(task.client_id, "diverged"),
            Failure::Unrecoverable => DpError::invalid("model exploded"),
        })
    }

    fn accuracy(&self, params: &ParameterSet) -> Result<f64> {
        let w = params.require_float("encoder.w")?;
        let dist: f64 = w
            .iter()
            .zip(self.target.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();
        Ok(1.0 / (1.0 + dist))
    }

    fn gradient<R: Rng>(&self, w: &Tensor, rng: &mut R) -> Tensor {
        let jitter: Tensor = Array1::from_shape_fn(DIM, |_| rng.gen_range(-0.05_f64..0.05)).into_dyn();
        w - &self.target.clone().into_dyn() + jitter
    }

    fn pool(task: &LocalTask<'_>) -> Vec<usize> {
        task.split
            .train_class_ids
            .to_vec()
            .into_iter()
            .filter(|&c| c < CLASSES)
            .collect()
    }
}

impl LocalTrainer for ToyTrainer {
    fn train<R: Rng>(
        &mut self,
        task: &LocalTask<'_>,
        params: &mut ParameterSet,
        rng: &mut R,
    ) -> Result<LocalReport> {
        let sampler = EpisodeSampler::new(&self.labels, task.data)?;
        let pool = Self::pool(task);
        for _ in 0..task.num_tasks {
            sampler.sample(&task.episode, &pool, rng)?;
            let grad = self.gradient(params.require_float("encoder.w")?, rng);
            let w = params
                .float_mut("encoder.w")
                .ok_or_else(|| DpError::missing_key("encoder.w"))?;
            w.scaled_add(-self.lr, &grad);
        }
        self.fail(task)?;
        Ok(LocalReport {
            accuracy: self.accuracy(params)?,
            num_episodes: task.num_tasks,
        })
    }

    fn train_private<R: Rng>(
        &mut self,
        task: &LocalTask<'_>,
        model: &mut Instrumented,
        grad_norms: &mut GradNormTracker,
        rng: &mut R,
    ) -> Result<LocalReport> {
        self.private_calls += 1;
        let sampler = EpisodeSampler::new(&self.labels, task.data)?;
        let pool = Self::pool(task);
        for _ in 0..task.num_tasks {
            let episode = sampler.sample(&task.episode, &pool, rng)?;
            for _ in episode.support.iter().chain(&episode.query) {
                let w = model.module().require_float("encoder.w")?.clone();
                let mut grads = Delta::new();
                grads.insert("encoder.w", self.gradient(&w, rng));
                model.record_sample(grads)?;
            }
            // Fails with samples still cached on the wrapper.
            self.fail(task)?;
            let step = model.privatize_step(rng, grad_norms)?;
            model.apply_gradient(&step.gradient, self.lr)?;
        }
        Ok(LocalReport {
            accuracy: self.accuracy(model.module())?,
            num_episodes: task.num_tasks,
        })
    }

    fn evaluate<R: Rng>(
        &mut self,
        _task: &LocalTask<'_>,
        params: &ParameterSet,
        shots: usize,
        rng: &mut R,
    ) -> Result<f64> {
        let bonus = shots as f64 / (shots as f64 + 1.0);
        let noise = rng.gen_range(0.0_f64..0.01);
        Ok((self.accuracy(params)? * bonus + noise).min(1.0))
    }
}
