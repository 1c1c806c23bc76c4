//! Federated meta-training of a nearest-prototype model on synthetic data.
//!
//! ```text
//! cargo run -p fedmeta --example synthetic_federation -- [config.json]
//! ```
//!
//! `FEDMETA_*` variables override the file, e.g. `FEDMETA_DP_MODE=local`.

use std::path::PathBuf;

use fedmeta::prelude::*;
use fedmeta::telemetry::init_tracing;
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};

const DIM: usize = 8;
const SAMPLES_PER_CLASS: usize = 40;

/// Each sample is its class centroid plus Gaussian noise.
struct Synthetic {
    labels: Vec<usize>,
    features: Array2<f64>,
}

impl Synthetic {
    fn generate<R: Rng>(classes: &[usize], centroids: &Array2<f64>, rng: &mut R) -> Result<Self> {
        let spread = Normal::new(0.0, 0.6).map_err(|e| DpError::invalid(e.to_string()))?;
        let labels: Vec<usize> = (0..classes.len() * SAMPLES_PER_CLASS)
            .map(|i| classes[i % classes.len()])
            .collect();
        let features = Array2::from_shape_fn((labels.len(), DIM), |(i, j)| {
            centroids[[labels[i], j]] + spread.sample(rng)
        });
        Ok(Self { labels, features })
    }
}

/// Learns a linear embedding `encoder.w`; classifies queries by nearest
/// support prototype in the embedded space.
struct PrototypeTrainer {
    data: Synthetic,
    held_out: Synthetic,
    lr: f64,
}

impl PrototypeTrainer {
    fn embed(w: &Array2<f64>, data: &Synthetic, idx: usize) -> Array1<f64> {
        w.dot(&data.features.row(idx))
    }

    fn weights(params: &ParameterSet) -> Result<Array2<f64>> {
        params
            .require_float("encoder.w")?
            .clone()
            .into_dimensionality()
            .map_err(|e| DpError::invalid(e.to_string()))
    }

    fn prototypes(w: &Array2<f64>, data: &Synthetic, episode: &Episode) -> Vec<Array1<f64>> {
        let shots = episode.support.len() / episode.classes.len();
        episode
            .support
            .chunks(shots)
            .map(|chunk| {
                let sum = chunk
                    .iter()
                    .fold(Array1::zeros(DIM), |acc, &i| acc + Self::embed(w, data, i));
                sum / chunk.len() as f64
            })
            .collect()
    }

    fn nearest(protos: &[Array1<f64>], z: &Array1<f64>) -> usize {
        protos
            .iter()
            .map(|p| (p - z).mapv(|v| v * v).sum())
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map_or(0, |(i, _)| i)
    }

    /// Accuracy on the queries and, per query, the gradient of the squared
    /// distance to its own prototype.
    fn episode_step(w: &Array2<f64>, data: &Synthetic, episode: &Episode) -> (f64, Vec<Array2<f64>>) {
        let protos = Self::prototypes(w, data, episode);
        let per_class = episode.query.len() / episode.classes.len();
        let mut correct = 0;
        let mut grads = Vec::with_capacity(episode.query.len());
        for (n, &q) in episode.query.iter().enumerate() {
            let class = n / per_class.max(1);
            let z = Self::embed(w, data, q);
            if Self::nearest(&protos, &z) == class {
                correct += 1;
            }
            let diff = &z - &protos[class];
            let x = data.features.row(q);
            let g = Array2::from_shape_fn((DIM, DIM), |(r, c)| 2.0 * diff[r] * x[c]);
            grads.push(g);
        }
        (correct as f64 / episode.query.len().max(1) as f64, grads)
    }

    /// Unit-norm embeddings of `idx`, one per row.
    fn embed_rows(w: &Array2<f64>, data: &Synthetic, idx: &[usize]) -> Array2<f64> {
        let mut rows = Array2::zeros((idx.len(), DIM));
        for (mut row, &i) in rows.outer_iter_mut().zip(idx) {
            row.assign(&Self::embed(w, data, i));
        }
        l2_normalize_rows(&rows)
    }

    /// Nearest-prototype accuracy on normalized embeddings.
    fn held_out_accuracy(w: &Array2<f64>, data: &Synthetic, episode: &Episode) -> f64 {
        let shots = (episode.support.len() / episode.classes.len().max(1)).max(1);
        let support = Self::embed_rows(w, data, &episode.support);
        let protos: Vec<Array1<f64>> = support
            .axis_chunks_iter(Axis(0), shots)
            .map(|chunk| chunk.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(DIM)))
            .collect();
        let queries = Self::embed_rows(w, data, &episode.query);
        let per_class = (episode.query.len() / episode.classes.len().max(1)).max(1);
        let correct = queries
            .outer_iter()
            .enumerate()
            .filter(|(n, z)| Self::nearest(&protos, &z.to_owned()) == n / per_class)
            .count();
        correct as f64 / episode.query.len().max(1) as f64
    }

    fn sampler(&self, task: &LocalTask<'_>) -> Result<EpisodeSampler> {
        EpisodeSampler::new(&self.data.labels, task.data)
    }
}

impl LocalTrainer for PrototypeTrainer {
    fn train<R: Rng>(
        &mut self,
        task: &LocalTask<'_>,
        params: &mut ParameterSet,
        rng: &mut R,
    ) -> Result<LocalReport> {
        let sampler = self.sampler(task)?;
        let pool = task.split.train_class_ids.to_vec();
        let mut w = Self::weights(params)?;
        let mut acc = 0.0;
        for _ in 0..task.num_tasks {
            let episode = sampler.sample(&task.episode, &pool, rng)?;
            let (a, grads) = Self::episode_step(&w, &self.data, &episode);
            acc += a;
            for g in &grads {
                w.scaled_add(-self.lr / grads.len() as f64, g);
            }
        }
        params.insert_float("encoder.w", w.into_dyn());
        Ok(LocalReport {
            accuracy: acc / task.num_tasks as f64,
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
        let sampler = self.sampler(task)?;
        let pool = task.split.train_class_ids.to_vec();
        let mut acc = 0.0;
        for _ in 0..task.num_tasks {
            let episode = sampler.sample(&task.episode, &pool, rng)?;
            let w = Self::weights(model.module())?;
            let (a, grads) = Self::episode_step(&w, &self.data, &episode);
            acc += a;
            for g in grads {
                let mut sample = Delta::new();
                sample.insert("encoder.w", g.into_dyn());
                model.record_sample(sample)?;
            }
            let step = model.privatize_step(rng, grad_norms)?;
            model.apply_gradient(&step.gradient, self.lr)?;
        }
        Ok(LocalReport {
            accuracy: acc / task.num_tasks as f64,
            num_episodes: task.num_tasks,
        })
    }

    fn evaluate<R: Rng>(
        &mut self,
        task: &LocalTask<'_>,
        params: &ParameterSet,
        shots: usize,
        rng: &mut R,
    ) -> Result<f64> {
        let all: Vec<usize> = (0..self.held_out.labels.len()).collect();
        let sampler = EpisodeSampler::new(&self.held_out.labels, &all)?;
        let pool = task.split.test_class_ids.to_vec();
        let shape = task.episode.with_shots(shots);
        let w = Self::weights(params)?;
        let episodes = 10;
        let mut acc = 0.0;
        for _ in 0..episodes {
            let episode = sampler.sample(&shape, &pool, rng)?;
            acc += Self::held_out_accuracy(&w, &self.held_out, &episode);
        }
        Ok(acc / episodes as f64)
    }
}

fn main() -> Result<()> {
    init_tracing();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match path {
        Some(_) => FederatedConfig::load(path.as_deref())?,
        None => {
            let mut config = FederatedConfig {
                comm_round: 20,
                n_parties: 6,
                sample_fraction: 0.5,
                num_train_tasks: 5,
                dp_noise: 0.8,
                partition: PartitionStrategy::Homogeneous,
                ..FederatedConfig::default()
            };
            config.apply_env_overrides()?;
            config
        }
    };

    let split = fedmeta::dataset_split(&config.dataset)?;
    let train_classes = split.train_class_ids.to_vec();
    let test_classes = split.test_class_ids.to_vec();
    let label_space = train_classes
        .iter()
        .chain(&test_classes)
        .max()
        .map_or(0, |&c| c + 1);
    let mut rng = RunKey::new(config.seed).fold_in(0xDA7A).to_rng();
    let centroids = Array2::from_shape_fn((label_space, DIM), |_| rng.gen_range(-2.0_f64..2.0));
    let data = Synthetic::generate(&train_classes, &centroids, &mut rng)?;
    let held_out = Synthetic::generate(&test_classes, &centroids, &mut rng)?;

    let mut global = ParameterSet::new();
    global.insert_float("encoder.w", Array2::<f64>::eye(DIM).into_dyn());
    global.insert_float("transform_layer.w", Array1::<f64>::ones(DIM).into_dyn());
    let clients = init_clients(&config, &data.labels, &global)?;

    let trainer = PrototypeTrainer {
        data,
        held_out,
        lr: 0.01,
    };
    let mut orch = RoundOrchestrator::new(config, global, clients, trainer)?;
    for summary in orch.run()? {
        println!(
            "round {:>3}  clients {:?}  acc {:?}  eps {}",
            summary.round,
            summary.trained,
            summary.accuracy,
            summary
                .epsilon
                .map_or_else(|| "-".to_string(), |e| format!("{e:.3}")),
        );
    }
    Ok(())
}
