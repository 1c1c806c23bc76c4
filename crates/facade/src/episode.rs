//! N-way K-shot episode shapes and sampling.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use fedmeta_core::{DpError, Result};

/// Classes per episode, support shots per class and queries per class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeShape {
    /// Classes per episode (N).
    pub n_way: usize,
    /// Support examples per class (K).
    pub k_shot: usize,
    /// Query examples per class (Q).
    pub q_query: usize,
}

impl Default for EpisodeShape {
    fn default() -> Self {
        Self {
            n_way: 5,
            k_shot: 5,
            q_query: 5,
        }
    }
}

impl EpisodeShape {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.n_way < 2 {
            return Err(DpError::invalid("n_way must be at least 2"));
        }
        if self.k_shot == 0 || self.q_query == 0 {
            return Err(DpError::invalid("k_shot and q_query must be positive"));
        }
        Ok(())
    }

    /// The same shape with `k_shot` replaced.
    pub fn with_shots(self, k_shot: usize) -> Self {
        Self { k_shot, ..self }
    }

    /// Examples drawn per class.
    pub fn per_class(&self) -> usize {
        self.k_shot + self.q_query
    }

    /// Examples per episode: `N*K + N*Q`.
    pub fn batch_size(&self) -> usize {
        self.n_way * self.k_shot + self.n_way * self.q_query
    }

    /// Fraction of a client's samples seen by one episode, capped at 1.
    pub fn sampling_rate(&self, client_samples: usize) -> f64 {
        if client_samples == 0 {
            return 1.0;
        }
        (self.batch_size() as f64 / client_samples as f64).min(1.0)
    }
}

/// Sample indices of one episode; labels are positions in `classes`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Episode {
    /// Class ids, in label order.
    pub classes: Vec<usize>,
    /// `K` support indices per class, grouped by class.
    pub support: Vec<usize>,
    /// `Q` query indices per class, grouped by class.
    pub query: Vec<usize>,
}

impl Episode {
    /// Dense label of every support index.
    pub fn support_labels(&self) -> Vec<usize> {
        group_labels(self.classes.len(), self.support.len())
    }

    /// Dense label of every query index.
    pub fn query_labels(&self) -> Vec<usize> {
        group_labels(self.classes.len(), self.query.len())
    }
}

fn group_labels(n_way: usize, len: usize) -> Vec<usize> {
    let per = if n_way == 0 { 0 } else { len / n_way };
    (0..n_way).flat_map(|c| std::iter::repeat(c).take(per)).collect()
}

/// Draws episodes from the samples of one data partition.
#[derive(Clone, Debug, Default)]
pub struct EpisodeSampler {
    by_class: BTreeMap<usize, Vec<usize>>,
}

impl EpisodeSampler {
    /// Index `indices` by their label in `labels`.
    pub fn new(labels: &[usize], indices: &[usize]) -> Result<Self> {
        let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &idx in indices {
            let label = labels.get(idx).copied().ok_or_else(|| {
                DpError::invalid(format!("sample index {idx} out of range ({})", labels.len()))
            })?;
            by_class.entry(label).or_default().push(idx);
        }
        Ok(Self { by_class })
    }

    /// Number of samples of `class`.
    pub fn class_size(&self, class: usize) -> usize {
        self.by_class.get(&class).map_or(0, Vec::len)
    }

    /// Draw an episode whose classes come from `pool`.
    ///
    /// Only classes with at least `K + Q` samples are eligible.
    pub fn sample<R: Rng>(&self, shape: &EpisodeShape, pool: &[usize], rng: &mut R) -> Result<Episode> {
        shape.validate()?;
        let eligible: Vec<usize> = pool
            .iter()
            .copied()
            .filter(|&c| self.class_size(c) >= shape.per_class())
            .collect();
        if eligible.len() < shape.n_way {
            return Err(DpError::invalid(format!(
                "{} classes have {} samples, an episode needs {}",
                eligible.len(),
                shape.per_class(),
                shape.n_way
            )));
        }

        let classes: Vec<usize> = eligible
            .choose_multiple(rng, shape.n_way)
            .copied()
            .collect();
        let mut support = Vec::with_capacity(shape.n_way * shape.k_shot);
        let mut query = Vec::with_capacity(shape.n_way * shape.q_query);
        for class in &classes {
            let Some(samples) = self.by_class.get(class) else {
                continue;
            };
            let picked: Vec<usize> = samples
                .choose_multiple(rng, shape.per_class())
                .copied()
                .collect();
            support.extend_from_slice(&picked[..shape.k_shot]);
            query.extend_from_slice(&picked[shape.k_shot..]);
        }
        Ok(Episode {
            classes,
            support,
            query,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn batch_size_and_rate() {
        let shape = EpisodeShape::default();
        assert_eq!(shape.batch_size(), 50);
        assert_eq!(shape.sampling_rate(500), 0.1);
        assert_eq!(shape.sampling_rate(20), 1.0);
        assert_eq!(shape.with_shots(1).batch_size(), 30);
    }

    #[test]
    fn sampled_episode_has_requested_shape() {
        let labels: Vec<usize> = (0..8).flat_map(|c| std::iter::repeat(c).take(12)).collect();
        let all: Vec<usize> = (0..labels.len()).collect();
        let sampler = EpisodeSampler::new(&labels, &all).unwrap();
        let shape = EpisodeShape {
            n_way: 3,
            k_shot: 2,
            q_query: 4,
        };
        let pool: Vec<usize> = (0..8).collect();
        let ep = sampler
            .sample(&shape, &pool, &mut ChaCha8Rng::seed_from_u64(5))
            .unwrap();
        assert_eq!(ep.classes.len(), 3);
        assert_eq!(ep.support.len(), 6);
        assert_eq!(ep.query.len(), 12);
        assert_eq!(ep.support_labels(), vec![0, 0, 1, 1, 2, 2]);
        for (i, &idx) in ep.support.iter().enumerate() {
            assert_eq!(labels[idx], ep.classes[i / 2]);
        }
        assert!(ep.support.iter().all(|s| !ep.query.contains(s)));
    }

    #[test]
    fn small_classes_are_not_eligible() {
        let labels = vec![0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1];
        let all: Vec<usize> = (0..labels.len()).collect();
        let sampler = EpisodeSampler::new(&labels, &all).unwrap();
        let err = sampler
            .sample(&EpisodeShape::default(), &[0, 1], &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, DpError::InvalidParameters { .. }));
    }
}
