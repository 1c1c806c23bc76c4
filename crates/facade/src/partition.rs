//! Splitting a labeled training set across clients.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Dirichlet, Distribution};
use serde::{Deserialize, Serialize};
use tracing::debug;

use fedmeta_core::{DpError, Result};

/// Smallest number of samples every client must receive.
pub const MIN_CLIENT_SAMPLES: usize = 10;

/// Dirichlet draws attempted before giving up.
pub const MAX_PARTITION_ATTEMPTS: usize = 1_000;

/// Sample indices held by each client, keyed by client id.
pub type PartitionMap = BTreeMap<usize, Vec<usize>>;

/// How training samples are spread across clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PartitionStrategy {
    /// Shuffle, then split into equal shares.
    Homogeneous,
    /// Label skew: per class, proportions drawn from `Dirichlet(beta)`.
    Dirichlet {
        /// Concentration; smaller values give more skew.
        beta: f64,
    },
}

impl Default for PartitionStrategy {
    fn default() -> Self {
        PartitionStrategy::Dirichlet { beta: 1.0 }
    }
}

/// Partition `labels` (one per sample) across `num_clients` clients.
pub fn partition<R: Rng>(
    labels: &[usize],
    num_clients: usize,
    strategy: &PartitionStrategy,
    rng: &mut R,
) -> Result<PartitionMap> {
    if num_clients == 0 {
        return Err(DpError::invalid("num_clients must be positive"));
    }
    match strategy {
        PartitionStrategy::Homogeneous => Ok(homogeneous(labels.len(), num_clients, rng)),
        PartitionStrategy::Dirichlet { beta } => dirichlet(labels, num_clients, *beta, rng),
    }
}

fn homogeneous<R: Rng>(num_samples: usize, num_clients: usize, rng: &mut R) -> PartitionMap {
    let mut idxs: Vec<usize> = (0..num_samples).collect();
    idxs.shuffle(rng);
    let base = num_samples / num_clients;
    let extra = num_samples % num_clients;
    let mut out = PartitionMap::new();
    let mut start = 0;
    for client in 0..num_clients {
        let len = base + usize::from(client < extra);
        out.insert(client, idxs[start..start + len].to_vec());
        start += len;
    }
    out
}

fn dirichlet<R: Rng>(
    labels: &[usize],
    num_clients: usize,
    beta: f64,
    rng: &mut R,
) -> Result<PartitionMap> {
    if !beta.is_finite() || beta <= 0.0 {
        return Err(DpError::invalid(format!("dirichlet beta must be positive, got {beta}")));
    }
    let num_samples = labels.len();
    if num_samples < MIN_CLIENT_SAMPLES * num_clients {
        return Err(DpError::config(format!(
            "{num_samples} samples cannot give {num_clients} clients {MIN_CLIENT_SAMPLES} each"
        )));
    }
    if num_clients == 1 {
        return Ok(PartitionMap::from([(0, (0..num_samples).collect())]));
    }

    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(idx);
    }
    let dist = Dirichlet::new_with_size(beta, num_clients)
        .map_err(|e| DpError::invalid(format!("dirichlet: {e}")))?;
    let fair_share = num_samples as f64 / num_clients as f64;

    for attempt in 1..=MAX_PARTITION_ATTEMPTS {
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); num_clients];
        for class_idxs in by_class.values() {
            let mut idxs = class_idxs.clone();
            idxs.shuffle(rng);

            // Clients already at their fair share receive nothing more.
            let mut props: Vec<f64> = dist
                .sample(rng)
                .into_iter()
                .zip(buckets.iter())
                .map(|(p, b)| if (b.len() as f64) < fair_share { p } else { 0.0 })
                .collect();
            let total: f64 = props.iter().sum();
            if total > 0.0 {
                props.iter_mut().for_each(|p| *p /= total);
            } else {
                props.fill(1.0 / num_clients as f64);
            }

            let mut cumulative = 0.0;
            let mut start = 0;
            for (client, p) in props.iter().enumerate() {
                cumulative += p;
                let end = if client + 1 == num_clients {
                    idxs.len()
                } else {
                    ((cumulative * idxs.len() as f64) as usize).min(idxs.len())
                };
                let end = end.max(start);
                buckets[client].extend_from_slice(&idxs[start..end]);
                start = end;
            }
        }

        let min_size = buckets.iter().map(Vec::len).min().unwrap_or(0);
        if min_size >= MIN_CLIENT_SAMPLES {
            debug!(attempt, min_size, "dirichlet partition accepted");
            return Ok(buckets
                .into_iter()
                .enumerate()
                .map(|(client, mut idxs)| {
                    idxs.shuffle(rng);
                    (client, idxs)
                })
                .collect());
        }
    }
    Err(DpError::config(format!(
        "no dirichlet(beta = {beta}) partition gave every client {MIN_CLIENT_SAMPLES} samples \
         in {MAX_PARTITION_ATTEMPTS} attempts"
    )))
}
