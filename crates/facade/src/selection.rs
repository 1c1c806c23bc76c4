//! Per-round client selection.

use rand::seq::index;

use fedmeta_core::{DpError, Result};
use fedmeta_prng::{RunKey, Stream};

/// Clients taken per round: `floor(n_parties * fraction)`, at least one.
pub fn clients_per_round(n_parties: usize, sample_fraction: f64) -> usize {
    ((n_parties as f64 * sample_fraction).floor() as usize).clamp(1, n_parties.max(1))
}

/// Sorted client ids selected in `round`.
///
/// A pure function of the key, the population, the fraction and the round,
/// so a resumed run selects exactly the clients the original run would have.
pub fn select_clients(key: RunKey, n_parties: usize, sample_fraction: f64, round: usize) -> Vec<usize> {
    let count = clients_per_round(n_parties, sample_fraction);
    if count >= n_parties {
        return (0..n_parties).collect();
    }
    let mut rng = key.stream(Stream::Selection).fold_in(round as u64).to_rng();
    let mut ids = index::sample(&mut rng, n_parties, count).into_vec();
    ids.sort_unstable();
    ids
}

/// Selections for every round of a run, computed up front.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionSchedule {
    per_round: usize,
    rounds: Vec<Vec<usize>>,
}

impl SelectionSchedule {
    /// Precompute `num_rounds` selections.
    pub fn new(key: RunKey, n_parties: usize, sample_fraction: f64, num_rounds: usize) -> Result<Self> {
        if n_parties == 0 {
            return Err(DpError::invalid("n_parties must be positive"));
        }
        if !sample_fraction.is_finite() || sample_fraction <= 0.0 || sample_fraction > 1.0 {
            return Err(DpError::invalid("sample_fraction must be in (0, 1]"));
        }
        let rounds = (0..num_rounds)
            .map(|r| select_clients(key, n_parties, sample_fraction, r))
            .collect();
        Ok(Self {
            per_round: clients_per_round(n_parties, sample_fraction),
            rounds,
        })
    }

    /// Clients selected per round.
    pub fn clients_per_round(&self) -> usize {
        self.per_round
    }

    /// Selection of `round`, if scheduled.
    pub fn round(&self, round: usize) -> Option<&[usize]> {
        self.rounds.get(round).map(Vec::as_slice)
    }

    /// Number of scheduled rounds.
    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    /// Whether no round is scheduled.
    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn count_is_floored_and_at_least_one() {
        assert_eq!(clients_per_round(4, 0.5), 2);
        assert_eq!(clients_per_round(10, 0.25), 2);
        assert_eq!(clients_per_round(3, 0.1), 1);
        assert_eq!(clients_per_round(3, 1.0), 3);
    }

    #[test]
    fn full_participation_selects_everyone() {
        assert_eq!(select_clients(RunKey::new(0), 4, 1.0, 9), vec![0, 1, 2, 3]);
    }

    #[test]
    fn selections_are_sorted_distinct_and_reproducible() {
        let key = RunKey::new(42);
        let schedule = SelectionSchedule::new(key, 10, 0.3, 20).unwrap();
        assert_eq!(schedule.len(), 20);
        for r in 0..20 {
            let ids = schedule.round(r).unwrap();
            assert_eq!(ids.len(), 3);
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            assert!(ids.iter().all(|&i| i < 10));
            assert_eq!(ids, select_clients(key, 10, 0.3, r).as_slice());
        }
        assert_eq!(schedule, SelectionSchedule::new(key, 10, 0.3, 20).unwrap());
        assert!(schedule.round(20).is_none());
    }

    #[test]
    fn rounds_differ() {
        let key = RunKey::new(1);
        let distinct: std::collections::BTreeSet<Vec<usize>> =
            (0..10).map(|r| select_clients(key, 20, 0.2, r)).collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        assert!(SelectionSchedule::new(RunKey::new(0), 4, 0.0, 3).is_err());
        assert!(SelectionSchedule::new(RunKey::new(0), 4, 1.5, 3).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
        #[test]
        fn selection_size_matches_fraction(
            seed in 0u64..1000,
            n in 1usize..50,
            fraction in 0.01f64..=1.0,
            round in 0usize..100,
        ) {
            let ids = select_clients(RunKey::new(seed), n, fraction, round);
            prop_assert_eq!(ids.len(), clients_per_round(n, fraction));
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(ids.iter().all(|&i| i < n));
        }
    }
}
