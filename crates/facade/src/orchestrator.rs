//! The federated round protocol.
//!
//! Each round runs `SELECT -> BROADCAST -> EVALUATE -> LOCAL_TRAIN -> ACCOUNT
//! -> AGGREGATE -> MOMENTUM -> COMMIT`. The privacy state and momentum
//! buffers are staged on copies alongside the new global set and swapped in
//! only at COMMIT, so a round that returns an error leaves the run context
//! untouched.
//!
//! Any error returned by the trainer drops that client from the round; its
//! parameters are restored to the broadcast snapshot. Errors raised by the
//! orchestrator itself (delta computation, aggregation, momentum) abort the
//! round.

use std::collections::BTreeMap;

use rand::Rng;
use tracing::{debug, info, warn};

use fedmeta_accounting::{find_noise_multiplier, PrivacyAccountant, PrivacyState};
use fedmeta_core::{
    l2_norm, with_instrumentation, Aggregator, Delta, DeltaComputer, DpError, DpSgdConfig,
    DpSgdEngine, ParameterSet, PersonalizationPolicy, Result, ServerMomentum, WeightedParams,
};
use fedmeta_prng::{RunKey, Stream};

use crate::checkpoint::{CheckpointSink, NoCheckpoints};
use crate::client::{ClientState, LocalReport, LocalTask, LocalTrainer};
use crate::config::{DpMode, FederatedConfig};
use crate::datasets::{dataset_split, DatasetSplit};
use crate::selection::SelectionSchedule;

/// Run-wide mutable state threaded through every round.
#[derive(Clone, Debug)]
pub struct RunContext {
    key: RunKey,
    round: usize,
    privacy: PrivacyState,
    accountant: PrivacyAccountant,
    schedule: SelectionSchedule,
    momentum: Option<ServerMomentum>,
    epsilon: Option<f64>,
    best: BTreeMap<usize, f64>,
}

impl RunContext {
    /// Root key of the run.
    pub fn key(&self) -> RunKey {
        self.key
    }

    /// Index of the next round to run.
    pub fn round(&self) -> usize {
        self.round
    }

    /// Noise, clip norm, step count and gradient-norm averages.
    pub fn privacy(&self) -> &PrivacyState {
        &self.privacy
    }

    /// The configured accountant.
    pub fn accountant(&self) -> &PrivacyAccountant {
        &self.accountant
    }

    /// Client selection of every round.
    pub fn schedule(&self) -> &SelectionSchedule {
        &self.schedule
    }

    /// Momentum buffers, when server momentum is enabled.
    pub fn momentum(&self) -> Option<&ServerMomentum> {
        self.momentum.as_ref()
    }

    /// Epsilon after the last committed round.
    pub fn epsilon(&self) -> Option<f64> {
        self.epsilon
    }

    /// Best held-out accuracy seen so far for `shots`.
    pub fn best_accuracy(&self, shots: usize) -> Option<f64> {
        self.best.get(&shots).copied()
    }
}

/// What happened in one committed round.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundSummary {
    /// Absolute round index.
    pub round: usize,
    /// Selected clients, ascending.
    pub selected: Vec<usize>,
    /// Clients whose contribution was aggregated.
    pub trained: Vec<usize>,
    /// Clients dropped after a recoverable failure.
    pub failed: Vec<usize>,
    /// Held-out accuracy per shot count, maximum over selected clients.
    pub accuracy: BTreeMap<usize, f64>,
    /// Mean meta-training accuracy of the trained clients.
    pub train_accuracy: Option<f64>,
    /// Epsilon after this round; `None` with DP off.
    pub epsilon: Option<f64>,
    /// Noise multiplier in effect.
    pub noise_multiplier: f64,
    /// Clip norm after this round.
    pub clip_norm: f64,
    /// Whether the global set changed.
    pub aggregated: bool,
    /// Whether a checkpoint was written.
    pub checkpointed: bool,
}

#[derive(Default)]
struct Collected {
    reports: BTreeMap<usize, LocalReport>,
    deltas: BTreeMap<usize, Delta>,
    failed: Vec<usize>,
}

/// Round-local copies of the run state, swapped in at COMMIT.
struct Staged {
    privacy: PrivacyState,
    momentum: Option<ServerMomentum>,
    candidate: Option<ParameterSet>,
}

/// Drives federated rounds over a fixed population of clients.
pub struct RoundOrchestrator<T, S = NoCheckpoints> {
    config: FederatedConfig,
    split: &'static DatasetSplit,
    policy: PersonalizationPolicy,
    delta_computer: DeltaComputer,
    aggregator: Aggregator,
    engine: DpSgdEngine,
    trainer: T,
    sink: S,
    global: ParameterSet,
    clients: Vec<ClientState>,
    ctx: RunContext,
}

impl<T: LocalTrainer> RoundOrchestrator<T, NoCheckpoints> {
    /// Create an orchestrator that writes no checkpoints.
    pub fn new(
        config: FederatedConfig,
        global: ParameterSet,
        clients: Vec<ClientState>,
        trainer: T,
    ) -> Result<Self> {
        Self::with_sink(config, global, clients, trainer, NoCheckpoints)
    }
}

impl<T: LocalTrainer, S: CheckpointSink> RoundOrchestrator<T, S> {
    /// Create an orchestrator.
    ///
    /// `clients[i].id` must equal `i` and there must be `n_parties` clients.
    /// With `target_epsilon` set, the noise multiplier is calibrated over all
    /// `comm_round` rounds. Rounds before `start_round` are charged to the
    /// accountant as already spent.
    pub fn with_sink(
        config: FederatedConfig,
        global: ParameterSet,
        clients: Vec<ClientState>,
        trainer: T,
        sink: S,
    ) -> Result<Self> {
        config.validate()?;
        if clients.len() != config.n_parties {
            return Err(DpError::config(format!(
                "{} clients given, n_parties is {}",
                clients.len(),
                config.n_parties
            )));
        }
        if let Some((i, c)) = clients.iter().enumerate().find(|(i, c)| c.id != *i) {
            return Err(DpError::invalid(format!("client at index {i} has id {}", c.id)));
        }
        let split = dataset_split(&config.dataset)?;
        let policy = config.policy();
        let key = RunKey::new(config.seed);
        let schedule = SelectionSchedule::new(
            key,
            config.n_parties,
            config.sample_fraction,
            config.comm_round,
        )?;
        let accountant = PrivacyAccountant::new(config.dp_accountant, config.dp_delta)?;
        let mut privacy = PrivacyState::new(
            config.dp_noise,
            config.dp_clip,
            config.dp_delta,
            config.grad_norm_decay,
        )?;

        let per_round = schedule.clients_per_round();
        if let Some(target_eps) = config.target_epsilon {
            let steps = steps_per_round(&config, per_round) * config.comm_round as u64;
            let sigma = find_noise_multiplier(
                steps,
                target_eps,
                config.dp_delta,
                config.dp_accountant,
                sampling_rate(per_round, config.n_parties),
                &config.noise_search,
            )?;
            info!(sigma, target_eps, steps, accountant = %config.dp_accountant, "calibrated noise multiplier");
            privacy.set_noise_multiplier(sigma)?;
        }
        if config.dp_mode.is_private() {
            privacy.record_steps(steps_per_round(&config, per_round) * config.start_round as u64);
        }

        let momentum = if config.server_momentum > 0.0 {
            Some(ServerMomentum::new(config.server_momentum)?)
        } else {
            None
        };
        let engine = DpSgdEngine::new(DpSgdConfig::new(
            privacy.clip_norm(),
            privacy.noise_multiplier(),
            config.episode.batch_size(),
        ))
        .with_policy(policy.clone());

        let ctx = RunContext {
            key,
            round: config.start_round,
            privacy,
            accountant,
            schedule,
            momentum,
            epsilon: None,
            best: BTreeMap::new(),
        };
        info!(
            dp_mode = %config.dp_mode,
            n_parties = config.n_parties,
            per_round,
            rounds = config.remaining_rounds(),
            noise = ctx.privacy.noise_multiplier(),
            "orchestrator ready"
        );
        Ok(Self {
            delta_computer: DeltaComputer::new(policy.clone()),
            aggregator: Aggregator::new(policy.clone()),
            policy,
            split,
            engine,
            trainer,
            sink,
            global,
            clients,
            ctx,
            config,
        })
    }

    /// The run configuration.
    pub fn config(&self) -> &FederatedConfig {
        &self.config
    }

    /// Current global parameters.
    pub fn global(&self) -> &ParameterSet {
        &self.global
    }

    /// All clients, indexed by id.
    pub fn clients(&self) -> &[ClientState] {
        &self.clients
    }

    /// Run-wide state.
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// The local-training collaborator.
    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    /// DP-SGD engine used in local mode.
    pub fn engine(&self) -> &DpSgdEngine {
        &self.engine
    }

    /// The checkpoint sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Whether every configured round has been committed.
    pub fn is_finished(&self) -> bool {
        self.ctx.round >= self.config.comm_round
    }

    /// Run all remaining rounds.
    pub fn run(&mut self) -> Result<Vec<RoundSummary>> {
        let mut summaries = Vec::with_capacity(self.config.comm_round.saturating_sub(self.ctx.round));
        while !self.is_finished() {
            summaries.push(self.run_round()?);
        }
        Ok(summaries)
    }

    /// Run the next round.
    pub fn run_round(&mut self) -> Result<RoundSummary> {
        let round = self.ctx.round;
        let selected = self
            .ctx
            .schedule
            .round(round)
            .map(<[usize]>::to_vec)
            .ok_or_else(|| {
                DpError::invalid(format!(
                    "round {round} is past comm_round {}",
                    self.config.comm_round
                ))
            })?;
        info!(round, clients = ?selected, "round started");

        self.broadcast(&selected);
        let accuracy = self.evaluate(&selected);
        let mut privacy = self.ctx.privacy.clone();
        let collected = self.local_train(round, &selected, &mut privacy)?;
        let epsilon = self.account(round, selected.len(), &collected, &mut privacy);
        let candidate = self.aggregate(round, &collected, &privacy)?;
        let staged = self.apply_momentum(candidate, privacy)?;
        Ok(self.commit(round, selected, collected, staged, accuracy, epsilon))
    }

    fn broadcast(&mut self, selected: &[usize]) {
        for &id in selected {
            let written = self.policy.broadcast(&self.global, &mut self.clients[id].params);
            debug!(client = id, written, "broadcast");
        }
    }

    fn evaluate(&mut self, selected: &[usize]) -> BTreeMap<usize, f64> {
        let mut accuracy = BTreeMap::new();
        for &shots in &self.config.eval_shots {
            let mut best: Option<f64> = None;
            for &id in selected {
                let client = &self.clients[id];
                let task = local_task(&self.config, self.split, client, self.ctx.round);
                // Same held-out episodes every round, so rounds are comparable.
                let mut rng = self
                    .ctx
                    .key
                    .stream(Stream::Evaluation)
                    .fold_in(id as u64)
                    .fold_in(shots as u64)
                    .to_rng();
                match self.trainer.evaluate(&task, &client.params, shots, &mut rng) {
                    Ok(acc) if acc.is_finite() => {
                        best = Some(best.map_or(acc, |b: f64| b.max(acc)));
                    }
                    Ok(acc) => warn!(client = id, shots, acc, "non-finite accuracy ignored"),
                    Err(err) => warn!(client = id, shots, %err, "evaluation failed"),
                }
            }
            if let Some(acc) = best {
                accuracy.insert(shots, acc);
            }
        }
        accuracy
    }

    fn local_train(
        &mut self,
        round: usize,
        selected: &[usize],
        privacy: &mut PrivacyState,
    ) -> Result<Collected> {
        let mut collected = Collected::default();
        for &id in selected {
            let snapshot = self.clients[id].params.clone();
            let privacy_before = privacy.clone();
            let mut rng = self
                .ctx
                .key
                .stream(Stream::LocalTraining)
                .fold_in(round as u64)
                .fold_in(id as u64)
                .to_rng();

            let outcome = match self.config.dp_mode {
                DpMode::Local => self.train_local(round, id, privacy, &mut rng),
                DpMode::Server | DpMode::Off => {
                    let mut params = std::mem::take(&mut self.clients[id].params);
                    let task = local_task(&self.config, self.split, &self.clients[id], round);
                    let outcome = self.trainer.train(&task, &mut params, &mut rng);
                    self.clients[id].params = params;
                    outcome
                }
            };

            let report = match outcome {
                Ok(report) => report,
                Err(err) => {
                    self.clients[id].params = snapshot;
                    *privacy = privacy_before;
                    warn!(
                        client = id,
                        round,
                        %err,
                        recoverable = err.is_recoverable(),
                        "client dropped from round"
                    );
                    collected.failed.push(id);
                    continue;
                }
            };
            debug!(client = id, accuracy = report.accuracy, episodes = report.num_episodes, "local training done");

            if self.config.dp_mode == DpMode::Server {
                let mut noise_rng = self
                    .ctx
                    .key
                    .stream(Stream::ClientNoise)
                    .fold_in(round as u64)
                    .fold_in(id as u64)
                    .to_rng();
                // Server-side aggregation adds the noise; clients only clip.
                let pair = self.delta_computer.compute_delta(
                    &snapshot,
                    &self.clients[id].params,
                    privacy.clip_norm(),
                    0.0,
                    &mut noise_rng,
                )?;
                let tracker = privacy.grad_norms_mut();
                for (name, value) in pair.unnoised.iter() {
                    tracker.observe(name, l2_norm(value));
                }
                if pair.clip.clipped {
                    debug!(client = id, norm = pair.clip.original_norm, "delta clipped");
                }
                collected.deltas.insert(id, pair.noised);
            }
            collected.reports.insert(id, report);
        }
        Ok(collected)
    }

    fn train_local<R: Rng>(
        &mut self,
        round: usize,
        id: usize,
        privacy: &mut PrivacyState,
        rng: &mut R,
    ) -> Result<LocalReport> {
        self.engine.set_config(DpSgdConfig::new(
            privacy.clip_norm(),
            privacy.noise_multiplier(),
            self.config.episode.batch_size(),
        ));

        let model = std::mem::take(&mut self.clients[id].params);
        let task = local_task(&self.config, self.split, &self.clients[id], round);
        let trainer = &mut self.trainer;
        let grad_norms = privacy.grad_norms_mut();
        let run = with_instrumentation(&mut self.engine, model, |wrapped| {
            trainer.train_private(&task, wrapped, grad_norms, rng)
        });
        self.clients[id].params = run.model;
        if run.leaked {
            warn!(client = id, round, "DP-SGD instrumentation did not detach, stripped");
        }
        let report = run.outcome?;

        if self.config.adaptive_clip {
            if let Some(clip) = privacy.retune_clip(self.config.clip_percentile) {
                debug!(client = id, clip, "adaptive clip norm");
            }
        }
        Ok(report)
    }

    fn account(
        &self,
        round: usize,
        num_selected: usize,
        collected: &Collected,
        privacy: &mut PrivacyState,
    ) -> Option<f64> {
        if !self.config.dp_mode.is_private() {
            return None;
        }
        if collected.reports.is_empty() {
            warn!(round, "no client finished training, nothing to account");
            return self.ctx.epsilon;
        }
        // Local mode charges every selected client's episodes to one shared
        // accountant. This is an approximation of the true composition.
        let steps = steps_per_round(&self.config, num_selected);
        let q = sampling_rate(num_selected, self.config.n_parties);
        let epsilon = privacy.record(&self.ctx.accountant, steps, q);
        info!(
            round,
            epsilon,
            delta = self.config.dp_delta,
            steps = privacy.cumulative_steps(),
            "privacy spent"
        );
        Some(epsilon)
    }

    fn aggregate(
        &self,
        round: usize,
        collected: &Collected,
        privacy: &PrivacyState,
    ) -> Result<Option<ParameterSet>> {
        if collected.reports.is_empty() {
            warn!(round, "no contributions, global parameters unchanged");
            return Ok(None);
        }
        let mut candidate = self.global.clone();
        match self.config.dp_mode {
            DpMode::Server => {
                let mut rng = self
                    .ctx
                    .key
                    .stream(Stream::ServerNoise)
                    .fold_in(round as u64)
                    .to_rng();
                let report = self.aggregator.aggregate(
                    &mut candidate,
                    collected.deltas.values().cloned().collect(),
                    privacy.clip_norm(),
                    privacy.noise_multiplier(),
                    &mut rng,
                )?;
                debug!(round, contributors = report.contributors, keys = report.keys_updated, "DP aggregation");
            }
            DpMode::Local | DpMode::Off => {
                let weighted: Vec<WeightedParams<'_>> = collected
                    .reports
                    .keys()
                    .map(|&id| WeightedParams {
                        params: &self.clients[id].params,
                        num_samples: self.clients[id].num_samples(),
                    })
                    .collect();
                let report = self.aggregator.weighted_average(&mut candidate, &weighted)?;
                debug!(round, contributors = report.contributors, keys = report.keys_updated, "weighted averaging");
            }
        }
        Ok(Some(candidate))
    }

    fn apply_momentum(
        &self,
        mut candidate: Option<ParameterSet>,
        privacy: PrivacyState,
    ) -> Result<Staged> {
        let mut momentum = self.ctx.momentum.clone();
        if let (Some(candidate), Some(momentum)) = (candidate.as_mut(), momentum.as_mut()) {
            momentum.apply(&self.global, candidate)?;
        }
        Ok(Staged {
            privacy,
            momentum,
            candidate,
        })
    }

    fn commit(
        &mut self,
        round: usize,
        selected: Vec<usize>,
        collected: Collected,
        staged: Staged,
        accuracy: BTreeMap<usize, f64>,
        epsilon: Option<f64>,
    ) -> RoundSummary {
        let aggregated = staged.candidate.is_some();
        if let Some(candidate) = staged.candidate {
            self.global = candidate;
        }
        self.ctx.privacy = staged.privacy;
        self.ctx.momentum = staged.momentum;
        self.ctx.round = round + 1;
        self.ctx.epsilon = epsilon;

        let improved = self.update_best(&accuracy);
        let checkpointed = improved && self.checkpoint(round);

        let train_accuracy = if collected.reports.is_empty() {
            None
        } else {
            let sum: f64 = collected.reports.values().map(|r| r.accuracy).sum();
            Some(sum / collected.reports.len() as f64)
        };
        let summary = RoundSummary {
            round,
            selected,
            trained: collected.reports.keys().copied().collect(),
            failed: collected.failed,
            accuracy,
            train_accuracy,
            epsilon,
            noise_multiplier: self.ctx.privacy.noise_multiplier(),
            clip_norm: self.ctx.privacy.clip_norm(),
            aggregated,
            checkpointed,
        };
        info!(
            round,
            trained = summary.trained.len(),
            failed = summary.failed.len(),
            epsilon = ?summary.epsilon,
            "round committed"
        );
        summary
    }

    fn update_best(&mut self, accuracy: &BTreeMap<usize, f64>) -> bool {
        let mut first_improved = false;
        for (i, &shots) in self.config.eval_shots.iter().enumerate() {
            let Some(&acc) = accuracy.get(&shots) else {
                continue;
            };
            let best = match self.ctx.best.get(&shots) {
                Some(&best) if best >= acc => best,
                _ => {
                    self.ctx.best.insert(shots, acc);
                    first_improved |= i == 0;
                    acc
                }
            };
            info!(shots, accuracy = acc, best, "held-out accuracy");
        }
        first_improved
    }

    fn checkpoint(&mut self, round: usize) -> bool {
        let Some(client) = self.clients.first() else {
            return false;
        };
        match self
            .sink
            .save(&self.config.run_id, round, &self.global, &client.params)
        {
            Ok(()) => true,
            Err(err) => {
                warn!(round, %err, "checkpoint failed");
                false
            }
        }
    }
}

fn local_task<'a>(
    config: &FederatedConfig,
    split: &'a DatasetSplit,
    client: &'a ClientState,
    round: usize,
) -> LocalTask<'a> {
    LocalTask {
        client_id: client.id,
        round,
        data: &client.data,
        split,
        episode: config.episode,
        num_tasks: config.num_train_tasks,
    }
}

fn steps_per_round(config: &FederatedConfig, num_selected: usize) -> u64 {
    match config.dp_mode {
        DpMode::Local => (config.num_train_tasks * num_selected) as u64,
        DpMode::Server => 1,
        DpMode::Off => 0,
    }
}

fn sampling_rate(num_selected: usize, n_parties: usize) -> f64 {
    num_selected as f64 / n_parties as f64
}
