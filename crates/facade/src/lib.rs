//! Federated few-shot meta-learning with differential privacy.
//!
//! A [`RoundOrchestrator`] drives rounds of client selection, broadcast,
//! held-out evaluation, local meta-training, privacy accounting and
//! aggregation over a population of [`ClientState`]s. Model code plugs in
//! through [`LocalTrainer`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod datasets;
pub mod episode;
pub mod orchestrator;
pub mod partition;
pub mod selection;
pub mod telemetry;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use fedmeta_accounting as accounting;
pub use fedmeta_core as core;
pub use fedmeta_prng as prng;

pub use checkpoint::{CheckpointSink, JsonCheckpointDir, NoCheckpoints};
pub use client::{init_clients, ClientState, LocalReport, LocalTask, LocalTrainer};
pub use config::{DpMode, FederatedConfig};
pub use datasets::{dataset_split, ClassIds, DatasetSplit, DATASET_SPLITS};
pub use episode::{Episode, EpisodeSampler, EpisodeShape};
pub use orchestrator::{RoundOrchestrator, RoundSummary, RunContext};
pub use partition::{partition, PartitionMap, PartitionStrategy, MIN_CLIENT_SAMPLES};
pub use selection::{clients_per_round, select_clients, SelectionSchedule};
pub use telemetry::{init_tracing, init_tracing_with_filter};

/// Common imports for building and running a federation.
pub mod prelude {
    pub use crate::checkpoint::{CheckpointSink, JsonCheckpointDir, NoCheckpoints};
    pub use crate::client::{init_clients, ClientState, LocalReport, LocalTask, LocalTrainer};
    pub use crate::config::{DpMode, FederatedConfig};
    pub use crate::episode::{Episode, EpisodeSampler, EpisodeShape};
    pub use crate::orchestrator::{RoundOrchestrator, RoundSummary};
    pub use crate::partition::PartitionStrategy;
    pub use fedmeta_accounting::prelude::*;
    pub use fedmeta_core::prelude::*;
    pub use fedmeta_prng::prelude::*;
}
