mod common;

use common::{initial_global, small_config, train_labels, ToyTrainer};
use fedmeta::prelude::*;

struct BrokenDisk {
    attempts: usize,
}

impl CheckpointSink for BrokenDisk {
    fn save(&mut self, _: &str, _: usize, _: &ParameterSet, _: &ParameterSet) -> Result<()> {
        self.attempts += 1;
        Err(DpError::checkpoint("disk full"))
    }
}

#[test]
fn improving_rounds_are_checkpointed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = FederatedConfig {
        run_id: "toy".into(),
        ..small_config(DpMode::Off)
    };
    let global = initial_global();
    let clients = init_clients(&config, &train_labels(), &global)?;
    let sink = JsonCheckpointDir::new(dir.path());
    let mut orch =
        RoundOrchestrator::with_sink(config, global, clients, ToyTrainer::new(train_labels()), sink)?;

    let first = orch.run_round()?;
    assert!(first.checkpointed, "the first evaluation is always an improvement");
    assert_eq!(orch.sink().load_global("toy", 0)?, *orch.global());
    assert_eq!(orch.sink().load_client("toy", 0)?, orch.clients()[0].params);

    for summary in orch.run()? {
        let path = orch.sink().global_path("toy", summary.round);
        assert_eq!(path.exists(), summary.checkpointed, "{}", path.display());
    }
    let best = orch.context().best_accuracy(1).unwrap_or_default();
    assert!(best >= first.accuracy[&1]);
    Ok(())
}

#[test]
fn failed_checkpoint_does_not_fail_the_round() -> anyhow::Result<()> {
    let config = small_config(DpMode::Off);
    let global = initial_global();
    let clients = init_clients(&config, &train_labels(), &global)?;
    let sink = BrokenDisk { attempts: 0 };
    let mut orch =
        RoundOrchestrator::with_sink(config, global, clients, ToyTrainer::new(train_labels()), sink)?;

    let summary = orch.run_round()?;
    assert!(!summary.checkpointed);
    assert!(summary.aggregated);
    assert_eq!(orch.sink().attempts, 1);
    assert_eq!(orch.context().round(), 1);
    Ok(())
}
