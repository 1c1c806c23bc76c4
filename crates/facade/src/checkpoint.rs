//! Persisting the best models of a run.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use fedmeta_core::{DpError, ParameterSet, Result};

/// Receives the global set and one client's set when accuracy improves.
pub trait CheckpointSink {
    /// Persist both sets for `round` of `run_id`.
    fn save(
        &mut self,
        run_id: &str,
        round: usize,
        global: &ParameterSet,
        client: &ParameterSet,
    ) -> Result<()>;
}

/// Discards checkpoints.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCheckpoints;

impl CheckpointSink for NoCheckpoints {
    fn save(&mut self, _: &str, _: usize, _: &ParameterSet, _: &ParameterSet) -> Result<()> {
        Ok(())
    }
}

/// Writes `<run_id>-r<round>-global.json` and `<run_id>-r<round>-client.json`.
#[derive(Clone, Debug)]
pub struct JsonCheckpointDir {
    dir: PathBuf,
}

impl JsonCheckpointDir {
    /// Checkpoints go to `dir`, created on first save.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the global artifact.
    pub fn global_path(&self, run_id: &str, round: usize) -> PathBuf {
        self.dir.join(format!("{run_id}-r{round}-global.json"))
    }

    /// Path of the client artifact.
    pub fn client_path(&self, run_id: &str, round: usize) -> PathBuf {
        self.dir.join(format!("{run_id}-r{round}-client.json"))
    }

    /// Read back a global set, e.g. to resume a run.
    pub fn load_global(&self, run_id: &str, round: usize) -> Result<ParameterSet> {
        read_json(&self.global_path(run_id, round))
    }

    /// Read back a client set.
    pub fn load_client(&self, run_id: &str, round: usize) -> Result<ParameterSet> {
        read_json(&self.client_path(run_id, round))
    }
}

impl CheckpointSink for JsonCheckpointDir {
    fn save(
        &mut self,
        run_id: &str,
        round: usize,
        global: &ParameterSet,
        client: &ParameterSet,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| DpError::checkpoint(format!("{}: {e}", self.dir.display())))?;
        let global_path = self.global_path(run_id, round);
        write_json(&global_path, global)?;
        write_json(&self.client_path(run_id, round), client)?;
        info!(path = %global_path.display(), round, "checkpoint written");
        Ok(())
    }
}

// Written to a sibling temp file first so a crash never leaves half a file.
fn write_json(path: &Path, params: &ParameterSet) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let err = |e: &dyn std::fmt::Display| DpError::checkpoint(format!("{}: {e}", path.display()));
    let file = File::create(&tmp).map_err(|e| err(&e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, params).map_err(|e| err(&e))?;
    writer.flush().map_err(|e| err(&e))?;
    fs::rename(&tmp, path).map_err(|e| err(&e))
}

fn read_json(path: &Path) -> Result<ParameterSet> {
    let file = File::open(path)
        .map_err(|e| DpError::checkpoint(format!("{}: {e}", path.display())))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| DpError::checkpoint(format!("{}: {e}", path.display())))
}
