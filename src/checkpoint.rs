//! Checkpoint persistence.
//!
//! Each (fold, run) keeps two slots in the checkpoint directory: a "latest"
//! file overwritten every epoch and a "best" file overwritten only when the
//! watched validation metric improves. Writes go through a temporary file
//! and an atomic rename so an interrupted save never clobbers a readable
//! checkpoint.

use crate::{Normalizer, RunIdentity, TrainError, TrainResult, TrainerConfig};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Everything needed to reconstruct a run exactly: model weights, optimizer
/// buffers, scheduler counters, the fitted normalizer, the epoch to resume
/// from and the best watched metric so far. The config travels along so a
/// resumed run can verify it matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Epoch the run should resume from (one past the last completed epoch).
    pub epoch: usize,
    /// Flattened model parameters.
    pub model_state: HashMap<String, Vec<f64>>,
    /// Flattened optimizer buffers.
    pub optimizer_state: HashMap<String, Vec<f64>>,
    /// Scheduler counters.
    pub scheduler_state: HashMap<String, f64>,
    /// Fitted target normalizer.
    pub normalizer: Normalizer,
    /// Best watched validation metric seen so far (lower is better).
    pub best_metric: f64,
    /// Training configuration the checkpoint was produced under.
    pub config: TrainerConfig,
}

/// File naming and save/load for one run's checkpoint slots.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    ident: RunIdentity,
    gzip: bool,
}

impl CheckpointManager {
    /// Create a manager rooted at `dir` for one (fold, run).
    pub fn new(dir: impl Into<PathBuf>, ident: RunIdentity, gzip: bool) -> Self {
        Self {
            dir: dir.into(),
            ident,
            gzip,
        }
    }

    fn slot_path(&self, slot: &str) -> PathBuf {
        let extension = if self.gzip { "json.gz" } else { "json" };
        self.dir
            .join(format!("{}_{}.{}", slot, self.ident, extension))
    }

    /// Path of the per-epoch "latest" slot.
    pub fn latest_path(&self) -> PathBuf {
        self.slot_path("checkpoint")
    }

    /// Path of the "best" slot.
    pub fn best_path(&self) -> PathBuf {
        self.slot_path("best")
    }

    fn write_record(&self, path: &Path, record: &CheckpointRecord) -> TrainResult<()> {
        let tmp = path.with_extension("tmp");
        let file = File::create(&tmp)
            .map_err(|e| TrainError::CheckpointIo(format!("create {}: {}", tmp.display(), e)))?;
        let mut writer = BufWriter::new(file);

        let json = serde_json::to_vec(record)
            .map_err(|e| TrainError::CheckpointIo(format!("serialize checkpoint: {}", e)))?;
        let io_result = if self.gzip {
            let mut encoder = GzEncoder::new(&mut writer, Compression::default());
            encoder.write_all(&json).and_then(|_| encoder.finish().map(|_| ()))
        } else {
            writer.write_all(&json)
        };
        io_result
            .and_then(|_| writer.flush())
            .map_err(|e| TrainError::CheckpointIo(format!("write {}: {}", tmp.display(), e)))?;

        fs::rename(&tmp, path)
            .map_err(|e| TrainError::CheckpointIo(format!("rename {}: {}", path.display(), e)))
    }

    /// Save `record` to the latest slot, and to the best slot as well when
    /// `is_best`.
    pub fn save(&self, record: &CheckpointRecord, is_best: bool) -> TrainResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            TrainError::CheckpointIo(format!("create dir {}: {}", self.dir.display(), e))
        })?;

        self.write_record(&self.latest_path(), record)?;
        if is_best {
            self.write_record(&self.best_path(), record)?;
        }
        Ok(())
    }

    /// Load the latest slot.
    pub fn load_latest(&self) -> TrainResult<CheckpointRecord> {
        load_record(&self.latest_path())
    }

    /// Load the best slot.
    pub fn load_best(&self) -> TrainResult<CheckpointRecord> {
        load_record(&self.best_path())
    }
}

/// Load a full checkpoint record from an arbitrary path. Gzip is detected
/// from the file extension.
pub fn load_record(path: &Path) -> TrainResult<CheckpointRecord> {
    if !path.exists() {
        return Err(TrainError::CheckpointNotFound(path.to_path_buf()));
    }

    let file = File::open(path)
        .map_err(|e| TrainError::CheckpointIo(format!("open {}: {}", path.display(), e)))?;
    let reader = BufReader::new(file);

    let json = if path.extension().is_some_and(|ext| ext == "gz") {
        let mut decoder = GzDecoder::new(reader);
        let mut buffer = String::new();
        decoder
            .read_to_string(&mut buffer)
            .map_err(|e| TrainError::CheckpointIo(format!("decompress {}: {}", path.display(), e)))?;
        buffer
    } else {
        let mut buffer = String::new();
        let mut reader = reader;
        reader
            .read_to_string(&mut buffer)
            .map_err(|e| TrainError::CheckpointIo(format!("read {}: {}", path.display(), e)))?;
        buffer
    };

    serde_json::from_str(&json)
        .map_err(|e| TrainError::CheckpointCorrupt(format!("{}: {}", path.display(), e)))
}

/// Load only the model weights from a checkpoint at `path`. Used by
/// fine-tuning and transfer learning, which discard the optimizer, scheduler
/// and normalizer of the source run.
pub fn load_weights(path: &Path) -> TrainResult<HashMap<String, Vec<f64>>> {
    Ok(load_record(path)?.model_state)
}
