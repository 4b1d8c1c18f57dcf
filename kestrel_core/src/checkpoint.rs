use crate::corpus::CorpusSeed;
use crate::input::Input;
use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::error::{DecodeError, EncodeError};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors raised while saving or loading a checkpoint.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Checkpoint decoding error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Checkpoint metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Failed to move checkpoint into place: {0}")]
    Persist(#[from] tempfile::PersistError),

    /// The checkpoint on disk belongs to a different run.
    #[error("Checkpoint is for {found_target}/{found_strategy}, expected {target}/{strategy}")]
    Mismatch {
        target: String,
        strategy: String,
        found_target: String,
        found_strategy: String,
    },
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "I: Input")]
pub struct EngineState<I: Input> {
    /// Last completed iteration.
    pub iteration: u64,
    pub coverage_tokens: BTreeSet<String>,
    /// Oldest first.
    pub corpus_seeds: Vec<CorpusSeed<I>>,
    pub logger_iterations: u64,
    pub strategy: String,
    pub target_id: String,
}

/// Human-readable counts written next to the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub iteration: u64,
    pub total_tokens: usize,
    pub corpus_size: usize,
    pub logger_iterations: u64,
    pub strategy: String,
    pub target_id: String,
}

impl<I: Input> From<&EngineState<I>> for CheckpointMetadata {
    fn from(state: &EngineState<I>) -> Self {
        Self {
            iteration: state.iteration,
            total_tokens: state.coverage_tokens.len(),
            corpus_size: state.corpus_seeds.len(),
            logger_iterations: state.logger_iterations,
            strategy: state.strategy.clone(),
            target_id: state.target_id.clone(),
        }
    }
}

/// Replaces characters that do not belong in a file name.
pub fn sanitize_id(id: &str) -> String {
    id.replace("::", "_")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Atomic persistence for one `(target, strategy)` pair.
///
/// Both files are written to a temporary file in the same directory and renamed into
/// place, so a reader sees either the previous checkpoint or the new one.
#[derive(Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    target_id: String,
    strategy: String,
    state_path: PathBuf,
    metadata_path: PathBuf,
    bincode_config: Configuration<LittleEndian, Fixint, NoLimit>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("dir", &self.dir)
            .field("target_id", &self.target_id)
            .field("strategy", &self.strategy)
            .field("state_path", &self.state_path)
            .field("metadata_path", &self.metadata_path)
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, target_id: &str, strategy: &str) -> Self {
        let dir = dir.into();
        let stem = format!("{}_{}", sanitize_id(target_id), sanitize_id(strategy));
        Self {
            state_path: dir.join(format!("{stem}_checkpoint.bin")),
            metadata_path: dir.join(format!("{stem}_metadata.json")),
            dir,
            target_id: target_id.to_string(),
            strategy: strategy.to_string(),
            bincode_config: bincode::config::standard()
                .with_little_endian()
                .with_fixed_int_encoding(),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    pub fn save<I: Input>(&self, state: &EngineState<I>) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let bytes = bincode::serde::encode_to_vec(state, self.bincode_config)?;
        self.write_atomic(&self.state_path, &bytes)?;

        let metadata = serde_json::to_vec_pretty(&CheckpointMetadata::from(state))?;
        self.write_atomic(&self.metadata_path, &metadata)?;
        debug!(
            "checkpoint saved at iteration {} ({} bytes) to {:?}",
            state.iteration,
            bytes.len(),
            self.state_path
        );
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        Ok(())
    }

    /// Loads the checkpoint, or `Ok(None)` if there is none.
    pub fn load<I: Input>(&self) -> Result<Option<EngineState<I>>, CheckpointError> {
        if !self.state_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.state_path)?;
        let (state, _len): (EngineState<I>, usize) =
            bincode::serde::decode_from_slice(&bytes, self.bincode_config)?;
        if state.target_id != self.target_id || state.strategy != self.strategy {
            return Err(CheckpointError::Mismatch {
                target: self.target_id.clone(),
                strategy: self.strategy.clone(),
                found_target: state.target_id,
                found_strategy: state.strategy,
            });
        }
        info!(
            "loaded checkpoint from {:?}: iteration {}, {} tokens, {} seeds",
            self.state_path,
            state.iteration,
            state.coverage_tokens.len(),
            state.corpus_seeds.len()
        );
        Ok(Some(state))
    }

    pub fn load_metadata(&self) -> Result<Option<CheckpointMetadata>, CheckpointError> {
        if !self.metadata_path.exists() {
            return Ok(None);
        }
        let content = fs::read(&self.metadata_path)?;
        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Removes both files. Missing files are not an error.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        for path in [&self.state_path, &self.metadata_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
