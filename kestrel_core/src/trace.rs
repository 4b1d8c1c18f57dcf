use crate::scheduler::Source;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Trace I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Trace serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One line of the per-iteration trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub iteration: u64,
    pub strategy: String,
    pub source: Source,
    pub valid: bool,
    pub new_tokens: usize,
    pub total_tokens: usize,
    /// Coverage-space percentage for the run's target after this iteration.
    #[serde(default)]
    pub coverage_space_percentage: f64,
    /// Unique bug signatures known so far. Advances at each bug-scan drain.
    #[serde(default)]
    pub unique_bugs: usize,
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Appends [`TraceRecord`]s as JSON lines and keeps valid/invalid counters.
///
/// `logged_iterations` is part of the checkpoint so a resumed run continues the count.
#[derive(Debug)]
pub struct TraceLogger {
    path: PathBuf,
    writer: BufWriter<File>,
    logged_iterations: u64,
    valid_count: u64,
    invalid_count: u64,
}

impl TraceLogger {
    /// Opens `path` for writing. `append` keeps existing records (used when resuming).
    pub fn create(path: impl AsRef<Path>, append: bool) -> Result<Self, TraceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| TraceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .map_err(|source| TraceError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            logged_iterations: 0,
            valid_count: 0,
            invalid_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Continues counting from a checkpoint.
    pub fn resume_count(&mut self, logged_iterations: u64) {
        self.logged_iterations = logged_iterations;
    }

    pub fn log(&mut self, record: &TraceRecord) -> Result<(), TraceError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n").map_err(|source| TraceError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.logged_iterations += 1;
        if record.valid {
            self.valid_count += 1;
        } else {
            self.invalid_count += 1;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TraceError> {
        self.writer.flush().map_err(|source| TraceError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn logged_iterations(&self) -> u64 {
        self.logged_iterations
    }

    pub fn valid_count(&self) -> u64 {
        self.valid_count
    }

    pub fn invalid_count(&self) -> u64 {
        self.invalid_count
    }

    /// Valid fraction of the records written by this logger instance.
    pub fn valid_rate(&self) -> f64 {
        let written = self.valid_count + self.invalid_count;
        if written == 0 {
            0.0
        } else {
            self.valid_count as f64 / written as f64
        }
    }
}

/// Reads a trace file back, one record per line.
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<TraceRecord>, TraceError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(TraceError::from))
        .collect()
}
