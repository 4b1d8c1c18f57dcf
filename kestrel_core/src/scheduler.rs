use crate::policy::MutationPolicy;
use rand::Rng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_CORPUS_PROBABILITY: f64 = 0.7;

/// Where an iteration's candidate comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Fresh candidate, unconditionally (warm-up, or no usable corpus).
    Baseline,
    /// Fresh candidate chosen by the epsilon-greedy policy.
    Exploration,
    /// Copy of a stored seed.
    Corpus,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Source::Baseline => "baseline",
            Source::Exploration => "exploration",
            Source::Corpus => "corpus",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Init,
    Resume,
    Warmup,
    Evolution,
    Done,
}

/// Iterations below this index run in the warm-up phase.
pub fn warmup_threshold(max_iterations: u64, warmup_ratio: f64) -> u64 {
    (max_iterations as f64 * warmup_ratio.clamp(0.0, 1.0)).floor() as u64
}

/// Per-iteration source decision.
///
/// During warm-up every iteration is `Baseline`. Afterwards the policy gets the first
/// say (`Exploration`), then a non-empty corpus is used with `corpus_probability`, and
/// everything else falls back to `Baseline`.
#[derive(Debug, Clone)]
pub struct SourceScheduler {
    warmup_threshold: u64,
    corpus_probability: f64,
    corpus_enabled: bool,
}

impl SourceScheduler {
    pub fn new(warmup_threshold: u64, corpus_probability: f64, corpus_enabled: bool) -> Self {
        Self {
            warmup_threshold,
            corpus_probability: corpus_probability.clamp(0.0, 1.0),
            corpus_enabled,
        }
    }

    pub fn warmup_threshold(&self) -> u64 {
        self.warmup_threshold
    }

    pub fn phase(&self, iteration: u64) -> Phase {
        if iteration < self.warmup_threshold {
            Phase::Warmup
        } else {
            Phase::Evolution
        }
    }

    pub fn next_source(
        &self,
        iteration: u64,
        policy: &mut MutationPolicy,
        corpus_len: usize,
        rng: &mut dyn RngCore,
    ) -> Source {
        if iteration < self.warmup_threshold {
            return Source::Baseline;
        }
        if policy.should_explore(rng) {
            return Source::Exploration;
        }
        if self.corpus_enabled && corpus_len > 0 && rng.random::<f64>() < self.corpus_probability {
            return Source::Corpus;
        }
        Source::Baseline
    }
}
