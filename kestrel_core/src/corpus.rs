use crate::input::Input;
use rand::Rng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

pub const DEFAULT_CORPUS_MAX_SIZE: usize = 100;

/// Errors raised while building or filling a [`Corpus`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorpusError {
    /// A corpus must be able to hold at least one seed.
    #[error("Corpus capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),
}

/// How [`Corpus::select_parent`] picks a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    #[default]
    Uniform,
    /// Probability proportional to the number of tokens the seed discovered.
    ScoreWeighted,
}

/// A stored candidate together with the number of tokens its execution produced.
///
/// The candidate is an owned copy; nothing outside the corpus holds a reference to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "I: Input")]
pub struct CorpusSeed<I: Input> {
    pub candidate: I,
    pub score: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CorpusStats {
    pub size: usize,
    pub max_size: usize,
    pub admitted: u64,
    pub evicted: u64,
    pub mean_score: f64,
}

/// A bounded pool of promising candidates with strict FIFO eviction.
#[derive(Debug, Clone)]
pub struct Corpus<I: Input> {
    seeds: VecDeque<CorpusSeed<I>>,
    max_size: usize,
    mode: SelectionMode,
    admitted: u64,
    evicted: u64,
}

impl<I: Input> Corpus<I> {
    pub fn new(max_size: usize, mode: SelectionMode) -> Result<Self, CorpusError> {
        if max_size == 0 {
            return Err(CorpusError::InvalidCapacity(max_size));
        }
        Ok(Self {
            seeds: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            mode,
            admitted: 0,
            evicted: 0,
        })
    }

    /// Stores a copy of `candidate` if it discovered anything.
    ///
    /// Returns `Ok(None)` when the candidate was not admitted, otherwise the number of
    /// old seeds evicted to make room.
    pub fn add_seed(
        &mut self,
        candidate: &I,
        discovered_token_count: usize,
    ) -> Result<Option<usize>, CorpusError> {
        if discovered_token_count == 0 {
            return Ok(None);
        }
        self.seeds.push_back(CorpusSeed {
            candidate: candidate.clone(),
            score: discovered_token_count,
        });
        self.admitted += 1;

        let mut evicted = 0;
        while self.seeds.len() > self.max_size {
            self.seeds.pop_front();
            evicted += 1;
        }
        self.evicted += evicted as u64;
        Ok(Some(evicted))
    }

    /// Picks a parent and hands back an independent copy. Selection is with replacement.
    pub fn select_parent(&self, rng: &mut dyn RngCore) -> Option<I> {
        if self.seeds.is_empty() {
            return None;
        }
        let index = match self.mode {
            SelectionMode::Uniform => rng.random_range(0..self.seeds.len()),
            SelectionMode::ScoreWeighted => self.weighted_index(rng),
        };
        self.seeds.get(index).map(|seed| seed.candidate.clone())
    }

    fn weighted_index(&self, rng: &mut dyn RngCore) -> usize {
        let total: u64 = self.seeds.iter().map(|s| s.score as u64).sum();
        if total == 0 {
            return rng.random_range(0..self.seeds.len());
        }
        let mut target = rng.random_range(0..total);
        for (index, seed) in self.seeds.iter().enumerate() {
            let weight = seed.score as u64;
            if target < weight {
                return index;
            }
            target -= weight;
        }
        self.seeds.len() - 1
    }

    /// Replaces the contents with checkpointed seeds, keeping the newest `max_size`.
    pub fn restore(&mut self, seeds: Vec<CorpusSeed<I>>) {
        let skip = seeds.len().saturating_sub(self.max_size);
        self.seeds = seeds.into_iter().skip(skip).collect();
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Oldest first.
    pub fn seeds(&self) -> impl Iterator<Item = &CorpusSeed<I>> {
        self.seeds.iter()
    }

    pub fn to_seeds(&self) -> Vec<CorpusSeed<I>> {
        self.seeds.iter().cloned().collect()
    }

    pub fn stats(&self) -> CorpusStats {
        let mean_score = if self.seeds.is_empty() {
            0.0
        } else {
            self.seeds.iter().map(|s| s.score as f64).sum::<f64>() / self.seeds.len() as f64
        };
        CorpusStats {
            size: self.seeds.len(),
            max_size: self.max_size,
            admitted: self.admitted,
            evicted: self.evicted,
            mean_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn zero_capacity_is_rejected() {
        let result = Corpus::<Vec<u8>>::new(0, SelectionMode::Uniform);
        assert_eq!(result.unwrap_err(), CorpusError::InvalidCapacity(0));
    }

    #[test]
    fn candidates_without_discoveries_are_not_admitted() {
        let mut corpus = Corpus::<Vec<u8>>::new(4, SelectionMode::Uniform).unwrap();
        assert_eq!(corpus.add_seed(&vec![1], 0).unwrap(), None);
        assert!(corpus.is_empty());
        assert_eq!(corpus.add_seed(&vec![1], 2).unwrap(), Some(0));
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let max_size = 5;
        let extra = 3;
        let mut corpus = Corpus::<Vec<u8>>::new(max_size, SelectionMode::Uniform).unwrap();
        for i in 0..(max_size + extra) {
            corpus.add_seed(&vec![i as u8], 1).unwrap();
        }
        assert_eq!(corpus.len(), max_size);
        let kept: Vec<u8> = corpus.seeds().map(|s| s.candidate[0]).collect();
        assert_eq!(kept, vec![3, 4, 5, 6, 7]);
        let stats = corpus.stats();
        assert_eq!(stats.admitted, 8);
        assert_eq!(stats.evicted, 3);
    }

    #[test]
    fn selected_parent_is_an_independent_copy() {
        let mut corpus = Corpus::<Vec<u8>>::new(2, SelectionMode::Uniform).unwrap();
        let mut original = vec![1u8, 2, 3];
        corpus.add_seed(&original, 1).unwrap();
        original[0] = 99;

        let mut rng = ChaCha8Rng::from_seed([5u8; 32]);
        let mut parent = corpus.select_parent(&mut rng).unwrap();
        assert_eq!(parent, vec![1, 2, 3]);
        parent[1] = 42;

        let stored: Vec<&Vec<u8>> = corpus.seeds().map(|s| &s.candidate).collect();
        assert_eq!(stored, vec![&vec![1u8, 2, 3]]);
    }

    #[test]
    fn empty_corpus_selects_nothing() {
        let corpus = Corpus::<Vec<u8>>::new(2, SelectionMode::ScoreWeighted).unwrap();
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        assert!(corpus.select_parent(&mut rng).is_none());
    }

    #[test]
    fn weighted_selection_prefers_high_scores() {
        let mut corpus = Corpus::<Vec<u8>>::new(2, SelectionMode::ScoreWeighted).unwrap();
        corpus.add_seed(&vec![0], 1).unwrap();
        corpus.add_seed(&vec![1], 99).unwrap();

        let mut rng = ChaCha8Rng::from_seed([9u8; 32]);
        let heavy = (0..2000)
            .filter(|_| corpus.select_parent(&mut rng) == Some(vec![1]))
            .count();
        assert!(heavy > 1900, "heavy seed picked {heavy} times");
    }

    #[test]
    fn restore_keeps_newest_seeds_in_order() {
        let mut corpus = Corpus::<Vec<u8>>::new(2, SelectionMode::Uniform).unwrap();
        let seeds = (0..4u8)
            .map(|i| CorpusSeed {
                candidate: vec![i],
                score: 1,
            })
            .collect();
        corpus.restore(seeds);
        assert_eq!(
            corpus.to_seeds(),
            vec![
                CorpusSeed {
                    candidate: vec![2u8],
                    score: 1
                },
                CorpusSeed {
                    candidate: vec![3u8],
                    score: 1
                },
            ]
        );
    }
}
