use crate::input::Input;
use log::warn;
use rand::Rng;
use rand_core::RngCore;
use serde_json::{Number as JsonNumber, Value as JsonValue};
use std::marker::PhantomData;

/// Probability that a field within a JSON object or array is visited.
const DEFAULT_JSON_FIELD_CHANGE_PROBABILITY: f64 = 0.5;
/// Probability that a visited leaf value is actually changed.
const DEFAULT_JSON_VALUE_MUTATION_PROBABILITY: f64 = 0.5;
/// Default maximum recursion depth for `JsonFieldMutator`.
const DEFAULT_JSON_MAX_MUTATION_DEPTH: usize = 10;

/// Perturbs a candidate.
///
/// The engine decides *how strongly* to perturb through `range`, a magnitude bound
/// (normally ±8, widened to ±64 while the search is expanding). What a unit of
/// perturbation means is up to the implementation.
pub trait Mutator<I: Input> {
    /// Consumes `candidate` and returns the mutated value.
    ///
    /// # Errors
    /// Returns an error if the candidate cannot be mutated. The engine then executes the
    /// unmutated candidate.
    fn mutate(&mut self, candidate: I, range: u32, rng: &mut dyn RngCore) -> Result<I, anyhow::Error>;
}

/// Adds a non-zero delta within `±range` to one randomly chosen byte, with wrapping.
///
/// An empty input first gains a single zero byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteDeltaMutator;

impl Mutator<Vec<u8>> for ByteDeltaMutator {
    fn mutate(
        &mut self,
        mut candidate: Vec<u8>,
        range: u32,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<u8>, anyhow::Error> {
        if candidate.is_empty() {
            candidate.push(0);
        }
        let bound = range.clamp(1, 255) as i16;
        let magnitude = rng.random_range(1..=bound);
        let delta = if rng.random_bool(0.5) { magnitude } else { -magnitude };
        let index = rng.random_range(0..candidate.len());
        candidate[index] = (candidate[index] as i16 + delta).rem_euclid(256) as u8;
        Ok(candidate)
    }
}

/// A structure-aware mutator for any serde candidate.
///
/// The candidate is converted to a `serde_json::Value`, a random subset of its leaves is
/// perturbed (numbers by at most `range`, booleans flipped, one character of a string
/// replaced), and the value is converted back. If the mutated JSON no longer fits the
/// candidate type, the original candidate is returned unchanged.
pub struct JsonFieldMutator<I: Input> {
    max_mutation_depth: usize,
    field_recurse_probability: f64,
    mutate_strings: bool,
    _marker: PhantomData<fn() -> I>,
}

impl<I: Input> Default for JsonFieldMutator<I> {
    fn default() -> Self {
        Self::new(DEFAULT_JSON_MAX_MUTATION_DEPTH, DEFAULT_JSON_FIELD_CHANGE_PROBABILITY)
    }
}

impl<I: Input> JsonFieldMutator<I> {
    pub fn new(max_mutation_depth: usize, field_recurse_probability: f64) -> Self {
        Self {
            max_mutation_depth: if max_mutation_depth == 0 {
                DEFAULT_JSON_MAX_MUTATION_DEPTH
            } else {
                max_mutation_depth
            },
            field_recurse_probability: if field_recurse_probability <= 0.0
                || field_recurse_probability > 1.0
            {
                DEFAULT_JSON_FIELD_CHANGE_PROBABILITY
            } else {
                field_recurse_probability
            },
            mutate_strings: true,
            _marker: PhantomData,
        }
    }

    /// Leave string leaves alone, e.g. when they hold enumerated values.
    pub fn without_strings(mut self) -> Self {
        self.mutate_strings = false;
        self
    }

    fn mutate_json_value(
        &self,
        value: &mut JsonValue,
        range: u32,
        rng: &mut dyn RngCore,
        current_depth: usize,
    ) {
        if current_depth >= self.max_mutation_depth {
            return;
        }

        match value {
            JsonValue::Object(map) => {
                for (_key, val) in map.iter_mut() {
                    if rng.random_bool(self.field_recurse_probability) {
                        self.mutate_json_value(val, range, rng, current_depth + 1);
                    }
                }
            }
            JsonValue::Array(arr) => {
                for val in arr.iter_mut() {
                    if rng.random_bool(self.field_recurse_probability) {
                        self.mutate_json_value(val, range, rng, current_depth + 1);
                    }
                }
            }
            JsonValue::String(s) => {
                if self.mutate_strings
                    && !s.is_empty()
                    && rng.random_bool(DEFAULT_JSON_VALUE_MUTATION_PROBABILITY)
                {
                    let mut chars: Vec<char> = s.chars().collect();
                    let idx = rng.random_range(0..chars.len());
                    chars[idx] = rng.random_range(32u8..127u8) as char;
                    *s = chars.into_iter().collect();
                }
            }
            JsonValue::Number(n) => {
                if rng.random_bool(DEFAULT_JSON_VALUE_MUTATION_PROBABILITY) {
                    let bound = range.max(1) as i64;
                    if let Some(val_u64) = n.as_u64() {
                        let delta = rng.random_range(-bound..=bound);
                        let new_val = if delta < 0 {
                            val_u64.saturating_sub(delta.unsigned_abs())
                        } else {
                            val_u64.saturating_add(delta as u64)
                        };
                        *n = JsonNumber::from(new_val);
                    } else if let Some(val_i64) = n.as_i64() {
                        let delta = rng.random_range(-bound..=bound);
                        *n = JsonNumber::from(val_i64.saturating_add(delta));
                    } else if let Some(val_f64) = n.as_f64() {
                        let delta: f64 = rng.random_range(-1.0..1.0) * bound as f64;
                        let new_val = val_f64 + delta;
                        *n = JsonNumber::from_f64(new_val).unwrap_or_else(|| JsonNumber::from(0));
                    }
                }
            }
            JsonValue::Bool(b) => {
                if rng.random_bool(DEFAULT_JSON_VALUE_MUTATION_PROBABILITY) {
                    *b = !*b;
                }
            }
            JsonValue::Null => {}
        }
    }
}

impl<I: Input> Mutator<I> for JsonFieldMutator<I> {
    fn mutate(&mut self, candidate: I, range: u32, rng: &mut dyn RngCore) -> Result<I, anyhow::Error> {
        let mut json = serde_json::to_value(&candidate)
            .map_err(|e| anyhow::anyhow!("Failed to convert candidate to JSON: {}", e))?;

        self.mutate_json_value(&mut json, range, rng, 0);

        match serde_json::from_value(json) {
            Ok(mutated) => Ok(mutated),
            Err(e) => {
                warn!("mutated JSON no longer fits the candidate type ({e}), keeping the original");
                Ok(candidate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
    struct Shape {
        rows: u32,
        cols: i32,
        contiguous: bool,
        label: String,
        nested: Vec<u8>,
    }

    impl Input for Shape {
        fn describe(&self) -> String {
            format!("{}x{}", self.rows, self.cols)
        }
    }

    #[test]
    fn byte_delta_mutator_changes_one_byte_within_range() {
        let mut mutator = ByteDeltaMutator;
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        for _ in 0..200 {
            let original: Vec<u8> = vec![100, 100, 100];
            let mutated = mutator.mutate(original.clone(), 8, &mut rng).unwrap();
            assert_eq!(mutated.len(), original.len());
            let changed: Vec<usize> = (0..3).filter(|&i| mutated[i] != original[i]).collect();
            assert_eq!(changed.len(), 1);
            let diff = (mutated[changed[0]] as i16 - 100).abs();
            assert!((1..=8).contains(&diff), "diff was {diff}");
        }
    }

    #[test]
    fn byte_delta_mutator_handles_empty_input() {
        let mut mutator = ByteDeltaMutator;
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
        let mutated = mutator.mutate(Vec::new(), 64, &mut rng).unwrap();
        assert_eq!(mutated.len(), 1);
        assert_ne!(mutated[0], 0);
    }

    #[test]
    fn json_field_mutator_keeps_numbers_within_range() {
        let mut mutator = JsonFieldMutator::<Shape>::new(4, 1.0).without_strings();
        let mut rng = ChaCha8Rng::from_seed([2u8; 32]);
        let original = Shape {
            rows: 50,
            cols: -50,
            contiguous: true,
            label: "fixed".to_string(),
            nested: vec![10, 20],
        };
        let mut saw_change = false;
        for _ in 0..100 {
            let mutated = mutator.mutate(original.clone(), 8, &mut rng).unwrap();
            assert!((42..=58).contains(&mutated.rows));
            assert!((-58..=-42).contains(&mutated.cols));
            assert_eq!(mutated.label, "fixed");
            saw_change |= mutated != original;
        }
        assert!(saw_change);
    }

    #[test]
    fn json_field_mutator_reverts_when_value_no_longer_fits() {
        // A u8 at 255 can be pushed past the type's range; the original must come back.
        let mut mutator = JsonFieldMutator::<Vec<u8>>::new(4, 1.0);
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        for _ in 0..50 {
            let mutated = mutator.mutate(vec![255u8; 4], 64, &mut rng).unwrap();
            assert_eq!(mutated.len(), 4);
        }
    }
}
