use rand_core::RngCore;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;

/// A candidate input handed to the target-under-test.
///
/// Candidates are plain values: the corpus stores owned clones, and every parent handed
/// out for mutation is a fresh copy. The serde bounds let a candidate travel inside a
/// checkpoint.
pub trait Input: Clone + Send + Sync + std::fmt::Debug + Serialize + DeserializeOwned + 'static {
    /// Short, stable fingerprint written to the per-iteration trace.
    fn describe(&self) -> String;

    /// Observed values for the combinatorial coverage space, keyed by axis name.
    ///
    /// Candidates that cannot describe some axis simply leave it out; the space model
    /// fills missing axes with a sentinel.
    fn dimension_values(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl Input for Vec<u8> {
    fn describe(&self) -> String {
        format!("{:x}", md5::compute(self.as_slice()))
    }

    fn dimension_values(&self) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        values.insert("len".to_string(), self.len().to_string());
        if let Some(first) = self.first() {
            values.insert("first".to_string(), format!("{first:02x}"));
        }
        values
    }
}

/// Produces fresh candidates for a target. Used by the baseline and exploration sources.
pub trait CandidateGenerator<I: Input> {
    fn generate(&mut self, target_id: &str, rng: &mut dyn RngCore) -> Result<I, anyhow::Error>;
}

/// Generates random byte strings of bounded length.
#[derive(Debug, Clone)]
pub struct RandomBytesGenerator {
    max_len: usize,
}

impl RandomBytesGenerator {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
        }
    }
}

impl CandidateGenerator<Vec<u8>> for RandomBytesGenerator {
    fn generate(&mut self, _target_id: &str, rng: &mut dyn RngCore) -> Result<Vec<u8>, anyhow::Error> {
        let len = 1 + (rng.next_u32() as usize % self.max_len);
        let mut bytes = vec![0u8; len];
        rng.fill_bytes(&mut bytes);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn vec_u8_describe_is_stable_md5() {
        let data: Vec<u8> = vec![1, 2, 3];
        assert_eq!(data.describe(), format!("{:x}", md5::compute([1u8, 2, 3])));
        assert_eq!(data.describe(), data.clone().describe());
    }

    #[test]
    fn vec_u8_dimension_values_cover_len_and_first_byte() {
        let data: Vec<u8> = vec![0xAB, 0x01];
        let values = data.dimension_values();
        assert_eq!(values.get("len").map(String::as_str), Some("2"));
        assert_eq!(values.get("first").map(String::as_str), Some("ab"));

        let empty: Vec<u8> = Vec::new();
        assert!(!empty.dimension_values().contains_key("first"));
    }

    #[test]
    fn random_bytes_generator_respects_max_len() {
        let mut generator = RandomBytesGenerator::new(4);
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        for _ in 0..50 {
            let candidate = generator.generate("bytes", &mut rng).unwrap();
            assert!(!candidate.is_empty());
            assert!(candidate.len() <= 4);
        }
    }
}
