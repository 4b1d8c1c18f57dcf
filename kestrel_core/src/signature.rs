use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_SIGNATURES: usize = 1000;
pub const DEFAULT_MAX_SIGNATURE_LEN: usize = 200;
pub const FATAL_SIGNATURE: &str = "FATAL: process crashed";

/// Process-level crash markers, matched case-insensitively anywhere in the raw text.
const FATAL_MARKERS: &[&str] = &[
    "segmentation fault",
    "sigsegv",
    "core dumped",
    "sigabrt",
    "fatal python error",
    "illegal instruction",
    "bus error",
];

const DEEP_KEYWORDS: &[&str] = &[
    "cuda",
    "cudnn",
    "cublas",
    "device-side assert",
    "internal assert",
    "illegal memory access",
    "out of memory",
    "driver",
    "kernel",
];

const SHALLOW_KEYWORDS: &[&str] = &[
    "typeerror",
    "valueerror",
    "shape",
    "size mismatch",
    "dimension",
    "argument",
    "expected",
    "invalid",
    "must be",
    "dtype",
    "not implemented",
];

/// Ordered substitutions applied to the focus line. Earlier rules win: addresses are
/// replaced before their digits could be read as integers, and integers before the
/// list and shape rules look for placeholder-only brackets.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    (r"0[xX][0-9a-fA-F]+", "<ADDR>"),
    (r"[-+]?\d+\.\d*(?:[eE][-+]?\d+)?|[-+]?\d+[eE][-+]?\d+", "<FLOAT>"),
    (r"[-+]?\b\d+\b", "<INT>"),
    (r"\[[^\[\]]*\]", "<LIST>"),
    (r"\(\s*<INT>(?:\s*,\s*<INT>)*\s*,?\s*\)", "<SHAPE>"),
    (r"\s+", " "),
];

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Invalid canonicalization rule: {0}")]
    Rule(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BugCategory {
    Fatal,
    Deep,
    Shallow,
    Unclassified,
}

impl BugCategory {
    pub const ALL: [BugCategory; 4] = [
        BugCategory::Fatal,
        BugCategory::Deep,
        BugCategory::Shallow,
        BugCategory::Unclassified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BugCategory::Fatal => "fatal",
            BugCategory::Deep => "deep",
            BugCategory::Shallow => "shallow",
            BugCategory::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for BugCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureConfig {
    pub max_signatures: usize,
    pub max_signature_len: usize,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            max_signatures: DEFAULT_MAX_SIGNATURES,
            max_signature_len: DEFAULT_MAX_SIGNATURE_LEN,
        }
    }
}

/// A normalized failure diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BugSignature {
    pub text: String,
    pub key: [u8; 16],
    pub category: BugCategory,
}

impl BugSignature {
    pub fn hex_key(&self) -> String {
        self.key.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub is_new: bool,
    pub signature: BugSignature,
}

/// A stored signature with occurrence bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct SignatureEntry {
    pub signature: BugSignature,
    pub first_iteration: u64,
    pub occurrences: u64,
    pub example: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub unique: usize,
    pub total: u64,
    pub overflow: u64,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: HashMap<[u8; 16], SignatureEntry>,
    total: u64,
    overflow: u64,
}

/// Deduplicates raw failure text into per-category signature buckets.
///
/// Each bucket stores at most `max_signatures` distinct signatures. Once a bucket is full,
/// new signatures are counted in `overflow` and the bucket total, but not stored, so the
/// unique count is a lower bound from that point on.
#[derive(Debug)]
pub struct BugSignatureIndex {
    config: SignatureConfig,
    rules: Vec<(Regex, &'static str)>,
    buckets: BTreeMap<BugCategory, Bucket>,
}

impl BugSignatureIndex {
    pub fn new(config: SignatureConfig) -> Result<Self, SignatureError> {
        let rules = SUBSTITUTIONS
            .iter()
            .map(|(pattern, placeholder)| Regex::new(pattern).map(|re| (re, *placeholder)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self {
            config,
            rules,
            buckets: BTreeMap::new(),
        })
    }

    pub fn canonicalize(&self, raw_text: &str) -> String {
        let lowered = raw_text.to_lowercase();
        if FATAL_MARKERS.iter().any(|m| lowered.contains(m)) {
            return FATAL_SIGNATURE.to_string();
        }

        let mut line = focus_line(raw_text).to_string();
        for (regex, placeholder) in &self.rules {
            line = regex.replace_all(&line, *placeholder).into_owned();
        }
        truncate_chars(line.trim(), self.config.max_signature_len)
    }

    pub fn classify(&self, signature: &str) -> BugCategory {
        let lowered = signature.to_lowercase();
        if lowered == FATAL_SIGNATURE.to_lowercase() || FATAL_MARKERS.iter().any(|m| lowered.contains(m)) {
            BugCategory::Fatal
        } else if DEEP_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            BugCategory::Deep
        } else if SHALLOW_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            BugCategory::Shallow
        } else {
            BugCategory::Unclassified
        }
    }

    /// Canonicalizes `raw_text` and records it under `bucket`.
    pub fn record(&mut self, bucket: BugCategory, raw_text: &str, iteration: u64) -> RecordOutcome {
        let text = self.canonicalize(raw_text);
        let key = md5::compute(text.as_bytes()).0;
        let signature = BugSignature {
            text,
            key,
            category: bucket,
        };

        let max_signatures = self.config.max_signatures;
        let slot = self.buckets.entry(bucket).or_default();
        slot.total += 1;

        if let Some(entry) = slot.entries.get_mut(&key) {
            entry.occurrences += 1;
            return RecordOutcome {
                is_new: false,
                signature,
            };
        }
        if slot.entries.len() >= max_signatures {
            if slot.overflow == 0 {
                warn!("signature bucket '{bucket}' is full ({max_signatures}), uniqueness is now approximate");
            }
            slot.overflow += 1;
            return RecordOutcome {
                is_new: false,
                signature,
            };
        }

        debug!("new {bucket} signature {}: {}", signature.hex_key(), signature.text);
        slot.entries.insert(
            key,
            SignatureEntry {
                signature: signature.clone(),
                first_iteration: iteration,
                occurrences: 1,
                example: truncate_chars(raw_text, self.config.max_signature_len * 4),
            },
        );
        RecordOutcome {
            is_new: true,
            signature,
        }
    }

    /// Records `raw_text` in the bucket its canonical form classifies into.
    pub fn record_classified(&mut self, raw_text: &str, iteration: u64) -> RecordOutcome {
        let bucket = self.classify(&self.canonicalize(raw_text));
        self.record(bucket, raw_text, iteration)
    }

    pub fn unique_by_category(&self) -> BTreeMap<String, usize> {
        BugCategory::ALL
            .iter()
            .map(|c| {
                let unique = self.buckets.get(c).map_or(0, |b| b.entries.len());
                (c.as_str().to_string(), unique)
            })
            .collect()
    }

    pub fn total_unique(&self) -> usize {
        self.buckets.values().map(|b| b.entries.len()).sum()
    }

    pub fn bucket_stats(&self, category: BugCategory) -> BucketStats {
        self.buckets
            .get(&category)
            .map(|b| BucketStats {
                unique: b.entries.len(),
                total: b.total,
                overflow: b.overflow,
            })
            .unwrap_or_default()
    }

    /// Stored signatures of one category, oldest first.
    pub fn signatures(&self, category: BugCategory) -> Vec<&SignatureEntry> {
        let mut entries: Vec<&SignatureEntry> = self
            .buckets
            .get(&category)
            .map(|b| b.entries.values().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            a.first_iteration
                .cmp(&b.first_iteration)
                .then_with(|| a.signature.text.cmp(&b.signature.text))
        });
        entries
    }
}

/// The last line mentioning an error or exception, else the last non-empty line.
fn focus_line(raw_text: &str) -> &str {
    let lines: Vec<&str> = raw_text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines
        .iter()
        .rev()
        .find(|l| {
            let lowered = l.to_lowercase();
            lowered.contains("error") || lowered.contains("exception")
        })
        .or_else(|| lines.last())
        .copied()
        .unwrap_or("")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> BugSignatureIndex {
        BugSignatureIndex::new(SignatureConfig::default()).unwrap()
    }

    #[test]
    fn numbers_and_addresses_normalize_to_one_signature() {
        let mut index = index();
        let first = "RuntimeError: index 17 out of range at 0x7ffd1234 (scale 0.25)";
        let second = "RuntimeError: index 9031 out of range at 0xdeadbeef (scale 3.5)";
        assert_eq!(index.canonicalize(first), index.canonicalize(second));

        let a = index.record(BugCategory::Unclassified, first, 1);
        let b = index.record(BugCategory::Unclassified, second, 2);
        assert!(a.is_new);
        assert!(!b.is_new);
        assert_eq!(a.signature.key, b.signature.key);
        assert_eq!(index.bucket_stats(BugCategory::Unclassified).total, 2);
        assert_eq!(index.signatures(BugCategory::Unclassified)[0].occurrences, 2);
    }

    #[test]
    fn signed_integers_share_a_signature() {
        let mut index = index();
        let positive = "IndexError: Dimension out of range (expected to be in range of [-1, 0], but got 2)";
        let negative = "IndexError: Dimension out of range (expected to be in range of [-1, 0], but got -3)";
        assert_eq!(
            index.canonicalize(negative),
            "IndexError: Dimension out of range (expected to be in range of <LIST>, but got <INT>)"
        );
        assert_eq!(index.canonicalize(positive), index.canonicalize(negative));
        assert!(index.record(BugCategory::Shallow, positive, 1).is_new);
        assert!(!index.record(BugCategory::Shallow, negative, 2).is_new);
        assert_eq!(index.canonicalize("offset +4 ignored"), "offset <INT> ignored");
    }

    #[test]
    fn substitution_order_is_applied() {
        let index = index();
        assert_eq!(
            index.canonicalize("ValueError: got   shape (3, 4) and [1, 2, 3] at 0x10 with 1.5e-3"),
            "ValueError: got shape <SHAPE> and <LIST> at <ADDR> with <FLOAT>"
        );
    }

    #[test]
    fn fatal_markers_short_circuit() {
        let index = index();
        let raw = "loading model\nTypeError: bad arg\nSegmentation fault (core dumped)";
        assert_eq!(index.canonicalize(raw), FATAL_SIGNATURE);
        assert_eq!(index.classify(&index.canonicalize(raw)), BugCategory::Fatal);
        assert_eq!(index.classify("CUDA error but also SIGSEGV"), BugCategory::Fatal);
    }

    #[test]
    fn focus_line_prefers_last_error_line() {
        let index = index();
        let raw = "Traceback:\n  File x.py\nValueError: first\nnoise\nRuntimeError: second\ntrailing note\n";
        assert_eq!(index.canonicalize(raw), "RuntimeError: second");
        assert_eq!(index.canonicalize("just a warning\nlast words"), "last words");
        assert_eq!(index.canonicalize(""), "");
    }

    #[test]
    fn classification_follows_priority() {
        let index = index();
        assert_eq!(
            index.classify("RuntimeError: CUDA error: invalid argument"),
            BugCategory::Deep
        );
        assert_eq!(
            index.classify("ValueError: expected dtype float"),
            BugCategory::Shallow
        );
        assert_eq!(index.classify("AssertionError: mismatch"), BugCategory::Unclassified);
    }

    #[test]
    fn signatures_are_truncated_on_char_boundaries() {
        let index = BugSignatureIndex::new(SignatureConfig {
            max_signatures: 10,
            max_signature_len: 5,
        })
        .unwrap();
        assert_eq!(index.canonicalize("éééééééé"), "ééééé");
    }

    #[test]
    fn full_bucket_counts_overflow_without_storing() {
        let mut index = BugSignatureIndex::new(SignatureConfig {
            max_signatures: 2,
            max_signature_len: 200,
        })
        .unwrap();
        assert!(index.record(BugCategory::Shallow, "alpha failure", 0).is_new);
        assert!(index.record(BugCategory::Shallow, "beta failure", 1).is_new);
        assert!(!index.record(BugCategory::Shallow, "gamma failure", 2).is_new);
        assert!(!index.record(BugCategory::Shallow, "alpha failure", 3).is_new);

        let stats = index.bucket_stats(BugCategory::Shallow);
        assert_eq!(stats.unique, 2);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.overflow, 1);
        // Buckets are independent.
        assert!(index.record(BugCategory::Deep, "gamma failure", 4).is_new);
    }

    #[test]
    fn record_classified_routes_to_bucket() {
        let mut index = index();
        index.record_classified("Fatal Python error: Aborted", 0);
        index.record_classified("RuntimeError: CUDA out of memory. Tried 20 MiB", 1);
        index.record_classified("RuntimeError: CUDA out of memory. Tried 512 MiB", 2);
        index.record_classified("TypeError: argument 'x' must be Tensor", 3);

        let unique = index.unique_by_category();
        assert_eq!(unique["fatal"], 1);
        assert_eq!(unique["deep"], 1);
        assert_eq!(unique["shallow"], 1);
        assert_eq!(unique["unclassified"], 0);
        assert_eq!(index.total_unique(), 3);
    }
}
