//! A self-contained simulated target: calls into a toy tensor library.
//!
//! The simulated library exposes a handful of ops whose "kernels" depend on dtype,
//! device, layout and rank, and it carries a few planted bugs at different depths so a
//! run has something to find.

use kestrel_core::executor::{Diagnostic, ExecutionResult};
use kestrel_core::guard::OutlierFilter;
use kestrel_core::input::{CandidateGenerator, Input};
use kestrel_core::mutator::{JsonFieldMutator, Mutator};
use kestrel_core::signature::BugCategory;
use kestrel_core::space::DimensionAxis;
use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const DEMO_TARGET: &str = "demo.tensor_call";

pub const OPS: &[&str] = &["add", "matmul", "softmax", "conv2d", "sum"];
pub const DTYPES: &[&str] = &["float32", "float16", "int64", "bool"];
pub const DEVICES: &[&str] = &["cpu", "cuda"];
pub const LAYOUTS: &[&str] = &["strided", "sparse"];
const MAX_RANK: usize = 4;
const MAX_DIM: u32 = 64;

pub const DEFAULT_MAX_ELEMENTS: u64 = 1 << 22;
pub const DEFAULT_MAX_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TensorCall {
    pub op: String,
    pub dtype: String,
    pub device: String,
    pub layout: String,
    pub shape: Vec<u32>,
    pub alpha: f64,
}

impl TensorCall {
    fn numel(&self) -> u64 {
        self.shape.iter().map(|d| *d as u64).product()
    }

    fn element_size(&self) -> u64 {
        match self.dtype.as_str() {
            "float16" => 2,
            "float32" => 4,
            "int64" => 8,
            "bool" => 1,
            _ => 8,
        }
    }
}

impl Input for TensorCall {
    fn describe(&self) -> String {
        format!(
            "{}({},{},{},{:?},alpha={:.3})",
            self.op, self.dtype, self.device, self.layout, self.shape, self.alpha
        )
    }

    fn dimension_values(&self) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        values.insert("dtype".to_string(), self.dtype.clone());
        values.insert("device".to_string(), self.device.clone());
        values.insert("layout".to_string(), self.layout.clone());
        values.insert("rank".to_string(), self.shape.len().to_string());
        values
    }
}

/// Axes of the demo target's coverage space.
pub fn demo_axes() -> Vec<DimensionAxis> {
    vec![
        DimensionAxis::new("dtype", DTYPES.iter().copied()),
        DimensionAxis::new("device", DEVICES.iter().copied()),
        DimensionAxis::new("layout", LAYOUTS.iter().copied()),
        DimensionAxis::new("rank", (1..=MAX_RANK).map(|r| r.to_string())),
    ]
}

fn pick(choices: &[&str], rng: &mut dyn RngCore) -> String {
    choices.choose(rng).copied().unwrap_or_default().to_string()
}

#[derive(Debug, Default)]
pub struct TensorCallGenerator;

impl CandidateGenerator<TensorCall> for TensorCallGenerator {
    fn generate(&mut self, _target_id: &str, rng: &mut dyn RngCore) -> Result<TensorCall, anyhow::Error> {
        let rank = rng.random_range(1..=MAX_RANK);
        Ok(TensorCall {
            op: pick(OPS, rng),
            dtype: pick(DTYPES, rng),
            device: pick(DEVICES, rng),
            layout: pick(LAYOUTS, rng),
            shape: (0..rank).map(|_| rng.random_range(1..=16)).collect(),
            alpha: rng.random_range(-2.0..2.0),
        })
    }
}

/// Perturbs numeric fields through [`JsonFieldMutator`] and occasionally swaps one
/// categorical field or the rank. Wider ranges make categorical swaps more likely.
pub struct TensorCallMutator {
    fields: JsonFieldMutator<TensorCall>,
}

impl Default for TensorCallMutator {
    fn default() -> Self {
        Self {
            fields: JsonFieldMutator::new(3, 0.5).without_strings(),
        }
    }
}

impl Mutator<TensorCall> for TensorCallMutator {
    fn mutate(
        &mut self,
        candidate: TensorCall,
        range: u32,
        rng: &mut dyn RngCore,
    ) -> Result<TensorCall, anyhow::Error> {
        let mut call = self.fields.mutate(candidate, range, rng)?;

        let swap_probability = (range as f64 / 64.0).clamp(0.05, 0.9);
        if rng.random_bool(swap_probability) {
            match rng.random_range(0..5) {
                0 => call.op = pick(OPS, rng),
                1 => call.dtype = pick(DTYPES, rng),
                2 => call.device = pick(DEVICES, rng),
                3 => call.layout = pick(LAYOUTS, rng),
                _ => {
                    if call.shape.len() < MAX_RANK && rng.random_bool(0.5) {
                        call.shape.push(rng.random_range(1..=8));
                    } else if call.shape.len() > 1 {
                        call.shape.pop();
                    }
                }
            }
        }
        for dim in call.shape.iter_mut() {
            *dim = (*dim).min(MAX_DIM);
        }
        Ok(call)
    }
}

/// Rejects calls whose tensors are too large to be worth running.
#[derive(Debug, Clone, Copy)]
pub struct TensorSizeFilter {
    pub max_elements: u64,
    pub max_bytes: u64,
}

impl Default for TensorSizeFilter {
    fn default() -> Self {
        Self {
            max_elements: DEFAULT_MAX_ELEMENTS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl OutlierFilter<TensorCall> for TensorSizeFilter {
    fn check(&mut self, call: &TensorCall) -> Option<String> {
        let numel = call.numel();
        if numel > self.max_elements {
            return Some(format!("{numel} elements exceeds {}", self.max_elements));
        }
        let bytes = numel.saturating_mul(call.element_size());
        (bytes > self.max_bytes).then(|| format!("{bytes} bytes exceeds {}", self.max_bytes))
    }
}

/// Runs a call against the simulated library.
pub fn simulate(call: &TensorCall) -> Result<ExecutionResult, anyhow::Error> {
    let rank = call.shape.len();
    let numel = call.numel();

    if call.device == "cuda" && call.shape.iter().any(|d| *d > 60) {
        return Err(anyhow::anyhow!("simulated device ran out of launch resources"));
    }
    if call.layout == "sparse" && call.op == "softmax" && rank == 3 {
        panic!("Segmentation fault in sparse softmax kernel (rank {rank})");
    }

    let mut tokens = BTreeSet::new();
    tokens.insert(format!("kernel:{}_{}_{}", call.op, call.dtype, call.device));
    tokens.insert(format!("layout:{}_{}", call.op, call.layout));
    tokens.insert(format!("rank:{}_{}", call.op, rank));
    if numel == 0 {
        tokens.insert(format!("path:{}_empty", call.op));
    }
    if numel > 4096 {
        tokens.insert(format!("path:{}_large_{}", call.op, call.device));
    }
    if call.alpha < 0.0 {
        tokens.insert(format!("path:{}_negative_alpha", call.op));
    }

    let diagnostic = if call.op == "matmul" && rank < 2 {
        Some(Diagnostic {
            category: None,
            raw_text: format!(
                "Traceback (most recent call last):\nValueError: matmul expected 2 dims, got {rank} (shape {:?})",
                call.shape
            ),
        })
    } else if call.device == "cuda" && call.dtype == "float16" && numel > 2048 {
        Some(Diagnostic {
            category: Some(BugCategory::Deep),
            raw_text: format!(
                "RuntimeError: CUDA error: an illegal memory access was encountered at 0x7f{:06x}",
                numel
            ),
        })
    } else if call.dtype == "bool" && call.op == "sum" && call.alpha > 1.5 {
        Some(Diagnostic {
            category: None,
            raw_text: format!("AssertionError: result {:.4} differs from reference", call.alpha),
        })
    } else {
        None
    };

    Ok(ExecutionResult { tokens, diagnostic })
}
