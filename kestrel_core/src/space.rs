//! Combinatorial coverage accounting.
//!
//! A target registers a set of named axes, each with a finite domain. The theoretical
//! space is the cartesian product of those domains; the model records which tuples were
//! actually observed and reports the observed fraction. The product is never
//! materialized: its size is kept as a saturating `u128`, and uncovered tuples are
//! enumerated lazily.
//!
//! Observations are deliberately forgiving. A value outside an axis domain is recorded as
//! [`OTHER_VALUE`], an axis the caller did not report is recorded as [`UNKNOWN_VALUE`].
//! Both sentinels are part of every tuple key but not of the registered domain, so they
//! can push distinct keys past the domain product; the numerator is clamped to the
//! denominator when reporting. Hits beyond the global `max_hits` cap are counted as
//! overflow and not stored, which under-reports coverage once the cap is reached.

use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;

pub const OTHER_VALUE: &str = "other";
pub const UNKNOWN_VALUE: &str = "unknown";
pub const DEFAULT_MAX_HITS: usize = 1_000_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SpaceError {
    #[error("Target '{0}' registered without any axes")]
    NoAxes(String),
    #[error("Axis '{axis}' of target '{target}' has an empty domain")]
    EmptyDomain { target: String, axis: String },
    #[error("Axis '{axis}' registered twice for target '{target}'")]
    DuplicateAxis { target: String, axis: String },
    #[error("Target '{0}' is not registered")]
    UnknownTarget(String),
}

/// A named, finite-domain property of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct DimensionAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl DimensionAxis {
    pub fn new<S: Into<String>>(name: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug)]
struct TargetSpace {
    axes: Vec<DimensionAxis>,
    domains: Vec<BTreeSet<String>>,
    denominator: u128,
    hits: HashSet<[u8; 16]>,
    sentinel_hits: usize,
}

impl TargetSpace {
    /// Canonical `axis=value` pairs, ordered by axis name.
    fn state_tuple(&self, observed: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut tuple: Vec<(String, String)> = self
            .axes
            .iter()
            .zip(&self.domains)
            .map(|(axis, domain)| {
                let value = match observed.get(&axis.name) {
                    Some(raw) if domain.contains(raw) => raw.clone(),
                    Some(_) => OTHER_VALUE.to_string(),
                    None => UNKNOWN_VALUE.to_string(),
                };
                (axis.name.clone(), value)
            })
            .collect();
        tuple.sort();
        tuple
    }

    fn is_sentinel(tuple: &[(String, String)]) -> bool {
        tuple
            .iter()
            .any(|(_, value)| value == OTHER_VALUE || value == UNKNOWN_VALUE)
    }

    fn numerator(&self) -> u128 {
        (self.hits.len() as u128).min(self.denominator)
    }
}

fn tuple_key(tuple: &[(String, String)]) -> [u8; 16] {
    let mut canonical = String::new();
    for (i, (axis, value)) in tuple.iter().enumerate() {
        if i > 0 {
            canonical.push('|');
        }
        canonical.push_str(axis);
        canonical.push('=');
        canonical.push_str(value);
    }
    md5::compute(canonical.as_bytes()).0
}

/// Per-target coverage figures for summaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetCoverage {
    pub numerator: u128,
    pub denominator: u128,
    pub percentage: f64,
    /// Stored combinations holding a sentinel value. They are part of `numerator`.
    pub sentinel_hits: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpaceSnapshot {
    pub targets: BTreeMap<String, TargetCoverage>,
    pub overall_percentage: f64,
    pub stored_hits: usize,
    pub sentinel_hits: usize,
    pub overflow: u64,
    pub record_calls: u64,
}

#[derive(Debug)]
pub struct CoverageSpaceModel {
    targets: BTreeMap<String, TargetSpace>,
    max_hits: usize,
    stored_hits: usize,
    overflow: u64,
    record_calls: u64,
}

impl Default for CoverageSpaceModel {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HITS)
    }
}

impl CoverageSpaceModel {
    pub fn new(max_hits: usize) -> Self {
        Self {
            targets: BTreeMap::new(),
            max_hits,
            stored_hits: 0,
            overflow: 0,
            record_calls: 0,
        }
    }

    /// Registers (or re-registers) a target and returns its denominator.
    pub fn register(&mut self, target_id: &str, axes: Vec<DimensionAxis>) -> Result<u128, SpaceError> {
        if axes.is_empty() {
            return Err(SpaceError::NoAxes(target_id.to_string()));
        }
        let mut seen = BTreeSet::new();
        let mut domains = Vec::with_capacity(axes.len());
        let mut denominator: u128 = 1;
        for axis in &axes {
            if !seen.insert(axis.name.as_str()) {
                return Err(SpaceError::DuplicateAxis {
                    target: target_id.to_string(),
                    axis: axis.name.clone(),
                });
            }
            let domain: BTreeSet<String> = axis.values.iter().cloned().collect();
            if domain.is_empty() {
                return Err(SpaceError::EmptyDomain {
                    target: target_id.to_string(),
                    axis: axis.name.clone(),
                });
            }
            denominator = denominator.saturating_mul(domain.len() as u128);
            domains.push(domain);
        }

        if let Some(previous) = self.targets.remove(target_id) {
            self.stored_hits -= previous.hits.len();
        }
        debug!(
            "registered coverage space for '{}': {} axes, {} combinations",
            target_id,
            axes.len(),
            denominator
        );
        self.targets.insert(
            target_id.to_string(),
            TargetSpace {
                axes,
                domains,
                denominator,
                hits: HashSet::new(),
                sentinel_hits: 0,
            },
        );
        Ok(denominator)
    }

    pub fn is_registered(&self, target_id: &str) -> bool {
        self.targets.contains_key(target_id)
    }

    pub fn axes(&self, target_id: &str) -> Option<&[DimensionAxis]> {
        self.targets.get(target_id).map(|t| t.axes.as_slice())
    }

    /// Records one observation. Returns whether it was a previously unseen combination.
    pub fn record_hit(
        &mut self,
        target_id: &str,
        observed: &BTreeMap<String, String>,
    ) -> Result<bool, SpaceError> {
        self.record_calls += 1;
        let space = self
            .targets
            .get_mut(target_id)
            .ok_or_else(|| SpaceError::UnknownTarget(target_id.to_string()))?;

        let tuple = space.state_tuple(observed);
        let key = tuple_key(&tuple);
        if space.hits.contains(&key) {
            return Ok(false);
        }
        if self.stored_hits >= self.max_hits {
            if self.overflow == 0 {
                warn!(
                    "coverage space hit cap of {} reached, further combinations are not stored",
                    self.max_hits
                );
            }
            self.overflow += 1;
            return Ok(false);
        }
        space.hits.insert(key);
        if TargetSpace::is_sentinel(&tuple) {
            space.sentinel_hits += 1;
        }
        self.stored_hits += 1;
        Ok(true)
    }

    /// Observed fraction of the target's space, always within `[0, 1]`.
    pub fn coverage(&self, target_id: &str) -> f64 {
        match self.targets.get(target_id) {
            Some(space) => space.numerator() as f64 / space.denominator as f64,
            None => 0.0,
        }
    }

    /// `(observed, theoretical)` combination counts.
    pub fn counts(&self, target_id: &str) -> Option<(u128, u128)> {
        self.targets
            .get(target_id)
            .map(|space| (space.numerator(), space.denominator))
    }

    /// Sum of numerators over sum of denominators across every registered target.
    pub fn overall_coverage(&self) -> f64 {
        let (num, den) = self.targets.values().fold((0u128, 0u128), |(n, d), space| {
            (n.saturating_add(space.numerator()), d.saturating_add(space.denominator))
        });
        if den == 0 { 0.0 } else { num as f64 / den as f64 }
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    pub fn stored_hits(&self) -> usize {
        self.stored_hits
    }

    /// Stored combinations of `target_id` that contain an `other` or `unknown` value.
    pub fn sentinel_hits(&self, target_id: &str) -> usize {
        self.targets.get(target_id).map_or(0, |space| space.sentinel_hits)
    }

    /// Up to `k` in-domain combinations that have not been observed, in product order.
    pub fn sample_uncovered(&self, target_id: &str, k: usize) -> Vec<BTreeMap<String, String>> {
        let Some(space) = self.targets.get(target_id) else {
            return Vec::new();
        };
        AxisProduct::new(&space.axes)
            .filter(|tuple| {
                let mut sorted = tuple.clone();
                sorted.sort();
                !space.hits.contains(&tuple_key(&sorted))
            })
            .take(k)
            .map(|tuple| tuple.into_iter().collect())
            .collect()
    }

    pub fn snapshot(&self) -> SpaceSnapshot {
        let targets = self
            .targets
            .iter()
            .map(|(id, space)| {
                (
                    id.clone(),
                    TargetCoverage {
                        numerator: space.numerator(),
                        denominator: space.denominator,
                        percentage: self.coverage(id) * 100.0,
                        sentinel_hits: space.sentinel_hits,
                    },
                )
            })
            .collect();
        SpaceSnapshot {
            targets,
            overall_percentage: self.overall_coverage() * 100.0,
            stored_hits: self.stored_hits,
            sentinel_hits: self.targets.values().map(|t| t.sentinel_hits).sum(),
            overflow: self.overflow,
            record_calls: self.record_calls,
        }
    }
}

/// Odometer over the axis domains in registration order.
struct AxisProduct<'a> {
    axes: &'a [DimensionAxis],
    indices: Vec<usize>,
    done: bool,
}

impl<'a> AxisProduct<'a> {
    fn new(axes: &'a [DimensionAxis]) -> Self {
        let done = axes.is_empty() || axes.iter().any(|a| a.values.is_empty());
        Self {
            axes,
            indices: vec![0; axes.len()],
            done,
        }
    }
}

impl Iterator for AxisProduct<'_> {
    type Item = Vec<(String, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self
            .axes
            .iter()
            .zip(&self.indices)
            .map(|(axis, &i)| (axis.name.clone(), axis.values[i].clone()))
            .collect();

        // Advance the last axis fastest.
        let mut position = self.indices.len();
        loop {
            if position == 0 {
                self.done = true;
                break;
            }
            position -= 1;
            self.indices[position] += 1;
            if self.indices[position] < self.axes[position].values.len() {
                break;
            }
            self.indices[position] = 0;
        }
        Some(item)
    }
}
