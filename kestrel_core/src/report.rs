use crate::corpus::CorpusStats;
use crate::policy::PolicyStats;
use crate::space::SpaceSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Termination {
    Completed,
    ResourceCritical { guard: String, message: String },
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub baseline: u64,
    pub exploration: u64,
    pub corpus: u64,
}

/// Final, JSON-serializable result of a run. Produced even when the run stops early.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub target_id: String,
    pub strategy: String,
    pub total_tokens: usize,
    pub coverage_space_percentage: f64,
    pub unique_bugs_by_category: BTreeMap<String, usize>,
    pub corpus_size: usize,
    pub iterations_run: u64,
    pub start_iteration: u64,
    pub termination: Termination,
    pub valid_executions: u64,
    pub invalid_executions: u64,
    pub filtered_candidates: u64,
    pub sources: SourceCounts,
    pub expansions: u64,
    /// Throughput checks that fell below the slow-speed threshold.
    pub slow_warnings: u64,
    pub signature_overflow: u64,
    pub policy: PolicyStats,
    pub corpus: CorpusStats,
    pub space: SpaceSnapshot,
    pub uncovered_sample: Vec<BTreeMap<String, String>>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn total_unique_bugs(&self) -> usize {
        self.unique_bugs_by_category.values().sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Renders a summary as a plain-text report.
pub fn format_report(summary: &RunSummary) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "=== Kestrel Run Report ===");
    let _ = writeln!(out, "Target: {}", summary.target_id);
    let _ = writeln!(out, "Strategy: {}", summary.strategy);
    let termination = match &summary.termination {
        Termination::Completed => "completed".to_string(),
        Termination::ResourceCritical { guard, message } => {
            format!("stopped by resource guard '{guard}': {message}")
        }
        Termination::Cancelled => "cancelled".to_string(),
    };
    let _ = writeln!(out, "Termination: {termination}");
    let _ = writeln!(
        out,
        "Iterations: {} (started at {}, {:.1}s)",
        summary.iterations_run, summary.start_iteration, summary.elapsed_secs
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "--- Coverage ---");
    let _ = writeln!(out, "Tokens: {}", summary.total_tokens);
    let _ = writeln!(
        out,
        "Coverage space: {:.2}%",
        summary.coverage_space_percentage
    );
    for (target, cov) in &summary.space.targets {
        let _ = writeln!(
            out,
            "  {}: {}/{} ({:.2}%)",
            target, cov.numerator, cov.denominator, cov.percentage
        );
        if cov.sentinel_hits > 0 {
            let _ = writeln!(
                out,
                "    includes {} combinations with other/unknown values",
                cov.sentinel_hits
            );
        }
    }
    if summary.space.overflow > 0 {
        let _ = writeln!(
            out,
            "  hit cap reached: {} combinations not stored",
            summary.space.overflow
        );
    }
    if !summary.uncovered_sample.is_empty() {
        let _ = writeln!(out, "  uncovered examples:");
        for combo in &summary.uncovered_sample {
            let pairs: Vec<String> = combo.iter().map(|(k, v)| format!("{k}={v}")).collect();
            let _ = writeln!(out, "    {}", pairs.join(", "));
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "--- Search ---");
    let _ = writeln!(
        out,
        "Sources: baseline={} exploration={} corpus={}",
        summary.sources.baseline, summary.sources.exploration, summary.sources.corpus
    );
    let _ = writeln!(
        out,
        "Policy: explore/exploit {}/{} ({:.1}% explore), expansions {}",
        summary.policy.exploration_count,
        summary.policy.exploitation_count,
        summary.policy.exploration_fraction * 100.0,
        summary.expansions
    );
    let _ = writeln!(
        out,
        "Executions: valid={} invalid={} filtered={}",
        summary.valid_executions, summary.invalid_executions, summary.filtered_candidates
    );
    if summary.slow_warnings > 0 {
        let _ = writeln!(out, "Slow-speed warnings: {}", summary.slow_warnings);
    }
    let _ = writeln!(
        out,
        "Corpus: {}/{} seeds (admitted {}, evicted {}, mean score {:.2})",
        summary.corpus.size,
        summary.corpus.max_size,
        summary.corpus.admitted,
        summary.corpus.evicted,
        summary.corpus.mean_score
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "--- Bugs ---");
    let _ = writeln!(out, "Unique signatures: {}", summary.total_unique_bugs());
    for (category, count) in &summary.unique_bugs_by_category {
        let _ = writeln!(out, "  {category}: {count}");
    }
    if summary.signature_overflow > 0 {
        let _ = writeln!(
            out,
            "  (approximate: {} signatures over capacity)",
            summary.signature_overflow
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::TargetCoverage;

    fn summary() -> RunSummary {
        let mut bugs = BTreeMap::new();
        bugs.insert("fatal".to_string(), 1);
        bugs.insert("shallow".to_string(), 3);
        let mut combo = BTreeMap::new();
        combo.insert("dtype".to_string(), "f16".to_string());
        RunSummary {
            target_id: "torch.add".to_string(),
            strategy: "hybrid".to_string(),
            total_tokens: 42,
            coverage_space_percentage: 12.5,
            unique_bugs_by_category: bugs,
            corpus_size: 7,
            iterations_run: 1000,
            start_iteration: 0,
            termination: Termination::ResourceCritical {
                guard: "disk".to_string(),
                message: "full".to_string(),
            },
            valid_executions: 990,
            invalid_executions: 10,
            filtered_candidates: 0,
            sources: SourceCounts::default(),
            expansions: 2,
            slow_warnings: 3,
            signature_overflow: 0,
            policy: PolicyStats::default(),
            corpus: CorpusStats::default(),
            space: SpaceSnapshot {
                targets: [(
                    "torch.add".to_string(),
                    TargetCoverage {
                        numerator: 1,
                        denominator: 8,
                        percentage: 12.5,
                        sentinel_hits: 1,
                    },
                )]
                .into_iter()
                .collect(),
                overall_percentage: 12.5,
                stored_hits: 1,
                sentinel_hits: 1,
                overflow: 0,
                record_calls: 990,
            },
            uncovered_sample: vec![combo],
            elapsed_secs: 1.5,
        }
    }

    #[test]
    fn report_contains_key_figures() {
        let report = format_report(&summary());
        assert!(report.contains("=== Kestrel Run Report ==="));
        assert!(report.contains("Tokens: 42"));
        assert!(report.contains("Coverage space: 12.50%"));
        assert!(report.contains("Unique signatures: 4"));
        assert!(report.contains("resource guard 'disk'"));
        assert!(report.contains("dtype=f16"));
        assert!(report.contains("torch.add: 1/8 (12.50%)"));
        assert!(report.contains("includes 1 combinations with other/unknown values"));
        assert!(report.contains("Slow-speed warnings: 3"));
    }

    #[test]
    fn summary_serializes_required_fields() {
        let json: serde_json::Value = serde_json::from_str(&summary().to_json().unwrap()).unwrap();
        for key in [
            "total_tokens",
            "coverage_space_percentage",
            "unique_bugs_by_category",
            "corpus_size",
            "iterations_run",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["termination"]["kind"], "resource-critical");
        assert_eq!(json["unique_bugs_by_category"]["shallow"], 3);
        assert_eq!(json["slow_warnings"], 3);
        assert_eq!(json["space"]["sentinel_hits"], 1);
    }
}
