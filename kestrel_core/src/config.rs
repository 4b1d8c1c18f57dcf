use crate::corpus::{DEFAULT_CORPUS_MAX_SIZE, SelectionMode};
use crate::guard::{DEFAULT_SLOW_THRESHOLD, DEFAULT_THROUGHPUT_WINDOW};
use crate::policy::PolicyConfig;
use crate::saturation::{DEFAULT_CHECK_INTERVAL, DEFAULT_PATIENCE};
use crate::scheduler::DEFAULT_CORPUS_PROBABILITY;
use crate::signature::SignatureConfig;
use crate::space::{DEFAULT_MAX_HITS, DimensionAxis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Unknown preset '{0}' (expected hybrid, warmup-evolve or corpus-heavy)")]
    UnknownPreset(String),
}

/// Named configurations of the single policy/orchestrator pair.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// Epsilon-greedy with saturation-driven expansion, uniform parent selection.
    #[default]
    Hybrid,
    /// 10% warm-up, then epsilon-greedy with score-weighted parents; no expansion.
    WarmupEvolve,
    /// No exploration and a fixed, high corpus probability.
    CorpusHeavy,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Hybrid, Preset::WarmupEvolve, Preset::CorpusHeavy];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Hybrid => "hybrid",
            Preset::WarmupEvolve => "warmup-evolve",
            Preset::CorpusHeavy => "corpus-heavy",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| ConfigError::UnknownPreset(s.to_string()))
    }
}

pub fn default_iterations() -> u64 {
    10_000
}
pub fn default_checkpoint_interval() -> u64 {
    100
}
pub fn default_bug_scan_interval() -> u64 {
    50
}

/// Everything the orchestrator needs for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub target_id: String,
    pub strategy: String,
    pub seed: u64,
    pub max_iterations: u64,
    pub checkpoint_interval: u64,
    pub bug_scan_interval: u64,
    pub warmup_ratio: f64,
    pub corpus_enabled: bool,
    pub corpus_max_size: usize,
    pub corpus_probability: f64,
    pub selection_mode: SelectionMode,
    pub saturation_enabled: bool,
    pub saturation_patience: u64,
    pub saturation_check_interval: u64,
    pub policy: PolicyConfig,
    pub max_hits: usize,
    pub axes: Vec<DimensionAxis>,
    pub signatures: SignatureConfig,
    pub checkpoint_dir: Option<PathBuf>,
    pub resume: bool,
    pub trace_path: Option<PathBuf>,
    pub throughput_window: usize,
    pub slow_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_preset(Preset::Hybrid)
    }
}

impl EngineConfig {
    pub fn from_preset(preset: Preset) -> Self {
        let mut config = Self {
            target_id: "default".to_string(),
            strategy: preset.name().to_string(),
            seed: 0,
            max_iterations: default_iterations(),
            checkpoint_interval: default_checkpoint_interval(),
            bug_scan_interval: default_bug_scan_interval(),
            warmup_ratio: 0.0,
            corpus_enabled: true,
            corpus_max_size: DEFAULT_CORPUS_MAX_SIZE,
            corpus_probability: DEFAULT_CORPUS_PROBABILITY,
            selection_mode: SelectionMode::Uniform,
            saturation_enabled: true,
            saturation_patience: DEFAULT_PATIENCE,
            saturation_check_interval: DEFAULT_CHECK_INTERVAL,
            policy: PolicyConfig::default(),
            max_hits: DEFAULT_MAX_HITS,
            axes: Vec::new(),
            signatures: SignatureConfig::default(),
            checkpoint_dir: None,
            resume: true,
            trace_path: None,
            throughput_window: DEFAULT_THROUGHPUT_WINDOW,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        };
        match preset {
            Preset::Hybrid => {}
            Preset::WarmupEvolve => {
                config.warmup_ratio = 0.1;
                config.selection_mode = SelectionMode::ScoreWeighted;
                config.saturation_enabled = false;
                config.policy.expansion_enabled = false;
            }
            Preset::CorpusHeavy => {
                config.corpus_probability = 0.8;
                config.saturation_enabled = false;
                config.policy.exploration_enabled = false;
                config.policy.expansion_enabled = false;
            }
        }
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        let positive = |name: &str, v: u64| {
            if v > 0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be greater than 0")))
            }
        };
        if self.target_id.is_empty() {
            return Err(ConfigError::Invalid("target-id must not be empty".to_string()));
        }
        unit("warmup-ratio", self.warmup_ratio)?;
        unit("corpus probability", self.corpus_probability)?;
        unit("base-epsilon", self.policy.base_epsilon)?;
        unit("expansion-epsilon", self.policy.expansion_epsilon)?;
        positive("checkpoint-interval", self.checkpoint_interval)?;
        positive("bug-scan-interval", self.bug_scan_interval)?;
        positive("saturation check-interval", self.saturation_check_interval)?;
        positive("corpus max-size", self.corpus_max_size as u64)?;
        if self.throughput_window < 2 {
            return Err(ConfigError::Invalid(
                "throughput window must be at least 2".to_string(),
            ));
        }
        if self.slow_threshold.is_nan() || self.slow_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "throughput slow-threshold must be non-negative, got {}",
                self.slow_threshold
            )));
        }
        positive("signatures max-signatures", self.signatures.max_signatures as u64)?;
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    pub target_id: Option<String>,
    pub strategy: Option<String>,
    pub seed: Option<u64>,
    pub max_iterations: Option<u64>,
    pub checkpoint_interval: Option<u64>,
    pub bug_scan_interval: Option<u64>,
    pub warmup_ratio: Option<f64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSection {
    pub enabled: Option<bool>,
    pub max_size: Option<usize>,
    pub probability: Option<f64>,
    pub selection: Option<SelectionMode>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SaturationSection {
    pub enabled: Option<bool>,
    pub patience: Option<u64>,
    pub check_interval: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PolicySection {
    pub exploration_enabled: Option<bool>,
    pub expansion_enabled: Option<bool>,
    pub base_epsilon: Option<f64>,
    pub expansion_epsilon: Option<f64>,
    pub surgical_range: Option<u32>,
    pub exploration_range: Option<u32>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AxisSettings {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SpaceSection {
    pub max_hits: Option<usize>,
    #[serde(default)]
    pub axes: Vec<AxisSettings>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SignatureSection {
    pub max_signatures: Option<usize>,
    pub max_signature_len: Option<usize>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CheckpointSection {
    pub dir: Option<PathBuf>,
    pub resume: Option<bool>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TraceSection {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ThroughputSection {
    pub window: Option<usize>,
    pub slow_threshold: Option<f64>,
}

/// On-disk configuration. Every key is optional; unset keys come from the preset.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct KestrelConfig {
    #[serde(default)]
    pub preset: Preset,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub corpus: CorpusSection,
    #[serde(default)]
    pub saturation: SaturationSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub space: SpaceSection,
    #[serde(default)]
    pub signatures: SignatureSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub trace: TraceSection,
    #[serde(default)]
    pub throughput: ThroughputSection,
}

fn overlay<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

impl KestrelConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Starts from the preset and applies every key that was set, then validates.
    pub fn to_engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let mut config = EngineConfig::from_preset(self.preset);

        let engine = self.engine.clone();
        overlay(&mut config.target_id, engine.target_id);
        overlay(&mut config.strategy, engine.strategy);
        overlay(&mut config.seed, engine.seed);
        overlay(&mut config.max_iterations, engine.max_iterations);
        overlay(&mut config.checkpoint_interval, engine.checkpoint_interval);
        overlay(&mut config.bug_scan_interval, engine.bug_scan_interval);
        overlay(&mut config.warmup_ratio, engine.warmup_ratio);

        overlay(&mut config.corpus_enabled, self.corpus.enabled);
        overlay(&mut config.corpus_max_size, self.corpus.max_size);
        overlay(&mut config.corpus_probability, self.corpus.probability);
        overlay(&mut config.selection_mode, self.corpus.selection);

        overlay(&mut config.saturation_enabled, self.saturation.enabled);
        overlay(&mut config.saturation_patience, self.saturation.patience);
        overlay(&mut config.saturation_check_interval, self.saturation.check_interval);

        let policy = &self.policy;
        overlay(&mut config.policy.exploration_enabled, policy.exploration_enabled);
        overlay(&mut config.policy.expansion_enabled, policy.expansion_enabled);
        overlay(&mut config.policy.base_epsilon, policy.base_epsilon);
        overlay(&mut config.policy.expansion_epsilon, policy.expansion_epsilon);
        overlay(&mut config.policy.surgical_range, policy.surgical_range);
        overlay(&mut config.policy.exploration_range, policy.exploration_range);

        overlay(&mut config.max_hits, self.space.max_hits);
        config.axes = self
            .space
            .axes
            .iter()
            .map(|a| DimensionAxis::new(a.name.clone(), a.values.clone()))
            .collect();

        overlay(&mut config.signatures.max_signatures, self.signatures.max_signatures);
        overlay(&mut config.signatures.max_signature_len, self.signatures.max_signature_len);

        config.checkpoint_dir = self.checkpoint.dir.clone();
        overlay(&mut config.resume, self.checkpoint.resume);
        config.trace_path = self.trace.path.clone();
        overlay(&mut config.throughput_window, self.throughput.window);
        overlay(&mut config.slow_threshold, self.throughput.slow_threshold);

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_yields_hybrid_defaults() {
        let config: KestrelConfig = toml::from_str("").unwrap();
        let engine = config.to_engine_config().unwrap();
        assert_eq!(engine, EngineConfig::default());
        assert_eq!(engine.strategy, "hybrid");
        assert_eq!(engine.max_iterations, 10_000);
        assert_eq!(engine.checkpoint_interval, 100);
        assert_eq!(engine.bug_scan_interval, 50);
        assert_eq!(engine.corpus_max_size, 100);
        assert_eq!(engine.saturation_patience, 500);
        assert_eq!(engine.saturation_check_interval, 100);
    }

    #[test]
    fn presets_differ_only_in_policy_knobs() {
        let warmup = EngineConfig::from_preset(Preset::WarmupEvolve);
        assert_eq!(warmup.warmup_ratio, 0.1);
        assert_eq!(warmup.selection_mode, SelectionMode::ScoreWeighted);
        assert!(!warmup.saturation_enabled);

        let heavy = EngineConfig::from_preset(Preset::CorpusHeavy);
        assert_eq!(heavy.corpus_probability, 0.8);
        assert!(!heavy.policy.exploration_enabled);
        assert_eq!(heavy.max_iterations, warmup.max_iterations);

        assert_eq!("corpus-heavy".parse::<Preset>().unwrap(), Preset::CorpusHeavy);
        assert!("greedy".parse::<Preset>().is_err());
    }

    #[test]
    fn explicit_keys_override_the_preset() {
        let toml_text = r#"
preset = "warmup-evolve"

[engine]
target-id = "torch.add"
max-iterations = 500
warmup-ratio = 0.2

[corpus]
selection = "uniform"
max-size = 7

[saturation]
enabled = true

[[space.axes]]
name = "dtype"
values = ["float32", "int64"]

[[space.axes]]
name = "device"
values = ["cpu", "cuda"]
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_text.as_bytes()).unwrap();
        let config = KestrelConfig::load_from_file(file.path()).unwrap();
        let engine = config.to_engine_config().unwrap();

        assert_eq!(engine.strategy, "warmup-evolve");
        assert_eq!(engine.target_id, "torch.add");
        assert_eq!(engine.max_iterations, 500);
        assert_eq!(engine.warmup_ratio, 0.2);
        assert_eq!(engine.selection_mode, SelectionMode::Uniform);
        assert_eq!(engine.corpus_max_size, 7);
        assert!(engine.saturation_enabled);
        assert!(!engine.policy.expansion_enabled, "untouched preset value");
        assert_eq!(engine.axes.len(), 2);
        assert_eq!(engine.axes[1].name, "device");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<KestrelConfig, _> = toml::from_str("[engine]\nthreads = 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let config: KestrelConfig = toml::from_str("[engine]\nwarmup-ratio = 1.5\n").unwrap();
        assert!(matches!(config.to_engine_config(), Err(ConfigError::Invalid(_))));

        let config: KestrelConfig = toml::from_str("[corpus]\nmax-size = 0\n").unwrap();
        assert!(config.to_engine_config().is_err());
    }

    #[test]
    fn throughput_section_is_validated() {
        let config: KestrelConfig =
            toml::from_str("[throughput]\nwindow = 20\nslow-threshold = 2.0\n").unwrap();
        let engine = config.to_engine_config().unwrap();
        assert_eq!(engine.throughput_window, 20);
        assert_eq!(engine.slow_threshold, 2.0);
        assert_eq!(EngineConfig::default().throughput_window, 100);
        assert_eq!(EngineConfig::default().slow_threshold, 0.5);

        let config: KestrelConfig = toml::from_str("[throughput]\nwindow = 1\n").unwrap();
        assert!(matches!(config.to_engine_config(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = KestrelConfig::load_from_file(Path::new("/nonexistent/kestrel.toml")).unwrap_err();
        assert!(err.to_string().contains("kestrel.toml"));
    }
}
