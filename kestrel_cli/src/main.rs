mod demo;

use demo::{
    DEFAULT_MAX_BYTES, DEFAULT_MAX_ELEMENTS, DEMO_TARGET, TensorCall, TensorCallGenerator,
    TensorCallMutator, TensorSizeFilter, demo_axes, simulate,
};
use kestrel_core::config::{EngineConfig, KestrelConfig, Preset};
use kestrel_core::coverage::CoverageTracker;
use kestrel_core::executor::InProcessExecutor;
use kestrel_core::guard::{DirectorySizeGuard, FreeSpaceGuard};
use kestrel_core::orchestrator::Orchestrator;
use kestrel_core::report::{RunSummary, format_report};
use kestrel_core::scanner::DirectoryBugScanner;

use clap::Parser;
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Artifacts beyond this size under the bug directory stop the run.
const BUG_DIR_BUDGET_BYTES: u64 = 512 * 1024 * 1024;
/// Scratch files an executor may leave under the bug directory.
const CLEANUP_PATTERNS: &[&str] = &["*.tmp", "core"];
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(short, long)]
    target: Option<String>,
    /// hybrid, warmup-evolve or corpus-heavy
    #[clap(short, long)]
    preset: Option<String>,
    #[clap(long)]
    seed: Option<u64>,
    #[clap(long)]
    checkpoint_dir: Option<PathBuf>,
    #[clap(long)]
    trace_file: Option<PathBuf>,
    /// Directory where failure artifacts are collected from.
    #[clap(long)]
    bug_dir: Option<PathBuf>,
    /// Stop when free disk space under the output directory stays below this.
    #[clap(long, default_value_t = 1.0)]
    min_free_gb: f64,
    /// Skip calls whose tensors hold more elements than this.
    #[clap(long, default_value_t = DEFAULT_MAX_ELEMENTS)]
    max_elements: u64,
    #[clap(long)]
    summary_out: Option<PathBuf>,
    /// Run a second, independent strategy and compare coverage.
    #[clap(long)]
    compare_with: Option<String>,
}

#[derive(Serialize)]
struct Comparison<'a> {
    primary: &'a RunSummary,
    secondary: &'a RunSummary,
    exclusive_to_primary: usize,
    exclusive_to_secondary: usize,
    overlap: usize,
}

impl Cli {
    /// Command-line flags win over the config file.
    fn apply_overrides(&self, config: &mut EngineConfig) {
        if let Some(iterations) = self.iterations {
            config.max_iterations = iterations;
        }
        if let Some(target) = &self.target {
            config.target_id = target.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = Some(dir.clone());
        }
        if let Some(path) = &self.trace_file {
            config.trace_path = Some(path.clone());
        }
    }
}

fn load_config(cli: &Cli) -> Result<KestrelConfig, anyhow::Error> {
    let config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            KestrelConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("kestrel.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                KestrelConfig::load_from_file(&default_config_path)?
            } else {
                info!("No config file specified and 'kestrel.toml' not found, using built-in defaults.");
                KestrelConfig::default()
            }
        }
    };
    Ok(config)
}

fn engine_config(cli: &Cli, file_config: &KestrelConfig, preset: Option<Preset>) -> Result<EngineConfig, anyhow::Error> {
    let mut file_config = file_config.clone();
    if let Some(preset) = preset {
        file_config.preset = preset;
    }
    let mut config = file_config.to_engine_config()?;
    cli.apply_overrides(&mut config);
    if config.target_id == "default" {
        config.target_id = DEMO_TARGET.to_string();
    }
    if config.axes.is_empty() {
        config.axes = demo_axes();
    }
    config.validate()?;
    Ok(config)
}

/// Directory whose filesystem the free-space guard watches.
fn output_dir(cli: &Cli, config: &EngineConfig) -> PathBuf {
    cli.bug_dir
        .clone()
        .or_else(|| config.checkpoint_dir.clone())
        .or_else(|| {
            config
                .trace_path
                .as_deref()
                .and_then(Path::parent)
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

fn run_strategy(
    cli: &Cli,
    config: EngineConfig,
    stop_flag: Arc<AtomicBool>,
) -> Result<(RunSummary, CoverageTracker), anyhow::Error> {
    let watched = output_dir(cli, &config);
    let min_free_bytes = (cli.min_free_gb.max(0.0) * BYTES_PER_GB) as u64;
    let mut orchestrator: Orchestrator<TensorCall> = Orchestrator::new(
        config,
        Box::new(TensorCallGenerator),
        Box::new(TensorCallMutator::default()),
        Box::new(InProcessExecutor::new(simulate)),
    )?
    .with_stop_flag(stop_flag)
    .with_outlier_filter(Box::new(TensorSizeFilter {
        max_elements: cli.max_elements,
        max_bytes: DEFAULT_MAX_BYTES,
    }));

    let mut free_space = FreeSpaceGuard::new(&watched, min_free_bytes);
    if cli.bug_dir.is_some() {
        free_space = free_space.with_cleanup(CLEANUP_PATTERNS.iter().copied());
    }
    orchestrator = orchestrator.with_guard(Box::new(free_space));

    if let Some(dir) = &cli.bug_dir {
        orchestrator = orchestrator
            .with_bug_scanner(Box::new(DirectoryBugScanner::new(dir)))
            .with_guard(Box::new(DirectorySizeGuard::new(dir, BUG_DIR_BUDGET_BYTES)));
    }

    let summary = orchestrator.run();
    Ok((summary, orchestrator.tracker().clone()))
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let file_config = load_config(&cli)?;
    let preset = cli.preset.as_deref().map(str::parse::<Preset>).transpose()?;
    let primary_config = engine_config(&cli, &file_config, preset)?;
    info!("Effective configuration: {primary_config:#?}");

    let stop_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop_flag);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("Failed to install Ctrl-C handler: {}", e))?;

    let (primary, primary_tracker) = run_strategy(&cli, primary_config.clone(), Arc::clone(&stop_flag))?;
    println!("{}", format_report(&primary));

    let comparison = match &cli.compare_with {
        Some(other) if !stop_flag.load(Ordering::SeqCst) => {
            let other_preset: Preset = other.parse()?;
            let mut secondary_config = engine_config(&cli, &file_config, Some(other_preset))?;
            if secondary_config.strategy == primary_config.strategy {
                secondary_config.strategy = format!("{}-compare", other_preset.name());
            }
            if let Some(path) = &secondary_config.trace_path {
                secondary_config.trace_path =
                    Some(path.with_extension(format!("{}.jsonl", secondary_config.strategy)));
            }
            let (secondary, secondary_tracker) = run_strategy(&cli, secondary_config, stop_flag)?;
            println!("{}", format_report(&secondary));

            let exclusive_to_primary = primary_tracker.exclusive(&secondary_tracker).len();
            let exclusive_to_secondary = secondary_tracker.exclusive(&primary_tracker).len();
            let overlap = primary_tracker.overlap(&secondary_tracker).len();
            println!("=== Comparison: {} vs {} ===", primary.strategy, secondary.strategy);
            println!("Only {}: {}", primary.strategy, exclusive_to_primary);
            println!("Only {}: {}", secondary.strategy, exclusive_to_secondary);
            println!("Both: {overlap}");
            Some((secondary, exclusive_to_primary, exclusive_to_secondary, overlap))
        }
        Some(_) => {
            warn!("Run was cancelled, skipping comparison run.");
            None
        }
        None => None,
    };

    if let Some(path) = &cli.summary_out {
        let json = match &comparison {
            Some((secondary, exclusive_to_primary, exclusive_to_secondary, overlap)) => {
                serde_json::to_string_pretty(&Comparison {
                    primary: &primary,
                    secondary,
                    exclusive_to_primary: *exclusive_to_primary,
                    exclusive_to_secondary: *exclusive_to_secondary,
                    overlap: *overlap,
                })?
            }
            None => primary.to_json()?,
        };
        std::fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write summary to {:?}: {}", path, e))?;
        info!("Summary written to {path:?}");
    }

    Ok(())
}
