use crate::checkpoint::{CheckpointStore, EngineState};
use crate::config::{ConfigError, EngineConfig};
use crate::corpus::{Corpus, CorpusError};
use crate::coverage::CoverageTracker;
use crate::executor::{Diagnostic, Executor};
use crate::guard::{OutlierFilter, ResourceGuard, ThroughputGuard};
use crate::input::{CandidateGenerator, Input};
use crate::mutator::Mutator;
use crate::policy::MutationPolicy;
use crate::report::{RunSummary, SourceCounts, Termination};
use crate::saturation::SaturationDetector;
use crate::scanner::BugScanner;
use crate::scheduler::{Phase, Source, SourceScheduler, warmup_threshold};
use crate::signature::{BugCategory, BugSignatureIndex, SignatureError};
use crate::space::{CoverageSpaceModel, DimensionAxis, SpaceError};
use crate::trace::{TraceError, TraceLogger, TraceRecord};
use log::{debug, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Number of uncovered combinations listed in the summary.
const UNCOVERED_SAMPLE_SIZE: usize = 5;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Trace(#[from] TraceError),
}

/// Result of one iteration, before bookkeeping.
struct Attempt<I> {
    candidate: Option<I>,
    tokens: BTreeSet<String>,
    valid: bool,
    note: Option<String>,
}

impl<I> Attempt<I> {
    fn failed(candidate: Option<I>, note: String) -> Self {
        Self {
            candidate,
            tokens: BTreeSet::new(),
            valid: false,
            note: Some(note),
        }
    }
}

/// The fuzzing loop.
///
/// Owns every piece of engine state and drives the injected collaborators one
/// iteration at a time. Two orchestrators never share state; comparing strategies
/// means running two of them.
pub struct Orchestrator<I: Input> {
    config: EngineConfig,
    generator: Box<dyn CandidateGenerator<I>>,
    mutator: Box<dyn Mutator<I>>,
    executor: Box<dyn Executor<I>>,
    scanners: Vec<Box<dyn BugScanner>>,
    guards: Vec<Box<dyn ResourceGuard>>,
    throughput: ThroughputGuard,
    outlier_filter: Option<Box<dyn OutlierFilter<I>>>,
    checkpoint_store: Option<CheckpointStore>,
    trace: Option<TraceLogger>,
    stop_flag: Option<Arc<AtomicBool>>,

    rng: ChaCha8Rng,
    tracker: CoverageTracker,
    space: CoverageSpaceModel,
    detector: SaturationDetector,
    policy: MutationPolicy,
    scheduler: SourceScheduler,
    corpus: Corpus<I>,
    signatures: BugSignatureIndex,
    pending_diagnostics: Vec<(u64, Diagnostic)>,

    phase: Phase,
    start_iteration: u64,
    iterations_run: u64,
    logger_iterations: u64,
    valid_executions: u64,
    invalid_executions: u64,
    filtered_candidates: u64,
    sources: SourceCounts,
}

impl<I: Input> Orchestrator<I> {
    pub fn new(
        config: EngineConfig,
        generator: Box<dyn CandidateGenerator<I>>,
        mutator: Box<dyn Mutator<I>>,
        executor: Box<dyn Executor<I>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let mut space = CoverageSpaceModel::new(config.max_hits);
        if !config.axes.is_empty() {
            space.register(&config.target_id, config.axes.clone())?;
        }
        let checkpoint_store = config
            .checkpoint_dir
            .as_ref()
            .map(|dir| CheckpointStore::new(dir, &config.target_id, &config.strategy));

        Ok(Self {
            generator,
            mutator,
            executor,
            scanners: Vec::new(),
            guards: Vec::new(),
            throughput: ThroughputGuard::new(config.throughput_window, config.slow_threshold),
            outlier_filter: None,
            checkpoint_store,
            trace: None,
            stop_flag: None,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            tracker: CoverageTracker::new(format!("{}/{}", config.target_id, config.strategy)),
            space,
            detector: SaturationDetector::new(
                config.saturation_patience,
                config.saturation_check_interval,
            ),
            policy: MutationPolicy::new(config.policy.clone()),
            scheduler: SourceScheduler::new(
                warmup_threshold(config.max_iterations, config.warmup_ratio),
                config.corpus_probability,
                config.corpus_enabled,
            ),
            corpus: Corpus::new(config.corpus_max_size, config.selection_mode)?,
            signatures: BugSignatureIndex::new(config.signatures.clone())?,
            pending_diagnostics: Vec::new(),
            phase: Phase::Init,
            start_iteration: 0,
            iterations_run: 0,
            logger_iterations: 0,
            valid_executions: 0,
            invalid_executions: 0,
            filtered_candidates: 0,
            sources: SourceCounts::default(),
            config,
        })
    }

    pub fn with_bug_scanner(mut self, scanner: Box<dyn BugScanner>) -> Self {
        self.scanners.push(scanner);
        self
    }

    pub fn with_guard(mut self, guard: Box<dyn ResourceGuard>) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn with_outlier_filter(mut self, filter: Box<dyn OutlierFilter<I>>) -> Self {
        self.outlier_filter = Some(filter);
        self
    }

    /// Overrides the store derived from `checkpoint_dir`.
    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Overrides the logger opened from `trace_path`.
    pub fn with_trace_logger(mut self, logger: TraceLogger) -> Self {
        self.trace = Some(logger);
        self
    }

    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(flag);
        self
    }

    /// Registers (or replaces) axes for an additional target in the coverage space.
    pub fn register_axes(&mut self, target_id: &str, axes: Vec<DimensionAxis>) -> Result<u128, SpaceError> {
        self.space.register(target_id, axes)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tracker(&self) -> &CoverageTracker {
        &self.tracker
    }

    pub fn corpus(&self) -> &Corpus<I> {
        &self.corpus
    }

    pub fn policy(&self) -> &MutationPolicy {
        &self.policy
    }

    pub fn space(&self) -> &CoverageSpaceModel {
        &self.space
    }

    pub fn signatures(&self) -> &BugSignatureIndex {
        &self.signatures
    }

    pub fn throughput(&self) -> &ThroughputGuard {
        &self.throughput
    }

    pub fn checkpoint_store(&self) -> Option<&CheckpointStore> {
        self.checkpoint_store.as_ref()
    }

    /// Restores state from the checkpoint, if any. Returns the first iteration to run.
    fn resume(&mut self) -> u64 {
        let Some(store) = self.checkpoint_store.as_ref().filter(|_| self.config.resume) else {
            return 0;
        };
        match store.load::<I>() {
            Ok(Some(state)) => {
                self.phase = Phase::Resume;
                self.tracker = CoverageTracker::restore(
                    self.tracker.name().to_string(),
                    state.coverage_tokens,
                    state.iteration,
                );
                self.corpus.restore(state.corpus_seeds);
                self.logger_iterations = state.logger_iterations;
                self.detector.resume_from(self.tracker.total(), state.iteration);
                // A resumed run should not replay the random stream of the first one.
                self.rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(state.iteration + 1));
                info!(
                    "resuming {} from iteration {} with {} tokens and {} seeds",
                    self.config.target_id,
                    state.iteration + 1,
                    self.tracker.total(),
                    self.corpus.len()
                );
                state.iteration + 1
            }
            Ok(None) => 0,
            Err(e) => {
                warn!("could not load checkpoint, starting fresh: {e}");
                0
            }
        }
    }

    fn open_trace(&mut self, resumed: bool) {
        if self.trace.is_none() {
            if let Some(path) = self.config.trace_path.clone() {
                match TraceLogger::create(&path, resumed) {
                    Ok(logger) => self.trace = Some(logger),
                    Err(e) => warn!("tracing disabled: {e}"),
                }
            }
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.resume_count(self.logger_iterations);
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn obtain_candidate(&mut self, source: Source) -> Result<I, anyhow::Error> {
        if source == Source::Corpus {
            if let Some(parent) = self.corpus.select_parent(&mut self.rng) {
                return Ok(parent);
            }
        }
        self.generator.generate(&self.config.target_id, &mut self.rng)
    }

    fn attempt(&mut self, iteration: u64, source: Source) -> Attempt<I> {
        let candidate = match self.obtain_candidate(source) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("iteration {iteration}: candidate generation failed: {e}");
                return Attempt::failed(None, format!("generation failed: {e}"));
            }
        };

        let range = self.policy.current_range();
        let candidate = match self.mutator.mutate(candidate.clone(), range, &mut self.rng) {
            Ok(mutated) => mutated,
            Err(e) => {
                warn!("iteration {iteration}: mutation failed, running the unmutated candidate: {e}");
                candidate
            }
        };

        if let Some(filter) = self.outlier_filter.as_mut() {
            if let Some(reason) = filter.check(&candidate) {
                debug!("iteration {iteration}: candidate rejected: {reason}");
                self.filtered_candidates += 1;
                return Attempt::failed(Some(candidate), format!("filtered: {reason}"));
            }
        }

        match self.executor.execute(&candidate) {
            Ok(result) => {
                // A crash or an execution that reports nothing is not a valid run; its
                // diagnostic still reaches the signature index.
                let valid = !result.tokens.is_empty();
                let note = match (&result.diagnostic, valid) {
                    (_, true) => None,
                    (Some(diagnostic), false) if diagnostic.category == Some(BugCategory::Fatal) => {
                        Some("execution crashed".to_string())
                    }
                    (_, false) => Some("execution produced no tokens".to_string()),
                };
                if let Some(diagnostic) = result.diagnostic {
                    self.pending_diagnostics.push((iteration, diagnostic));
                }
                Attempt {
                    candidate: Some(candidate),
                    tokens: result.tokens,
                    valid,
                    note,
                }
            }
            Err(e) => {
                debug!("iteration {iteration}: execution failed: {e}");
                Attempt::failed(Some(candidate), format!("execution failed: {e}"))
            }
        }
    }

    fn step(&mut self, iteration: u64) {
        self.phase = self.scheduler.phase(iteration);
        let source = self
            .scheduler
            .next_source(iteration, &mut self.policy, self.corpus.len(), &mut self.rng);
        match source {
            Source::Baseline => self.sources.baseline += 1,
            Source::Exploration => self.sources.exploration += 1,
            Source::Corpus => self.sources.corpus += 1,
        }

        let attempt = self.attempt(iteration, source);
        if attempt.valid {
            self.valid_executions += 1;
        } else {
            self.invalid_executions += 1;
        }

        let new_count = self.tracker.update(&attempt.tokens, iteration);

        if attempt.valid && self.space.is_registered(&self.config.target_id) {
            if let Some(candidate) = attempt.candidate.as_ref() {
                if let Err(e) = self
                    .space
                    .record_hit(&self.config.target_id, &candidate.dimension_values())
                {
                    warn!("coverage space: {e}");
                }
            }
        }

        if self.config.saturation_enabled {
            let signal = self.detector.update(self.tracker.total(), iteration);
            if signal.should_expand {
                self.policy.enter_expansion();
            }
        }
        if new_count > 0 && self.policy.is_expanding() {
            self.policy.exit_expansion();
        }

        if new_count > 0 {
            if let Some(candidate) = attempt.candidate.as_ref() {
                if let Err(e) = self.corpus.add_seed(candidate, new_count) {
                    warn!("corpus: {e}");
                }
            }
        }

        self.logger_iterations += 1;
        if let Some(trace) = self.trace.as_mut() {
            let record = TraceRecord {
                iteration,
                strategy: self.config.strategy.clone(),
                source,
                valid: attempt.valid,
                new_tokens: new_count,
                total_tokens: self.tracker.total(),
                coverage_space_percentage: self.space.coverage(&self.config.target_id) * 100.0,
                unique_bugs: self.signatures.total_unique(),
                candidate: attempt
                    .candidate
                    .as_ref()
                    .map(|c| c.describe())
                    .unwrap_or_default(),
                note: attempt.note,
            };
            if let Err(e) = trace.log(&record) {
                warn!("trace write failed, tracing disabled for the rest of the run: {e}");
                self.trace = None;
            }
        }
    }

    /// Feeds scanner output and buffered executor diagnostics into the signature index.
    fn drain_bugs(&mut self, iteration: u64) {
        let mut raw_reports = Vec::new();
        for scanner in self.scanners.iter_mut() {
            match scanner.scan() {
                Ok(reports) => raw_reports.extend(reports),
                Err(e) => warn!("bug scan failed: {e}"),
            }
        }
        for raw in raw_reports {
            let outcome = self.signatures.record_classified(&raw, iteration);
            if outcome.is_new {
                info!(
                    "new {} bug at iteration {}: {}",
                    outcome.signature.category, iteration, outcome.signature.text
                );
            }
        }

        for (seen_at, diagnostic) in std::mem::take(&mut self.pending_diagnostics) {
            let outcome = match diagnostic.category {
                Some(category) => self.signatures.record(category, &diagnostic.raw_text, seen_at),
                None => self.signatures.record_classified(&diagnostic.raw_text, seen_at),
            };
            if outcome.is_new {
                info!(
                    "new {} bug at iteration {}: {}",
                    outcome.signature.category, seen_at, outcome.signature.text
                );
            }
        }
    }

    fn engine_state(&self, iteration: u64) -> EngineState<I> {
        EngineState {
            iteration,
            coverage_tokens: self.tracker.token_set(),
            corpus_seeds: self.corpus.to_seeds(),
            logger_iterations: self.logger_iterations,
            strategy: self.config.strategy.clone(),
            target_id: self.config.target_id.clone(),
        }
    }

    fn save_checkpoint(&mut self, iteration: u64) {
        if let Some(trace) = self.trace.as_mut() {
            if let Err(e) = trace.flush() {
                warn!("trace flush failed: {e}");
            }
        }
        let Some(store) = self.checkpoint_store.as_ref() else {
            return;
        };
        if let Err(e) = store.save(&self.engine_state(iteration)) {
            warn!("checkpoint save failed at iteration {iteration}: {e}");
        }
    }

    fn check_guards(&mut self) -> Option<Termination> {
        let status = self.throughput.check();
        debug!("resource guard 'throughput': {}", status.message);
        for guard in self.guards.iter_mut() {
            let status = guard.check();
            if status.critical {
                warn!("resource guard '{}' is critical: {}", guard.name(), status.message);
                return Some(Termination::ResourceCritical {
                    guard: guard.name().to_string(),
                    message: status.message,
                });
            }
            debug!("resource guard '{}': {}", guard.name(), status.message);
        }
        None
    }

    fn log_progress(&self, iteration: u64) {
        let remaining = self.config.max_iterations.saturating_sub(iteration + 1);
        let eta = self
            .throughput
            .eta(remaining)
            .map_or_else(|| "unknown".to_string(), |d| format!("{:.0}s", d.as_secs_f64()));
        info!(
            "[{}/{}] {}/{} tokens={} corpus={} bugs={} space={:.2}% {} {} eta {}",
            self.config.target_id,
            self.config.strategy,
            iteration + 1,
            self.config.max_iterations,
            self.tracker.total(),
            self.corpus.len(),
            self.signatures.total_unique(),
            self.space.coverage(&self.config.target_id) * 100.0,
            self.policy.status_line(),
            self.throughput.status_line(),
            eta
        );
    }

    /// Runs until `max_iterations`, a critical resource guard, or the stop flag.
    pub fn run(&mut self) -> RunSummary {
        let started = Instant::now();
        self.phase = Phase::Init;
        self.start_iteration = self.resume();
        self.open_trace(self.start_iteration > 0);

        info!(
            "starting {} with strategy {}: iterations {} -> {}, warm-up until {}",
            self.config.target_id,
            self.config.strategy,
            self.start_iteration,
            self.config.max_iterations,
            self.scheduler.warmup_threshold()
        );

        let mut termination = Termination::Completed;
        let mut last_completed: Option<u64> = self.start_iteration.checked_sub(1);
        self.throughput.start();

        for iteration in self.start_iteration..self.config.max_iterations {
            if self.stop_requested() {
                info!("stop requested before iteration {iteration}");
                termination = Termination::Cancelled;
                break;
            }

            self.step(iteration);
            self.throughput.tick();
            self.iterations_run += 1;
            last_completed = Some(iteration);

            if (iteration + 1) % self.config.bug_scan_interval == 0 {
                self.drain_bugs(iteration);
            }
            if (iteration + 1) % self.config.checkpoint_interval == 0 {
                self.save_checkpoint(iteration);
                self.log_progress(iteration);
                if let Some(critical) = self.check_guards() {
                    termination = critical;
                    break;
                }
            }
        }

        let final_iteration = last_completed.unwrap_or(0);
        self.drain_bugs(final_iteration);

        match termination {
            Termination::Completed => {
                if let Some(store) = self.checkpoint_store.as_ref() {
                    if let Err(e) = store.clear() {
                        warn!("could not clear checkpoint: {e}");
                    }
                }
            }
            _ => {
                if let Some(iteration) = last_completed {
                    self.save_checkpoint(iteration);
                }
            }
        }
        if let Some(trace) = self.trace.as_mut() {
            if let Err(e) = trace.flush() {
                warn!("trace flush failed: {e}");
            }
        }
        self.phase = Phase::Done;

        let summary = self.summary(termination, started);
        info!(
            "finished {} ({}): {} iterations, {} tokens, {} unique bugs",
            self.config.target_id,
            self.config.strategy,
            summary.iterations_run,
            summary.total_tokens,
            summary.total_unique_bugs()
        );
        summary
    }

    fn summary(&self, termination: Termination, started: Instant) -> RunSummary {
        let signature_overflow = BugCategory::ALL
            .iter()
            .map(|c| self.signatures.bucket_stats(*c).overflow)
            .sum();
        RunSummary {
            target_id: self.config.target_id.clone(),
            strategy: self.config.strategy.clone(),
            total_tokens: self.tracker.total(),
            coverage_space_percentage: self.space.coverage(&self.config.target_id) * 100.0,
            unique_bugs_by_category: self.signatures.unique_by_category(),
            corpus_size: self.corpus.len(),
            iterations_run: self.iterations_run,
            start_iteration: self.start_iteration,
            termination,
            valid_executions: self.valid_executions,
            invalid_executions: self.invalid_executions,
            filtered_candidates: self.filtered_candidates,
            sources: self.sources,
            expansions: self.detector.expansion_count(),
            slow_warnings: self.throughput.slow_warnings(),
            signature_overflow,
            policy: self.policy.stats(),
            corpus: self.corpus.stats(),
            space: self.space.snapshot(),
            uncovered_sample: self
                .space
                .sample_uncovered(&self.config.target_id, UNCOVERED_SAMPLE_SIZE),
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }
}
