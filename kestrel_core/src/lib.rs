pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod guard;
pub mod input;
pub mod mutator;
pub mod orchestrator;
pub mod policy;
pub mod report;
pub mod saturation;
pub mod scanner;
pub mod scheduler;
pub mod signature;
pub mod space;
pub mod trace;

pub use checkpoint::{CheckpointError, CheckpointMetadata, CheckpointStore, EngineState};
pub use config::{ConfigError, EngineConfig, KestrelConfig, Preset};
pub use corpus::{Corpus, CorpusError, CorpusSeed, SelectionMode};
pub use coverage::CoverageTracker;
pub use executor::{Diagnostic, ExecutionResult, Executor, InProcessExecutor};
pub use guard::{
    DirectorySizeGuard, FreeSpaceGuard, GuardStatus, OutlierFilter, ResourceGuard, ThroughputGuard,
};
pub use input::{CandidateGenerator, Input, RandomBytesGenerator};
pub use mutator::{ByteDeltaMutator, JsonFieldMutator, Mutator};
pub use orchestrator::{EngineError, Orchestrator};
pub use policy::{MutationPolicy, PolicyConfig};
pub use report::{RunSummary, Termination, format_report};
pub use saturation::{SaturationDetector, SaturationState};
pub use scanner::{BugScanner, DirectoryBugScanner};
pub use scheduler::{Phase, Source, SourceScheduler};
pub use signature::{BugCategory, BugSignature, BugSignatureIndex, SignatureConfig};
pub use space::{CoverageSpaceModel, DimensionAxis, SpaceError};
pub use trace::{TraceLogger, TraceRecord};
