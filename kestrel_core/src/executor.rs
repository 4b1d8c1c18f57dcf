use crate::input::Input;
use crate::signature::BugCategory;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Failure text reported by an executor alongside its coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Bucket chosen by the executor. `None` lets the signature index classify the text.
    pub category: Option<BugCategory>,
    pub raw_text: String,
}

/// Outcome of one execution: the coverage tokens it exercised and an optional diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    pub tokens: BTreeSet<String>,
    pub diagnostic: Option<Diagnostic>,
}

impl ExecutionResult {
    pub fn with_tokens<S: Into<String>>(tokens: impl IntoIterator<Item = S>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            diagnostic: None,
        }
    }
}

/// Runs a candidate against the target-under-test.
///
/// The call is synchronous and may block for as long as the target runs; any timeout
/// policy belongs to the implementation. An `Err` means the execution itself failed
/// (the iteration is recorded as invalid); a target that merely misbehaves should be
/// reported through [`ExecutionResult::diagnostic`].
pub trait Executor<I: Input> {
    fn execute(&mut self, candidate: &I) -> Result<ExecutionResult, anyhow::Error>;
}

/// Executes a harness closure in the current process.
///
/// A panic inside the harness is caught and turned into a fatal diagnostic with an empty
/// token set, so one crashing candidate never takes the run down with it.
pub struct InProcessExecutor<I, F>
where
    F: FnMut(&I) -> Result<ExecutionResult, anyhow::Error>,
{
    harness_fn: F,
    _marker: PhantomData<fn(&I)>,
}

impl<I, F> InProcessExecutor<I, F>
where
    F: FnMut(&I) -> Result<ExecutionResult, anyhow::Error>,
{
    pub fn new(harness_fn: F) -> Self {
        Self {
            harness_fn,
            _marker: PhantomData,
        }
    }
}

impl<I: Input, F> Executor<I> for InProcessExecutor<I, F>
where
    F: FnMut(&I) -> Result<ExecutionResult, anyhow::Error>,
{
    fn execute(&mut self, candidate: &I) -> Result<ExecutionResult, anyhow::Error> {
        let result = catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(candidate)));

        match result {
            Ok(outcome) => outcome,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                Ok(ExecutionResult {
                    tokens: BTreeSet::new(),
                    diagnostic: Some(Diagnostic {
                        category: Some(BugCategory::Fatal),
                        raw_text: format!("harness panicked: {msg}"),
                    }),
                })
            }
        }
    }
}
