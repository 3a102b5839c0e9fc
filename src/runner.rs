//! Runs a resolved suite over a fixed pool of worker threads.
//!
//! # Execution Flow
//!
//! ```text
//! for iteration in 0..iterations
//!   for permutation in suite permutations
//!     queue = selected tests as TestCases (FIFO)
//!     spawn `threads` workers ──► pop ─► execute ─► record ─► notify
//!     join workers
//! ```
//!
//! Every test's cancellation token is a child of the run's stop token. The
//! stop token fires when the caller's token is cancelled (the run is then
//! reported as interrupted) or when a step or worker fails in a way that
//! aborts the run (reported as [`RunAbortError`]).

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::report::{Notifier, Reporter, RunInfo};
use crate::resource::ResourceRegistry;
use crate::result::{IterationResult, PermutationResult, RunResult, StatusDetail, TestResult, TestStatus};
use crate::step::StepRegistry;
use crate::suite::{Criteria, Suite, TestModel};
use crate::test_case::{ExecEnv, Execution, TestCase, sanitize};
use crate::variables::VariableScope;

/// A run that stopped because of an engine failure.
///
/// Carries whatever results were recorded before the run stopped.
#[derive(Debug, thiserror::Error)]
#[error("Run aborted: {reason}")]
pub struct RunAbortError {
    pub reason: String,
    pub result: RunResult,
}

/// Executes the tests of a [`Suite`].
pub struct Runner<'a> {
    suite: &'a Suite,
    registry: StepRegistry,
    threads: usize,
    iterations: usize,
    output_dir: PathBuf,
    notifier: Notifier,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for Runner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("suite", &self.suite.path())
            .field("threads", &self.threads)
            .field("iterations", &self.iterations)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

/// State shared by the workers of one permutation.
struct Batch<'a> {
    queue: Mutex<VecDeque<TestCase>>,
    result: &'a PermutationResult,
    iteration: usize,
}

impl Batch<'_> {
    fn pop(&self) -> Option<TestCase> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

impl<'a> Runner<'a> {
    /// A runner using the suite's settings.
    pub fn new(suite: &'a Suite, registry: StepRegistry) -> Self {
        let settings = suite.settings();
        Self {
            suite,
            registry,
            threads: settings.threads.max(1),
            iterations: settings.iterations.max(1),
            output_dir: settings.output_dir.clone(),
            notifier: Notifier::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Adds a reporter; events reach reporters in the order they were added.
    pub fn with_reporter(self, reporter: Box<dyn Reporter>) -> Self {
        self.notifier.add(reporter);
        self
    }

    /// Cancelling `token` interrupts the run.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Runs every test matching `criteria`.
    ///
    /// Returns `Ok` for completed and interrupted runs, whatever the test
    /// outcomes. Returns [`RunAbortError`] when a step reported an engine
    /// error or a worker panicked.
    pub fn run(&self, criteria: &Criteria) -> Result<RunResult, RunAbortError> {
        let started = Instant::now();
        let run_id = new_run_id();
        let mut result = RunResult::new(&run_id);

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("suiterun-io")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                return Err(RunAbortError {
                    reason: format!("failed to start I/O runtime: {e}"),
                    result,
                });
            }
        };

        let selected = self.suite.tests(criteria);
        let permutations = self.suite.permutations();
        let resources = ResourceRegistry::from_definitions(&self.suite.document().resources);
        let stop = self.cancellation_token.child_token();
        let abort: Mutex<Option<String>> = Mutex::new(None);

        self.notifier.on_run_start(&RunInfo {
            run_id: run_id.clone(),
            iterations: self.iterations,
            permutations: permutations.len(),
            tests: selected.len(),
            threads: self.threads,
        });

        for iteration in 0..self.iterations {
            if stop.is_cancelled() {
                break;
            }
            self.notifier.on_iteration_start(iteration);
            let mut iteration_result = IterationResult::new(iteration);

            for (index, values) in permutations.iter().enumerate() {
                if stop.is_cancelled() {
                    break;
                }
                self.notifier.on_permutation_start(iteration, index, values);
                let permutation = PermutationResult::new(index, values.clone());

                match self.permutation_scope(values) {
                    Ok(scope) => {
                        let cases = self.test_cases(&selected, &run_id, iteration, index, &scope, &stop);
                        let batch = Batch {
                            queue: Mutex::new(cases),
                            result: &permutation,
                            iteration,
                        };
                        self.run_batch(&batch, &resources, runtime.handle(), &stop, &abort);
                    }
                    Err(reason) => record_abort(&abort, &stop, reason),
                }

                self.notifier.on_permutation_end(iteration, &permutation);
                iteration_result.permutations.push(permutation);
            }

            self.notifier.on_iteration_end(&iteration_result);
            result.iterations.push(iteration_result);
        }

        runtime.shutdown_background();
        result.duration = started.elapsed();

        let abort = abort.into_inner().unwrap_or_else(PoisonError::into_inner);
        result.interrupted = abort.is_none() && self.cancellation_token.is_cancelled();
        self.notifier.on_run_end(&result);

        match abort {
            Some(reason) => {
                error!("Run {} aborted: {}", run_id, reason);
                Err(RunAbortError { reason, result })
            }
            None => {
                info!(
                    "Run {} complete: {}/{} passed",
                    run_id,
                    result.passed(),
                    result.total()
                );
                Ok(result)
            }
        }
    }

    fn permutation_scope(&self, values: &Map<String, Value>) -> Result<Arc<VariableScope>, String> {
        let mut scope = VariableScope::child(self.suite.scope());
        scope
            .set_vars_with_origin(values, "matrix")
            .map_err(|e| format!("suite matrix: {e}"))?;
        Ok(Arc::new(scope))
    }

    fn test_cases(
        &self,
        models: &[Arc<TestModel>],
        run_id: &str,
        iteration: usize,
        permutation: usize,
        scope: &Arc<VariableScope>,
        stop: &CancellationToken,
    ) -> VecDeque<TestCase> {
        let base = self
            .output_dir
            .join(run_id)
            .join(format!("iter{iteration}"))
            .join(format!("perm{permutation}"));

        models
            .iter()
            .map(|model| {
                TestCase::new(
                    Arc::clone(model),
                    &self.registry,
                    iteration,
                    permutation,
                    Arc::clone(scope),
                    base.join(sanitize(&model.name)),
                    stop.child_token(),
                )
            })
            .collect()
    }

    fn run_batch(
        &self,
        batch: &Batch<'_>,
        resources: &ResourceRegistry,
        runtime: &Handle,
        stop: &CancellationToken,
        abort: &Mutex<Option<String>>,
    ) {
        thread::scope(|s| {
            let mut handles = Vec::with_capacity(self.threads);
            for worker in 0..self.threads {
                let spawned = thread::Builder::new()
                    .name(format!("suiterun-worker-{worker}"))
                    .spawn_scoped(s, || self.work(batch, resources, runtime.clone(), stop, abort));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => record_abort(abort, stop, format!("failed to spawn worker: {e}")),
                }
            }
            for handle in handles {
                if let Err(panic) = handle.join() {
                    record_abort(abort, stop, format!("worker panicked: {}", panic_message(&*panic)));
                }
            }
        });
    }

    fn work(
        &self,
        batch: &Batch<'_>,
        resources: &ResourceRegistry,
        runtime: Handle,
        stop: &CancellationToken,
        abort: &Mutex<Option<String>>,
    ) {
        let env = ExecEnv {
            resources,
            settings: self.suite.settings(),
            runtime,
            work_dir: self.suite.document().base_dir(),
            reporter: &self.notifier,
        };

        while !stop.is_cancelled() {
            let Some(mut case) = batch.pop() else {
                break;
            };
            let name = case.name().to_string();
            self.notifier
                .on_test_start(&name, batch.iteration, batch.result.index);

            let result = match catch_unwind(AssertUnwindSafe(|| case.execute(&env))) {
                Ok(Execution { result, abort: None }) => result,
                Ok(Execution {
                    result,
                    abort: Some(e),
                }) => {
                    record_abort(abort, stop, format!("test '{name}': {e}"));
                    result
                }
                Err(panic) => {
                    let message = format!("test '{}' panicked: {}", name, panic_message(&*panic));
                    record_abort(abort, stop, message.clone());
                    let mut result = TestResult::new(&name, batch.iteration, batch.result.index);
                    result.set_status(TestStatus::NotRun, Some(StatusDetail::TestErr), Some(message));
                    result
                }
            };

            debug!("[{}] recorded {}", name, result.status_label());
            batch.result.insert(result.clone());
            self.notifier.on_test_end(&result);
        }
    }
}

/// Keeps the first abort reason and stops the run.
fn record_abort(slot: &Mutex<Option<String>>, stop: &CancellationToken, reason: String) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        error!("Stopping run: {}", reason);
        *slot = Some(reason);
    }
    stop.cancel();
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Format;
    use crate::result::StepResult;
    use crate::step::{Step, StepContext, StepError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn suite(yaml: &str, dir: &TempDir) -> Suite {
        Suite::parse(yaml, Format::Yaml, dir.path()).unwrap()
    }

    struct Exploding;

    impl Step for Exploding {
        fn name(&self) -> &str {
            "boom"
        }
        fn kind(&self) -> &str {
            "explode"
        }
        fn setup(&mut self, _ctx: &StepContext) -> Result<(), StepError> {
            Ok(())
        }
        fn run(&mut self, _ctx: &StepContext) -> Result<StepResult, StepError> {
            Err(StepError::Runtime("engine broke".to_string()))
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl Reporter for Counting {
        fn on_test_end(&self, _result: &TestResult) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_run_records_every_execution() {
        let dir = TempDir::new().unwrap();
        let suite = suite(
            r#"
matrix:
  mode: [fast, slow]
tests:
  - name: a
    run: [{type: sleep, duration: 0}]
  - name: b
    run: [{type: sleep, duration: 0}]
  - name: c
    skip: true
"#,
            &dir,
        );
        let ends = Arc::new(AtomicUsize::new(0));
        let result = Runner::new(&suite, StepRegistry::with_builtins())
            .with_threads(2)
            .with_iterations(2)
            .with_output_dir(dir.path().join("out"))
            .with_reporter(Box::new(Counting(Arc::clone(&ends))))
            .run(&Criteria::all())
            .unwrap();

        assert_eq!(result.total(), 12);
        assert_eq!(ends.load(Ordering::SeqCst), 12);
        assert_eq!(result.passed(), 8);
        assert_eq!(result.skipped(), 4);
        assert!(result.success());
        assert_eq!(result.iterations[1].permutations[1].values["mode"], "slow");

        let a = result.iterations[0].permutations[0].get("a").unwrap();
        let dir = a.output_dir.unwrap();
        assert!(dir.ends_with(format!("{}/iter0/perm0/a", result.run_id)));
        assert!(dir.is_dir());
    }

    #[test]
    fn test_step_error_aborts_run() {
        let dir = TempDir::new().unwrap();
        let suite = suite(
            r#"
tests:
  - name: broken
    run: [{type: explode}]
"#,
            &dir,
        );
        let mut registry = StepRegistry::with_builtins();
        registry.register("explode", |_, _| Ok(Box::new(Exploding) as Box<dyn Step>));

        let err = Runner::new(&suite, registry)
            .with_output_dir(dir.path().join("out"))
            .with_iterations(3)
            .run(&Criteria::all())
            .unwrap_err();
        assert!(err.reason.contains("engine broke"));
        assert_eq!(err.result.iterations.len(), 1);
        assert_eq!(err.result.not_run(), 1);
        assert!(!err.result.interrupted);
    }

    #[test]
    fn test_cancelled_before_start_is_interrupted() {
        let dir = TempDir::new().unwrap();
        let suite = suite(
            r#"
tests:
  - name: a
    run: [{type: sleep, duration: 5}]
"#,
            &dir,
        );
        let token = CancellationToken::new();
        token.cancel();
        let result = Runner::new(&suite, StepRegistry::with_builtins())
            .with_output_dir(dir.path().join("out"))
            .with_cancellation_token(token)
            .run(&Criteria::all())
            .unwrap();
        assert!(result.interrupted);
        assert_eq!(result.total(), 0);
        assert_eq!(result.exit_code(), 130);
    }

    #[test]
    fn test_run_id_shape() {
        let id = new_run_id();
        assert_eq!(id.len(), "20260101-000000-".len() + 8);
        assert_ne!(id, new_run_id());
    }
}
