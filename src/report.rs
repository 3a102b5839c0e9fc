//! Run events and reporters.
//!
//! The runner emits one event per run, iteration, permutation, test, phase
//! and step boundary. Events are delivered synchronously from the worker
//! thread that produced them, through a [`Notifier`] that fans out to every
//! registered [`Reporter`] under a single lock.

pub mod console;

pub use console::{ConsoleReporter, print_summary};

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::result::{IterationResult, Phase, PhaseResult, PermutationResult, RunResult, StepResult, TestResult};

/// Shape of a run, announced before anything executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: String,
    pub iterations: usize,
    pub permutations: usize,
    /// Selected tests per permutation.
    pub tests: usize,
    pub threads: usize,
}

impl RunInfo {
    /// Number of test executions the run will perform.
    pub fn total_executions(&self) -> usize {
        self.iterations * self.permutations * self.tests
    }
}

/// Receives run events. Every method defaults to doing nothing.
pub trait Reporter: Send {
    fn on_run_start(&self, _info: &RunInfo) {}
    fn on_run_end(&self, _result: &RunResult) {}

    fn on_iteration_start(&self, _iteration: usize) {}
    fn on_iteration_end(&self, _result: &IterationResult) {}

    fn on_permutation_start(&self, _iteration: usize, _permutation: usize, _values: &Map<String, Value>) {}
    fn on_permutation_end(&self, _iteration: usize, _result: &PermutationResult) {}

    fn on_test_start(&self, _test: &str, _iteration: usize, _permutation: usize) {}
    fn on_test_end(&self, _result: &TestResult) {}

    fn on_phase_start(&self, _test: &str, _phase: Phase, _step_count: usize) {}
    fn on_phase_end(&self, _test: &str, _result: &PhaseResult) {}

    fn on_step_start(&self, _test: &str, _phase: Phase, _step: &str, _index: usize) {}
    fn on_step_end(&self, _test: &str, _phase: Phase, _index: usize, _result: &StepResult) {}
}

/// A reporter that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Reports through `tracing`: milestones at info, tests and steps at debug.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn on_run_start(&self, info: &RunInfo) {
        info!(
            "Run {} started: {} test(s) x {} permutation(s) x {} iteration(s) on {} thread(s)",
            info.run_id, info.tests, info.permutations, info.iterations, info.threads
        );
    }

    fn on_run_end(&self, result: &RunResult) {
        info!(
            "Run {} finished in {:?}: {} passed, {} failed, {} skipped, {} not run{}",
            result.run_id,
            result.duration,
            result.passed(),
            result.failed(),
            result.skipped(),
            result.not_run(),
            if result.interrupted { " (interrupted)" } else { "" }
        );
    }

    fn on_iteration_start(&self, iteration: usize) {
        info!("Iteration {} started", iteration);
    }

    fn on_permutation_start(&self, iteration: usize, permutation: usize, values: &Map<String, Value>) {
        if !values.is_empty() {
            let values = Value::Object(values.clone()).to_string();
            info!("Iteration {} permutation {}: {}", iteration, permutation, values);
        }
    }

    fn on_test_start(&self, test: &str, iteration: usize, permutation: usize) {
        debug!("[{}] started (iteration {}, permutation {})", test, iteration, permutation);
    }

    fn on_test_end(&self, result: &TestResult) {
        match result.error_summary() {
            Some(summary) => info!("[{}] {}: {}", result.name, result.status_label(), summary),
            None => info!("[{}] {}", result.name, result.status_label()),
        }
    }

    fn on_step_end(&self, test: &str, phase: Phase, index: usize, result: &StepResult) {
        debug!(
            "[{}] {} step {} '{}' passed={} completed={} in {:?}",
            test, phase, index, result.name, result.passed, result.completed, result.duration
        );
    }
}

/// Fans events out to every registered reporter.
#[derive(Default)]
pub struct Notifier {
    reporters: Mutex<Vec<Box<dyn Reporter>>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("reporters", &self.len()).finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(self, reporter: R) -> Self {
        self.add(Box::new(reporter));
        self
    }

    pub fn add(&self, reporter: Box<dyn Reporter>) {
        self.lock().push(reporter);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Box<dyn Reporter>>> {
        self.reporters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn each(&self, f: impl Fn(&dyn Reporter)) {
        for reporter in self.lock().iter() {
            f(reporter.as_ref());
        }
    }
}

impl From<Vec<Box<dyn Reporter>>> for Notifier {
    fn from(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self {
            reporters: Mutex::new(reporters),
        }
    }
}

impl Reporter for Notifier {
    fn on_run_start(&self, info: &RunInfo) {
        self.each(|r| r.on_run_start(info));
    }

    fn on_run_end(&self, result: &RunResult) {
        self.each(|r| r.on_run_end(result));
    }

    fn on_iteration_start(&self, iteration: usize) {
        self.each(|r| r.on_iteration_start(iteration));
    }

    fn on_iteration_end(&self, result: &IterationResult) {
        self.each(|r| r.on_iteration_end(result));
    }

    fn on_permutation_start(&self, iteration: usize, permutation: usize, values: &Map<String, Value>) {
        self.each(|r| r.on_permutation_start(iteration, permutation, values));
    }

    fn on_permutation_end(&self, iteration: usize, result: &PermutationResult) {
        self.each(|r| r.on_permutation_end(iteration, result));
    }

    fn on_test_start(&self, test: &str, iteration: usize, permutation: usize) {
        self.each(|r| r.on_test_start(test, iteration, permutation));
    }

    fn on_test_end(&self, result: &TestResult) {
        self.each(|r| r.on_test_end(result));
    }

    fn on_phase_start(&self, test: &str, phase: Phase, step_count: usize) {
        self.each(|r| r.on_phase_start(test, phase, step_count));
    }

    fn on_phase_end(&self, test: &str, result: &PhaseResult) {
        self.each(|r| r.on_phase_end(test, result));
    }

    fn on_step_start(&self, test: &str, phase: Phase, step: &str, index: usize) {
        self.each(|r| r.on_step_start(test, phase, step, index));
    }

    fn on_step_end(&self, test: &str, phase: Phase, index: usize, result: &StepResult) {
        self.each(|r| r.on_step_end(test, phase, index, result));
    }
}
