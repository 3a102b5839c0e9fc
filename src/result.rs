//! The result tree of a run.
//!
//! ```text
//! RunResult
//! └── IterationResult (one per iteration)
//!     └── PermutationResult (one per suite-level matrix permutation)
//!         └── test name -> TestResult
//!             └── PhaseResult (pre_run, run, post_run)
//!                 └── StepResult
//! ```
//!
//! A [`PermutationResult`] is filled concurrently by the workers; its map and
//! status summary sit behind a single mutex.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Primary outcome of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    NotRun,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "PASSED",
            TestStatus::Failed => "FAILED",
            TestStatus::Skipped => "SKIPPED",
            TestStatus::NotRun => "NOT_RUN",
        };
        f.write_str(s)
    }
}

/// Qualifies a status with why it was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusDetail {
    /// The test could not be set up.
    InitErr,
    /// `pre_run` failed or did not complete.
    PreTestErr,
    /// `run` did not complete.
    TestErr,
    /// `run` failed and failure was expected.
    ExpectedFail,
    /// `run` passed but failure was expected.
    UnexpectedPass,
}

impl fmt::Display for StatusDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusDetail::InitErr => "INIT_ERR",
            StatusDetail::PreTestErr => "PRE_TEST_ERR",
            StatusDetail::TestErr => "TEST_ERR",
            StatusDetail::ExpectedFail => "EXPECTED_FAIL",
            StatusDetail::UnexpectedPass => "UNEXPECTED_PASS",
        };
        f.write_str(s)
    }
}

/// One of the three phases of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreRun,
    Run,
    PostRun,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::PreRun, Phase::Run, Phase::PostRun];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreRun => "pre_run",
            Phase::Run => "run",
            Phase::PostRun => "post_run",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step.
///
/// `completed` says the step ran to its end; `passed` says the end was the
/// expected one. An incomplete step (timed out, interrupted) never passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepResult {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub passed: bool,
    pub completed: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

impl StepResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            completed: true,
            ..Self::default()
        }
    }

    /// Completed, but not with the expected outcome.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            completed: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Did not run to its end.
    pub fn incomplete(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::incomplete(message)
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResult {
    pub phase: Phase,
    /// The phase body ran (even if it had no steps).
    pub executed: bool,
    /// Executed, and every executed step completed.
    pub completed: bool,
    /// Stopped early because the test was cancelled.
    pub interrupted: bool,
    pub steps: Vec<StepResult>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

impl PhaseResult {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            executed: false,
            completed: false,
            interrupted: false,
            steps: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Every executed step passed.
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|s| s.passed)
    }

    /// Executed, completed and passed.
    pub fn ok(&self) -> bool {
        self.executed && self.completed && self.passed()
    }

    pub fn first_problem(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| !s.passed)
    }

    /// A one-line description of what went wrong, if anything.
    pub fn problem(&self) -> Option<String> {
        if self.interrupted {
            return Some(format!("{} interrupted", self.phase));
        }
        self.first_problem().map(|step| {
            let what = if step.timed_out {
                "timed out"
            } else if !step.completed {
                "did not complete"
            } else {
                "failed"
            };
            match &step.message {
                Some(message) => format!("{} step '{}' {}: {}", self.phase, step.name, what, message),
                None => format!("{} step '{}' {}", self.phase, step.name, what),
            }
        })
    }
}

/// Outcome of one test in one iteration and permutation.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    pub detail: Option<StatusDetail>,
    pub reason: Option<String>,
    /// Problems that did not change the status (e.g. `post_run` failures).
    pub notices: Vec<String>,
    pub start: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub pre_run: PhaseResult,
    pub run: PhaseResult,
    pub post_run: PhaseResult,
    pub output_dir: Option<PathBuf>,
    pub iteration: usize,
    pub permutation: usize,
    pub matrix_values: Map<String, Value>,
}

impl TestResult {
    /// A not-yet-run result.
    pub fn new(name: impl Into<String>, iteration: usize, permutation: usize) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::NotRun,
            detail: None,
            reason: None,
            notices: Vec::new(),
            start: None,
            duration: Duration::ZERO,
            pre_run: PhaseResult::new(Phase::PreRun),
            run: PhaseResult::new(Phase::Run),
            post_run: PhaseResult::new(Phase::PostRun),
            output_dir: None,
            iteration,
            permutation,
            matrix_values: Map::new(),
        }
    }

    pub fn phase(&self, phase: Phase) -> &PhaseResult {
        match phase {
            Phase::PreRun => &self.pre_run,
            Phase::Run => &self.run,
            Phase::PostRun => &self.post_run,
        }
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseResult {
        match phase {
            Phase::PreRun => &mut self.pre_run,
            Phase::Run => &mut self.run,
            Phase::PostRun => &mut self.post_run,
        }
    }

    pub fn set_status(&mut self, status: TestStatus, detail: Option<StatusDetail>, reason: Option<String>) {
        self.status = status;
        self.detail = detail;
        self.reason = reason;
    }

    /// Status with its detail, e.g. `NOT_RUN/INIT_ERR`.
    pub fn status_label(&self) -> String {
        match self.detail {
            Some(detail) => format!("{}/{}", self.status, detail),
            None => self.status.to_string(),
        }
    }

    /// The reason and every notice, joined.
    pub fn error_summary(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .reason
            .iter()
            .chain(self.notices.iter())
            .map(String::as_str)
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

#[derive(Debug, Default)]
struct PermutationState {
    results: BTreeMap<String, TestResult>,
    summary: BTreeMap<TestStatus, Vec<String>>,
}

/// Results of every test of one permutation of one iteration.
#[derive(Debug)]
pub struct PermutationResult {
    pub index: usize,
    /// Suite-level matrix assignment.
    pub values: Map<String, Value>,
    state: Mutex<PermutationState>,
}

impl PermutationResult {
    pub fn new(index: usize, values: Map<String, Value>) -> Self {
        Self {
            index,
            values,
            state: Mutex::new(PermutationState::default()),
        }
    }

    /// Records a result, replacing any earlier result of the same test.
    pub fn insert(&self, result: TestResult) {
        let mut state = self.lock();
        if let Some(previous) = state.results.remove(&result.name) {
            if let Some(names) = state.summary.get_mut(&previous.status) {
                names.retain(|n| *n != previous.name);
            }
        }
        state
            .summary
            .entry(result.status)
            .or_default()
            .push(result.name.clone());
        state.results.insert(result.name.clone(), result);
    }

    pub fn get(&self, name: &str) -> Option<TestResult> {
        self.lock().results.get(name).cloned()
    }

    /// All results, ordered by test name.
    pub fn results(&self) -> Vec<TestResult> {
        self.lock().results.values().cloned().collect()
    }

    /// Names of the tests with `status`, in completion order.
    pub fn names_with(&self, status: TestStatus) -> Vec<String> {
        self.lock().summary.get(&status).cloned().unwrap_or_default()
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.lock().summary.get(&status).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().results.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, PermutationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Serialize for PermutationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            index: usize,
            values: &'a Map<String, Value>,
            summary: &'a BTreeMap<TestStatus, Vec<String>>,
            results: &'a BTreeMap<String, TestResult>,
        }

        let state = self.lock();
        Snapshot {
            index: self.index,
            values: &self.values,
            summary: &state.summary,
            results: &state.results,
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Serialize)]
pub struct IterationResult {
    pub index: usize,
    pub permutations: Vec<PermutationResult>,
}

impl IterationResult {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            permutations: Vec::new(),
        }
    }
}

/// Aggregated results of a whole run.
#[derive(Debug, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub start: DateTime<Utc>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    /// The run was stopped from outside before it finished.
    pub interrupted: bool,
    pub iterations: Vec<IterationResult>,
}

impl RunResult {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            start: Utc::now(),
            duration: Duration::ZERO,
            interrupted: false,
            iterations: Vec::new(),
        }
    }

    /// Every test result, iteration by iteration.
    pub fn all_results(&self) -> Vec<TestResult> {
        self.iterations
            .iter()
            .flat_map(|it| it.permutations.iter())
            .flat_map(|p| p.results())
            .collect()
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.iterations
            .iter()
            .flat_map(|it| it.permutations.iter())
            .map(|p| p.count(status))
            .sum()
    }

    pub fn counts(&self) -> BTreeMap<TestStatus, usize> {
        [
            TestStatus::Passed,
            TestStatus::Failed,
            TestStatus::Skipped,
            TestStatus::NotRun,
        ]
        .into_iter()
        .map(|s| (s, self.count(s)))
        .collect()
    }

    pub fn total(&self) -> usize {
        self.iterations
            .iter()
            .flat_map(|it| it.permutations.iter())
            .map(PermutationResult::len)
            .sum()
    }

    pub fn passed(&self) -> usize {
        self.count(TestStatus::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(TestStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(TestStatus::Skipped)
    }

    pub fn not_run(&self) -> usize {
        self.count(TestStatus::NotRun)
    }

    /// No test failed, every selected test ran and the run was not interrupted.
    pub fn success(&self) -> bool {
        self.failed() == 0 && self.not_run() == 0 && !self.interrupted
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            130
        } else if self.failed() > 0 || self.not_run() > 0 {
            1
        } else {
            0
        }
    }
}
