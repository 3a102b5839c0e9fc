//! Runtime tests and the phase state machine.
//!
//! A [`TestCase`] is one execution of a resolved [`TestModel`] in a given
//! iteration and permutation. Executing it walks these rules in order; the
//! first that applies decides the outcome:
//!
//! | # | Condition | Result |
//! |---|-----------|--------|
//! | 1 | resolution or step creation failed | NotRun / InitErr |
//! | 2 | `skip` | Skipped (no output directory) |
//! | 3 | platform not in `platforms` | Skipped |
//! | 4 | no `run` steps | NotRun, "no command" |
//! | 5 | resources cannot be obtained | NotRun / InitErr |
//! | 6 | output dir, scope or a step's setup fails | NotRun / InitErr |
//!
//! Otherwise the phases run in order, each wrapped in start/end events:
//!
//! ```text
//! pre_run ──(all passed and completed)──► run ──► post_run (always)
//!    │                                     │
//!    └─ else NotRun/PreTestErr             ├─ incomplete          NotRun/TestErr
//!       (run body no-ops)                  ├─ failed, expected    Passed/ExpectedFail
//!                                          ├─ failed              Failed
//!                                          ├─ passed, expected    Failed/UnexpectedPass
//!                                          └─ passed              Passed
//! ```
//!
//! `post_run` problems become notices and never change the status.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::report::Reporter;
use crate::resource::{ResourceGuard, ResourceRegistry};
use crate::result::{Phase, PhaseResult, StatusDetail, StepResult, TestResult, TestStatus};
use crate::step::{Step, StepContext, StepError, StepRegistry};
use crate::suite::{BUILTIN_ORIGIN, TestModel};
use crate::variables::{VariableError, VariableScope};

/// Shared state a test executes against.
pub struct ExecEnv<'a> {
    pub resources: &'a ResourceRegistry,
    pub settings: &'a Settings,
    pub runtime: Handle,
    /// Directory steps run in by default.
    pub work_dir: &'a Path,
    pub reporter: &'a dyn Reporter,
}

/// Outcome of [`TestCase::execute`].
#[derive(Debug)]
pub struct Execution {
    pub result: TestResult,
    /// A step failed in a way that must abort the whole run.
    pub abort: Option<StepError>,
}

struct PlannedStep {
    name: String,
    step: Box<dyn Step>,
    ctx: Option<StepContext>,
}

/// One execution of a test.
pub struct TestCase {
    model: Arc<TestModel>,
    iteration: usize,
    permutation: usize,
    parent_scope: Arc<VariableScope>,
    test_dir: PathBuf,
    phases: [Vec<PlannedStep>; 3],
    init_error: Option<String>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.model.name)
            .field("iteration", &self.iteration)
            .field("permutation", &self.permutation)
            .field("test_dir", &self.test_dir)
            .finish()
    }
}

impl TestCase {
    /// Instantiates the test's steps.
    ///
    /// A step that cannot be created is not an error here; it makes the
    /// test NotRun/InitErr when executed.
    pub fn new(
        model: Arc<TestModel>,
        registry: &StepRegistry,
        iteration: usize,
        permutation: usize,
        parent_scope: Arc<VariableScope>,
        test_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        let mut init_error = None;
        let mut phases: [Vec<PlannedStep>; 3] = Default::default();

        if model.error.is_none() {
            let specs = [&model.pre_run, &model.run, &model.post_run];
            'phases: for (phase, specs) in Phase::ALL.iter().zip(specs) {
                for (index, spec) in specs.iter().enumerate() {
                    let name = spec.display_name(index);
                    match registry.create(spec, &name) {
                        Ok(step) => phases[phase_index(*phase)].push(PlannedStep {
                            name,
                            step,
                            ctx: None,
                        }),
                        Err(e) => {
                            init_error = Some(format!("{phase} step '{name}': {e}"));
                            break 'phases;
                        }
                    }
                }
            }
        }

        Self {
            model,
            iteration,
            permutation,
            parent_scope,
            test_dir,
            phases,
            init_error,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.model.name
    }

    pub fn model(&self) -> &Arc<TestModel> {
        &self.model
    }

    pub fn test_dir(&self) -> &Path {
        &self.test_dir
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Asks in-flight steps to stop; pending steps will not start.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Runs the state machine and returns the result.
    pub fn execute(&mut self, env: &ExecEnv<'_>) -> Execution {
        let started = Instant::now();
        let mut result = TestResult::new(&self.model.name, self.iteration, self.permutation);
        result.start = Some(Utc::now());
        result.matrix_values = self.model.matrix_values.clone();

        let abort = self.drive(env, &mut result);

        result.duration = started.elapsed();
        debug!(
            "[{}] {} in {:?}",
            result.name,
            result.status_label(),
            result.duration
        );
        Execution { result, abort }
    }

    fn drive(&mut self, env: &ExecEnv<'_>, result: &mut TestResult) -> Option<StepError> {
        let model = Arc::clone(&self.model);

        if let Some(error) = model.error.as_ref().or(self.init_error.as_ref()) {
            result.set_status(TestStatus::NotRun, Some(StatusDetail::InitErr), Some(error.clone()));
            return None;
        }
        if model.skip {
            let reason = model.skip_reason.clone().unwrap_or_else(|| "skipped".to_string());
            result.set_status(TestStatus::Skipped, None, Some(reason));
            return None;
        }
        if !model.supports_platform(&env.settings.platform) {
            result.set_status(
                TestStatus::Skipped,
                None,
                Some(format!("not supported on platform '{}'", env.settings.platform)),
            );
            return None;
        }
        if self.phases[phase_index(Phase::Run)].is_empty() {
            result.set_status(TestStatus::NotRun, None, Some("no command".to_string()));
            return None;
        }

        let guards = match env.resources.obtain_all(
            &model.resources,
            &self.cancel,
            env.settings.resource_timeout(),
        ) {
            Ok(guards) => guards,
            Err(e) => {
                result.set_status(TestStatus::NotRun, Some(StatusDetail::InitErr), Some(e.to_string()));
                return None;
            }
        };

        if let Err(e) = std::fs::create_dir_all(&self.test_dir) {
            result.set_status(
                TestStatus::NotRun,
                Some(StatusDetail::InitErr),
                Some(format!("failed to create {}: {}", self.test_dir.display(), e)),
            );
            return None;
        }
        result.output_dir = Some(self.test_dir.clone());

        if let Err(reason) = self.prepare(env, &guards) {
            result.set_status(TestStatus::NotRun, Some(StatusDetail::InitErr), Some(reason));
            return None;
        }

        let (pre_run, mut abort) = self.run_phase(Phase::PreRun, true, env);
        let pre_ok = pre_run.ok();
        result.pre_run = pre_run;

        let (run, run_abort) = self.run_phase(Phase::Run, pre_ok && abort.is_none(), env);
        abort = abort.or(run_abort);
        result.run = run;

        let (post_run, post_abort) = self.run_phase(Phase::PostRun, abort.is_none(), env);
        abort = abort.or(post_abort);
        result.post_run = post_run;

        drop(guards);
        decide_status(&model, result);
        abort
    }

    /// Builds the test scope and every step's context, then sets steps up.
    fn prepare(&mut self, env: &ExecEnv<'_>, guards: &[ResourceGuard]) -> Result<(), String> {
        let scope = Arc::new(
            self.test_scope(guards)
                .map_err(|e| format!("test variables: {e}"))?,
        );

        for phase in Phase::ALL {
            for (index, planned) in self.phases[phase_index(phase)].iter_mut().enumerate() {
                let step_dir = self
                    .test_dir
                    .join(phase.as_str())
                    .join(format!("{}_{}", index, sanitize(&planned.name)));

                let mut step_scope = VariableScope::child(&scope);
                let builtins = [
                    ("step_name", Value::String(planned.name.clone())),
                    ("step_dir", Value::String(step_dir.display().to_string())),
                    ("phase", Value::String(phase.as_str().to_string())),
                ];
                for (name, value) in builtins {
                    step_scope
                        .set_with_origin(name, value, BUILTIN_ORIGIN)
                        .map_err(|e| e.to_string())?;
                }

                let ctx = StepContext {
                    scope: Arc::new(step_scope),
                    test_name: self.model.name.clone(),
                    step_name: planned.name.clone(),
                    phase,
                    step_dir,
                    work_dir: env.work_dir.to_path_buf(),
                    cancel: self.cancel.clone(),
                    runtime: env.runtime.clone(),
                    default_timeout: env.settings.step_timeout(),
                };
                planned
                    .step
                    .setup(&ctx)
                    .map_err(|e| format!("{} step '{}': {}", phase, planned.name, e))?;
                planned.ctx = Some(ctx);
            }
        }
        Ok(())
    }

    fn test_scope(&self, guards: &[ResourceGuard]) -> Result<VariableScope, VariableError> {
        let model = &self.model;
        let mut scope = VariableScope::child(&self.parent_scope);
        scope.set_vars_with_origin(&model.matrix_values, "matrix")?;
        scope.set_vars_with_origin(&model.var_map, &format!("test:{}", model.name))?;

        for guard in guards {
            let origin = format!("resource:{}", guard.pool());
            let values = guard.units().iter().map(|u| u.value.clone()).collect();
            let names = guard
                .units()
                .iter()
                .map(|u| Value::String(u.name.clone()))
                .collect();
            scope.set_with_origin(guard.as_var(), Value::Array(values), &origin)?;
            scope.set_with_origin(&format!("{}_names", guard.as_var()), Value::Array(names), &origin)?;
        }

        let builtins = [
            ("test_name", Value::String(model.name.clone())),
            ("test_dir", Value::String(self.test_dir.display().to_string())),
            ("iteration", Value::from(self.iteration)),
            ("permutation", Value::from(self.permutation)),
        ];
        for (name, value) in builtins {
            scope.set_with_origin(name, value, BUILTIN_ORIGIN)?;
        }
        Ok(scope)
    }

    fn run_phase(&mut self, phase: Phase, enabled: bool, env: &ExecEnv<'_>) -> (PhaseResult, Option<StepError>) {
        let test = self.model.name.as_str();
        let steps = &mut self.phases[phase_index(phase)];
        let reporter = env.reporter;

        reporter.on_phase_start(test, phase, steps.len());
        let started = Instant::now();
        let mut phase_result = PhaseResult::new(phase);
        let mut abort = None;

        if enabled {
            phase_result.executed = true;
            phase_result.completed = true;

            for (index, planned) in steps.iter_mut().enumerate() {
                if self.cancel.is_cancelled() {
                    phase_result.interrupted = true;
                    phase_result.completed = false;
                    break;
                }
                let Some(ctx) = planned.ctx.as_ref() else {
                    continue;
                };

                reporter.on_step_start(test, phase, &planned.name, index);
                let step_started = Instant::now();
                let mut step_result = match planned.step.run(ctx) {
                    Ok(r) => r,
                    Err(e) => {
                        let r = StepResult::incomplete(format!("engine error: {e}"));
                        abort = Some(e);
                        r
                    }
                };
                step_result.name = planned.name.clone();
                step_result.kind = planned.step.kind().to_string();
                step_result.duration = step_started.elapsed();
                reporter.on_step_end(test, phase, index, &step_result);

                let stop = !step_result.passed;
                if !step_result.completed {
                    phase_result.completed = false;
                }
                phase_result.steps.push(step_result);

                if abort.is_some() || (stop && phase != Phase::PostRun) {
                    break;
                }
            }
        }

        phase_result.duration = started.elapsed();
        reporter.on_phase_end(test, &phase_result);
        (phase_result, abort)
    }
}

fn decide_status(model: &TestModel, result: &mut TestResult) {
    let pre = &result.pre_run;
    let run = &result.run;

    let (status, detail, reason) = if !pre.ok() {
        let reason = pre
            .problem()
            .unwrap_or_else(|| "pre_run did not complete".to_string());
        (TestStatus::NotRun, Some(StatusDetail::PreTestErr), Some(reason))
    } else if !run.completed {
        let reason = run.problem().unwrap_or_else(|| "run did not complete".to_string());
        (TestStatus::NotRun, Some(StatusDetail::TestErr), Some(reason))
    } else if !run.passed() && model.expected_failure {
        (TestStatus::Passed, Some(StatusDetail::ExpectedFail), run.problem())
    } else if !run.passed() {
        (TestStatus::Failed, None, run.problem())
    } else if model.expected_failure {
        (
            TestStatus::Failed,
            Some(StatusDetail::UnexpectedPass),
            Some("run passed but failure was expected".to_string()),
        )
    } else {
        (TestStatus::Passed, None, None)
    };
    result.set_status(status, detail, reason);

    let post = &result.post_run;
    if post.executed && !post.ok() {
        let notice = post
            .problem()
            .unwrap_or_else(|| "post_run did not complete".to_string());
        warn!("[{}] {}", result.name, notice);
        result.notices.push(notice);
    }
}

fn phase_index(phase: Phase) -> usize {
    match phase {
        Phase::PreRun => 0,
        Phase::Run => 1,
        Phase::PostRun => 2,
    }
}

/// Makes a test or step name safe to use as a directory name.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
