#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use suiterun::config::Format;
use suiterun::report::{Reporter, RunInfo};
use suiterun::result::{IterationResult, Phase, PermutationResult, PhaseResult, RunResult, StepResult};
use suiterun::step::{Step, StepContext, StepError, StepRegistry};
use suiterun::suite::StepSpec;
use suiterun::{Suite, TestResult};
use tempfile::TempDir;

/// Writes `content` to `dir/name` and returns the path.
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

pub fn yaml_suite(dir: &TempDir, yaml: &str) -> Suite {
    Suite::parse(yaml, Format::Yaml, dir.path()).unwrap()
}

/// A step whose outcome is its `outcome` field: pass, fail, incomplete or error.
pub struct Scripted {
    name: String,
    outcome: String,
}

impl Step for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "scripted"
    }

    fn setup(&mut self, ctx: &StepContext) -> Result<(), StepError> {
        let fields = ctx.expand_fields(&Map::from_iter([(
            "outcome".to_string(),
            Value::String(self.outcome.clone()),
        )]))?;
        self.outcome = fields["outcome"].as_str().unwrap_or("pass").to_string();
        Ok(())
    }

    fn run(&mut self, _ctx: &StepContext) -> Result<StepResult, StepError> {
        match self.outcome.as_str() {
            "pass" => Ok(StepResult::pass()),
            "fail" => Ok(StepResult::fail("scripted failure")),
            "incomplete" => Ok(StepResult::incomplete("scripted stop")),
            other => Err(StepError::Runtime(format!("scripted error: {other}"))),
        }
    }
}

/// Built-in steps plus `scripted`.
pub fn registry() -> StepRegistry {
    let mut registry = StepRegistry::with_builtins();
    registry.register("scripted", |spec: &StepSpec, name: &str| {
        let outcome = spec
            .field("outcome")
            .and_then(Value::as_str)
            .unwrap_or("pass")
            .to_string();
        Ok(Box::new(Scripted {
            name: name.to_string(),
            outcome,
        }) as Box<dyn Step>)
    });
    registry
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RunStart(RunInfo),
    RunEnd,
    IterationStart(usize),
    IterationEnd(usize),
    PermutationStart(usize, usize),
    PermutationEnd(usize, usize),
    TestStart(String, usize, usize),
    TestEnd(String, usize, usize),
    PhaseStart(String, Phase, usize),
    PhaseEnd(String, Phase),
    StepStart(String, Phase, usize),
    StepEnd(String, Phase, usize),
}

/// Records every event it receives.
#[derive(Clone, Default)]
pub struct Recorder {
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Reporter for Recorder {
    fn on_run_start(&self, info: &RunInfo) {
        self.push(Event::RunStart(info.clone()));
    }
    fn on_run_end(&self, _result: &RunResult) {
        self.push(Event::RunEnd);
    }
    fn on_iteration_start(&self, iteration: usize) {
        self.push(Event::IterationStart(iteration));
    }
    fn on_iteration_end(&self, result: &IterationResult) {
        self.push(Event::IterationEnd(result.index));
    }
    fn on_permutation_start(&self, iteration: usize, permutation: usize, _values: &Map<String, Value>) {
        self.push(Event::PermutationStart(iteration, permutation));
    }
    fn on_permutation_end(&self, iteration: usize, result: &PermutationResult) {
        self.push(Event::PermutationEnd(iteration, result.index));
    }
    fn on_test_start(&self, test: &str, iteration: usize, permutation: usize) {
        self.push(Event::TestStart(test.to_string(), iteration, permutation));
    }
    fn on_test_end(&self, result: &TestResult) {
        self.push(Event::TestEnd(result.name.clone(), result.iteration, result.permutation));
    }
    fn on_phase_start(&self, test: &str, phase: Phase, step_count: usize) {
        self.push(Event::PhaseStart(test.to_string(), phase, step_count));
    }
    fn on_phase_end(&self, test: &str, result: &PhaseResult) {
        self.push(Event::PhaseEnd(test.to_string(), result.phase));
    }
    fn on_step_start(&self, test: &str, phase: Phase, _step: &str, index: usize) {
        self.push(Event::StepStart(test.to_string(), phase, index));
    }
    fn on_step_end(&self, test: &str, phase: Phase, index: usize, _result: &StepResult) {
        self.push(Event::StepEnd(test.to_string(), phase, index));
    }
}
