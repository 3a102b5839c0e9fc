//! suiterun: a declarative test orchestration engine.
//!
//! Suites are YAML, JSON or TOML files describing named tests made of
//! ordered steps. Tests inherit from each other, reference variables,
//! expand into matrix variants and claim units of shared resource pools.
//! The engine resolves all of that up front and then runs the selected
//! tests over a fixed number of worker threads, for a number of iterations,
//! collecting a result tree.
//!
//! # Architecture
//!
//! - **config**: suite documents, includes and settings
//! - **suite**: inheritance, matrix expansion and test selection
//! - **variables**: scopes and `{placeholder}` expansion
//! - **resource**: pools of units tests hold while they run
//! - **step**: the step contract and the built-in `process` and `sleep` steps
//! - **test_case**: the pre_run / run / post_run state machine
//! - **runner**: workers, iterations, permutations and cancellation
//! - **result** / **report**: the result tree and run events
//!
//! # Example
//!
//! ```no_run
//! use suiterun::report::ConsoleReporter;
//! use suiterun::{Criteria, Reporter};
//!
//! fn main() -> anyhow::Result<()> {
//!     let suite = suiterun::resolve_suite(std::path::Path::new("suite.yaml"))?;
//!     let reporters: Vec<Box<dyn Reporter>> = vec![Box::new(ConsoleReporter::new(false))];
//!     let result = suiterun::run(&suite, &Criteria::all().group("smoke"), reporters, 1, 4)?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod config;
pub mod report;
pub mod resource;
pub mod result;
pub mod runner;
pub mod step;
pub mod suite;
pub mod test_case;
pub mod variables;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

// Re-export commonly used types
pub use config::{ConfigError, Settings};
pub use report::{Notifier, Reporter};
pub use result::{RunResult, TestResult, TestStatus};
pub use runner::{RunAbortError, Runner};
pub use step::{Step, StepRegistry};
pub use suite::{Criteria, Pattern, Suite, TestModel};

/// Loads and resolves the suite at `path`.
pub fn resolve_suite(path: &Path) -> Result<Suite, ConfigError> {
    Suite::resolve(path)
}

/// Like [`resolve_suite`], with `key=value` settings overrides applied.
pub fn resolve_suite_with(path: &Path, overrides: &BTreeMap<String, String>) -> Result<Suite, ConfigError> {
    Suite::resolve_with(path, overrides)
}

/// The tests of `suite` selected by `criteria`, in declaration order.
pub fn list_tests(suite: &Suite, criteria: &Criteria) -> Vec<Arc<TestModel>> {
    suite.tests(criteria)
}

/// Runs the selected tests with the built-in step types.
pub fn run(
    suite: &Suite,
    criteria: &Criteria,
    reporters: Vec<Box<dyn Reporter>>,
    iterations: usize,
    threads: usize,
) -> Result<RunResult, RunAbortError> {
    reporters
        .into_iter()
        .fold(Runner::new(suite, StepRegistry::with_builtins()), Runner::with_reporter)
        .with_iterations(iterations)
        .with_threads(threads)
        .run(criteria)
}
