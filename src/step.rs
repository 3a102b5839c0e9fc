//! Steps: the units of work inside a test phase.
//!
//! A step is created from its [`StepSpec`] by the factory registered for its
//! `type` tag in a [`StepRegistry`]. Each step is set up once, after the test
//! scope is built, and then run at most once:
//!
//! ```text
//! StepRegistry::create(spec) ──► Box<dyn Step>
//!                                  ├── setup(ctx)   expand fields, validate
//!                                  └── run(ctx)     -> StepResult
//! ```
//!
//! A step reports its outcome through [`StepResult`]: failed, passed, or
//! incomplete (timed out, interrupted). Returning `Err` from [`Step::run`]
//! means the engine itself is broken and aborts the whole run.

pub mod process;
pub mod sleep;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::result::{Phase, StepResult};
use crate::suite::StepSpec;
use crate::variables::{ValueType, VariableError, VariableScope};

pub use process::ProcessStep;
pub use sleep::SleepStep;

/// Errors from creating, setting up or running a step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Unknown step type '{0}'")]
    UnknownType(String),

    #[error("Invalid configuration for step '{step}': {message}")]
    InvalidConfig { step: String, message: String },

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Step runtime error: {0}")]
    Runtime(String),
}

impl StepError {
    pub fn invalid(step: &str, message: impl Into<String>) -> Self {
        StepError::InvalidConfig {
            step: step.to_string(),
            message: message.into(),
        }
    }
}

/// Everything a step sees while it is set up and run.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The step's scope: `step_name`, `step_dir`, `phase` over the test scope.
    pub scope: Arc<VariableScope>,
    pub test_name: String,
    pub step_name: String,
    pub phase: Phase,
    /// Output directory of this step (not created until the step needs it).
    pub step_dir: PathBuf,
    /// Directory commands run in unless a step says otherwise.
    pub work_dir: PathBuf,
    /// Fires when the test is stopped.
    pub cancel: CancellationToken,
    /// Runtime for async I/O and timers.
    pub runtime: Handle,
    /// Timeout for steps that do not declare one.
    pub default_timeout: Option<Duration>,
}

impl StepContext {
    /// Expands every string in the step's fields against the step scope.
    pub fn expand_fields(&self, fields: &Map<String, Value>) -> Result<Map<String, Value>, StepError> {
        match self.scope.expand_value(&Value::Object(fields.clone()))? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    /// Reads an optional duration field, expanding a placeholder to a number
    /// or a numeric string.
    pub fn duration_field(
        &self,
        fields: &Map<String, Value>,
        key: &str,
    ) -> Result<Option<Duration>, StepError> {
        let value = match fields.get(key) {
            Some(Value::String(text)) => {
                Some(self.scope.expand(text, Some(&[ValueType::Number, ValueType::String]))?)
            }
            other => other.cloned(),
        };
        parse_duration(value.as_ref(), key, &self.step_name)
    }

    /// Creates the step directory.
    pub fn ensure_step_dir(&self) -> Result<(), StepError> {
        std::fs::create_dir_all(&self.step_dir).map_err(|source| StepError::Io {
            context: format!("Failed to create {}", self.step_dir.display()),
            source,
        })
    }
}

/// A unit of work in a test phase.
pub trait Step: Send {
    fn name(&self) -> &str;

    /// The `type` tag this step was created from.
    fn kind(&self) -> &str;

    /// Prepares the step once the test scope exists.
    ///
    /// An error here keeps the whole test from running.
    fn setup(&mut self, ctx: &StepContext) -> Result<(), StepError>;

    /// Runs the step.
    fn run(&mut self, ctx: &StepContext) -> Result<StepResult, StepError>;
}

/// Builds a step from its spec.
pub type StepFactory = Arc<dyn Fn(&StepSpec, &str) -> Result<Box<dyn Step>, StepError> + Send + Sync>;

/// Maps `type` tags to step factories.
#[derive(Clone, Default)]
pub struct StepRegistry {
    factories: HashMap<String, StepFactory>,
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl StepRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `process` and `sleep` steps.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(process::KIND, |spec, name| {
            Ok(Box::new(ProcessStep::new(spec, name)) as Box<dyn Step>)
        });
        registry.register(sleep::KIND, |spec, name| {
            Ok(Box::new(SleepStep::new(spec, name)) as Box<dyn Step>)
        });
        registry
    }

    /// Registers (or replaces) the factory for `kind`.
    ///
    /// The factory receives the spec and the step's display name.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&StepSpec, &str) -> Result<Box<dyn Step>, StepError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered tags, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Instantiates a step.
    pub fn create(&self, spec: &StepSpec, name: &str) -> Result<Box<dyn Step>, StepError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| StepError::UnknownType(spec.kind.clone()))?;
        factory(spec, name)
    }
}

/// Reads an optional duration in seconds: a number or a numeric string.
pub fn parse_duration(
    value: Option<&Value>,
    key: &str,
    step: &str,
) -> Result<Option<Duration>, StepError> {
    let secs = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match secs {
        Some(secs) if secs >= 0.0 => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| StepError::invalid(step, format!("'{key}': {e}"))),
        _ => Err(StepError::invalid(
            step,
            format!("'{key}' must be a non-negative number of seconds"),
        )),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::runtime::Runtime;

    /// A context rooted in `dir` with an empty scope.
    pub fn context(runtime: &Runtime, dir: &std::path::Path, scope: VariableScope) -> StepContext {
        StepContext {
            scope: Arc::new(scope),
            test_name: "t".to_string(),
            step_name: "s".to_string(),
            phase: Phase::Run,
            step_dir: dir.join("s"),
            work_dir: dir.to_path_buf(),
            cancel: CancellationToken::new(),
            runtime: runtime.handle().clone(),
            default_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop(String);

    impl Step for Noop {
        fn name(&self) -> &str {
            &self.0
        }
        fn kind(&self) -> &str {
            "noop"
        }
        fn setup(&mut self, _ctx: &StepContext) -> Result<(), StepError> {
            Ok(())
        }
        fn run(&mut self, _ctx: &StepContext) -> Result<StepResult, StepError> {
            Ok(StepResult::pass())
        }
    }

    #[test]
    fn test_registry_create() {
        let mut registry = StepRegistry::with_builtins();
        registry.register("noop", |_spec, name| {
            Ok(Box::new(Noop(name.to_string())) as Box<dyn Step>)
        });
        assert_eq!(registry.kinds(), ["noop", "process", "sleep"]);

        let step = registry.create(&StepSpec::new("noop"), "first").unwrap();
        assert_eq!(step.name(), "first");
        assert_eq!(step.kind(), "noop");

        assert!(matches!(
            registry.create(&StepSpec::new("teleport"), "x"),
            Err(StepError::UnknownType(kind)) if kind == "teleport"
        ));
    }

    #[test]
    fn test_parse_duration() {
        let fields = json!({"a": 1.5, "b": "2", "c": "soon", "d": -1, "e": null});
        let fields = fields.as_object().unwrap();
        let parse = |key: &str| parse_duration(fields.get(key), key, "s");
        assert_eq!(parse("a").unwrap(), Some(Duration::from_millis(1500)));
        assert_eq!(parse("b").unwrap(), Some(Duration::from_secs(2)));
        assert!(parse("c").is_err());
        assert!(parse("d").is_err());
        assert_eq!(parse("e").unwrap(), None);
        assert_eq!(parse("missing").unwrap(), None);
    }

    #[test]
    fn test_duration_field_is_typed() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let mut scope = VariableScope::new();
        scope.set("pause", json!(2)).unwrap();
        scope.set("pauses", json!([1, 2])).unwrap();
        let ctx = test_support::context(&rt, dir.path(), scope);

        let fields = json!({"ok": "{pause}", "text": "{pause}.5", "list": "{pauses}"});
        let fields = fields.as_object().unwrap();
        assert_eq!(ctx.duration_field(fields, "ok").unwrap(), Some(Duration::from_secs(2)));
        assert_eq!(
            ctx.duration_field(fields, "text").unwrap(),
            Some(Duration::from_millis(2500))
        );
        assert!(matches!(
            ctx.duration_field(fields, "list"),
            Err(StepError::Variable(VariableError::InvalidVarType { .. }))
        ));
    }
}
