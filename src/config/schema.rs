//! Suite document schema.
//!
//! These types mirror one suite file as written on disk, before includes are
//! merged and before inheritance is applied. Every format (YAML, JSON, TOML)
//! deserializes into the same structures.
//!
//! # Schema Overview
//!
//! ```text
//! RawDocument (one file)
//! ├── include      - other suite files, relative to this one
//! ├── variables    - suite-level variables
//! ├── settings     - run settings (see Settings)
//! ├── resources    - pool name -> units
//! ├── matrix       - suite-level axes, one run per permutation
//! ├── steps        - named step library, referenced via `base`
//! └── tests        - TestDesc list
//!     ├── base / abstract
//!     ├── pre_run / run / post_run (StepDesc lists) + *_inheritance
//!     ├── var_map / inherit_variables
//!     ├── resources (ResourceRequestDesc list)
//!     └── matrix, groups, platforms, skip, expected_failure ...
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::resource::Unit;

/// One suite file.
///
/// # Example
///
/// ```
/// use suiterun::config::RawDocument;
///
/// let doc: RawDocument = serde_yaml_ng::from_str(r#"
/// variables:
///   greeting: hello
/// tests:
///   - name: hello
///     run:
///       - type: process
///         command: echo {greeting}
/// "#).unwrap();
///
/// assert_eq!(doc.tests.len(), 1);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawDocument {
    /// Other suite files merged into this one.
    #[serde(default, alias = "includes")]
    pub include: Vec<String>,

    #[serde(default)]
    pub tests: Vec<TestDesc>,

    /// Named step templates that steps can inherit from through `base`.
    #[serde(default)]
    pub steps: Vec<StepDesc>,

    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Raw settings; typed through [`Settings`] after merging.
    #[serde(default)]
    pub settings: Map<String, Value>,

    #[serde(default)]
    pub resources: BTreeMap<String, Vec<UnitDesc>>,

    /// Suite-level matrix: the whole suite runs once per permutation.
    #[serde(default)]
    pub matrix: BTreeMap<String, Vec<Value>>,
}

/// A test as written in a suite file.
///
/// Every optional field distinguishes "not set" from "set to the default",
/// which is what inheritance keys on.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TestDesc {
    pub name: String,

    /// Test this one inherits from.
    pub base: Option<String>,

    /// Abstract tests only exist to be inherited from and never run.
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,

    pub short_desc: Option<String>,
    pub long_desc: Option<String>,
    pub groups: Option<Vec<String>>,

    pub pre_run: Option<Vec<StepDesc>>,
    pub run: Option<Vec<StepDesc>>,
    pub post_run: Option<Vec<StepDesc>>,

    pub pre_run_inheritance: Option<InheritanceMode>,
    pub run_inheritance: Option<InheritanceMode>,
    pub post_run_inheritance: Option<InheritanceMode>,

    /// Failing is the expected outcome of `run`.
    pub expected_failure: Option<bool>,
    pub skip: Option<bool>,
    pub skip_reason: Option<String>,

    pub var_map: Option<Map<String, Value>>,

    /// Whether `var_map` merges with the base's. Default: true.
    pub inherit_variables: Option<bool>,

    /// Platforms the test may run on. Absent means any.
    pub platforms: Option<Vec<String>>,

    pub resources: Option<Vec<ResourceRequestDesc>>,

    /// Test-level matrix: the test is expanded into one variant per permutation.
    pub matrix: Option<BTreeMap<String, Vec<Value>>>,

    /// File the test was loaded from.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// How a child's phase step list combines with its base's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InheritanceMode {
    /// Child's list if declared, else the base's.
    #[default]
    Replace,
    /// Base's steps, then the child's.
    Append,
    /// Child's steps, then the base's.
    Prepend,
}

/// A step as written in a suite file.
///
/// Only `type`, `name` and `base` are interpreted here; everything else is
/// passed to the step implementation selected by `type`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StepDesc {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Entry of the step library this step inherits from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A test's request for units of one pool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRequestDesc {
    pub pool: String,

    /// Any `count` free units. Exclusive with `names`.
    pub count: Option<usize>,

    /// These specific units. Exclusive with `count`.
    pub names: Option<Vec<String>>,

    /// Variable the unit values are bound to. Default: the pool name.
    #[serde(rename = "as")]
    pub as_var: Option<String>,
}

/// A pool unit: either a bare string (name and value) or a name/value pair.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum UnitDesc {
    Name(String),
    Full { name: String, value: Option<Value> },
}

impl UnitDesc {
    pub fn name(&self) -> &str {
        match self {
            UnitDesc::Name(name) => name,
            UnitDesc::Full { name, .. } => name,
        }
    }

    pub fn to_unit(&self) -> Unit {
        match self {
            UnitDesc::Name(name) => Unit::new(name.clone(), Value::String(name.clone())),
            UnitDesc::Full { name, value } => Unit::new(
                name.clone(),
                value.clone().unwrap_or_else(|| Value::String(name.clone())),
            ),
        }
    }
}

/// Typed run settings, deserialized from the merged `settings` map.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `threads` | 1 |
/// | `iterations` | 1 |
/// | `output_dir` | `suiterun-results` |
/// | `step_timeout_secs` | None (no limit) |
/// | `resource_timeout_secs` | None (wait forever) |
/// | `platform` | the host OS (`linux`, `macos`, ...) |
///
/// Keys not listed here are kept in the document but ignored by the runner.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Number of worker threads.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Number of times the whole suite runs.
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Root of every test's output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Fallback timeout for steps that do not declare one.
    #[serde(default)]
    pub step_timeout_secs: Option<f64>,

    /// Limit on how long a test waits for its resources.
    #[serde(default)]
    pub resource_timeout_secs: Option<f64>,

    /// Platform tests are matched against.
    #[serde(default = "default_platform")]
    pub platform: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            iterations: default_iterations(),
            output_dir: default_output_dir(),
            step_timeout_secs: None,
            resource_timeout_secs: None,
            platform: default_platform(),
        }
    }
}

impl Settings {
    /// `step_timeout_secs` as a duration.
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// `resource_timeout_secs` as a duration; `None` waits forever.
    pub fn resource_timeout(&self) -> Option<Duration> {
        self.resource_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

fn default_threads() -> usize {
    1
}

fn default_iterations() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("suiterun-results")
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}
