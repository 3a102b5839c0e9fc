//! Test inheritance.
//!
//! [`TestResolver`] turns the [`TestDesc`]s of a merged document into fully
//! materialised [`TestModel`]s. A test names at most one `base`; the base is
//! resolved first (recursively) and the child is laid over it:
//!
//! | Field | Rule |
//! |-------|------|
//! | `pre_run`, `run`, `post_run` | per `<phase>_inheritance`: replace, append or prepend |
//! | `var_map` | base ∪ child (child wins) unless `inherit_variables: false` |
//! | `groups`, `resources`, `platforms`, `matrix`, descriptions, `expected_failure`, `skip`, `skip_reason` | base value unless the child sets it |
//! | `abstract` | never inherited |
//!
//! Steps inherit from the document's named step library the same way, one
//! level lower: fields merge key-wise and the `type` tag is inherited.
//!
//! Problems with a single test never abort resolution. They are recorded in
//! [`TestModel::error`] and surface as a not-run result when the test runs.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{Document, InheritanceMode, ResourceRequestDesc, StepDesc, TestDesc};
use crate::resource::{ResourceError, ResourceRegistry, ResourceRequest, Selector};
use crate::suite::RESERVED_NAMES;
use crate::variables::{self, VariableError};

/// Errors raised while resolving a test.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("Unknown test '{0}'")]
    UnknownTest(String),

    #[error("Test '{test}' inherits from unknown test '{base}'")]
    UnknownBase { test: String, base: String },

    #[error("Step '{step}' inherits from unknown step '{base}'")]
    UnknownStepBase { step: String, base: String },

    #[error("Inheritance loop: {}", .0.join(" -> "))]
    InheritanceLoop(Vec<String>),

    #[error("Step '{step}' declares type '{found}' but its base has type '{expected}'")]
    StepTypeMismatch {
        step: String,
        expected: String,
        found: String,
    },

    #[error("Step '{0}' has no type")]
    MissingStepType(String),

    #[error("base '{base}': {message}")]
    Base { base: String, message: String },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Variable(#[from] VariableError),
}

/// A step after library inheritance: its type tag and configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
    pub base: Option<String>,
    pub fields: Map<String, Value>,
}

impl StepSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            base: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The step's name, or `<type>_<index>` for anonymous steps.
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.kind, index))
    }
}

/// A test with inheritance applied.
#[derive(Debug, Clone, Serialize)]
pub struct TestModel {
    pub name: String,
    pub base: Option<String>,
    #[serde(rename = "abstract")]
    pub is_abstract: bool,
    pub short_desc: Option<String>,
    pub long_desc: Option<String>,
    pub groups: Vec<String>,
    pub pre_run: Vec<StepSpec>,
    pub run: Vec<StepSpec>,
    pub post_run: Vec<StepSpec>,
    pub expected_failure: bool,
    pub skip: bool,
    pub skip_reason: Option<String>,
    pub var_map: Map<String, Value>,
    /// Empty means any platform.
    pub platforms: Vec<String>,
    pub resources: Vec<ResourceRequest>,
    /// Axes still to be expanded.
    pub matrix: BTreeMap<String, Vec<Value>>,
    /// Axis assignment of a matrix variant.
    pub matrix_values: Map<String, Value>,
    /// Name of the test a matrix variant was expanded from.
    pub variant_of: Option<String>,
    pub source: Option<PathBuf>,
    /// Why the test cannot run, if it cannot.
    pub error: Option<String>,
}

impl TestModel {
    /// An empty, valid model.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            is_abstract: false,
            short_desc: None,
            long_desc: None,
            groups: Vec::new(),
            pre_run: Vec::new(),
            run: Vec::new(),
            post_run: Vec::new(),
            expected_failure: false,
            skip: false,
            skip_reason: None,
            var_map: Map::new(),
            platforms: Vec::new(),
            resources: Vec::new(),
            matrix: BTreeMap::new(),
            matrix_values: Map::new(),
            variant_of: None,
            source: None,
            error: None,
        }
    }

    /// A model that failed to resolve; keeps what the descriptor says directly.
    fn failed(desc: &TestDesc, error: String) -> Self {
        Self {
            base: desc.base.clone(),
            is_abstract: desc.is_abstract,
            short_desc: desc.short_desc.clone(),
            long_desc: desc.long_desc.clone(),
            groups: desc.groups.clone().unwrap_or_default(),
            source: desc.source.clone(),
            error: Some(error),
            ..Self::named(desc.name.clone())
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// Whether the test may run on `platform`.
    pub fn supports_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty() || self.platforms.iter().any(|p| p == platform)
    }

    pub fn step_count(&self) -> usize {
        self.pre_run.len() + self.run.len() + self.post_run.len()
    }
}

/// Resolves tests of one document, caching each result by name.
#[derive(Debug)]
pub struct TestResolver<'a> {
    doc: &'a Document,
    pools: ResourceRegistry,
    cache: HashMap<String, Arc<TestModel>>,
}

impl<'a> TestResolver<'a> {
    pub fn new(doc: &'a Document) -> Self {
        Self {
            doc,
            pools: ResourceRegistry::from_definitions(&doc.resources),
            cache: HashMap::new(),
        }
    }

    /// Resolves one test.
    ///
    /// Only an unknown name is an `Err`; every other problem is recorded in
    /// the returned model's `error`.
    pub fn resolve(&mut self, name: &str) -> Result<Arc<TestModel>, ResolveError> {
        let mut chain = Vec::new();
        self.resolve_chain(name, &mut chain)
    }

    /// Resolves every test in declaration order.
    pub fn resolve_all(&mut self) -> Vec<Arc<TestModel>> {
        let doc = self.doc;
        doc.tests
            .iter()
            .filter_map(|desc| self.resolve(&desc.name).ok())
            .collect()
    }

    fn resolve_chain(
        &mut self,
        name: &str,
        chain: &mut Vec<String>,
    ) -> Result<Arc<TestModel>, ResolveError> {
        if let Some(model) = self.cache.get(name) {
            return Ok(Arc::clone(model));
        }
        let doc = self.doc;
        let desc = doc
            .test(name)
            .ok_or_else(|| ResolveError::UnknownTest(name.to_string()))?;

        chain.push(name.to_string());
        let built = self.build(desc, chain);
        chain.pop();

        let model = match built {
            Ok(model) => model,
            Err(e) => {
                debug!("Test '{}' failed to resolve: {}", name, e);
                TestModel::failed(desc, e.to_string())
            }
        };
        let model = Arc::new(model);
        self.cache.insert(name.to_string(), Arc::clone(&model));
        Ok(model)
    }

    fn build(&mut self, desc: &TestDesc, chain: &mut Vec<String>) -> Result<TestModel, ResolveError> {
        let base = match &desc.base {
            None => None,
            Some(base_name) => {
                if let Some(pos) = chain.iter().position(|n| n == base_name) {
                    let mut cycle = chain[pos..].to_vec();
                    cycle.push(base_name.clone());
                    return Err(ResolveError::InheritanceLoop(cycle));
                }
                let base = self.resolve_chain(base_name, chain).map_err(|e| match e {
                    ResolveError::UnknownTest(_) => ResolveError::UnknownBase {
                        test: desc.name.clone(),
                        base: base_name.clone(),
                    },
                    other => other,
                })?;
                if let Some(message) = &base.error {
                    return Err(ResolveError::Base {
                        base: base_name.clone(),
                        message: message.clone(),
                    });
                }
                Some(base)
            }
        };
        let base = base.as_deref();

        let pre_run = self.merge_phase(
            desc.pre_run.as_deref(),
            desc.pre_run_inheritance,
            base.map(|b| b.pre_run.as_slice()),
        )?;
        let run = self.merge_phase(
            desc.run.as_deref(),
            desc.run_inheritance,
            base.map(|b| b.run.as_slice()),
        )?;
        let post_run = self.merge_phase(
            desc.post_run.as_deref(),
            desc.post_run_inheritance,
            base.map(|b| b.post_run.as_slice()),
        )?;

        let mut var_map = match base {
            Some(b) if desc.inherit_variables.unwrap_or(true) => b.var_map.clone(),
            _ => Map::new(),
        };
        for (key, value) in desc.var_map.iter().flatten() {
            if !variables::is_valid_name(key) {
                return Err(VariableError::BadVarName(key.clone()).into());
            }
            var_map.insert(key.clone(), value.clone());
        }

        let groups = inherit(&desc.groups, base.map(|b| &b.groups)).unwrap_or_default();
        if desc.is_abstract && !groups.is_empty() {
            return Err(ResolveError::Validation(format!(
                "abstract test '{}' must not declare groups",
                desc.name
            )));
        }

        let resources = match &desc.resources {
            Some(requests) => requests
                .iter()
                .map(request_from_desc)
                .collect::<Result<Vec<_>, _>>()?,
            None => base.map(|b| b.resources.clone()).unwrap_or_default(),
        };
        self.pools.check(&resources)?;

        let matrix = inherit(&desc.matrix, base.map(|b| &b.matrix)).unwrap_or_default();
        validate_matrix(&matrix)?;

        Ok(TestModel {
            name: desc.name.clone(),
            base: desc.base.clone(),
            is_abstract: desc.is_abstract,
            short_desc: inherit(&desc.short_desc, base.and_then(|b| b.short_desc.as_ref())),
            long_desc: inherit(&desc.long_desc, base.and_then(|b| b.long_desc.as_ref())),
            groups,
            pre_run,
            run,
            post_run,
            expected_failure: desc
                .expected_failure
                .or(base.map(|b| b.expected_failure))
                .unwrap_or(false),
            skip: desc.skip.or(base.map(|b| b.skip)).unwrap_or(false),
            skip_reason: inherit(&desc.skip_reason, base.and_then(|b| b.skip_reason.as_ref())),
            var_map,
            platforms: inherit(&desc.platforms, base.map(|b| &b.platforms)).unwrap_or_default(),
            resources,
            matrix,
            matrix_values: Map::new(),
            variant_of: None,
            source: desc.source.clone(),
            error: None,
        })
    }

    fn merge_phase(
        &self,
        child: Option<&[StepDesc]>,
        mode: Option<InheritanceMode>,
        parent: Option<&[StepSpec]>,
    ) -> Result<Vec<StepSpec>, ResolveError> {
        let own = child
            .unwrap_or_default()
            .iter()
            .map(|step| self.resolve_step(step))
            .collect::<Result<Vec<_>, _>>()?;
        let parent = parent.unwrap_or_default();

        Ok(match mode.unwrap_or_default() {
            InheritanceMode::Replace if child.is_some() => own,
            InheritanceMode::Replace => parent.to_vec(),
            InheritanceMode::Append => parent.iter().cloned().chain(own).collect(),
            InheritanceMode::Prepend => own.into_iter().chain(parent.iter().cloned()).collect(),
        })
    }

    /// Applies library inheritance to one step.
    pub fn resolve_step(&self, desc: &StepDesc) -> Result<StepSpec, ResolveError> {
        let mut chain = Vec::new();
        let merged = self.merge_step(desc, &mut chain)?;
        let kind = merged
            .kind
            .ok_or_else(|| ResolveError::MissingStepType(step_label(desc)))?;
        Ok(StepSpec {
            kind,
            name: merged.name,
            base: merged.base,
            fields: merged.fields,
        })
    }

    fn merge_step(&self, desc: &StepDesc, chain: &mut Vec<String>) -> Result<StepDesc, ResolveError> {
        let Some(base_name) = &desc.base else {
            return Ok(desc.clone());
        };
        if let Some(pos) = chain.iter().position(|n| n == base_name) {
            let mut cycle = chain[pos..].to_vec();
            cycle.push(base_name.clone());
            return Err(ResolveError::InheritanceLoop(cycle));
        }
        let base_desc = self
            .doc
            .step(base_name)
            .ok_or_else(|| ResolveError::UnknownStepBase {
                step: step_label(desc),
                base: base_name.clone(),
            })?;

        chain.push(base_name.clone());
        let base = self.merge_step(base_desc, chain)?;
        chain.pop();

        let kind = match (&desc.kind, base.kind) {
            (Some(own), Some(inherited)) if *own != inherited => {
                return Err(ResolveError::StepTypeMismatch {
                    step: step_label(desc),
                    expected: inherited,
                    found: own.clone(),
                });
            }
            (Some(own), _) => Some(own.clone()),
            (None, inherited) => inherited,
        };

        let mut fields = base.fields;
        for (key, value) in &desc.fields {
            fields.insert(key.clone(), value.clone());
        }

        Ok(StepDesc {
            kind,
            name: desc.name.clone().or(base.name),
            base: desc.base.clone(),
            fields,
        })
    }
}

fn inherit<T: Clone>(own: &Option<T>, base: Option<&T>) -> Option<T> {
    own.clone().or_else(|| base.cloned())
}

fn step_label(desc: &StepDesc) -> String {
    match (&desc.name, &desc.kind) {
        (Some(name), _) => name.clone(),
        (None, Some(kind)) => format!("<{kind}>"),
        (None, None) => "<unnamed>".to_string(),
    }
}

fn request_from_desc(desc: &ResourceRequestDesc) -> Result<ResourceRequest, ResolveError> {
    let selector = match (desc.count, &desc.names) {
        (Some(count), None) => Selector::Count(count),
        (None, Some(names)) => Selector::Names(names.clone()),
        _ => {
            return Err(ResourceError::InvalidRequest {
                pool: desc.pool.clone(),
                message: "exactly one of 'count' or 'names' is required".to_string(),
            }
            .into());
        }
    };
    let as_var = desc.as_var.clone().unwrap_or_else(|| desc.pool.clone());
    if !variables::is_valid_name(&as_var) {
        return Err(VariableError::BadVarName(as_var).into());
    }
    if RESERVED_NAMES.contains(&as_var.as_str()) {
        return Err(ResolveError::Validation(format!(
            "resource binding '{as_var}' for pool '{}' uses a reserved variable name",
            desc.pool
        )));
    }
    Ok(ResourceRequest {
        pool: desc.pool.clone(),
        selector,
        as_var,
    })
}

/// Checks axis names and values of a matrix.
pub fn validate_matrix(matrix: &BTreeMap<String, Vec<Value>>) -> Result<(), ResolveError> {
    for (axis, values) in matrix {
        if !variables::is_valid_name(axis) {
            return Err(ResolveError::Validation(format!(
                "matrix axis '{axis}' is not a valid variable name"
            )));
        }
        if values.is_empty() {
            return Err(ResolveError::Validation(format!(
                "matrix axis '{axis}' has no values"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, Format};
    use serde_json::json;
    use std::path::Path;

    fn doc(yaml: &str) -> Document {
        ConfigResolver::new()
            .resolve_str(yaml, Format::Yaml, Path::new("."))
            .unwrap()
    }

    fn commands(steps: &[StepSpec]) -> Vec<String> {
        steps
            .iter()
            .map(|s| s.field("command").and_then(Value::as_str).unwrap_or("").to_string())
            .collect()
    }

    const INHERITANCE: &str = r#"
tests:
  - name: parent
    abstract: true
    short_desc: parent desc
    pre_run: [{type: process, command: p_pre}]
    run: [{type: process, command: p_run}]
    post_run: [{type: process, command: p_post}]
    var_map: {a: 1, b: 2}
    platforms: [linux]
  - name: replace
    base: parent
    run: [{type: process, command: c_run}]
    var_map: {b: 3}
  - name: append
    base: parent
    run_inheritance: append
    run: [{type: process, command: c_run}]
  - name: prepend
    base: parent
    run_inheritance: prepend
    run: [{type: process, command: c_run}]
    inherit_variables: false
    var_map: {c: 4}
"#;

    #[test]
    fn test_phase_inheritance_modes() {
        let doc = doc(INHERITANCE);
        let mut resolver = TestResolver::new(&doc);

        let replace = resolver.resolve("replace").unwrap();
        assert!(replace.is_valid());
        assert_eq!(commands(&replace.run), ["c_run"]);
        assert_eq!(commands(&replace.pre_run), ["p_pre"]);
        assert_eq!(commands(&replace.post_run), ["p_post"]);

        let append = resolver.resolve("append").unwrap();
        assert_eq!(commands(&append.run), ["p_run", "c_run"]);

        let prepend = resolver.resolve("prepend").unwrap();
        assert_eq!(commands(&prepend.run), ["c_run", "p_run"]);
    }

    #[test]
    fn test_field_inheritance() {
        let doc = doc(INHERITANCE);
        let mut resolver = TestResolver::new(&doc);

        let parent = resolver.resolve("parent").unwrap();
        assert!(parent.is_abstract);

        let replace = resolver.resolve("replace").unwrap();
        assert!(!replace.is_abstract);
        assert_eq!(replace.short_desc.as_deref(), Some("parent desc"));
        assert_eq!(replace.platforms, ["linux"]);
        assert_eq!(Value::Object(replace.var_map.clone()), json!({"a": 1, "b": 3}));

        let prepend = resolver.resolve("prepend").unwrap();
        assert_eq!(Value::Object(prepend.var_map.clone()), json!({"c": 4}));
    }

    #[test]
    fn test_resolution_is_cached() {
        let doc = doc(INHERITANCE);
        let mut resolver = TestResolver::new(&doc);
        let a = resolver.resolve("append").unwrap();
        let b = resolver.resolve("append").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(resolver.resolve_all().len(), 4);
    }

    #[test]
    fn test_unknown_test_and_base() {
        let doc = doc("tests:\n  - name: orphan\n    base: ghost\n");
        let mut resolver = TestResolver::new(&doc);
        assert_eq!(
            resolver.resolve("nope").unwrap_err(),
            ResolveError::UnknownTest("nope".to_string())
        );
        let orphan = resolver.resolve("orphan").unwrap();
        assert!(orphan.error.as_deref().unwrap().contains("ghost"));
    }

    #[test]
    fn test_inheritance_loop_and_base_error_propagation() {
        let doc = doc(
            r#"
tests:
  - name: a
    base: b
  - name: b
    base: a
  - name: c
    base: a
"#,
        );
        let mut resolver = TestResolver::new(&doc);
        let a = resolver.resolve("a").unwrap();
        assert!(a.error.is_some());
        let c = resolver.resolve("c").unwrap();
        assert!(c.error.as_deref().unwrap().starts_with("base 'a': "));
    }

    #[test]
    fn test_loop_chain_starts_at_reentered_test() {
        let doc = doc(
            r#"
tests:
  - name: a
    base: b
  - name: b
    base: a
  - name: c
    base: a
"#,
        );
        let mut resolver = TestResolver::new(&doc);
        resolver.resolve("c").unwrap();
        let b = resolver.resolve("b").unwrap();
        assert_eq!(b.error.as_deref(), Some("Inheritance loop: a -> b -> a"));
        let a = resolver.resolve("a").unwrap();
        assert_eq!(a.error.as_deref(), Some("base 'b': Inheritance loop: a -> b -> a"));
    }

    #[test]
    fn test_step_library_errors() {
        let doc = doc(
            r#"
steps:
  - name: x
    base: y
    type: sleep
  - name: y
    base: x
tests:
  - name: looped
    run: [{base: x}]
  - name: ghostly
    run: [{base: ghost}]
  - name: typed_ghost
    run: [{base: ghost, type: sleep}]
"#,
        );
        let mut resolver = TestResolver::new(&doc);
        let looped = resolver.resolve("looped").unwrap();
        assert_eq!(looped.error.as_deref(), Some("Inheritance loop: x -> y -> x"));

        let ghostly = resolver.resolve("ghostly").unwrap();
        assert_eq!(
            ghostly.error.as_deref(),
            Some("Step '<unnamed>' inherits from unknown step 'ghost'")
        );

        let typed = resolver.resolve("typed_ghost").unwrap();
        assert_eq!(
            typed.error.as_deref(),
            Some("Step '<sleep>' inherits from unknown step 'ghost'")
        );
    }

    #[test]
    fn test_abstract_with_groups_is_invalid() {
        let doc = doc("tests:\n  - name: t\n    abstract: true\n    groups: [g]\n");
        let model = TestResolver::new(&doc).resolve("t").unwrap();
        assert!(model.error.as_deref().unwrap().contains("abstract"));
    }

    #[test]
    fn test_step_library_inheritance() {
        let doc = doc(
            r#"
steps:
  - name: compile
    type: process
    command: make
    timeout: 60
  - name: fast_compile
    base: compile
    timeout: 5
tests:
  - name: t
    run:
      - base: fast_compile
        command: make -j8
      - base: compile
        type: sleep
      - name: untyped
        command: true
"#,
        );
        let resolver = TestResolver::new(&doc);
        let run = &doc.test("t").unwrap().run.clone().unwrap();

        let step = resolver.resolve_step(&run[0]).unwrap();
        assert_eq!(step.kind, "process");
        assert_eq!(step.name.as_deref(), Some("fast_compile"));
        assert_eq!(step.field("command"), Some(&json!("make -j8")));
        assert_eq!(step.field("timeout"), Some(&json!(5)));

        assert!(matches!(
            resolver.resolve_step(&run[1]),
            Err(ResolveError::StepTypeMismatch { .. })
        ));
        assert_eq!(
            resolver.resolve_step(&run[2]),
            Err(ResolveError::MissingStepType("untyped".to_string()))
        );
    }

    #[test]
    fn test_resource_requests_validated() {
        let doc = doc(
            r#"
resources:
  boards: [b0]
tests:
  - name: too_many
    run: [{type: sleep, duration: 0}]
    resources: [{pool: boards, count: 2}]
  - name: unknown_pool
    resources: [{pool: modems, count: 1}]
  - name: both
    resources: [{pool: boards, count: 1, names: [b0]}]
  - name: ok
    resources: [{pool: boards, names: [b0], as: board}]
  - name: reserved
    resources: [{pool: boards, count: 1, as: iteration}]
  - name: reserved_step
    resources: [{pool: boards, count: 1, as: step_dir}]
"#,
        );
        let mut resolver = TestResolver::new(&doc);
        for name in ["reserved", "reserved_step"] {
            let model = resolver.resolve(name).unwrap();
            assert!(model.error.as_deref().unwrap().contains("reserved variable name"), "{name}");
        }
        for name in ["too_many", "unknown_pool", "both"] {
            assert!(resolver.resolve(name).unwrap().error.is_some(), "{name}");
        }
        let ok = resolver.resolve("ok").unwrap();
        assert!(ok.is_valid());
        assert_eq!(ok.resources[0].as_var, "board");
    }

    #[test]
    fn test_matrix_validation() {
        let doc = doc(
            r#"
tests:
  - name: empty_axis
    matrix: {os: []}
  - name: bad_axis
    matrix: {"bad-name": [1]}
"#,
        );
        let mut resolver = TestResolver::new(&doc);
        assert!(resolver.resolve("empty_axis").unwrap().error.is_some());
        assert!(resolver.resolve("bad_axis").unwrap().error.is_some());
    }
}
