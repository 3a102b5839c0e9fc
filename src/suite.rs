//! Resolved suites.
//!
//! A [`Suite`] is the read-only product of loading a suite file: the merged
//! document, typed settings, every test resolved and matrix-expanded, the
//! suite-level permutations and the suite variable scope that every test
//! scope descends from.

pub mod criteria;
pub mod matrix;
pub mod resolver;

pub use criteria::{Criteria, Pattern};
pub use resolver::{ResolveError, StepSpec, TestModel, TestResolver};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{ConfigError, ConfigResolver, Document, Format, Settings};
use crate::variables::VariableScope;

/// Origin recorded for suite-level variables.
pub const SUITE_ORIGIN: &str = "suite";
/// Origin recorded for variables the engine defines.
pub const BUILTIN_ORIGIN: &str = "builtin";
/// Variables bound in every test or step scope.
pub const RESERVED_NAMES: &[&str] = &[
    "test_name",
    "test_dir",
    "iteration",
    "permutation",
    "step_name",
    "step_dir",
    "phase",
];

#[derive(Debug)]
pub struct Suite {
    document: Document,
    settings: Settings,
    models: Vec<Arc<TestModel>>,
    permutations: Vec<Map<String, Value>>,
    scope: Arc<VariableScope>,
}

impl Suite {
    /// Loads and resolves the suite at `path`.
    pub fn resolve(path: &Path) -> Result<Self, ConfigError> {
        Self::resolve_with(path, &BTreeMap::new())
    }

    /// Like [`resolve`](Self::resolve), with settings overrides applied.
    pub fn resolve_with(path: &Path, overrides: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let document = ConfigResolver::new().resolve(path)?;
        Self::from_document(document, overrides)
    }

    /// Resolves a suite held in memory; includes are relative to `base_dir`.
    pub fn parse(content: &str, format: Format, base_dir: &Path) -> Result<Self, ConfigError> {
        let document = ConfigResolver::new().resolve_str(content, format, base_dir)?;
        Self::from_document(document, &BTreeMap::new())
    }

    pub fn from_document(
        document: Document,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let settings = document.settings_with(overrides)?;

        resolver::validate_matrix(&document.matrix)
            .map_err(|e| ConfigError::InvalidMatrix(e.to_string()))?;
        let permutations = matrix::permutations(&document.matrix);

        let mut scope = VariableScope::new();
        scope.set_vars_with_origin(&document.variables, SUITE_ORIGIN)?;
        scope.set_with_origin(
            "suite_dir",
            Value::String(document.base_dir().display().to_string()),
            BUILTIN_ORIGIN,
        )?;
        scope.set_with_origin(
            "platform",
            Value::String(settings.platform.clone()),
            BUILTIN_ORIGIN,
        )?;

        let models: Vec<Arc<TestModel>> = TestResolver::new(&document)
            .resolve_all()
            .iter()
            .flat_map(matrix::expand)
            .collect();

        debug!(
            "Resolved suite {}: {} test(s), {} permutation(s)",
            document.path.display(),
            models.len(),
            permutations.len()
        );

        Ok(Self {
            document,
            settings,
            models,
            permutations,
            scope: Arc::new(scope),
        })
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn path(&self) -> &Path {
        &self.document.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Every resolved test, abstract ones included, in declaration order.
    pub fn models(&self) -> &[Arc<TestModel>] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&Arc<TestModel>> {
        self.models.iter().find(|m| m.name == name)
    }

    /// The tests selected by `criteria`, in declaration order.
    pub fn tests(&self, criteria: &Criteria) -> Vec<Arc<TestModel>> {
        self.models
            .iter()
            .filter(|m| criteria.matches(m))
            .cloned()
            .collect()
    }

    /// Suite-level matrix assignments; one empty assignment without a matrix.
    pub fn permutations(&self) -> &[Map<String, Value>] {
        &self.permutations
    }

    /// Scope holding suite variables and the suite built-ins.
    pub fn scope(&self) -> &Arc<VariableScope> {
        &self.scope
    }
}
