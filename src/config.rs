//! Suite file loading, include resolution and run settings.
//!
//! A suite is one root file plus every file it (transitively) includes. The
//! [`ConfigResolver`] loads them depth-first into a single [`Document`]:
//!
//! ```text
//! main.yaml ──include──► common/steps.yaml ──include──► defaults.toml
//!          └─include──► boards.json
//! ```
//!
//! Definitions merge with the including file first and its includes after it,
//! in listed order. The first definition of a test, named step, variable,
//! setting, pool or matrix axis wins; later ones are dropped with a warning.
//!
//! # Formats
//!
//! The format is picked from the file extension: `.yaml`/`.yml`, `.json`,
//! `.toml`. Anything else is read as YAML.

pub mod schema;

pub use schema::*;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::resource::Unit;
use crate::suite::Suite;
use crate::variables::VariableError;

/// Errors raised while loading a suite.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Bad include '{include}' in {}: {message}", .path.display())]
    BadInclude {
        path: PathBuf,
        include: String,
        message: String,
    },

    #[error("Include loop: {}", display_chain(.chain))]
    IncludeLoop { chain: Vec<PathBuf> },

    #[error("Duplicate {kind} '{name}' in {}", .path.display())]
    DuplicateName {
        kind: &'static str,
        name: String,
        path: PathBuf,
    },

    #[error("Invalid document {}: {message}", .path.display())]
    InvalidDocument { path: PathBuf, message: String },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error(transparent)]
    Variable(#[from] VariableError),
}

fn display_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// On-disk format of a suite file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
    Toml,
}

impl Format {
    /// Picks the format from the file extension, defaulting to YAML.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => Format::Json,
            Some("toml") => Format::Toml,
            _ => Format::Yaml,
        }
    }

    /// Parses one document in this format.
    ///
    /// `origin` only labels errors.
    pub fn parse(self, content: &str, origin: &Path) -> Result<RawDocument, ConfigError> {
        if content.trim().is_empty() {
            return Ok(RawDocument::default());
        }
        let parse_err = |message: String| ConfigError::Parse {
            path: origin.to_path_buf(),
            message,
        };
        match self {
            Format::Yaml => serde_yaml_ng::from_str(content).map_err(|e| parse_err(e.to_string())),
            Format::Json => serde_json::from_str(content).map_err(|e| parse_err(e.to_string())),
            Format::Toml => toml::from_str(content).map_err(|e| parse_err(e.to_string())),
        }
    }
}

/// A suite with every include merged in.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// The root file.
    pub path: PathBuf,
    pub tests: Vec<TestDesc>,
    pub steps: Vec<StepDesc>,
    pub variables: Map<String, Value>,
    pub settings: Map<String, Value>,
    pub resources: BTreeMap<String, Vec<Unit>>,
    pub matrix: BTreeMap<String, Vec<Value>>,
    /// Every file that contributed, in load order.
    pub sources: Vec<PathBuf>,
    step_sources: HashMap<String, PathBuf>,
}

impl Document {
    fn from_raw(raw: RawDocument, path: &Path) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut tests = Vec::with_capacity(raw.tests.len());
        for mut test in raw.tests {
            if test.name.is_empty() {
                return Err(ConfigError::InvalidDocument {
                    path: path.to_path_buf(),
                    message: "test without a name".to_string(),
                });
            }
            if !seen.insert(test.name.clone()) {
                return Err(ConfigError::DuplicateName {
                    kind: "test",
                    name: test.name,
                    path: path.to_path_buf(),
                });
            }
            test.source = Some(path.to_path_buf());
            tests.push(test);
        }

        let mut step_sources = HashMap::new();
        for step in &raw.steps {
            let Some(name) = &step.name else {
                return Err(ConfigError::InvalidDocument {
                    path: path.to_path_buf(),
                    message: "library step without a name".to_string(),
                });
            };
            if step_sources.insert(name.clone(), path.to_path_buf()).is_some() {
                return Err(ConfigError::DuplicateName {
                    kind: "step",
                    name: name.clone(),
                    path: path.to_path_buf(),
                });
            }
        }

        let mut resources = BTreeMap::new();
        for (pool, descs) in &raw.resources {
            let units: Vec<Unit> = descs.iter().map(UnitDesc::to_unit).collect();
            let mut seen = HashSet::new();
            if let Some(dup) = units.iter().find(|u| !seen.insert(u.name.as_str())) {
                return Err(ConfigError::DuplicateName {
                    kind: "unit",
                    name: format!("{}.{}", pool, dup.name),
                    path: path.to_path_buf(),
                });
            }
            resources.insert(pool.clone(), units);
        }

        Ok(Self {
            path: path.to_path_buf(),
            tests,
            steps: raw.steps,
            variables: raw.variables,
            settings: raw.settings,
            resources,
            matrix: raw.matrix,
            sources: vec![path.to_path_buf()],
            step_sources,
        })
    }

    /// Merges an included document; definitions already present win.
    fn absorb(&mut self, other: Document) {
        for test in other.tests {
            match self.tests.iter().find(|t| t.name == test.name) {
                Some(existing) if existing.source == test.source => {}
                Some(existing) => warn!(
                    "Test '{}' from {} is shadowed by the definition in {}",
                    test.name,
                    display_source(&test.source),
                    display_source(&existing.source)
                ),
                None => self.tests.push(test),
            }
        }

        for step in other.steps {
            let Some(name) = step.name.clone() else {
                continue;
            };
            let source = other.step_sources.get(&name).cloned().unwrap_or_default();
            match self.step_sources.get(&name) {
                Some(existing) if *existing == source => {}
                Some(existing) => warn!(
                    "Step '{}' from {} is shadowed by the definition in {}",
                    name,
                    source.display(),
                    existing.display()
                ),
                None => {
                    self.step_sources.insert(name, source);
                    self.steps.push(step);
                }
            }
        }

        for (key, value) in other.variables {
            self.variables.entry(key).or_insert(value);
        }
        for (key, value) in other.settings {
            self.settings.entry(key).or_insert(value);
        }
        for (key, units) in other.resources {
            self.resources.entry(key).or_insert(units);
        }
        for (key, values) in other.matrix {
            self.matrix.entry(key).or_insert(values);
        }
        for source in other.sources {
            if !self.sources.contains(&source) {
                self.sources.push(source);
            }
        }
    }

    pub fn test(&self, name: &str) -> Option<&TestDesc> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// Looks up a step of the named step library.
    pub fn step(&self, name: &str) -> Option<&StepDesc> {
        self.steps.iter().find(|s| s.name.as_deref() == Some(name))
    }

    /// Directory of the root file.
    pub fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Types the merged settings after applying `overrides` key-wise.
    ///
    /// Override values are parsed as JSON when possible (`4`, `true`,
    /// `[1,2]`) and used as plain strings otherwise.
    pub fn settings_with(&self, overrides: &BTreeMap<String, String>) -> Result<Settings, ConfigError> {
        let mut merged = self.settings.clone();
        for (key, raw) in overrides {
            merged.insert(key.clone(), parse_override(raw));
        }
        let settings: Settings = serde_json::from_value(Value::Object(merged))
            .map_err(|e| ConfigError::InvalidSettings(e.to_string()))?;
        if settings.threads == 0 {
            return Err(ConfigError::InvalidSettings(
                "threads must be at least 1".to_string(),
            ));
        }
        if settings.iterations == 0 {
            return Err(ConfigError::InvalidSettings(
                "iterations must be at least 1".to_string(),
            ));
        }
        for (key, secs) in [
            ("step_timeout_secs", settings.step_timeout_secs),
            ("resource_timeout_secs", settings.resource_timeout_secs),
        ] {
            if secs.is_some_and(|s| !s.is_finite() || s < 0.0) {
                return Err(ConfigError::InvalidSettings(format!(
                    "{key} must be a non-negative number"
                )));
            }
        }
        Ok(settings)
    }
}

fn display_source(source: &Option<PathBuf>) -> String {
    source
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<memory>".to_string())
}

/// Parses a command-line setting value.
pub fn parse_override(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Loads suite files and their includes.
#[derive(Debug, Default)]
pub struct ConfigResolver {
    /// Canonical paths of the files currently being loaded.
    stack: Vec<PathBuf>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path` and everything it includes.
    pub fn resolve(&mut self, path: &Path) -> Result<Document, ConfigError> {
        self.stack.clear();
        self.load(path)
    }

    /// Loads a document held in memory.
    ///
    /// Includes are resolved relative to `base_dir`.
    pub fn resolve_str(
        &mut self,
        content: &str,
        format: Format,
        base_dir: &Path,
    ) -> Result<Document, ConfigError> {
        self.stack.clear();
        let origin = base_dir.join("<memory>");
        let raw = format.parse(content, &origin)?;
        self.assemble(raw, &origin)
    }

    fn load(&mut self, path: &Path) -> Result<Document, ConfigError> {
        let canonical = path.canonicalize().map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(pos) = self.stack.iter().position(|p| *p == canonical) {
            let mut chain = self.stack[pos..].to_vec();
            chain.push(canonical);
            return Err(ConfigError::IncludeLoop { chain });
        }

        self.stack.push(canonical.clone());
        let result = self.load_file(&canonical);
        self.stack.pop();
        result
    }

    fn load_file(&mut self, path: &Path) -> Result<Document, ConfigError> {
        debug!("Loading suite file {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw = Format::from_path(path).parse(&content, path)?;
        self.assemble(raw, path)
    }

    fn assemble(&mut self, mut raw: RawDocument, path: &Path) -> Result<Document, ConfigError> {
        let includes = std::mem::take(&mut raw.include);
        let mut doc = Document::from_raw(raw, path)?;
        for include in &includes {
            let include_path = include_path(path, include)?;
            let included = self.load(&include_path)?;
            doc.absorb(included);
        }
        Ok(doc)
    }
}

/// Expands `~`/`$VAR` in an include and anchors it at the including file.
fn include_path(including: &Path, include: &str) -> Result<PathBuf, ConfigError> {
    let expanded = shellexpand::full(include).map_err(|e| ConfigError::BadInclude {
        path: including.to_path_buf(),
        include: include.to_string(),
        message: e.to_string(),
    })?;
    let candidate = PathBuf::from(expanded.as_ref());
    if candidate.is_absolute() {
        return Ok(candidate);
    }
    let dir = including.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(candidate))
}

/// Cache key: a suite file plus the settings overrides it was resolved with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuiteKey {
    pub path: PathBuf,
    pub overrides: BTreeMap<String, String>,
}

impl SuiteKey {
    pub fn new(path: &Path, overrides: &BTreeMap<String, String>) -> Self {
        Self {
            path: path.canonicalize().unwrap_or_else(|_| path.to_path_buf()),
            overrides: overrides.clone(),
        }
    }
}

/// Resolved suites, keyed by [`SuiteKey`].
#[derive(Debug, Default)]
pub struct SuiteCache {
    suites: Mutex<HashMap<SuiteKey, Arc<Suite>>>,
}

impl SuiteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached suite or resolves and caches it.
    ///
    /// Failed resolutions are not cached.
    pub fn get_or_resolve(
        &self,
        path: &Path,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Arc<Suite>, ConfigError> {
        let key = SuiteKey::new(path, overrides);
        if let Some(suite) = self.lock().get(&key) {
            debug!("Suite cache hit for {}", key.path.display());
            return Ok(Arc::clone(suite));
        }

        let suite = Arc::new(Suite::resolve_with(path, overrides)?);
        let mut suites = self.lock();
        let entry = suites.entry(key).or_insert(suite);
        Ok(Arc::clone(entry))
    }

    /// Drops every cached resolution of `path`.
    pub fn invalidate(&self, path: &Path) {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.lock().retain(|key, _| key.path != path);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SuiteKey, Arc<Suite>>> {
        self.suites.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
