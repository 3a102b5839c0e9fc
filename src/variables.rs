//! Hierarchical variable scopes and `{placeholder}` interpolation.
//!
//! A [`VariableScope`] maps names to JSON-like values and may have a parent
//! scope. Lookups fall back through the parent chain; children never mutate
//! their parents. The suite builds one read-only scope shared by all tests,
//! and every test and step derives a private child from it.
//!
//! # Syntax
//!
//! | Input | Result |
//! |-------|--------|
//! | `{name}` | value of `name` |
//! | `{name.field}` / `{name['key']}` / `{name.['key']}` | map member |
//! | `{name.$[0]}` / `{name[0]}` / `{name.0}` | list element |
//! | `\{` | literal `{` |
//! | `{{` | literal `{`, scanning continues after it |
//!
//! A `{` without a matching `}` and a lone `}` are kept as literal text.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use suiterun::variables::VariableScope;
//!
//! let mut scope = VariableScope::new();
//! scope.set("host", json!("db.local")).unwrap();
//! scope.set("ports", json!([5432, 5433])).unwrap();
//!
//! assert_eq!(
//!     scope.interpolate("{host}:{ports.$[1]}").unwrap(),
//!     "db.local:5433"
//! );
//! assert_eq!(scope.expand("{ports}", None).unwrap(), json!([5432, 5433]));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Map, Value};

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid name pattern"));

/// Origin recorded for values set without an explicit origin.
pub const LOCAL_ORIGIN: &str = "local";

/// Errors raised while setting or expanding variables.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VariableError {
    /// The name (or a path segment below it) does not exist.
    #[error("No such variable: {0}")]
    NoSuchVariable(String),

    /// A name was re-entered while it was still being expanded.
    ///
    /// Holds the chain of names on the expansion stack, ending with the
    /// name that closed the loop.
    #[error("Recursive variable reference: {}", .0.join(" -> "))]
    RecursiveVariable(Vec<String>),

    /// The variable name or reference path is malformed.
    #[error("Invalid variable name or reference: {0:?}")]
    BadVarName(String),

    /// The resolved value's type is not one of the accepted types.
    #[error("Variable {reference} is a {found}, expected {expected}")]
    InvalidVarType {
        reference: String,
        found: ValueType,
        expected: String,
    },
}

/// The type of a variable value, used to constrain expansions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Number,
    Bool,
    Null,
    List,
    Map,
}

impl ValueType {
    /// Returns the type of a value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueType::String,
            Value::Number(_) => ValueType::Number,
            Value::Bool(_) => ValueType::Bool,
            Value::Null => ValueType::Null,
            Value::Array(_) => ValueType::List,
            Value::Object(_) => ValueType::Map,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Bool => "bool",
            ValueType::Null => "null",
            ValueType::List => "list",
            ValueType::Map => "map",
        };
        f.write_str(name)
    }
}

/// Returns true if `name` is a valid variable name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// One step below a variable name in a reference path.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A hierarchical name → value store.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    values: Map<String, Value>,
    origins: HashMap<String, String>,
    parent: Option<Arc<VariableScope>>,
}

impl VariableScope {
    /// Creates an empty root scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty scope whose lookups fall back to `parent`.
    pub fn child(parent: &Arc<VariableScope>) -> Self {
        Self {
            values: Map::new(),
            origins: HashMap::new(),
            parent: Some(Arc::clone(parent)),
        }
    }

    /// Returns the parent scope, if any.
    pub fn parent(&self) -> Option<&Arc<VariableScope>> {
        self.parent.as_ref()
    }

    /// Sets a variable in this scope.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), VariableError> {
        self.set_with_origin(name, value, LOCAL_ORIGIN)
    }

    /// Sets a variable and records where the value came from.
    ///
    /// The origin is informational (e.g. `"suite"`, `"test:build"`,
    /// `"matrix"`) and is reported by [`origin`](Self::origin).
    pub fn set_with_origin(
        &mut self,
        name: &str,
        value: Value,
        origin: &str,
    ) -> Result<(), VariableError> {
        if !is_valid_name(name) {
            return Err(VariableError::BadVarName(name.to_string()));
        }
        self.values.insert(name.to_string(), value);
        self.origins.insert(name.to_string(), origin.to_string());
        Ok(())
    }

    /// Sets every entry of `vars`, stopping at the first invalid name.
    pub fn set_vars<'a, I>(&mut self, vars: I) -> Result<(), VariableError>
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        self.set_vars_with_origin(vars, LOCAL_ORIGIN)
    }

    /// Like [`set_vars`](Self::set_vars) with an explicit origin.
    pub fn set_vars_with_origin<'a, I>(&mut self, vars: I, origin: &str) -> Result<(), VariableError>
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        for (name, value) in vars {
            self.set_with_origin(name, value.clone(), origin)?;
        }
        Ok(())
    }

    /// Returns the raw (unexpanded) value of `name`, searching parents.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(value) => Some(value),
            None => self.parent.as_ref().and_then(|p| p.get(name)),
        }
    }

    /// Returns the origin recorded for `name`, searching parents.
    pub fn origin(&self, name: &str) -> Option<&str> {
        match self.origins.get(name) {
            Some(origin) => Some(origin.as_str()),
            None => self.parent.as_ref().and_then(|p| p.origin(name)),
        }
    }

    /// Returns true if `name` is defined here or in an ancestor.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names defined directly in this scope, in insertion order.
    pub fn local_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Flattens the scope chain into one map (children override parents).
    pub fn flatten(&self) -> Map<String, Value> {
        let mut merged = match &self.parent {
            Some(parent) => parent.flatten(),
            None => Map::new(),
        };
        for (name, value) in &self.values {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    /// Replaces every placeholder in `text` and returns the resulting string.
    pub fn interpolate(&self, text: &str) -> Result<String, VariableError> {
        let mut stack = Vec::new();
        self.interpolate_inner(text, &mut stack)
    }

    /// Looks up a reference path such as `servers.$[0].host`.
    ///
    /// String results are expanded again; list and map results have every
    /// string inside them expanded.
    pub fn resolve(
        &self,
        path: &str,
        allowed: Option<&[ValueType]>,
    ) -> Result<Value, VariableError> {
        let mut stack = Vec::new();
        let value = self.resolve_inner(path, &mut stack)?;
        check_type(path, &value, allowed)?;
        Ok(value)
    }

    /// Expands `input`.
    ///
    /// If `input` consists of exactly one placeholder, the referenced value
    /// is returned with its type intact; otherwise the interpolated string is
    /// returned. When `allowed` is given the result must have one of the
    /// listed types.
    pub fn expand(&self, input: &str, allowed: Option<&[ValueType]>) -> Result<Value, VariableError> {
        let mut stack = Vec::new();
        let value = self.expand_inner(input, &mut stack)?;
        check_type(input, &value, allowed)?;
        Ok(value)
    }

    /// Expands every string inside `value`, keeping its structure.
    pub fn expand_value(&self, value: &Value) -> Result<Value, VariableError> {
        let mut stack = Vec::new();
        self.expand_tree(value, &mut stack)
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    fn expand_inner(&self, input: &str, stack: &mut Vec<String>) -> Result<Value, VariableError> {
        if let Some(path) = single_placeholder(input) {
            return self.resolve_inner(path, stack);
        }
        self.interpolate_inner(input, stack).map(Value::String)
    }

    fn expand_tree(&self, value: &Value, stack: &mut Vec<String>) -> Result<Value, VariableError> {
        match value {
            Value::String(s) => self.expand_inner(s, stack),
            Value::Array(items) => items
                .iter()
                .map(|item| self.expand_tree(item, stack))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut expanded = Map::new();
                for (key, item) in map {
                    expanded.insert(key.clone(), self.expand_tree(item, stack)?);
                }
                Ok(Value::Object(expanded))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_inner(&self, path: &str, stack: &mut Vec<String>) -> Result<Value, VariableError> {
        let (name, segments) = parse_path(path)?;

        if stack.iter().any(|entry| entry == &name) {
            let mut chain = stack.clone();
            chain.push(name);
            return Err(VariableError::RecursiveVariable(chain));
        }

        let root = self
            .lookup(&name)
            .ok_or_else(|| VariableError::NoSuchVariable(name.clone()))?;
        let target = navigate(root, &segments, path)?;

        stack.push(name);
        let expanded = self.expand_tree(target, stack);
        stack.pop();
        expanded
    }

    fn interpolate_inner(&self, text: &str, stack: &mut Vec<String>) -> Result<String, VariableError> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();

        while let Some((idx, ch)) = chars.next() {
            match ch {
                '\\' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    out.push('{');
                }
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    out.push('{');
                }
                '{' => {
                    let body_start = idx + 1;
                    let Some(len) = text[body_start..].find('}') else {
                        // Unterminated: keep the remainder verbatim.
                        out.push_str(&text[idx..]);
                        break;
                    };
                    let close = body_start + len;
                    let value = self.resolve_inner(&text[body_start..close], stack)?;
                    out.push_str(&render(&value));
                    while let Some((pos, _)) = chars.next() {
                        if pos == close {
                            break;
                        }
                    }
                }
                other => out.push(other),
            }
        }

        Ok(out)
    }
}

/// Renders a value for inclusion in interpolated text.
///
/// Strings are inserted verbatim; everything else as compact JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn single_placeholder(input: &str) -> Option<&str> {
    let inner = input.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains(['{', '}']) {
        None
    } else {
        Some(inner)
    }
}

fn check_type(
    reference: &str,
    value: &Value,
    allowed: Option<&[ValueType]>,
) -> Result<(), VariableError> {
    let Some(allowed) = allowed else {
        return Ok(());
    };
    let found = ValueType::of(value);
    if allowed.contains(&found) {
        return Ok(());
    }
    Err(VariableError::InvalidVarType {
        reference: reference.to_string(),
        found,
        expected: allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" or "),
    })
}

fn navigate<'v>(root: &'v Value, segments: &[Segment], path: &str) -> Result<&'v Value, VariableError> {
    let missing = || VariableError::NoSuchVariable(path.to_string());
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key).ok_or_else(missing)?,
            (Segment::Key(key), Value::Array(items)) => {
                let idx: usize = key.parse().map_err(|_| missing())?;
                items.get(idx).ok_or_else(missing)?
            }
            (Segment::Index(idx), Value::Array(items)) => items.get(*idx).ok_or_else(missing)?,
            _ => return Err(missing()),
        };
    }
    Ok(current)
}

/// Splits a reference path into its variable name and member segments.
fn parse_path(path: &str) -> Result<(String, Vec<Segment>), VariableError> {
    let bad = || VariableError::BadVarName(path.to_string());
    let trimmed = path.trim();

    let name_len = trimmed
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(trimmed.len());
    let name = &trimmed[..name_len];
    if !is_valid_name(name) {
        return Err(bad());
    }

    let mut segments = Vec::new();
    let mut rest = &trimmed[name_len..];
    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            if let Some(after_dollar) = after_dot.strip_prefix('$') {
                let (segment, remaining) = parse_bracket(after_dollar).ok_or_else(bad)?;
                segments.push(segment);
                rest = remaining;
            } else if after_dot.starts_with('[') {
                let (segment, remaining) = parse_bracket(after_dot).ok_or_else(bad)?;
                segments.push(segment);
                rest = remaining;
            } else {
                let len = after_dot
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
                    .unwrap_or(after_dot.len());
                if len == 0 {
                    return Err(bad());
                }
                segments.push(Segment::Key(after_dot[..len].to_string()));
                rest = &after_dot[len..];
            }
        } else if rest.starts_with('[') {
            let (segment, remaining) = parse_bracket(rest).ok_or_else(bad)?;
            segments.push(segment);
            rest = remaining;
        } else {
            return Err(bad());
        }
    }

    Ok((name.to_string(), segments))
}

/// Parses `[3]`, `['key']` or `["key"]` at the start of `input`.
fn parse_bracket(input: &str) -> Option<(Segment, &str)> {
    let inner = input.strip_prefix('[')?;
    for quote in ['\'', '"'] {
        if let Some(quoted) = inner.strip_prefix(quote) {
            let end = quoted.find(quote)?;
            let remaining = quoted[end + 1..].strip_prefix(']')?;
            return Some((Segment::Key(quoted[..end].to_string()), remaining));
        }
    }
    let end = inner.find(']')?;
    let idx = inner[..end].trim().parse().ok()?;
    Some((Segment::Index(idx), &inner[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_with(pairs: &[(&str, Value)]) -> VariableScope {
        let mut scope = VariableScope::new();
        for (name, value) in pairs {
            scope.set(name, value.clone()).unwrap();
        }
        scope
    }

    #[test]
    fn test_simple_substitution() {
        let scope = scope_with(&[("a", json!("x"))]);
        assert_eq!(scope.expand("{a}", None).unwrap(), json!("x"));
        assert_eq!(scope.interpolate("pre-{a}-post").unwrap(), "pre-x-post");
    }

    #[test]
    fn test_escaped_brace_is_literal() {
        let scope = scope_with(&[("a", json!("x"))]);
        assert_eq!(scope.expand("\\{a}", None).unwrap(), json!("{a}"));
    }

    #[test]
    fn test_doubled_brace() {
        let scope = scope_with(&[("a", json!("x"))]);
        let doubled = scope.interpolate("{{a}").unwrap();
        let tail = scope.interpolate("a}").unwrap();
        assert_eq!(doubled, format!("{{{}", tail));
        assert_eq!(doubled, "{a}");
        assert_eq!(scope.interpolate("{{{a}").unwrap(), "{x");
    }

    #[test]
    fn test_unterminated_brace_is_literal() {
        let scope = scope_with(&[("a", json!("x"))]);
        assert_eq!(scope.interpolate("{a} and {b").unwrap(), "x and {b");
        assert_eq!(scope.interpolate("a } b").unwrap(), "a } b");
    }

    #[test]
    fn test_recursive_expansion() {
        let scope = scope_with(&[
            ("root", json!("/srv")),
            ("data", json!("{root}/data")),
            ("cache", json!("{data}/cache")),
        ]);
        assert_eq!(scope.interpolate("{cache}").unwrap(), "/srv/data/cache");
    }

    #[test]
    fn test_cycle_detection_and_recovery() {
        let mut scope = scope_with(&[
            ("v1", json!("{v3} x")),
            ("v2", json!("{v1} y")),
            ("v3", json!("{v2} z")),
        ]);

        let err = scope.expand("{v3}", None).unwrap_err();
        match err {
            VariableError::RecursiveVariable(chain) => {
                assert_eq!(chain.first().map(String::as_str), Some("v3"));
                assert_eq!(chain.last().map(String::as_str), Some("v3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let fix = Map::from_iter([("v1".to_string(), json!("value1"))]);
        scope.set_vars(&fix).unwrap();
        assert_eq!(scope.expand("{v3}", None).unwrap(), json!("value1 y z"));
        assert_eq!(scope.expand("{v3}", None).unwrap(), json!("value1 y z"));
    }

    #[test]
    fn test_same_variable_twice_is_not_a_cycle() {
        let scope = scope_with(&[("a", json!("x")), ("b", json!("{a}{a}"))]);
        assert_eq!(scope.interpolate("{b}-{a}").unwrap(), "xx-x");
    }

    #[test]
    fn test_missing_variable() {
        let scope = VariableScope::new();
        assert_eq!(
            scope.interpolate("{nope}").unwrap_err(),
            VariableError::NoSuchVariable("nope".to_string())
        );
    }

    #[test]
    fn test_path_lookups() {
        let scope = scope_with(&[(
            "cfg",
            json!({"servers": [{"host": "a"}, {"host": "b"}], "my-key": 3}),
        )]);
        assert_eq!(scope.interpolate("{cfg.servers.$[1].host}").unwrap(), "b");
        assert_eq!(scope.interpolate("{cfg.servers[0].host}").unwrap(), "a");
        assert_eq!(scope.interpolate("{cfg.servers.0.host}").unwrap(), "a");
        assert_eq!(scope.interpolate("{cfg.['my-key']}").unwrap(), "3");
        assert_eq!(scope.interpolate("{cfg[\"my-key\"]}").unwrap(), "3");
        assert_eq!(
            scope.resolve("cfg.servers.$[0]", None).unwrap(),
            json!({"host": "a"})
        );
    }

    #[test]
    fn test_bad_paths_are_missing_variables() {
        let scope = scope_with(&[("cfg", json!({"list": [1, 2], "n": 5}))]);
        for path in ["cfg.nope", "cfg.list.$[9]", "cfg.n.field", "cfg.n[0]"] {
            assert!(
                matches!(
                    scope.resolve(path, None),
                    Err(VariableError::NoSuchVariable(_))
                ),
                "{path} should be missing"
            );
        }
    }

    #[test]
    fn test_bad_names() {
        let mut scope = VariableScope::new();
        assert!(matches!(
            scope.set("1abc", json!(1)),
            Err(VariableError::BadVarName(_))
        ));
        assert!(matches!(
            scope.set("a-b", json!(1)),
            Err(VariableError::BadVarName(_))
        ));
        assert!(matches!(
            scope.interpolate("awk '{print $1}'"),
            Err(VariableError::BadVarName(_))
        ));
        assert_eq!(scope.interpolate("awk '\\{print $1}'").unwrap(), "awk '{print $1}'");
    }

    #[test]
    fn test_typed_expansion() {
        let scope = scope_with(&[("port", json!(8080)), ("url", json!("http://h:{port}"))]);
        assert_eq!(scope.expand("{port}", None).unwrap(), json!(8080));
        assert_eq!(
            scope
                .expand("{port}", Some(&[ValueType::Number]))
                .unwrap(),
            json!(8080)
        );
        assert!(matches!(
            scope.expand("{url}", Some(&[ValueType::Number, ValueType::Bool])),
            Err(VariableError::InvalidVarType {
                found: ValueType::String,
                ..
            })
        ));
    }

    #[test]
    fn test_scope_shadowing_and_visibility() {
        let mut root = VariableScope::new();
        root.set("shared", json!("root")).unwrap();
        root.set("only_root", json!("r")).unwrap();
        let root = Arc::new(root);

        let mut child = VariableScope::child(&root);
        child.set("shared", json!("child")).unwrap();
        let child = Arc::new(child);

        let mut grandchild = VariableScope::child(&child);
        grandchild.set("deep", json!("g")).unwrap();

        let sibling = VariableScope::child(&root);

        assert_eq!(child.interpolate("{shared}/{only_root}").unwrap(), "child/r");
        assert_eq!(grandchild.interpolate("{shared}-{deep}").unwrap(), "child-g");
        assert!(root.get("deep").is_none());
        assert!(child.get("deep").is_none());
        assert!(sibling.get("deep").is_none());
        assert_eq!(sibling.interpolate("{shared}").unwrap(), "root");
    }

    #[test]
    fn test_parent_template_sees_child_values() {
        let mut root = VariableScope::new();
        root.set("out", json!("/tmp/{test_name}")).unwrap();
        let root = Arc::new(root);

        let mut child = VariableScope::child(&root);
        child.set("test_name", json!("build")).unwrap();
        assert_eq!(child.interpolate("{out}").unwrap(), "/tmp/build");
    }

    #[test]
    fn test_expand_value_tree() {
        let scope = scope_with(&[("who", json!("world")), ("n", json!(2))]);
        let tree = json!({"greeting": "hello {who}", "count": "{n}", "list": ["{who}", 1]});
        assert_eq!(
            scope.expand_value(&tree).unwrap(),
            json!({"greeting": "hello world", "count": 2, "list": ["world", 1]})
        );
    }

    #[test]
    fn test_origin_tracking() {
        let mut root = VariableScope::new();
        root.set_with_origin("a", json!(1), "suite").unwrap();
        let root = Arc::new(root);
        let mut child = VariableScope::child(&root);
        child.set("b", json!(2)).unwrap();
        assert_eq!(child.origin("a"), Some("suite"));
        assert_eq!(child.origin("b"), Some(LOCAL_ORIGIN));
        assert_eq!(child.flatten().len(), 2);
    }
}
