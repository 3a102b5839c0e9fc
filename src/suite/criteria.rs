//! Test selection.

use super::TestModel;

#[derive(Debug, Clone)]
pub enum Pattern {
    Regex(regex::Regex),
    Literal(String),
}

impl From<String> for Pattern {
    fn from(x: String) -> Self {
        Pattern::Literal(x)
    }
}

impl From<&str> for Pattern {
    fn from(x: &str) -> Self {
        Pattern::Literal(x.to_string())
    }
}

impl From<regex::Regex> for Pattern {
    fn from(x: regex::Regex) -> Self {
        Pattern::Regex(x)
    }
}

impl Pattern {
    pub fn eval(&self, input: &str) -> bool {
        match self {
            Pattern::Regex(regex) => regex.is_match(input),
            Pattern::Literal(literal) => literal == input,
        }
    }
}

/// Which tests of a suite to list or run.
///
/// A test matches when it is not abstract, matches any name pattern (or no
/// patterns are given), belongs to any requested group (or none are
/// requested) and belongs to no excluded group. A matrix variant also
/// matches patterns written against the test it was expanded from.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    names: Vec<Pattern>,
    groups: Vec<String>,
    exclude_groups: Vec<String>,
}

impl Criteria {
    /// Matches every concrete test.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn name(mut self, pattern: impl Into<Pattern>) -> Self {
        self.names.push(pattern.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn exclude_group(mut self, group: impl Into<String>) -> Self {
        self.exclude_groups.push(group.into());
        self
    }

    pub fn matches(&self, model: &TestModel) -> bool {
        if model.is_abstract {
            return false;
        }
        if !self.names.is_empty() {
            let matched = self.names.iter().any(|p| {
                p.eval(&model.name)
                    || model
                        .variant_of
                        .as_deref()
                        .is_some_and(|parent| p.eval(parent))
            });
            if !matched {
                return false;
            }
        }
        if !self.groups.is_empty() && !model.groups.iter().any(|g| self.groups.contains(g)) {
            return false;
        }
        !model.groups.iter().any(|g| self.exclude_groups.contains(g))
    }
}
