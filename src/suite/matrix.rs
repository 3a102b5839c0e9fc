//! Matrix expansion.
//!
//! A matrix maps axis names to value lists. Its permutations are the
//! cartesian product of the axes taken in name order, with the first axis
//! varying slowest:
//!
//! ```text
//! {arch: [x86, arm], os: [linux, mac]}
//!   0: arch=x86 os=linux
//!   1: arch=x86 os=mac
//!   2: arch=arm os=linux
//!   3: arch=arm os=mac
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::TestModel;

/// All assignments of the matrix, in expansion order.
///
/// No axes yields a single empty assignment.
pub fn permutations(axes: &BTreeMap<String, Vec<Value>>) -> Vec<Map<String, Value>> {
    let mut result = vec![Map::new()];
    for (axis, values) in axes {
        result = result
            .into_iter()
            .flat_map(|partial| {
                values.iter().map(move |value| {
                    let mut next = partial.clone();
                    next.insert(axis.clone(), value.clone());
                    next
                })
            })
            .collect();
    }
    result
}

/// Expands a test with a matrix into one variant per permutation.
///
/// Variants are named `{name}:{index}`, carry their assignment in
/// `matrix_values` and have no matrix of their own. Tests without a matrix,
/// abstract tests and tests that failed to resolve are returned unchanged.
pub fn expand(model: &Arc<TestModel>) -> Vec<Arc<TestModel>> {
    if model.matrix.is_empty() || model.is_abstract || model.error.is_some() {
        return vec![Arc::clone(model)];
    }
    permutations(&model.matrix)
        .into_iter()
        .enumerate()
        .map(|(i, values)| {
            let mut variant = TestModel::clone(model);
            variant.name = format!("{}:{}", model.name, i);
            variant.variant_of = Some(model.name.clone());
            variant.matrix.clear();
            variant.matrix_values = values;
            Arc::new(variant)
        })
        .collect()
}
