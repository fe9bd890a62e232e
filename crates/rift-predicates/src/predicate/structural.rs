//! Field-by-field comparison of an expected tree against a normalized request.

use super::normalize::{try_json, MatchConfig};
use crate::error::Result;
use crate::value::Value;

/// Leaf comparison: `(expected, actual)`, where `actual` is `None` when the
/// field is absent.
pub type LeafFn<'f> = dyn Fn(&Value, Option<&Value>) -> Result<bool> + 'f;

/// Whether every field of `expected` is satisfied by `actual`.
///
/// A falsy or absent `actual` never matches. String actuals that parse as
/// JSON are matched structurally. For each expected field:
///
/// 1. both sides are lists: every expected element must match some actual element
/// 2. only the actual side is a list: `exists` with a truthy expectation is
///    satisfied outright, otherwise some element must match
/// 3. the field is missing but `actual` itself is a list: some element of
///    `actual` must satisfy the whole of `expected`
/// 4. bytes go straight to the leaf comparison
/// 5. mappings and lists recurse
/// 6. anything else is a leaf, with a missing actual read as `""`
pub fn satisfied(
    expected: &Value,
    actual: Option<&Value>,
    config: &MatchConfig<'_>,
    leaf: &LeafFn<'_>,
) -> Result<bool> {
    let actual = match actual {
        Some(value) if value.is_truthy() => value,
        _ => return Ok(false),
    };

    let parsed;
    let actual = match actual {
        Value::String(text) => {
            parsed = try_json(text, config);
            &parsed
        }
        other => other,
    };

    for (key, expected_field) in expected.entries() {
        let actual_field = actual.field(&key);
        let matched = match (expected_field, actual_field) {
            (Value::Array(expected_items), Some(Value::Array(actual_items))) => {
                all_found(expected_items, actual_items, config, leaf)?
            }
            (_, Some(Value::Array(actual_items))) => {
                if config.exists && expected_field.is_truthy() {
                    true
                } else {
                    any_matches(expected_field, actual_items, config, leaf)?
                }
            }
            (_, None) if !expected_field.is_array() && actual.is_array() => {
                let actual_items = actual.as_array().map(Vec::as_slice).unwrap_or_default();
                any_matches(expected, actual_items, config, leaf)?
            }
            (Value::Bytes(_), _) => leaf(expected_field, actual_field)?,
            (Value::Object(_) | Value::Array(_), _) => {
                satisfied(expected_field, actual_field, config, leaf)?
            }
            _ => test_leaf(expected_field, actual_field, config, leaf)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn test_leaf(
    expected: &Value,
    actual: Option<&Value>,
    config: &MatchConfig<'_>,
    leaf: &LeafFn<'_>,
) -> Result<bool> {
    let empty = Value::String(String::new());
    let actual = actual.unwrap_or(&empty);
    if expected.is_structured() {
        satisfied(expected, Some(actual), config, leaf)
    } else {
        leaf(expected, Some(actual))
    }
}

fn all_found(
    expected_items: &[Value],
    actual_items: &[Value],
    config: &MatchConfig<'_>,
    leaf: &LeafFn<'_>,
) -> Result<bool> {
    for expected in expected_items {
        if !any_matches(expected, actual_items, config, leaf)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_matches(
    expected: &Value,
    actual_items: &[Value],
    config: &MatchConfig<'_>,
    leaf: &LeafFn<'_>,
) -> Result<bool> {
    for actual in actual_items {
        if test_leaf(expected, Some(actual), config, leaf)? {
            return Ok(true);
        }
    }
    Ok(false)
}
