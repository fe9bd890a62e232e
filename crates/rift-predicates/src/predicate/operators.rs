//! Field operators and the `inject` escape hatch.
//!
//! Each field operator normalizes both sides with the predicate's modifiers
//! and hands a leaf comparison to the structural matcher. `deepEquals` is
//! the exception: it compares whole fields by canonical serialization.

use super::normalize::{compile_regex, normalize, try_json, MatchConfig, NormalizeOptions};
use super::safe_regex::warn_if_unsafe;
use super::structural::{satisfied, LeafFn};
use super::types::PredicateOptions;
use crate::error::{PredicateError, Result};
use crate::scripting::{ImposterState, InjectionContext, InjectionEngine};
use crate::value::Value;
use tracing::error;

pub fn equals(
    expected: &Value,
    options: &PredicateOptions,
    request: &Value,
    regex_size_limit: usize,
) -> Result<bool> {
    let config = MatchConfig::from_options(options, regex_size_limit)?;
    compare(expected, request, &config, &|expected, actual| {
        Ok(match (expected, actual) {
            (Value::Bytes(expected), Some(Value::Bytes(actual))) => expected == actual,
            (Value::Bytes(_), _) => false,
            _ => expected.to_display_string() == actual.and_then(Value::to_display_string),
        })
    })
}

pub fn contains(
    expected: &Value,
    options: &PredicateOptions,
    request: &Value,
    regex_size_limit: usize,
) -> Result<bool> {
    let config = MatchConfig::from_options(options, regex_size_limit)?;
    compare(expected, request, &config, &|expected, actual| {
        Ok(text_test(expected, actual, |e, a| a.contains(e), |e, a| {
            e.is_empty() || a.windows(e.len()).any(|w| w == e)
        }))
    })
}

pub fn starts_with(
    expected: &Value,
    options: &PredicateOptions,
    request: &Value,
    regex_size_limit: usize,
) -> Result<bool> {
    let config = MatchConfig::from_options(options, regex_size_limit)?;
    compare(expected, request, &config, &|expected, actual| {
        Ok(text_test(
            expected,
            actual,
            |e, a| a.starts_with(e),
            |e, a| a.starts_with(e),
        ))
    })
}

pub fn ends_with(
    expected: &Value,
    options: &PredicateOptions,
    request: &Value,
    regex_size_limit: usize,
) -> Result<bool> {
    let config = MatchConfig::from_options(options, regex_size_limit)?;
    compare(expected, request, &config, &|expected, actual| {
        Ok(text_test(
            expected,
            actual,
            |e, a| a.ends_with(e),
            |e, a| a.ends_with(e),
        ))
    })
}

pub fn exists(
    expected: &Value,
    options: &PredicateOptions,
    request: &Value,
    regex_size_limit: usize,
) -> Result<bool> {
    let config = MatchConfig::from_options(options, regex_size_limit)?.for_exists();
    compare(expected, request, &config, &|expected, actual| {
        let present = match actual {
            None => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        };
        Ok(if expected.is_truthy() { present } else { !present })
    })
}

/// Strict whole-field equality after coercing every leaf to a string.
pub fn deep_equals(
    expected: &Value,
    options: &PredicateOptions,
    request: &Value,
    regex_size_limit: usize,
) -> Result<bool> {
    if expected.field("body").is_some_and(Value::is_bytes) {
        return Err(PredicateError::validation(
            "deepEquals does not make sense with a binary body",
        ));
    }

    let config = MatchConfig::from_options(options, regex_size_limit)?;
    let expected = normalize(&expected.force_strings(), &config, NormalizeOptions::default())?;
    let actual = normalize(
        &request.force_strings(),
        &config,
        NormalizeOptions {
            with_selectors: true,
            force_strings: true,
            binary_body: false,
        },
    )?;

    for (key, expected_field) in expected.entries() {
        let actual_field = match actual.field(&key) {
            Some(Value::String(text)) if expected_field.is_structured() => {
                let parsed = try_json(text, &config).force_strings();
                Some(normalize(&parsed, &config, NormalizeOptions::default())?)
            }
            other => other.cloned(),
        };
        let equal = actual_field.is_some_and(|actual| actual.canonical() == expected_field.canonical());
        if !equal {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Regular expression match. Patterns keep their case; only the match flag
/// follows `caseSensitive`. `except` applies to the request side only.
pub fn matches(
    expected: &Value,
    options: &PredicateOptions,
    request: &Value,
    regex_size_limit: usize,
) -> Result<bool> {
    let case_sensitive = options.case_sensitive.unwrap_or(false);

    if let Some(Value::String(body)) = expected.field("body") {
        if !body.is_empty() && expected.field("bodyEncoding").is_none() {
            return Err(PredicateError::validation(
                "the matches predicate is not allowed for binary bodies",
            ));
        }
    }

    let config = MatchConfig::build(options, true, case_sensitive, regex_size_limit)?;
    let expected = normalize(expected, &config.without_except(), NormalizeOptions::default())?;
    let actual = normalize(request, &config, NormalizeOptions::request())?;

    satisfied(&expected, Some(&actual), &config, &|pattern, actual| {
        let pattern = pattern.to_display_string().unwrap_or_default();
        warn_if_unsafe(&pattern);
        let regex = compile_regex(&pattern, !case_sensitive, regex_size_limit)?;
        let subject = actual
            .and_then(Value::to_display_string)
            .unwrap_or_default();
        Ok(regex.is_match(&subject))
    })
}

/// Run an injected script. Dry runs short-circuit to `true` without
/// touching the script or the state.
pub fn inject(
    source: &str,
    request: &Value,
    state: &ImposterState,
    engine: &dyn InjectionEngine,
    allowed: bool,
) -> Result<bool> {
    if !allowed {
        return Err(PredicateError::validation_with_node(
            "inject predicates are disabled; enable allowInjection to use them",
            serde_json::json!({ "inject": source }),
        ));
    }

    if matches!(request.field("isDryRun"), Some(Value::Bool(true))) {
        return Ok(true);
    }

    let context = InjectionContext { request, state };
    engine.execute(source, &context).map_err(|failure| {
        error!("injection X=> {}", failure);
        error!("    source: {}", serde_json::Value::String(source.to_string()));
        error!("    config.request: {}", request.to_json());
        error!("    config.state: {}", state.to_json());
        PredicateError::Injection {
            message: "invalid predicate injection".to_string(),
            script: source.to_string(),
            details: failure.to_string(),
        }
    })
}

/// Normalize both sides and run the structural matcher. Bodies are compared
/// as bytes when both are strings and either side lacks a declared encoding.
fn compare(
    expected: &Value,
    request: &Value,
    config: &MatchConfig<'_>,
    leaf: &LeafFn<'_>,
) -> Result<bool> {
    let binary_body = is_binary_body(expected, request);
    let expected = normalize(
        expected,
        config,
        NormalizeOptions {
            binary_body,
            ..NormalizeOptions::default()
        },
    )?;
    let actual = normalize(
        request,
        config,
        NormalizeOptions {
            binary_body,
            ..NormalizeOptions::request()
        },
    )?;
    satisfied(&expected, Some(&actual), config, leaf)
}

fn is_binary_body(expected: &Value, request: &Value) -> bool {
    let both_text = matches!(
        (expected.field("body"), request.field("body")),
        (Some(Value::String(_)), Some(Value::String(_)))
    );
    both_text
        && (expected.field("bodyEncoding").is_none() || request.field("bodyEncoding").is_none())
}

/// Substring-style leaf test. Byte expectations only match byte actuals.
fn text_test(
    expected: &Value,
    actual: Option<&Value>,
    text: impl Fn(&str, &str) -> bool,
    bytes: impl Fn(&[u8], &[u8]) -> bool,
) -> bool {
    match (expected, actual) {
        (Value::Bytes(e), Some(Value::Bytes(a))) => bytes(e, a),
        (Value::Bytes(_), _) | (_, Some(Value::Bytes(_))) => false,
        _ => match (
            expected.to_display_string(),
            actual.and_then(Value::to_display_string),
        ) {
            (Some(e), Some(a)) => text(&e, &a),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::types::Predicate;
    use serde_json::json;

    const LIMIT: usize = 1 << 20;

    fn opts(node: serde_json::Value) -> PredicateOptions {
        let mut node = node;
        node["equals"] = json!({});
        Predicate::parse(&node).unwrap().options
    }

    fn v(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    #[test]
    fn test_equals_case_insensitive_by_default() {
        let request = v(json!({"headers": {"host": "example.com"}}));
        let expected = v(json!({"headers": {"Host": "EXAMPLE.com"}}));
        assert!(equals(&expected, &PredicateOptions::default(), &request, LIMIT).unwrap());
        assert!(!equals(&expected, &opts(json!({"caseSensitive": true})), &request, LIMIT).unwrap());
    }

    #[test]
    fn test_equals_with_except() {
        let request = v(json!({"path": "/orders/123"}));
        let expected = v(json!({"path": "/orders/"}));
        assert!(equals(&expected, &opts(json!({"except": "\\d+"})), &request, LIMIT).unwrap());
    }

    #[test]
    fn test_equals_binary_body() {
        let request = v(json!({"body": "AQID"}));
        assert!(equals(&v(json!({"body": "AQID"})), &PredicateOptions::default(), &request, LIMIT).unwrap());
        assert!(!equals(&v(json!({"body": "AQIE"})), &PredicateOptions::default(), &request, LIMIT).unwrap());
    }

    #[test]
    fn test_equals_text_body_with_encodings() {
        let request = v(json!({"body": "Hello", "bodyEncoding": "utf8"}));
        let expected = v(json!({"body": "hello", "bodyEncoding": "utf8"}));
        assert!(equals(&expected, &PredicateOptions::default(), &request, LIMIT).unwrap());
    }

    #[test]
    fn test_contains_starts_ends() {
        let request = v(json!({"path": "/api/v1/users"}));
        let none = PredicateOptions::default();
        assert!(contains(&v(json!({"path": "v1"})), &none, &request, LIMIT).unwrap());
        assert!(!contains(&v(json!({"path": "v2"})), &none, &request, LIMIT).unwrap());
        assert!(starts_with(&v(json!({"path": "/API"})), &none, &request, LIMIT).unwrap());
        assert!(!starts_with(&v(json!({"path": "users"})), &none, &request, LIMIT).unwrap());
        assert!(ends_with(&v(json!({"path": "users"})), &none, &request, LIMIT).unwrap());
        assert!(!ends_with(&v(json!({"path": "/api"})), &none, &request, LIMIT).unwrap());
    }

    #[test]
    fn test_contains_binary_body() {
        let request = v(json!({"body": "AAECAwQ="}));
        let expected = v(json!({"body": "AgM="}));
        assert!(contains(&expected, &PredicateOptions::default(), &request, LIMIT).unwrap());
    }

    #[test]
    fn test_exists() {
        let request = v(json!({"query": {"q": "rust", "empty": ""}, "headers": {}}));
        let none = PredicateOptions::default();
        assert!(exists(&v(json!({"query": {"q": true}})), &none, &request, LIMIT).unwrap());
        assert!(!exists(&v(json!({"query": {"empty": true}})), &none, &request, LIMIT).unwrap());
        assert!(exists(&v(json!({"query": {"missing": false}})), &none, &request, LIMIT).unwrap());
        assert!(!exists(&v(json!({"query": {"q": false}})), &none, &request, LIMIT).unwrap());
    }

    #[test]
    fn test_exists_true_with_empty_list() {
        let request = v(json!({"query": {"tags": []}}));
        let expected = v(json!({"query": {"tags": true}}));
        assert!(exists(&expected, &PredicateOptions::default(), &request, LIMIT).unwrap());
    }

    #[test]
    fn test_deep_equals_coerces_types() {
        let request = v(json!({"query": {"id": 5}}));
        let expected = v(json!({"query": {"id": "5"}}));
        assert!(deep_equals(&expected, &PredicateOptions::default(), &request, LIMIT).unwrap());
    }

    #[test]
    fn test_deep_equals_is_whole_value() {
        let request = v(json!({"query": {"a": "1", "b": "2"}}));
        let none = PredicateOptions::default();
        assert!(!deep_equals(&v(json!({"query": {"a": "1"}})), &none, &request, LIMIT).unwrap());
        assert!(deep_equals(&v(json!({"query": {"b": "2", "a": "1"}})), &none, &request, LIMIT).unwrap());
        assert!(deep_equals(&v(json!({"query": {}})), &none, &v(json!({"query": {}})), LIMIT).unwrap());
    }

    #[test]
    fn test_deep_equals_json_body() {
        let request = v(json!({"body": r#"{"Name": "Ada", "tags": ["y", "x"]}"#}));
        let expected = v(json!({"body": {"name": "ada", "tags": ["x", "y"]}}));
        assert!(deep_equals(&expected, &PredicateOptions::default(), &request, LIMIT).unwrap());
    }

    #[test]
    fn test_deep_equals_rejects_binary_body() {
        let expected = Value::Object(
            [("body".to_string(), Value::Bytes(vec![1]))]
                .into_iter()
                .collect(),
        );
        let err = deep_equals(&expected, &PredicateOptions::default(), &v(json!({})), LIMIT)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_matches_keeps_pattern_case() {
        let request = v(json!({"path": "/USERS/42"}));
        let expected = v(json!({"path": "/Users/\\d+"}));
        assert!(matches(&expected, &PredicateOptions::default(), &request, LIMIT).unwrap());
        assert!(!matches(&expected, &opts(json!({"caseSensitive": true})), &request, LIMIT).unwrap());

        // \D must not be folded into \d
        let digits = v(json!({"path": "^/\\D+$"}));
        assert!(matches(&digits, &PredicateOptions::default(), &v(json!({"path": "/abc"})), LIMIT).unwrap());
    }

    #[test]
    fn test_matches_header_keys_fold() {
        let request = v(json!({"headers": {"content-type": "application/json"}}));
        let expected = v(json!({"headers": {"Content-Type": "JSON$"}}));
        assert!(matches(&expected, &PredicateOptions::default(), &request, LIMIT).unwrap());
    }

    #[test]
    fn test_matches_rejects_binary_body() {
        let err = matches(&v(json!({"body": "^abc"})), &PredicateOptions::default(), &v(json!({})), LIMIT)
            .unwrap_err();
        assert!(err.is_validation());
        assert!(matches(
            &v(json!({"body": "^abc", "bodyEncoding": "utf8"})),
            &PredicateOptions::default(),
            &v(json!({"body": "abcdef", "bodyEncoding": "utf8"})),
            LIMIT
        )
        .unwrap());
    }

    #[test]
    fn test_matches_invalid_regex() {
        let err = matches(&v(json!({"path": "(unclosed"})), &PredicateOptions::default(), &v(json!({"path": "/"})), LIMIT)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_is_binary_body() {
        assert!(is_binary_body(&v(json!({"body": "AA=="})), &v(json!({"body": "AA==", "bodyEncoding": "utf8"}))));
        assert!(!is_binary_body(
            &v(json!({"body": "a", "bodyEncoding": "utf8"})),
            &v(json!({"body": "a", "bodyEncoding": "utf8"}))
        ));
        assert!(!is_binary_body(&v(json!({"body": {"a": 1}})), &v(json!({"body": "{}"}))));
    }
}
