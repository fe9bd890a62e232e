//! Canonical form for expected and actual value trees.
//!
//! Both sides of a comparison go through [`normalize`] with the same
//! [`MatchConfig`]: keys and string leaves are case-folded, `except` matches
//! are stripped, lists are sorted and (on the request side only) string
//! leaves are replaced by their JSONPath/XPath selection.

use super::safe_regex::warn_if_unsafe;
use super::selector::{select_jsonpath, select_xpath};
use super::types::{PredicateOptions, Selector};
use crate::error::{PredicateError, Result};
use crate::value::{sort_values, Value};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use regex::{Regex, RegexBuilder};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Resolved matching configuration for one predicate evaluation.
#[derive(Debug, Clone)]
pub struct MatchConfig<'a> {
    pub case_sensitive: bool,
    pub key_case_sensitive: bool,
    /// Compiled `except` pattern
    pub except: Option<Regex>,
    pub selector: Option<Selector<'a>>,
    /// Set for `exists`, enables the list shortcut in structural matching
    pub exists: bool,
}

impl<'a> MatchConfig<'a> {
    /// Resolve a predicate's modifiers. `keyCaseSensitive` inherits from
    /// `caseSensitive` when unset.
    pub fn from_options(options: &'a PredicateOptions, regex_size_limit: usize) -> Result<Self> {
        let case_sensitive = options.case_sensitive.unwrap_or(false);
        let key_case_sensitive = options.key_case_sensitive.unwrap_or(case_sensitive);
        Self::build(options, case_sensitive, key_case_sensitive, regex_size_limit)
    }

    /// Build with explicit case handling, as `matches` needs.
    pub fn build(
        options: &'a PredicateOptions,
        case_sensitive: bool,
        key_case_sensitive: bool,
        regex_size_limit: usize,
    ) -> Result<Self> {
        let except = match options.except_pattern() {
            Some(pattern) => {
                warn_if_unsafe(pattern);
                Some(compile_regex(pattern, !case_sensitive, regex_size_limit)?)
            }
            None => None,
        };

        Ok(Self {
            case_sensitive,
            key_case_sensitive,
            except,
            selector: options.selector(),
            exists: false,
        })
    }

    pub fn without_except(&self) -> Self {
        Self {
            except: None,
            ..self.clone()
        }
    }

    pub fn for_exists(mut self) -> Self {
        self.exists = true;
        self
    }

    /// Keys are folded unless both value and key comparison are case-sensitive.
    pub fn fold_keys(&self) -> bool {
        !(self.case_sensitive && self.key_case_sensitive)
    }

    pub fn transform_key(&self, key: &str) -> String {
        if self.fold_keys() {
            key.to_lowercase()
        } else {
            key.to_string()
        }
    }

    /// `except` removal, then case folding.
    ///
    /// Removal repeats until nothing more matches, so a removal that joins
    /// two halves of a new match (`ab` in `aabb`) still leaves a fixed point.
    pub fn transform_text(&self, text: &str) -> String {
        let mut stripped = text.to_string();
        if let Some(except) = &self.except {
            loop {
                match except.replace_all(&stripped, "") {
                    Cow::Owned(next) if next.len() < stripped.len() => stripped = next,
                    _ => break,
                }
            }
        }
        if self.case_sensitive {
            stripped
        } else {
            stripped.to_lowercase()
        }
    }
}

/// Compile a user-supplied pattern.
pub fn compile_regex(pattern: &str, case_insensitive: bool, size_limit: usize) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .size_limit(size_limit)
        .build()
        .map_err(|e| {
            PredicateError::validation(format!("invalid regular expression '{pattern}': {e}"))
        })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeOptions {
    /// Replace string leaves by their selector result (request side only)
    pub with_selectors: bool,
    /// Coerce selected JSON leaves to strings before the selector runs
    pub force_strings: bool,
    /// Decode `body` into bytes before comparison
    pub binary_body: bool,
}

impl NormalizeOptions {
    pub fn request() -> Self {
        Self {
            with_selectors: true,
            ..Self::default()
        }
    }
}

/// Normalize a copy of `value`. `bodyEncoding` is always dropped from the
/// top-level mapping.
pub fn normalize(value: &Value, config: &MatchConfig<'_>, options: NormalizeOptions) -> Result<Value> {
    let mut tree = value.clone();
    if let Value::Object(map) = &mut tree {
        if options.binary_body {
            if let Some(Value::String(body)) = map.get("body") {
                let encoding = map.get("bodyEncoding").and_then(Value::as_str);
                let bytes = decode_binary_body(body, encoding)?;
                map.insert("body".to_string(), Value::Bytes(bytes));
            }
        }
        map.remove("bodyEncoding");
    }

    let normalizer = Normalizer { config, options };
    Ok(normalizer.transform(tree).unwrap_or_default())
}

/// Speculatively parse `text` as JSON. On success keys and string leaves are
/// transformed like a normalized tree (lists keep their order so indexed
/// selectors still work); otherwise the raw text is returned.
pub fn try_json(text: &str, config: &MatchConfig<'_>) -> Value {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => transform_parsed(Value::from(json), config),
        Err(_) => Value::String(text.to_string()),
    }
}

fn transform_parsed(value: Value, config: &MatchConfig<'_>) -> Value {
    match value {
        Value::String(s) => Value::String(config.transform_text(&s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| transform_parsed(item, config))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (config.transform_key(&k), transform_parsed(v, config)))
                .collect(),
        ),
        other => other,
    }
}

/// Accepts unpadded input and stray bits in the last symbol.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Turn a textual body into bytes according to its declared encoding.
/// A missing encoding means the text is base64. Only an unknown encoding
/// fails.
pub fn decode_binary_body(body: &str, encoding: Option<&str>) -> Result<Vec<u8>> {
    match encoding.map(str::to_ascii_lowercase).as_deref() {
        None | Some("base64") => decode_base64(body),
        Some("utf8" | "utf-8") => Ok(body.as_bytes().to_vec()),
        Some("latin1" | "binary") => Ok(body
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect()),
        Some("ascii") => Ok(body
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect()),
        Some(other) => Err(PredicateError::validation(format!(
            "unsupported bodyEncoding '{other}'"
        ))),
    }
}

/// Decode base64 the forgiving way HTTP tooling does: the URL-safe symbols
/// are accepted, anything outside the alphabet is skipped, input ends at
/// the first `=`, and a dangling final symbol is dropped.
fn decode_base64(body: &str) -> Result<Vec<u8>> {
    let mut symbols: String = body
        .chars()
        .take_while(|&c| c != '=')
        .filter_map(|c| match c {
            '-' => Some('+'),
            '_' => Some('/'),
            c if c.is_ascii_alphanumeric() || c == '+' || c == '/' => Some(c),
            _ => None,
        })
        .collect();
    if symbols.len() % 4 == 1 {
        symbols.pop();
    }
    LENIENT
        .decode(&symbols)
        .map_err(|e| PredicateError::validation(format!("body is not valid base64: {e}")))
}

struct Normalizer<'c, 'a> {
    config: &'c MatchConfig<'a>,
    options: NormalizeOptions,
}

impl Normalizer<'_, '_> {
    /// `None` means the value disappeared (a selector with no match).
    fn transform(&self, value: Value) -> Option<Value> {
        match value {
            Value::String(s) => self.transform_string(&s),
            Value::Array(items) => {
                let mut items: Vec<Value> = items
                    .into_iter()
                    .map(|item| self.transform(item).unwrap_or_default())
                    .collect();
                sort_values(&mut items);
                Some(Value::Array(items))
            }
            Value::Object(map) => Some(Value::Object(
                map.into_iter()
                    .filter_map(|(k, v)| {
                        let v = self.transform(v)?;
                        Some((self.config.transform_key(&k), v))
                    })
                    .collect(),
            )),
            other => Some(other),
        }
    }

    fn transform_string(&self, text: &str) -> Option<Value> {
        if self.options.with_selectors {
            if let Some(selector) = self.config.selector {
                return self.select(selector, text).map(|v| self.transform_selected(v));
            }
        }
        Some(Value::String(self.config.transform_text(text)))
    }

    /// Run the predicate's selector against one string field.
    ///
    /// Case-insensitive JSONPath lower-cases the selector, and the parsed
    /// document's keys are already folded. Case-insensitive XPath lower-cases
    /// the selector, the namespace map and the XML text too, so `//Title`
    /// also finds `<TITLE>`. Mountebank folds only the selector and
    /// namespaces there, and misses elements whose names are not lower case.
    fn select(&self, selector: Selector<'_>, text: &str) -> Option<Value> {
        match selector {
            Selector::JsonPath(jsonpath) => {
                let path = if self.config.fold_keys() {
                    jsonpath.selector.to_lowercase()
                } else {
                    jsonpath.selector.clone()
                };
                let mut target = try_json(text, self.config);
                if self.options.force_strings {
                    target = target.force_strings();
                }
                select_jsonpath(&path, &target.to_json())
            }
            Selector::XPath(xpath) if self.config.case_sensitive => {
                select_xpath(&xpath.selector, &xpath.ns, text)
            }
            Selector::XPath(xpath) => {
                let ns: BTreeMap<String, String> = xpath
                    .ns
                    .iter()
                    .map(|(prefix, uri)| (prefix.to_lowercase(), uri.to_lowercase()))
                    .collect();
                select_xpath(&xpath.selector.to_lowercase(), &ns, &text.to_lowercase())
            }
        }
    }

    /// Selector output gets the value transforms and list sorting, but no
    /// further selection.
    fn transform_selected(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.config.transform_text(&s)),
            Value::Array(items) => {
                let mut items: Vec<Value> = items
                    .into_iter()
                    .map(|item| self.transform_selected(item))
                    .collect();
                sort_values(&mut items);
                Value::Array(items)
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.transform_selected(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::types::Predicate;
    use serde_json::json;

    fn options(node: serde_json::Value) -> PredicateOptions {
        let mut node = node;
        node["equals"] = json!({});
        Predicate::parse(&node).unwrap().options
    }

    #[test]
    fn test_default_folds_keys_and_values() {
        let opts = PredicateOptions::default();
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        let value = Value::from(json!({"Headers": {"Host": "EXAMPLE.com"}}));
        let normalized = normalize(&value, &config, NormalizeOptions::default()).unwrap();
        assert_eq!(
            normalized,
            Value::from(json!({"headers": {"host": "example.com"}}))
        );
    }

    #[test]
    fn test_case_sensitive_keeps_case() {
        let opts = options(json!({"caseSensitive": true}));
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        let value = Value::from(json!({"Path": "/Users"}));
        let normalized = normalize(&value, &config, NormalizeOptions::default()).unwrap();
        assert_eq!(normalized, value);
    }

    #[test]
    fn test_key_case_sensitivity_needs_both_flags() {
        let opts = options(json!({"caseSensitive": true, "keyCaseSensitive": false}));
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        assert!(config.fold_keys());
        assert_eq!(config.transform_key("X-Id"), "x-id");
        assert_eq!(config.transform_text("ABC"), "ABC");

        let opts = options(json!({"keyCaseSensitive": true}));
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        assert!(config.fold_keys());
    }

    #[test]
    fn test_except_is_removed_before_folding() {
        let opts = options(json!({"except": "\\d+"}));
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        assert_eq!(config.transform_text("Order-123-AB"), "order--ab");
    }

    #[test]
    fn test_except_removal_reaches_fixed_point() {
        let opts = options(json!({"except": "ab"}));
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        assert_eq!(config.transform_text("aabb"), "");
        assert_eq!(config.transform_text("xAaBby"), "xy");

        let value = Value::from(json!({"p": "aabb", "q": "caabbd"}));
        let once = normalize(&value, &config, NormalizeOptions::default()).unwrap();
        let twice = normalize(&once, &config, NormalizeOptions::default()).unwrap();
        assert_eq!(once, Value::from(json!({"p": "", "q": "cd"})));
        assert_eq!(once, twice);

        // Patterns that only match the empty string leave text alone.
        let opts = options(json!({"except": "x*"}));
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        assert_eq!(config.transform_text("axxb"), "ab");
        assert_eq!(config.transform_text("ab"), "ab");
    }

    #[test]
    fn test_invalid_except_is_validation_error() {
        let opts = options(json!({"except": "(unclosed"}));
        let err = MatchConfig::from_options(&opts, 1 << 20).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_lists_are_sorted_and_body_encoding_dropped() {
        let opts = PredicateOptions::default();
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        let value = Value::from(json!({
            "query": {"tag": ["b", "A", "c"]},
            "bodyEncoding": "utf8"
        }));
        let normalized = normalize(&value, &config, NormalizeOptions::default()).unwrap();
        assert_eq!(
            normalized,
            Value::from(json!({"query": {"tag": ["a", "b", "c"]}}))
        );
    }

    #[test]
    fn test_binary_body_decoding() {
        let opts = PredicateOptions::default();
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        let binary = NormalizeOptions {
            binary_body: true,
            ..NormalizeOptions::default()
        };

        let base64 = Value::from(json!({"body": "AQID"}));
        assert_eq!(
            normalize(&base64, &config, binary).unwrap().field("body"),
            Some(&Value::Bytes(vec![1, 2, 3]))
        );

        let text = Value::from(json!({"body": "hi", "bodyEncoding": "utf8"}));
        let mut expected = crate::value::Map::new();
        expected.insert("body".to_string(), Value::Bytes(b"hi".to_vec()));
        assert_eq!(
            normalize(&text, &config, binary).unwrap(),
            Value::Object(expected)
        );
    }

    #[test]
    fn test_binary_body_errors() {
        assert!(decode_binary_body("abc", Some("utf16le"))
            .unwrap_err()
            .is_validation());
        assert_eq!(decode_binary_body("caf\u{e9}", Some("latin1")).unwrap(), b"caf\xe9");
        assert_eq!(decode_binary_body("AQI", None).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_base64_decoding_is_lenient() {
        assert_eq!(decode_binary_body("hello", None).unwrap(), vec![0x85, 0xe9, 0x65]);
        assert_eq!(decode_binary_body("ell", None).unwrap(), vec![0x7a, 0x59]);
        assert_eq!(decode_binary_body("not base64!", None).unwrap(), decode_binary_body("notbase64", None).unwrap());
        assert_eq!(decode_binary_body("AQ ID\n", Some("base64")).unwrap(), vec![1, 2, 3]);
        assert_eq!(decode_binary_body("AQID==trailing", None).unwrap(), vec![1, 2, 3]);
        assert_eq!(decode_binary_body("-_8", None).unwrap(), decode_binary_body("+/8", None).unwrap());
        assert!(decode_binary_body("", None).unwrap().is_empty());
    }

    #[test]
    fn test_jsonpath_selection_on_request_side() {
        let opts = options(json!({"jsonpath": {"selector": "$.Book.Title"}}));
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        let request = Value::from(json!({
            "method": "POST",
            "body": r#"{"book": {"title": "Dune"}}"#
        }));
        let normalized = normalize(&request, &config, NormalizeOptions::request()).unwrap();
        assert_eq!(normalized, Value::from(json!({"body": "dune"})));

        // Selectors never apply without the request flag.
        let unselected = normalize(&request, &config, NormalizeOptions::default()).unwrap();
        assert_eq!(unselected.field("method"), Some(&Value::from("post")));
    }

    #[test]
    fn test_xpath_case_insensitive() {
        let opts = options(json!({"xpath": {"selector": "//Title"}}));
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        let request = Value::from(json!({"body": "<Doc><title>Dune</title><TITLE>Emma</TITLE></Doc>"}));
        let normalized = normalize(&request, &config, NormalizeOptions::request()).unwrap();
        assert_eq!(normalized, Value::from(json!({"body": ["dune", "emma"]})));
    }

    #[test]
    fn test_try_json() {
        let opts = PredicateOptions::default();
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        assert_eq!(
            try_json(r#"{"Name": ["B", "A"]}"#, &config),
            Value::from(json!({"name": ["b", "a"]}))
        );
        assert_eq!(try_json("Plain Text", &config), Value::from("Plain Text"));
        assert_eq!(try_json("42", &config), Value::from(json!(42)));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let opts = PredicateOptions::default();
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        let value = Value::from(json!({
            "Query": {"K": ["Z", "y", {"B": "X"}]},
            "path": "/A"
        }));
        let once = normalize(&value, &config, NormalizeOptions::default()).unwrap();
        let twice = normalize(&once, &config, NormalizeOptions::default()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_input_is_not_mutated() {
        let opts = PredicateOptions::default();
        let config = MatchConfig::from_options(&opts, 1 << 20).unwrap();
        let value = Value::from(json!({"Body": "X", "bodyEncoding": "utf8"}));
        let before = value.clone();
        normalize(&value, &config, NormalizeOptions::default()).unwrap();
        assert_eq!(value, before);
    }
}
