//! JSONPath and XPath extraction from string fields.
//!
//! Both extractors return `None` when nothing matched, the single value when
//! exactly one node matched, and a sorted list otherwise. Sorting keeps
//! multi-node selections comparable regardless of document order.

use crate::value::{sort_values, Value};
use serde_json_path::JsonPath;
use std::collections::BTreeMap;
use sxd_document::parser;
use sxd_xpath::{Context, Factory, Value as XPathValue};
use tracing::{debug, warn};

/// Query `target` with a JSONPath expression.
pub fn select_jsonpath(selector: &str, target: &serde_json::Value) -> Option<Value> {
    let path = match JsonPath::parse(selector) {
        Ok(path) => path,
        Err(e) => {
            warn!("Invalid jsonpath selector '{}': {}", selector, e);
            return None;
        }
    };

    let nodes = path
        .query(target)
        .all()
        .into_iter()
        .map(Value::from)
        .collect();
    collapse(nodes)
}

/// Evaluate an XPath expression against an XML document.
///
/// Text that does not parse as XML selects nothing.
pub fn select_xpath(
    selector: &str,
    namespaces: &BTreeMap<String, String>,
    xml: &str,
) -> Option<Value> {
    let package = parser::parse(xml).ok()?;
    let document = package.as_document();

    let xpath = match Factory::new().build(selector) {
        Ok(Some(xpath)) => xpath,
        Ok(None) => return None,
        Err(e) => {
            warn!("Invalid xpath selector '{}': {}", selector, e);
            return None;
        }
    };

    let mut context = Context::new();
    for (prefix, uri) in namespaces {
        context.set_namespace(prefix, uri);
    }

    match xpath.evaluate(&context, document.root()) {
        Ok(XPathValue::Nodeset(nodes)) => collapse(
            nodes
                .document_order()
                .iter()
                .map(|node| Value::String(node.string_value()))
                .collect(),
        ),
        Ok(XPathValue::String(s)) => Some(Value::String(s)),
        Ok(XPathValue::Number(n)) => Some(
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(n.to_string())),
        ),
        Ok(XPathValue::Boolean(b)) => Some(Value::Bool(b)),
        Err(e) => {
            debug!("xpath '{}' failed to evaluate: {}", selector, e);
            None
        }
    }
}

/// Check that a JSONPath expression parses.
pub fn check_jsonpath(selector: &str) -> Result<(), String> {
    JsonPath::parse(selector)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Check that an XPath expression compiles.
pub fn check_xpath(selector: &str) -> Result<(), String> {
    match Factory::new().build(selector) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err("no xpath expression".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn collapse(mut values: Vec<Value>) -> Option<Value> {
    match values.len() {
        0 => None,
        1 => values.pop(),
        _ => {
            sort_values(&mut values);
            Some(Value::Array(values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jsonpath_single_match() {
        let doc = json!({"user": {"name": "alice", "id": 7}});
        assert_eq!(
            select_jsonpath("$.user.name", &doc),
            Some(Value::from("alice"))
        );
        assert_eq!(select_jsonpath("$.user.id", &doc), Some(Value::from(json!(7))));
    }

    #[test]
    fn test_jsonpath_multiple_matches_are_sorted() {
        let doc = json!({"books": [{"title": "c"}, {"title": "a"}, {"title": "b"}]});
        assert_eq!(
            select_jsonpath("$.books[*].title", &doc),
            Some(Value::from(json!(["a", "b", "c"])))
        );
    }

    #[test]
    fn test_jsonpath_no_match_or_invalid() {
        let doc = json!({"a": 1});
        assert_eq!(select_jsonpath("$.missing", &doc), None);
        assert_eq!(select_jsonpath("not a path", &doc), None);
        assert_eq!(select_jsonpath("$.a", &json!("plain text")), None);
    }

    #[test]
    fn test_xpath_text_and_attribute() {
        let xml = r#"<doc><title lang="en">Hello</title><title lang="fr">Bonjour</title></doc>"#;
        assert_eq!(
            select_xpath("//title[@lang='fr']", &BTreeMap::new(), xml),
            Some(Value::from("Bonjour"))
        );
        assert_eq!(
            select_xpath("//title/@lang", &BTreeMap::new(), xml),
            Some(Value::from(json!(["en", "fr"])))
        );
    }

    #[test]
    fn test_xpath_scalar_results() {
        let xml = "<doc><item/><item/></doc>";
        assert_eq!(
            select_xpath("count(//item)", &BTreeMap::new(), xml),
            Some(Value::from(json!(2.0)))
        );
        assert_eq!(
            select_xpath("boolean(//item)", &BTreeMap::new(), xml),
            Some(Value::Bool(true))
        );
    }

    #[test]
    fn test_xpath_namespaces() {
        let xml = r#"<root xmlns:b="http://example.com/book"><b:title>Rust</b:title></root>"#;
        let mut ns = BTreeMap::new();
        ns.insert("bk".to_string(), "http://example.com/book".to_string());
        assert_eq!(select_xpath("//bk:title", &ns, xml), Some(Value::from("Rust")));
    }

    #[test]
    fn test_xpath_invalid_input() {
        assert_eq!(select_xpath("//a", &BTreeMap::new(), "not xml"), None);
        assert_eq!(select_xpath("//a", &BTreeMap::new(), "<doc/>"), None);
        assert!(check_xpath("//a[").is_err());
        assert!(check_xpath("//a").is_ok());
        assert!(check_jsonpath("$.a").is_ok());
        assert!(check_jsonpath("$[").is_err());
    }
}
