//! Parsed predicate tree.
//!
//! Predicates arrive as Mountebank-shaped JSON documents such as
//! `{"equals": {"method": "GET"}, "caseSensitive": true}`. They are parsed
//! once, at stub registration, into a [`Predicate`] so malformed nodes are
//! rejected before any request is matched.

use crate::error::{PredicateError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Operator keys, in the order they are recognized.
pub const OPERATORS: [&str; 11] = [
    "equals",
    "deepEquals",
    "contains",
    "startsWith",
    "endsWith",
    "matches",
    "exists",
    "not",
    "or",
    "and",
    "inject",
];

/// One predicate node: an operator plus the modifiers that apply to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub operator: Operator,
    pub options: PredicateOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Equals(Value),
    DeepEquals(Value),
    Contains(Value),
    StartsWith(Value),
    EndsWith(Value),
    Matches(Value),
    Exists(Value),
    Not(Box<Predicate>),
    Or(Vec<Predicate>),
    And(Vec<Predicate>),
    /// Script source, interpreted by the configured injection engine
    Inject(String),
}

impl Operator {
    /// The JSON key this operator is written under.
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Equals(_) => "equals",
            Operator::DeepEquals(_) => "deepEquals",
            Operator::Contains(_) => "contains",
            Operator::StartsWith(_) => "startsWith",
            Operator::EndsWith(_) => "endsWith",
            Operator::Matches(_) => "matches",
            Operator::Exists(_) => "exists",
            Operator::Not(_) => "not",
            Operator::Or(_) => "or",
            Operator::And(_) => "and",
            Operator::Inject(_) => "inject",
        }
    }

    /// The request-shaped operand of a field operator.
    pub fn fields(&self) -> Option<&Value> {
        match self {
            Operator::Equals(v)
            | Operator::DeepEquals(v)
            | Operator::Contains(v)
            | Operator::StartsWith(v)
            | Operator::EndsWith(v)
            | Operator::Matches(v)
            | Operator::Exists(v) => Some(v),
            _ => None,
        }
    }

    fn operand_json(&self) -> serde_json::Value {
        match self {
            Operator::Not(inner) => inner.to_json(),
            Operator::Or(list) | Operator::And(list) => {
                serde_json::Value::Array(list.iter().map(Predicate::to_json).collect())
            }
            Operator::Inject(source) => serde_json::Value::String(source.clone()),
            other => other.fields().map(Value::to_json).unwrap_or_default(),
        }
    }
}

/// Modifiers that change how a field operator compares values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredicateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_sensitive: Option<bool>,

    /// Defaults to `case_sensitive` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_case_sensitive: Option<bool>,

    /// Regex whose matches are removed from values before comparison
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonpath: Option<JsonPathSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<XPathSelector>,
}

impl PredicateOptions {
    /// The selector to apply to request fields. JSONPath wins when both are set.
    pub fn selector(&self) -> Option<Selector<'_>> {
        if let Some(jsonpath) = &self.jsonpath {
            Some(Selector::JsonPath(jsonpath))
        } else {
            self.xpath.as_ref().map(Selector::XPath)
        }
    }

    /// The `except` pattern, treating an empty string as unset.
    pub fn except_pattern(&self) -> Option<&str> {
        self.except.as_deref().filter(|pattern| !pattern.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonPathSelector {
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XPathSelector {
    pub selector: String,
    /// Namespace prefix to URI bindings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selector<'a> {
    JsonPath(&'a JsonPathSelector),
    XPath(&'a XPathSelector),
}

impl Predicate {
    pub fn new(operator: Operator) -> Self {
        Self {
            operator,
            options: PredicateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PredicateOptions) -> Self {
        self.options = options;
        self
    }

    /// Parse a predicate node.
    ///
    /// The first key (in document order) naming an operator decides the
    /// operator. Any further operator keys are ignored with a warning.
    pub fn parse(node: &serde_json::Value) -> Result<Self> {
        let Some(object) = node.as_object() else {
            return Err(PredicateError::validation_with_node(
                "predicate must be an object",
                node.clone(),
            ));
        };

        let mut operator_keys = object.keys().filter(|key| OPERATORS.contains(&key.as_str()));
        let Some(key) = operator_keys.next() else {
            return Err(PredicateError::validation_with_node(
                "missing predicate",
                node.clone(),
            ));
        };
        let ignored: Vec<&str> = operator_keys.map(String::as_str).collect();
        if !ignored.is_empty() {
            warn!(
                "Predicate has more than one operator; using '{}' and ignoring {:?}",
                key, ignored
            );
        }

        let options: PredicateOptions = serde_json::from_value(node.clone()).map_err(|e| {
            PredicateError::validation_with_node(
                format!("invalid predicate parameters: {e}"),
                node.clone(),
            )
        })?;

        let operand = &object[key.as_str()];
        let operator = match key.as_str() {
            "not" => Operator::Not(Box::new(Self::parse(operand)?)),
            "or" => Operator::Or(Self::parse_list(key, operand, node)?),
            "and" => Operator::And(Self::parse_list(key, operand, node)?),
            "inject" => match operand.as_str() {
                Some(source) => Operator::Inject(source.to_string()),
                None => {
                    return Err(PredicateError::validation_with_node(
                        "inject predicate must be a function source string",
                        node.clone(),
                    ))
                }
            },
            field_operator => {
                if !operand.is_object() {
                    return Err(PredicateError::validation_with_node(
                        format!("{field_operator} predicate must be an object"),
                        node.clone(),
                    ));
                }
                let fields = Value::from(operand);
                match field_operator {
                    "equals" => Operator::Equals(fields),
                    "deepEquals" => Operator::DeepEquals(fields),
                    "contains" => Operator::Contains(fields),
                    "startsWith" => Operator::StartsWith(fields),
                    "endsWith" => Operator::EndsWith(fields),
                    "matches" => Operator::Matches(fields),
                    _ => Operator::Exists(fields),
                }
            }
        };

        Ok(Self { operator, options })
    }

    fn parse_list(
        key: &str,
        operand: &serde_json::Value,
        node: &serde_json::Value,
    ) -> Result<Vec<Self>> {
        let Some(items) = operand.as_array() else {
            return Err(PredicateError::validation_with_node(
                format!("{key} predicate must be an array of predicates"),
                node.clone(),
            ));
        };
        items.iter().map(Self::parse).collect()
    }

    /// Parse a list of predicates, as found on a stub.
    pub fn parse_all(nodes: &serde_json::Value) -> Result<Vec<Self>> {
        match nodes {
            serde_json::Value::Array(items) => items.iter().map(Self::parse).collect(),
            single => Ok(vec![Self::parse(single)?]),
        }
    }

    /// Back to the Mountebank JSON shape.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert(self.operator.name().to_string(), self.operator.operand_json());
        if let Ok(serde_json::Value::Object(options)) = serde_json::to_value(&self.options) {
            object.extend(options);
        }
        serde_json::Value::Object(object)
    }
}

impl TryFrom<serde_json::Value> for Predicate {
    type Error = PredicateError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        Self::parse(&value)
    }
}

impl Serialize for Predicate {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let node = serde_json::Value::deserialize(deserializer)?;
        Self::try_from(node).map_err(serde::de::Error::custom)
    }
}
