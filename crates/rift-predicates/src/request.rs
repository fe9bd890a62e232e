//! Canonical request object consumed by the predicate engine.
//!
//! The protocol layer owns decompression and transport details; this module
//! only turns an already-assembled request (method, target, headers, body
//! bytes) into the shape predicates are written against.

use crate::value::{Map, Value};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A query parameter, header or form field: one value, or several when the
/// key was repeated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Single(String),
    Multiple(Vec<String>),
}

impl FieldValue {
    fn push(&mut self, value: String) {
        match self {
            FieldValue::Single(existing) => {
                *self = FieldValue::Multiple(vec![std::mem::take(existing), value]);
            }
            FieldValue::Multiple(values) => values.push(value),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            FieldValue::Single(s) => Value::String(s.clone()),
            FieldValue::Multiple(values) => {
                Value::Array(values.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Single(value.to_string())
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Mountebank-compatible request, as recorded and as matched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_from: Option<String>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query: Fields,
    #[serde(default)]
    pub headers: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Text encoding the body was decoded with; absent means base64 (binary)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<Fields>,
    /// Validation-only pass; `inject` predicates must not run
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_dry_run: bool,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Build a request from its raw parts.
    ///
    /// `target` is the request path with an optional query string. The body
    /// is decoded with the charset guessed from `Content-Type`, or base64
    /// encoded when no text charset applies.
    pub fn from_parts<I, K, V>(method: &str, target: &str, headers: I, body: &[u8]) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query_string(query)),
            None => (target, Fields::new()),
        };

        let mut header_fields = Fields::new();
        for (name, value) in headers {
            insert_field(&mut header_fields, name.into(), value.into());
        }

        let content_type = header_value(&header_fields, "content-type");
        let body_encoding = guess_body_encoding(content_type.as_deref().unwrap_or(""));
        let body_text = decode_body(body, body_encoding);

        let form = match content_type.as_deref() {
            Some(ct) if !body_text.is_empty() && is_url_encoded_form(ct) => {
                Some(parse_query_string(&body_text))
            }
            _ => None,
        };

        Self {
            request_from: None,
            method: method.to_string(),
            path: path.to_string(),
            query,
            headers: header_fields,
            body: Some(body_text),
            body_encoding: body_encoding.map(str::to_string),
            ip: None,
            form,
            is_dry_run: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        insert_field(&mut self.headers, name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        insert_field(&mut self.query, name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self.body_encoding = Some("utf8".to_string());
        self
    }

    pub fn with_client(mut self, ip: impl Into<String>, port: u16) -> Self {
        let ip = ip.into();
        self.request_from = Some(format!("{ip}:{port}"));
        self.ip = Some(ip);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.is_dry_run = true;
        self
    }

    /// Convert to the value tree predicates are evaluated against.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(from) = &self.request_from {
            map.insert("requestFrom".to_string(), Value::from(from.as_str()));
        }
        map.insert("method".to_string(), Value::from(self.method.as_str()));
        map.insert("path".to_string(), Value::from(self.path.as_str()));
        map.insert("query".to_string(), fields_to_value(&self.query));
        map.insert("headers".to_string(), fields_to_value(&self.headers));
        if let Some(body) = &self.body {
            map.insert("body".to_string(), Value::from(body.as_str()));
        }
        if let Some(encoding) = &self.body_encoding {
            map.insert("bodyEncoding".to_string(), Value::from(encoding.as_str()));
        }
        if let Some(ip) = &self.ip {
            map.insert("ip".to_string(), Value::from(ip.as_str()));
        }
        if let Some(form) = &self.form {
            map.insert("form".to_string(), fields_to_value(form));
        }
        if self.is_dry_run {
            map.insert("isDryRun".to_string(), Value::Bool(true));
        }
        Value::Object(map)
    }
}

impl From<&Request> for Value {
    fn from(request: &Request) -> Self {
        request.to_value()
    }
}

fn fields_to_value(fields: &Fields) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect(),
    )
}

fn insert_field(fields: &mut Fields, key: String, value: String) {
    match fields.get_mut(&key) {
        Some(existing) => existing.push(value),
        None => {
            fields.insert(key, FieldValue::Single(value));
        }
    }
}

fn header_value(headers: &Fields, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| match v {
            FieldValue::Single(s) => s.clone(),
            FieldValue::Multiple(values) => values.first().cloned().unwrap_or_default(),
        })
}

/// Parse a query string, URL-decoding keys and values. Repeated keys
/// collect into a list.
pub fn parse_query_string(query: &str) -> Fields {
    let mut fields = Fields::new();
    for pair in query.split('&').filter(|s| !s.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        insert_field(&mut fields, decode_component(key), decode_component(value));
    }
    fields
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn is_url_encoded_form(content_type: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or("").trim();
    media_type == "application/x-www-form-urlencoded"
}

/// Guess the text encoding of a body from its `Content-Type`.
///
/// An explicit `charset` decides on its own; otherwise form and JSON bodies
/// are UTF-8 and other `text/*` bodies Latin-1. `None` means binary.
pub fn guess_body_encoding(content_type: &str) -> Option<&'static str> {
    let (media_type, params) = match content_type.split_once(';') {
        Some((media_type, params)) => (media_type, Some(params)),
        None => (content_type, None),
    };

    let charset = params.and_then(|params| {
        params.find("charset=").map(|i| {
            let rest = &params[i + "charset=".len()..];
            rest.split(';').next().unwrap_or("")
        })
    });

    if let Some(charset) = charset.filter(|c| !c.is_empty()) {
        return match charset.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Some("utf8"),
            "iso88591" | "iso-8859-1" | "8859-1" | "iso-latin-1" | "latin-1" | "latin1" => {
                Some("latin1")
            }
            _ => None,
        };
    }

    if media_type == "application/x-www-form-urlencoded" || media_type.contains("json") {
        Some("utf8")
    } else if media_type.starts_with("text/") {
        Some("latin1")
    } else {
        None
    }
}

fn decode_body(body: &[u8], encoding: Option<&str>) -> String {
    match encoding {
        Some("utf8") => String::from_utf8_lossy(body).into_owned(),
        Some("latin1") => body.iter().map(|&b| char::from(b)).collect(),
        _ => base64::engine::general_purpose::STANDARD.encode(body),
    }
}
