//! Predicate dispatch.

use super::normalize::{compile_regex, MatchConfig};
use super::operators;
use super::safe_regex::warn_if_unsafe;
use super::selector::{check_jsonpath, check_xpath};
use super::types::{Operator, Predicate, Selector};
use crate::config::EngineConfig;
use crate::error::{PredicateError, Result};
use crate::request::Request;
use crate::scripting::{ImposterState, InjectionEngine, RhaiInjector};
use crate::value::Value;
use std::sync::Arc;
use tracing::debug;

/// Evaluates predicates against requests.
///
/// One evaluator can be shared by every imposter; it holds no per-request
/// state. Imposter state is passed in on each call.
#[derive(Clone)]
pub struct Evaluator {
    config: EngineConfig,
    injector: Arc<dyn InjectionEngine>,
}

impl Evaluator {
    /// Default configuration: injection disabled.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let injector = Arc::new(RhaiInjector::new(&config.injection));
        Self { config, injector }
    }

    /// Use a different script engine for `inject`.
    pub fn with_injector(config: EngineConfig, injector: Arc<dyn InjectionEngine>) -> Self {
        Self { config, injector }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether `predicate` holds for `request`.
    pub fn evaluate(
        &self,
        predicate: &Predicate,
        request: &Value,
        state: &ImposterState,
    ) -> Result<bool> {
        let limit = self.config.regex.size_limit;
        let options = &predicate.options;

        match &predicate.operator {
            Operator::Equals(expected) => operators::equals(expected, options, request, limit),
            Operator::DeepEquals(expected) => {
                operators::deep_equals(expected, options, request, limit)
            }
            Operator::Contains(expected) => operators::contains(expected, options, request, limit),
            Operator::StartsWith(expected) => {
                operators::starts_with(expected, options, request, limit)
            }
            Operator::EndsWith(expected) => operators::ends_with(expected, options, request, limit),
            Operator::Matches(expected) => operators::matches(expected, options, request, limit),
            Operator::Exists(expected) => operators::exists(expected, options, request, limit),
            Operator::Not(inner) => Ok(!self.evaluate(inner, request, state)?),
            Operator::Or(children) => {
                for child in children {
                    if self.evaluate(child, request, state)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Operator::And(children) => {
                for child in children {
                    if !self.evaluate(child, request, state)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Operator::Inject(source) => operators::inject(
                source,
                request,
                state,
                self.injector.as_ref(),
                self.config.allow_injection,
            ),
        }
    }

    /// Parse and evaluate a raw predicate node in one step.
    pub fn evaluate_json(
        &self,
        predicate: &serde_json::Value,
        request: &Value,
        state: &ImposterState,
    ) -> Result<bool> {
        let predicate = Predicate::parse(predicate)?;
        self.evaluate(&predicate, request, state)
    }

    pub fn evaluate_request(
        &self,
        predicate: &Predicate,
        request: &Request,
        state: &ImposterState,
    ) -> Result<bool> {
        self.evaluate(predicate, &request.to_value(), state)
    }

    /// Whether a stub with these predicates applies. No predicates match
    /// every request.
    pub fn all_match(
        &self,
        predicates: &[Predicate],
        request: &Value,
        state: &ImposterState,
    ) -> Result<bool> {
        for (index, predicate) in predicates.iter().enumerate() {
            if !self.evaluate(predicate, request, state)? {
                debug!(
                    "Predicate {} ({}) did not match",
                    index,
                    predicate.operator.name()
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Registration-time checks: regular expressions compile, selectors
    /// parse, and `inject` is allowed and compiles. Unsafe patterns only warn.
    pub fn validate(&self, predicate: &Predicate) -> Result<()> {
        let limit = self.config.regex.size_limit;
        let options = &predicate.options;

        // Compiles `except` as a side effect.
        MatchConfig::from_options(options, limit)
            .map_err(|e| with_node(e, predicate))?;

        let selector_check = match options.selector() {
            Some(Selector::JsonPath(jsonpath)) => check_jsonpath(&jsonpath.selector),
            Some(Selector::XPath(xpath)) => check_xpath(&xpath.selector),
            None => Ok(()),
        };
        selector_check.map_err(|e| {
            PredicateError::validation_with_node(
                format!("invalid selector: {e}"),
                predicate.to_json(),
            )
        })?;

        match &predicate.operator {
            Operator::Matches(expected) => {
                let case_sensitive = options.case_sensitive.unwrap_or(false);
                for pattern in string_leaves(expected) {
                    warn_if_unsafe(pattern);
                    compile_regex(pattern, !case_sensitive, limit)
                        .map_err(|e| with_node(e, predicate))?;
                }
                Ok(())
            }
            Operator::Not(inner) => self.validate(inner),
            Operator::Or(children) | Operator::And(children) => {
                children.iter().try_for_each(|child| self.validate(child))
            }
            Operator::Inject(source) => {
                if !self.config.allow_injection {
                    return Err(PredicateError::validation_with_node(
                        "inject predicates are disabled; enable allowInjection to use them",
                        predicate.to_json(),
                    ));
                }
                self.injector.compile(source).map_err(|e| {
                    PredicateError::validation_with_node(
                        format!("invalid {} injection: {e}", self.injector.name()),
                        predicate.to_json(),
                    )
                })
            }
            _ => Ok(()),
        }
    }

    /// Validate every predicate of a stub.
    pub fn validate_all(&self, predicates: &[Predicate]) -> Result<()> {
        predicates.iter().try_for_each(|p| self.validate(p))
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn with_node(error: PredicateError, predicate: &Predicate) -> PredicateError {
    match error {
        PredicateError::Validation { message, node: None } => PredicateError::Validation {
            message,
            node: Some(predicate.to_json()),
        },
        other => other,
    }
}

/// String leaves of a value tree, skipping `bodyEncoding`.
fn string_leaves(value: &Value) -> Vec<&str> {
    let mut out = Vec::new();
    collect_strings(value, &mut out);
    out
}

fn collect_strings<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| key.as_str() != "bodyEncoding")
            .for_each(|(_, item)| collect_strings(item, out)),
        _ => {}
    }
}
