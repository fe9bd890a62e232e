//! Scripted predicates (`inject`).
//!
//! The evaluator talks to script engines through [`InjectionEngine`], so the
//! language is pluggable. The bundled engine is Rhai ([`RhaiInjector`]):
//! scripts see a request snapshot, the imposter state and a logger, and
//! nothing else of the host.

use crate::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;

mod rhai_engine;
pub use rhai_engine::RhaiInjector;

/// Runtime or compile failure reported by a script engine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct InjectionFailure(pub String);

/// Everything an injected script may see.
pub struct InjectionContext<'a> {
    /// Request as normalized by the protocol layer (not predicate-normalized)
    pub request: &'a Value,
    pub state: &'a ImposterState,
}

/// A script language usable by `inject` predicates.
pub trait InjectionEngine: Send + Sync {
    /// Short engine name used in logs.
    fn name(&self) -> &'static str;

    /// Check that `source` compiles without running it.
    fn compile(&self, source: &str) -> Result<(), InjectionFailure>;

    /// Run `source` and report whether it matched.
    fn execute(&self, source: &str, context: &InjectionContext<'_>) -> Result<bool, InjectionFailure>;
}

/// Mutable state shared by every evaluation against one imposter.
///
/// Clones share the same map. Each operation holds the lock only for its own
/// duration; callers that need ordering across requests must serialize
/// evaluations themselves.
#[derive(Debug, Clone, Default)]
pub struct ImposterState {
    inner: Arc<Mutex<serde_json::Map<String, serde_json::Value>>>,
}

impl ImposterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a JSON object. Anything else yields an empty state.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self {
                inner: Arc::new(Mutex::new(map)),
            },
            _ => Self::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().remove(key)
    }

    /// Add `by` to an integer counter, starting from zero when the key is
    /// missing or not an integer. Returns the new value.
    pub fn increment(&self, key: &str, by: i64) -> i64 {
        let mut map = self.inner.lock();
        let current = map.get(key).and_then(serde_json::Value::as_i64).unwrap_or(0);
        let next = current.saturating_add(by);
        map.insert(key.to_string(), next.into());
        next
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        self.inner.lock().clone()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.snapshot())
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
