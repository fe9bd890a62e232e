use super::{ImposterState, InjectionContext, InjectionEngine, InjectionFailure};
use crate::config::InjectionLimits;
use crate::value::Value;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, FnPtr, Map, Scope, AST};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const INJECT_TARGET: &str = "rift_predicates::inject";

/// Rhai engine for `inject` predicates.
///
/// A script is either an expression evaluated with `config`, `request`,
/// `state` and `logger` in scope, or a closure that is then called with
/// `config`:
///
/// ```text
/// |config| config.request.method == "POST" && config.state.increment("posts") > 2
/// ```
///
/// Compiled scripts are cached by source text, up to
/// `InjectionLimits::max_cached_scripts` entries.
pub struct RhaiInjector {
    engine: Engine,
    cache: Mutex<ScriptCache>,
}

/// LRU cache of compiled scripts. Recency is a logical clock bumped on every
/// lookup.
struct ScriptCache {
    entries: HashMap<String, CachedScript>,
    capacity: usize,
    clock: u64,
}

struct CachedScript {
    ast: Arc<AST>,
    last_used: u64,
}

impl ScriptCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            clock: 0,
        }
    }

    fn get(&mut self, source: &str) -> Option<Arc<AST>> {
        self.clock += 1;
        let entry = self.entries.get_mut(source)?;
        entry.last_used = self.clock;
        Some(Arc::clone(&entry.ast))
    }

    fn insert(&mut self, source: &str, ast: Arc<AST>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(source) {
            self.evict_lru();
        }
        self.clock += 1;
        self.entries.insert(
            source.to_string(),
            CachedScript {
                ast,
                last_used: self.clock,
            },
        );
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(source, _)| source.clone());
        if let Some(source) = oldest {
            self.entries.remove(&source);
            trace!("Evicted compiled script from cache");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn contains(&self, source: &str) -> bool {
        self.entries.contains_key(source)
    }
}

impl RhaiInjector {
    pub fn new(limits: &InjectionLimits) -> Self {
        Self {
            engine: Self::create_engine(limits),
            cache: Mutex::new(ScriptCache::new(limits.max_cached_scripts)),
        }
    }

    fn create_engine(limits: &InjectionLimits) -> Engine {
        let mut engine = Engine::new();

        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_string_size(limits.max_string_size);
        engine.disable_symbol("eval");

        engine.on_print(|text| info!(target: INJECT_TARGET, "{}", text));
        engine.on_debug(|text, _source, pos| debug!(target: INJECT_TARGET, "{} ({})", text, pos));

        engine
            .register_type_with_name::<ScriptState>("ImposterState")
            .register_fn("get", ScriptState::get)
            .register_fn("set", ScriptState::set)
            .register_fn("contains", ScriptState::contains)
            .register_fn("remove", ScriptState::remove)
            .register_fn("increment", ScriptState::increment)
            .register_fn("increment", ScriptState::increment_by)
            .register_indexer_get(ScriptState::get)
            .register_indexer_set(ScriptState::set);

        engine
            .register_type_with_name::<ScriptLogger>("Logger")
            .register_fn("info", ScriptLogger::info)
            .register_fn("warn", ScriptLogger::warn)
            .register_fn("error", ScriptLogger::error);

        engine
    }

    fn ast(&self, source: &str) -> Result<Arc<AST>, InjectionFailure> {
        if let Some(ast) = self.cache.lock().get(source) {
            return Ok(ast);
        }
        let ast = Arc::new(
            self.engine
                .compile(source)
                .map_err(|e| InjectionFailure(format!("Failed to compile script: {e}")))?,
        );
        self.cache.lock().insert(source, Arc::clone(&ast));
        Ok(ast)
    }
}

impl Default for RhaiInjector {
    fn default() -> Self {
        Self::new(&InjectionLimits::default())
    }
}

impl InjectionEngine for RhaiInjector {
    fn name(&self) -> &'static str {
        "rhai"
    }

    fn compile(&self, source: &str) -> Result<(), InjectionFailure> {
        self.ast(source).map(|_| ())
    }

    fn execute(&self, source: &str, context: &InjectionContext<'_>) -> Result<bool, InjectionFailure> {
        let ast = self.ast(source)?;

        let request = json_to_dynamic(context.request.to_json());
        let state = ScriptState(context.state.clone());
        let config = Dynamic::from_map(build_config(context.request, &request, &state));

        let mut scope = Scope::new();
        scope.push("config", config.clone());
        scope.push("request", request);
        scope.push("state", state);
        scope.push("logger", ScriptLogger);

        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| InjectionFailure(e.to_string()))?;

        let result = match result.clone().try_cast::<FnPtr>() {
            Some(function) => function
                .call::<Dynamic>(&self.engine, &ast, (config,))
                .map_err(|e| InjectionFailure(e.to_string()))?,
            None => result,
        };

        Ok(is_truthy(&result))
    }
}

/// The `config` map handed to scripts. Requests that look like HTTP or TCP
/// requests also have their fields copied to the top level, for scripts
/// written against the older `function (request, ...)` calling convention.
fn build_config(request_value: &Value, request: &Dynamic, state: &ScriptState) -> Map {
    let mut config = Map::new();
    config.insert("request".into(), request.clone());
    config.insert("state".into(), Dynamic::from(state.clone()));
    config.insert("logger".into(), Dynamic::from(ScriptLogger));

    let legacy_shape = request_value.field("method").is_some_and(Value::is_truthy)
        || request_value.field("data").is_some_and(Value::is_truthy);
    if legacy_shape {
        if let Some(fields) = request.read_lock::<Map>() {
            for (key, value) in fields.iter() {
                config.insert(key.clone(), value.clone());
            }
        }
    }
    config
}

fn is_truthy(value: &Dynamic) -> bool {
    if value.is_unit() {
        false
    } else if let Ok(b) = value.as_bool() {
        b
    } else if let Ok(i) = value.as_int() {
        i != 0
    } else if let Ok(f) = value.as_float() {
        f != 0.0 && !f.is_nan()
    } else if value.is_string() {
        value
            .clone()
            .into_immutable_string()
            .is_ok_and(|s| !s.is_empty())
    } else {
        true
    }
}

/// Script-side handle to the imposter state.
#[derive(Clone)]
struct ScriptState(ImposterState);

impl ScriptState {
    fn get(&mut self, key: String) -> Dynamic {
        self.0
            .get(&key)
            .map(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    }

    fn set(&mut self, key: String, value: Dynamic) {
        self.0.set(key, dynamic_to_json(value));
    }

    fn contains(&mut self, key: String) -> bool {
        self.0.contains(&key)
    }

    fn remove(&mut self, key: String) -> Dynamic {
        self.0
            .remove(&key)
            .map(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    }

    fn increment(&mut self, key: String) -> i64 {
        self.0.increment(&key, 1)
    }

    fn increment_by(&mut self, key: String, by: i64) -> i64 {
        self.0.increment(&key, by)
    }
}

/// Script-side logger forwarding to `tracing`.
#[derive(Clone, Copy)]
struct ScriptLogger;

impl ScriptLogger {
    fn info(&mut self, message: Dynamic) {
        info!(target: INJECT_TARGET, "{}", message);
    }

    fn warn(&mut self, message: Dynamic) {
        warn!(target: INJECT_TARGET, "{}", message);
    }

    fn error(&mut self, message: Dynamic) {
        error!(target: INJECT_TARGET, "{}", message);
    }
}

fn json_to_dynamic(value: JsonValue) -> Dynamic {
    match value {
        JsonValue::Null => Dynamic::UNIT,
        JsonValue::Bool(b) => Dynamic::from(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        JsonValue::String(s) => Dynamic::from(s),
        JsonValue::Array(items) => {
            Dynamic::from_array(items.into_iter().map(json_to_dynamic).collect())
        }
        JsonValue::Object(object) => {
            let mut map = Map::new();
            for (k, v) in object {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from_map(map)
        }
    }
}

fn dynamic_to_json(value: Dynamic) -> JsonValue {
    if value.is_unit() {
        JsonValue::Null
    } else if let Ok(b) = value.as_bool() {
        JsonValue::Bool(b)
    } else if let Ok(i) = value.as_int() {
        JsonValue::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    } else if value.is_string() {
        JsonValue::String(value.to_string())
    } else if value.is_array() {
        let items = value.cast::<rhai::Array>();
        JsonValue::Array(items.into_iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        let map = value.cast::<Map>();
        JsonValue::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        )
    } else {
        JsonValue::String(value.to_string())
    }
}
