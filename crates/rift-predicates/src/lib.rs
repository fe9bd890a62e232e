//! Mountebank-compatible request matching for Rift.
//!
//! ```
//! use rift_predicates::{Evaluator, ImposterState, Predicate, Request};
//! use serde_json::json;
//!
//! let predicate = Predicate::parse(&json!({
//!     "equals": {"method": "POST", "headers": {"Content-Type": "application/json"}}
//! }))
//! .unwrap();
//! let request = Request::new("POST", "/orders").with_header("content-type", "APPLICATION/JSON");
//!
//! let evaluator = Evaluator::new();
//! let matched = evaluator
//!     .evaluate(&predicate, &request.to_value(), &ImposterState::new())
//!     .unwrap();
//! assert!(matched);
//! ```

pub mod config;
pub mod error;
pub mod predicate;
pub mod request;
pub mod scripting;
pub mod value;

pub use config::EngineConfig;
pub use error::{PredicateError, Result};
pub use predicate::{Evaluator, Operator, Predicate, PredicateOptions};
pub use request::{FieldValue, Request};
pub use scripting::{ImposterState, InjectionContext, InjectionEngine, InjectionFailure, RhaiInjector};
pub use value::Value;
