//! Predicate engine: parsing, normalization and evaluation.
//!
//! A request is matched in three steps. Both the expected operand and the
//! request are normalized with the predicate's modifiers ([`normalize`]),
//! then walked field by field ([`structural`]) with an operator-specific leaf
//! comparison ([`operators`]). [`Evaluator`] dispatches on the parsed
//! [`Operator`] and recurses for `not`, `or` and `and`.

mod evaluator;
pub mod normalize;
pub mod operators;
pub mod safe_regex;
pub mod selector;
pub mod structural;
mod types;

pub use evaluator::Evaluator;
pub use normalize::{normalize, MatchConfig, NormalizeOptions};
pub use safe_regex::is_safe_regex;
pub use types::{
    JsonPathSelector, Operator, Predicate, PredicateOptions, Selector, XPathSelector, OPERATORS,
};
