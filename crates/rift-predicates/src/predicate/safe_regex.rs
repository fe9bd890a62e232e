//! Heuristic check for regular expressions prone to catastrophic backtracking.
//!
//! The `regex` crate matches in linear time, so nothing here blocks
//! evaluation. The check flags patterns that would hang a backtracking
//! engine (nested quantifiers such as `(a+)+`, or very many quantifiers), so
//! operators can spot stubs that would misbehave elsewhere.

use regex_syntax::ast::{parse::Parser, Ast};
use tracing::warn;

/// Maximum number of repetition operators before a pattern is considered unsafe.
const REPETITION_LIMIT: usize = 25;

/// Returns `false` for patterns with star height above one, more than
/// [`REPETITION_LIMIT`] repetitions, or that cannot be parsed.
pub fn is_safe_regex(pattern: &str) -> bool {
    let Ok(ast) = Parser::new().parse(pattern) else {
        return false;
    };
    let mut repetitions = 0;
    walk(&ast, 0, &mut repetitions)
}

fn walk(ast: &Ast, star_height: usize, repetitions: &mut usize) -> bool {
    match ast {
        Ast::Repetition(rep) => {
            *repetitions += 1;
            let height = star_height + 1;
            if height > 1 || *repetitions > REPETITION_LIMIT {
                return false;
            }
            walk(&rep.ast, height, repetitions)
        }
        Ast::Group(group) => walk(&group.ast, star_height, repetitions),
        Ast::Alternation(alt) => alt
            .asts
            .iter()
            .all(|child| walk(child, star_height, repetitions)),
        Ast::Concat(concat) => concat
            .asts
            .iter()
            .all(|child| walk(child, star_height, repetitions)),
        _ => true,
    }
}

/// Log a warning for unsafe patterns. Never fails.
pub fn warn_if_unsafe(pattern: &str) {
    if !is_safe_regex(pattern) {
        warn!(
            "If the engine becomes unresponsive, it is because of this unsafe regular expression: {}",
            pattern
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_simple_patterns_are_safe() {
        assert!(is_safe_regex(r"^/api/v\d+/users$"));
        assert!(is_safe_regex(r"a+b*c?"));
        assert!(is_safe_regex(r"(foo|bar)+"));
        assert!(is_safe_regex(""));
    }

    #[test]
    fn test_nested_quantifiers_are_unsafe() {
        assert!(!is_safe_regex(r"(a+)+$"));
        assert!(!is_safe_regex(r"(x*y?)*"));
        assert!(!is_safe_regex(r"((ab)*c)+"));
    }

    #[test]
    fn test_repetition_limit() {
        let within = "a*".repeat(REPETITION_LIMIT);
        let over = "a*".repeat(REPETITION_LIMIT + 1);
        assert!(is_safe_regex(&within));
        assert!(!is_safe_regex(&over));
    }

    #[test]
    fn test_unparseable_is_unsafe() {
        assert!(!is_safe_regex("(unclosed"));
    }

    #[test]
    #[traced_test]
    fn test_warns_on_unsafe_pattern() {
        warn_if_unsafe(r"(a+)+$");
        assert!(logs_contain("unsafe regular expression: (a+)+$"));
    }

    #[test]
    #[traced_test]
    fn test_no_warning_for_safe_pattern() {
        warn_if_unsafe(r"\d+");
        assert!(!logs_contain("unsafe regular expression"));
    }
}
