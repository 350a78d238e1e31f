//! Scope selector parsing and matching.
//!
//! Selectors are the CSS-descendant-like expressions used by injection tables
//! and token-type maps: `L:text.html -comment, source.js`. Parsing is fully
//! generic: evaluating an identifier list against a candidate is delegated to
//! a caller-supplied predicate, so this module does not know what a "name"
//! means for the input being matched.

use std::sync::LazyLock;

use onig::Regex;

/// One top-level alternative of a selector, with its injection precedence:
/// -1 for `L:`, +1 for `R:`, 0 when no marker is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatcherWithPriority {
    pub matcher: Matcher,
    pub priority: i8,
}

/// A parsed selector expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Juxtaposed identifiers, e.g. `source.js string` - evaluated as one
    /// unit by the caller-supplied predicate
    Identifiers(Vec<String>),
    /// Space-separated operands: all must match
    And(Vec<Matcher>),
    /// `,` or `|` separated operands: any may match
    Or(Vec<Matcher>),
    /// `-` prefixed operand: must not match
    Not(Box<Matcher>),
}

impl Matcher {
    /// Evaluates this matcher against `input`, asking `matches_name` whether
    /// an identifier list applies to it.
    pub fn matches<T>(&self, input: &T, matches_name: &dyn Fn(&[String], &T) -> bool) -> bool {
        match self {
            Matcher::Identifiers(names) => matches_name(names, input),
            Matcher::And(inner) => inner.iter().all(|m| m.matches(input, matches_name)),
            Matcher::Or(inner) => inner.iter().any(|m| m.matches(input, matches_name)),
            Matcher::Not(inner) => !inner.matches(input, matches_name),
        }
    }
}

/// Matches the same tokens as vscode-textmate's selector tokenizer
static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([LR]:|[\w.:][\w.:\-]*|[,|\-()])").expect("invalid selector token regex")
});

fn is_identifier(token: &str) -> bool {
    !token.is_empty()
        && !matches!(token, "," | "|" | "-" | "(" | ")")
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
}

fn parse_operand(tokens: &[&str], position: &mut usize) -> Option<Matcher> {
    if *position >= tokens.len() {
        return None;
    }

    match tokens[*position] {
        "-" => {
            *position += 1;
            match parse_operand(tokens, position) {
                Some(negated) => Some(Matcher::Not(Box::new(negated))),
                // a dangling `-` never matches anything
                None => Some(Matcher::Or(Vec::new())),
            }
        }
        "(" => {
            *position += 1;
            let inner = parse_inner_expression(tokens, position);
            if *position < tokens.len() && tokens[*position] == ")" {
                *position += 1;
            }
            Some(inner)
        }
        _ => {
            let mut identifiers = Vec::new();
            while *position < tokens.len() && is_identifier(tokens[*position]) {
                identifiers.push(tokens[*position].to_owned());
                *position += 1;
            }

            if identifiers.is_empty() {
                None
            } else {
                Some(Matcher::Identifiers(identifiers))
            }
        }
    }
}

fn parse_conjunction(tokens: &[&str], position: &mut usize) -> Option<Matcher> {
    let mut matchers = Vec::new();
    while let Some(m) = parse_operand(tokens, position) {
        matchers.push(m);
    }

    match matchers.len() {
        0 => None,
        1 => Some(matchers.pop().unwrap()),
        _ => Some(Matcher::And(matchers)),
    }
}

fn parse_inner_expression(tokens: &[&str], position: &mut usize) -> Matcher {
    let mut matchers = Vec::new();
    while let Some(m) = parse_conjunction(tokens, position) {
        matchers.push(m);
        // consecutive separators collapse
        if *position < tokens.len() && matches!(tokens[*position], "|" | ",") {
            while *position < tokens.len() && matches!(tokens[*position], "|" | ",") {
                *position += 1;
            }
        } else {
            break;
        }
    }

    if matchers.len() == 1 {
        matchers.pop().unwrap()
    } else {
        Matcher::Or(matchers)
    }
}

/// Parses a selector string into its top-level alternatives.
///
/// Each alternative may carry a leading `L:` or `R:` priority marker;
/// malformed markers are logged and skipped, never a parse failure.
pub fn parse_matchers(selector: &str) -> Vec<MatcherWithPriority> {
    let tokens: Vec<&str> = TOKEN_REGEX
        .find_iter(selector)
        .map(|(start, end)| &selector[start..end])
        .collect();

    let mut results = Vec::new();
    let mut position = 0;

    while position < tokens.len() {
        let token = tokens[position];

        let mut priority = 0i8;
        if token.len() == 2 && token.ends_with(':') {
            match token.chars().next() {
                Some('L') => priority = -1,
                Some('R') => priority = 1,
                _ => log::warn!("unknown priority {token} in scope selector"),
            }
            position += 1;
        }

        let Some(matcher) = parse_conjunction(&tokens, &mut position) else {
            break;
        };
        results.push(MatcherWithPriority { matcher, priority });

        if position < tokens.len() && tokens[position] == "," {
            position += 1;
        } else {
            break;
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test predicate: every identifier must be present verbatim in the
    /// candidate list.
    fn contains_all(identifiers: &[String], candidate: &Vec<&str>) -> bool {
        identifiers
            .iter()
            .all(|id| candidate.iter().any(|c| *c == id.as_str()))
    }

    fn eval(selector: &str, candidate: &[&str]) -> Vec<(bool, i8)> {
        let candidate = candidate.to_vec();
        parse_matchers(selector)
            .iter()
            .map(|m| (m.matcher.matches(&candidate, &contains_all), m.priority))
            .collect()
    }

    #[test]
    fn negation_and_priority_alternatives() {
        // "a.b - c, L:d": alternative 1 ANDs a.b with NOT c at priority 0,
        // alternative 2 matches d with left priority
        let parsed = parse_matchers("a.b - c, L:d");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].priority, 0);
        assert_eq!(parsed[1].priority, -1);

        assert_eq!(eval("a.b - c, L:d", &["a.b"]), vec![(true, 0), (false, -1)]);
        assert_eq!(
            eval("a.b - c, L:d", &["a.b", "c"]),
            vec![(false, 0), (false, -1)]
        );
        assert_eq!(eval("a.b - c, L:d", &["d"]), vec![(false, 0), (true, -1)]);
    }

    #[test]
    fn juxtaposition_is_and() {
        assert_eq!(eval("a b", &["a", "b"]), vec![(true, 0)]);
        assert_eq!(eval("a b", &["a"]), vec![(false, 0)]);
    }

    #[test]
    fn parens_and_or() {
        let results = eval("(a | b) - c", &["b"]);
        assert_eq!(results, vec![(true, 0)]);
        assert_eq!(eval("(a | b) - c", &["b", "c"]), vec![(false, 0)]);
        assert_eq!(eval("(a | b) - c", &["x"]), vec![(false, 0)]);
    }

    #[test]
    fn consecutive_separators_collapse() {
        let parsed = parse_matchers("(a ,, b)");
        assert_eq!(parsed.len(), 1);
        assert_eq!(eval("(a ,, b)", &["b"]), vec![(true, 0)]);
    }

    #[test]
    fn right_priority_marker() {
        let parsed = parse_matchers("R:text.html");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].priority, 1);
    }

    #[test]
    fn real_world_selectors_parse() {
        for selector in [
            "L:text.html.markdown",
            "L:text.html -comment",
            "L:(meta.script.svelte | meta.style.svelte) (meta.lang.js) - (meta source)",
            "R:text.html - (comment.block, text.html meta.embedded)",
        ] {
            assert!(!parse_matchers(selector).is_empty(), "failed: {selector}");
        }
    }
}
