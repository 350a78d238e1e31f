//! Per-pattern source transformation.
//!
//! Grammar regexes go through one rewrite pass when a rule is compiled:
//! `\z` becomes a true end-of-line assertion, `\A`/`\G` mark the pattern as
//! anchor-sensitive (four resolved variants are precomputed), and `\1`..`\9`
//! in end/while sources flag the pattern for per-scan re-substitution.

use crate::grammars::rules::RuleId;

/// Stand-in for an anchor that is disabled in the current scan context.
/// U+FFFF is a noncharacter, so it can never occur in scanned text.
const UNMATCHABLE: char = '\u{FFFF}';

/// The four anchor-resolved renditions of one source string, keyed by
/// whether `\A` and/or `\G` are allowed to assert.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AnchorCache {
    a0_g0: String,
    a0_g1: String,
    a1_g0: String,
    a1_g1: String,
}

/// A single regex source string together with the rule it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegexSource {
    source: String,
    rule_id: RuleId,
    has_back_references: bool,
    anchor_cache: Option<Box<AnchorCache>>,
}

impl RegexSource {
    pub fn new(regex_source: String, rule_id: RuleId) -> Self {
        let (source, has_anchor) = rewrite_source(regex_source);
        let has_back_references = detect_back_references(&source);
        let anchor_cache = if has_anchor {
            Some(Box::new(build_anchor_cache(&source)))
        } else {
            None
        };

        Self {
            source,
            rule_id,
            has_back_references,
            anchor_cache,
        }
    }

    pub fn rule_id(&self) -> RuleId {
        self.rule_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_back_references(&self) -> bool {
        self.has_back_references
    }

    pub fn has_anchor(&self) -> bool {
        self.anchor_cache.is_some()
    }

    /// The source to hand the engine for a given anchor context.
    pub fn resolve_anchors(&self, allow_a: bool, allow_g: bool) -> &str {
        let Some(cache) = &self.anchor_cache else {
            return &self.source;
        };

        match (allow_a, allow_g) {
            (false, false) => &cache.a0_g0,
            (false, true) => &cache.a0_g1,
            (true, false) => &cache.a1_g0,
            (true, true) => &cache.a1_g1,
        }
    }

    /// Substitutes `\1`..`\9` (and higher) with the regex-escaped text the
    /// given captures matched, producing a fresh source string.
    pub fn resolve_back_references(
        &self,
        line: &str,
        captures: &[Option<(usize, usize)>],
    ) -> String {
        let mut out = String::with_capacity(self.source.len());
        let mut chars = self.source.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }

            if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                let mut index = 0usize;
                while let Some(&d) = chars.peek() {
                    let Some(digit) = d.to_digit(10) else { break };
                    index = index * 10 + digit as usize;
                    chars.next();
                }
                let captured = captures
                    .get(index)
                    .copied()
                    .flatten()
                    .map(|(start, end)| &line[start..end])
                    .unwrap_or("");
                escape_regex_characters(captured, &mut out);
            } else {
                out.push('\\');
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
        }

        out
    }
}

/// Rewrites `\z` into `$(?!\n)(?<!\n)` so it means "true line end" regardless
/// of the engine's multi-line settings, and reports whether the source
/// contains `\A` or `\G`.
fn rewrite_source(regex_source: String) -> (String, bool) {
    let mut has_anchor = false;
    let mut rewritten: Option<String> = None;
    let mut last_pushed = 0;

    let bytes = regex_source.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == b'\\' && pos + 1 < bytes.len() {
            match bytes[pos + 1] {
                b'z' => {
                    let out = rewritten.get_or_insert_with(String::new);
                    out.push_str(&regex_source[last_pushed..pos]);
                    out.push_str("$(?!\\n)(?<!\\n)");
                    last_pushed = pos + 2;
                }
                b'A' | b'G' => has_anchor = true,
                _ => {}
            }
            pos += 2;
        } else {
            pos += 1;
        }
    }

    let source = match rewritten {
        Some(mut out) => {
            out.push_str(&regex_source[last_pushed..]);
            out
        }
        None => regex_source,
    };

    (source, has_anchor)
}

fn detect_back_references(source: &str) -> bool {
    let bytes = source.as_bytes();
    let mut pos = 0;
    while pos + 1 < bytes.len() {
        if bytes[pos] == b'\\' {
            if bytes[pos + 1].is_ascii_digit() {
                return true;
            }
            pos += 2;
        } else {
            pos += 1;
        }
    }
    false
}

/// Builds the four variants in one pass: each `\A`/`\G` is either kept or has
/// its letter replaced by the unmatchable sentinel.
fn build_anchor_cache(source: &str) -> AnchorCache {
    let mut a0_g0 = String::with_capacity(source.len());
    let mut a0_g1 = String::with_capacity(source.len());
    let mut a1_g0 = String::with_capacity(source.len());
    let mut a1_g1 = String::with_capacity(source.len());

    let mut chars = source.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            for out in [&mut a0_g0, &mut a0_g1, &mut a1_g0, &mut a1_g1] {
                out.push(ch);
            }
            continue;
        }

        for out in [&mut a0_g0, &mut a0_g1, &mut a1_g0, &mut a1_g1] {
            out.push('\\');
        }
        let Some(next) = chars.next() else { break };
        match next {
            'A' => {
                a0_g0.push(UNMATCHABLE);
                a0_g1.push(UNMATCHABLE);
                a1_g0.push('A');
                a1_g1.push('A');
            }
            'G' => {
                a0_g0.push(UNMATCHABLE);
                a0_g1.push('G');
                a1_g0.push(UNMATCHABLE);
                a1_g1.push('G');
            }
            other => {
                for out in [&mut a0_g0, &mut a0_g1, &mut a1_g0, &mut a1_g1] {
                    out.push(other);
                }
            }
        }
    }

    AnchorCache {
        a0_g0,
        a0_g1,
        a1_g0,
        a1_g1,
    }
}

/// Escapes the characters Oniguruma treats specially so captured text can be
/// spliced back into a pattern as a literal.
fn escape_regex_characters(value: &str, out: &mut String) {
    for ch in value.chars() {
        if matches!(
            ch,
            '-' | '\\'
                | '{'
                | '}'
                | '*'
                | '+'
                | '?'
                | '|'
                | '^'
                | '$'
                | '.'
                | ','
                | '['
                | ']'
                | '('
                | ')'
                | '#'
        ) || ch.is_whitespace()
        {
            out.push('\\');
        }
        out.push(ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(s: &str) -> RegexSource {
        RegexSource::new(s.to_owned(), RuleId(1))
    }

    #[test]
    fn rewrites_z_to_true_line_end() {
        assert_eq!(src(r"foo\z").source(), r"foo$(?!\n)(?<!\n)");
        // escaped backslash before z is left alone
        assert_eq!(src(r"foo\\z").source(), r"foo\\z");
    }

    #[test]
    fn detects_back_references() {
        assert!(src(r"</\1>").has_back_references());
        assert!(!src(r"</\\1>").has_back_references());
        assert!(!src(r"plain").has_back_references());
    }

    #[test]
    fn anchor_variants() {
        let source = src(r"\A(\G.)x");
        assert_eq!(source.resolve_anchors(true, true), r"\A(\G.)x");
        assert_eq!(source.resolve_anchors(true, false), "\\A(\\\u{FFFF}.)x");
        assert_eq!(source.resolve_anchors(false, true), "\\\u{FFFF}(\\G.)x");
        assert_eq!(
            source.resolve_anchors(false, false),
            "\\\u{FFFF}(\\\u{FFFF}.)x"
        );
    }

    #[test]
    fn anchor_free_patterns_have_no_cache() {
        let source = src("plain");
        assert_eq!(source.resolve_anchors(false, false), "plain");
    }

    #[test]
    fn back_reference_resolution_escapes_captured_text() {
        let source = src(r"</\1>");
        let line = "<a.b>text";
        let captures = vec![Some((0, 5)), Some((1, 4))];
        assert_eq!(source.resolve_back_references(line, &captures), r"</a\.b>");
    }

    #[test]
    fn unmatched_back_reference_resolves_to_empty() {
        let source = src(r"end\7");
        assert_eq!(source.resolve_back_references("x", &[Some((0, 1))]), "end");
    }
}
