use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::TintaResult;

/// A single rule of a TextMate grammar, straight out of the JSON.
///
/// Everything is optional; which fields are present decides what the rule
/// compiles to:
///
/// ```json
/// { "match": "\\bif\\b", "name": "keyword.control.if.js" }
/// ```
///
/// ```json
/// {
///   "name": "string.quoted.double.js",
///   "begin": "\"",
///   "end": "\"",
///   "patterns": [{ "match": "\\\\.", "name": "constant.character.escape.js" }]
/// }
/// ```
///
/// ```json
/// { "include": "#expressions" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"), default)]
pub struct RawRule {
    /// Reference to other patterns:
    /// `#name` (repository), `$self`, `$base`, `scope.lang` or `scope.lang#name`
    pub include: Option<String>,
    /// Scope name for the whole rule. May contain `\1`..`\9` back-references
    /// resolved against the matched text, and may hold several
    /// space-separated scopes.
    pub name: Option<String>,
    /// Scope name for the text between the begin and end delimiters
    pub content_name: Option<String>,
    /// Regular expression for single-line match rules
    #[serde(rename(deserialize = "match"))]
    pub match_: Option<String>,
    /// Captures for `match`
    pub captures: Captures,
    /// Regular expression opening a begin/end or begin/while span
    pub begin: Option<String>,
    /// Captures for `begin`; falls back to `captures` when absent
    pub begin_captures: Captures,
    /// Regular expression closing a begin/end span.
    /// Can reference captures of the begin match with `\1`, `\2`, ...
    pub end: Option<String>,
    /// Captures for `end`; falls back to `captures` when absent
    pub end_captures: Captures,
    /// Regular expression re-validated at every line start while a
    /// begin/while span stays open
    #[serde(rename(deserialize = "while"))]
    pub while_: Option<String>,
    /// Captures for `while`; falls back to `captures` when absent
    pub while_captures: Captures,
    /// Nested patterns. `None` and `Some(vec![])` differ: an absent list lets
    /// `include` take its place, a present one makes `include` ignored.
    pub patterns: Option<Vec<RawRule>>,
    /// Named sub-rules reachable via `#name` from this rule downwards
    pub repository: HashMap<String, RawRule>,
    /// Try the end pattern after the nested patterns instead of before
    #[serde(deserialize_with = "deserialize_flag")]
    pub apply_end_pattern_last: bool,
}

/// Numbered capture table. Keys in the JSON are strings ("0", "1", ...);
/// anything non-numeric in there is ignored.
#[derive(Debug, Clone, Default)]
pub struct Captures(pub BTreeMap<usize, RawRule>);

impl Captures {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Captures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CapturesVisitor;

        impl<'de> Visitor<'de> for CapturesVisitor {
            type Value = Captures;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of capture numbers to rules")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut out = BTreeMap::new();
                while let Some(key) = map.next_key::<String>()? {
                    if let Ok(index) = key.parse::<usize>() {
                        out.insert(index, map.next_value()?);
                    } else {
                        let _: serde::de::IgnoredAny = map.next_value()?;
                    }
                }
                Ok(Captures(out))
            }
        }

        deserializer.deserialize_map(CapturesVisitor)
    }
}

/// Accepts `true`/`false` as well as the `0`/`1` some grammars in the wild use
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlagVisitor;

    impl Visitor<'_> for FlagVisitor {
        type Value = bool;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a boolean or 0/1")
        }

        fn visit_bool<E: serde::de::Error>(self, value: bool) -> Result<bool, E> {
            Ok(value)
        }

        fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<bool, E> {
            Ok(value != 0)
        }

        fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<bool, E> {
            Ok(value != 0)
        }
    }

    deserializer.deserialize_any(FlagVisitor)
}

/// Top-level structure of a TextMate grammar file after JSON parsing.
///
/// This is the boundary format: how the text got here (plist conversion,
/// bundled registry, network) is not this crate's concern.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"), default)]
pub struct RawGrammar {
    /// Human-readable language name, e.g. "JavaScript"
    pub name: Option<String>,
    /// Unique identifier for this grammar, e.g. "source.js"
    pub scope_name: String,
    /// File extensions this grammar applies to
    pub file_types: Vec<String>,
    /// Optional regex identifying files by their first line
    pub first_line_match: Option<String>,
    /// Root patterns, applied first when tokenizing
    pub patterns: Vec<RawRule>,
    /// Named pattern definitions referenced by `#name` includes
    pub repository: HashMap<String, RawRule>,
    /// Selector expression -> patterns injected into this grammar itself
    pub injections: BTreeMap<String, RawRule>,
    /// Where this grammar wants to be injected when used as an injection
    /// grammar, e.g. `L:text.html -comment`
    pub injection_selector: Option<String>,
}

impl RawGrammar {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> TintaResult<Self> {
        let file = File::open(&path)?;
        let raw_grammar = serde_json::from_reader(&file)?;
        Ok(raw_grammar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_common_rule_shapes() {
        let grammar: RawGrammar = serde_json::from_str(
            r##"{
                "scopeName": "source.test",
                "patterns": [
                    { "match": "\\bif\\b", "name": "keyword.control" },
                    { "begin": "\"", "end": "\"", "name": "string.quoted",
                      "applyEndPatternLast": 1,
                      "beginCaptures": { "0": { "name": "punctuation.begin" } } },
                    { "include": "#block" }
                ],
                "repository": {
                    "block": { "patterns": [{ "include": "$self" }] }
                }
            }"##,
        )
        .unwrap();

        assert_eq!(grammar.scope_name, "source.test");
        assert_eq!(grammar.patterns.len(), 3);
        assert_eq!(grammar.patterns[0].match_.as_deref(), Some("\\bif\\b"));
        assert!(grammar.patterns[1].apply_end_pattern_last);
        assert_eq!(
            grammar.patterns[1].begin_captures.0[&0].name.as_deref(),
            Some("punctuation.begin")
        );
        assert_eq!(grammar.patterns[2].include.as_deref(), Some("#block"));
        assert!(grammar.repository.contains_key("block"));
    }

    #[test]
    fn missing_patterns_field_is_distinguishable_from_empty() {
        let with_include: RawRule =
            serde_json::from_str(r##"{ "include": "#a", "patterns": [] }"##).unwrap();
        assert!(matches!(with_include.patterns.as_deref(), Some([])));

        let without: RawRule = serde_json::from_str(r##"{ "include": "#a" }"##).unwrap();
        assert!(without.patterns.is_none());
    }

    #[test]
    fn non_numeric_capture_keys_are_ignored() {
        let rule: RawRule = serde_json::from_str(
            r#"{ "match": "x", "captures": { "1": { "name": "a" }, "$meta": { "name": "b" } } }"#,
        )
        .unwrap();
        assert_eq!(rule.captures.0.len(), 1);
        assert_eq!(rule.captures.0[&1].name.as_deref(), Some("a"));
    }
}
