//! Compiled rule nodes.
//!
//! All rules of a grammar (and of every grammar reachable through includes)
//! live in one flat arena indexed by [`RuleId`]. Cross-references, including
//! self-references and cross-grammar includes, are plain ids resolved through
//! the arena, so the graph has no ownership cycles.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::grammars::regex_source::RegexSource;
use crate::scope::Scope;

/// Dense index of a compiled rule within its grammar's arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u32);

impl RuleId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// The root rule is always the first one compiled.
pub(crate) const ROOT_RULE_ID: RuleId = RuleId(0);
/// Sentinel owner for a frame's end pattern inside a compiled scanner.
pub(crate) const END_RULE_ID: RuleId = RuleId(u32::MAX);
/// Sentinel owner for a frame's while pattern.
pub(crate) const WHILE_RULE_ID: RuleId = RuleId(u32::MAX - 1);

/// A scope label from a grammar `name`/`contentName` field.
///
/// Most labels are static, but a label may reference captured text
/// (`"meta.tag.\1"`), in which case it is resolved against the actual match.
#[derive(Debug, Clone)]
pub(crate) enum ScopeName {
    Static(Vec<Scope>),
    Capturing(String),
}

impl ScopeName {
    pub fn parse(label: &str) -> ScopeName {
        if has_capture_reference(label) {
            ScopeName::Capturing(label.to_owned())
        } else {
            ScopeName::Static(Scope::parse_list(label))
        }
    }

    pub fn resolve(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Vec<Scope> {
        match self {
            ScopeName::Static(scopes) => scopes.clone(),
            ScopeName::Capturing(label) => {
                Scope::parse_list(&substitute_capture_references(label, line, captures))
            }
        }
    }
}

fn has_capture_reference(label: &str) -> bool {
    let bytes = label.as_bytes();
    (0..bytes.len().saturating_sub(1))
        .any(|i| bytes[i] == b'\\' && bytes[i + 1].is_ascii_digit())
}

/// Replaces `\1`..`\9` with the raw text the captures matched.
/// Unlike end-pattern substitution this does not regex-escape: the result is
/// a scope name, not a pattern.
fn substitute_capture_references(
    label: &str,
    line: &str,
    captures: &[Option<(usize, usize)>],
) -> String {
    let mut out = String::with_capacity(label.len());
    let mut chars = label.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\\' && chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            let mut index = 0usize;
            while let Some(&d) = chars.peek() {
                let Some(digit) = d.to_digit(10) else { break };
                index = index * 10 + digit as usize;
                chars.next();
            }
            if let Some(Some((start, end))) = captures.get(index) {
                out.push_str(line[*start..*end].trim());
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// One capture slot of a match/begin/end/while pattern.
#[derive(Debug, Clone)]
pub(crate) struct CaptureRef {
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    /// When the capture carries nested patterns, the rule to re-tokenize the
    /// captured substring with
    pub retokenize_rule: Option<RuleId>,
}

#[derive(Debug, Clone)]
pub(crate) struct MatchRule {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub match_: RegexSource,
    pub captures: Vec<Option<CaptureRef>>,
}

/// Pure container: contributes its children's patterns, never matches itself.
#[derive(Debug, Clone)]
pub(crate) struct IncludeOnlyRule {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub patterns: Vec<RuleId>,
    pub has_missing_patterns: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct BeginEndRule {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: RegexSource,
    pub begin_captures: Vec<Option<CaptureRef>>,
    pub end: RegexSource,
    pub end_captures: Vec<Option<CaptureRef>>,
    pub apply_end_pattern_last: bool,
    pub patterns: Vec<RuleId>,
    pub has_missing_patterns: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct BeginWhileRule {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: RegexSource,
    pub begin_captures: Vec<Option<CaptureRef>>,
    pub while_: RegexSource,
    pub while_captures: Vec<Option<CaptureRef>>,
    pub patterns: Vec<RuleId>,
    pub has_missing_patterns: bool,
}

/// The closed set of rule kinds.
#[derive(Debug, Clone)]
pub(crate) enum Rule {
    Match(MatchRule),
    IncludeOnly(IncludeOnlyRule),
    BeginEnd(BeginEndRule),
    BeginWhile(BeginWhileRule),
}

impl Rule {
    pub fn id(&self) -> RuleId {
        match self {
            Rule::Match(r) => r.id,
            Rule::IncludeOnly(r) => r.id,
            Rule::BeginEnd(r) => r.id,
            Rule::BeginWhile(r) => r.id,
        }
    }

    pub fn name(&self) -> Option<&ScopeName> {
        match self {
            Rule::Match(r) => r.name.as_ref(),
            Rule::IncludeOnly(r) => r.name.as_ref(),
            Rule::BeginEnd(r) => r.name.as_ref(),
            Rule::BeginWhile(r) => r.name.as_ref(),
        }
    }

    pub fn content_name(&self) -> Option<&ScopeName> {
        match self {
            Rule::Match(_) => None,
            Rule::IncludeOnly(r) => r.content_name.as_ref(),
            Rule::BeginEnd(r) => r.content_name.as_ref(),
            Rule::BeginWhile(r) => r.content_name.as_ref(),
        }
    }

    pub fn patterns(&self) -> &[RuleId] {
        match self {
            Rule::Match(_) => &[],
            Rule::IncludeOnly(r) => &r.patterns,
            Rule::BeginEnd(r) => &r.patterns,
            Rule::BeginWhile(r) => &r.patterns,
        }
    }

    pub fn name_scopes(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Vec<Scope> {
        self.name()
            .map(|n| n.resolve(line, captures))
            .unwrap_or_default()
    }

    pub fn content_name_scopes(
        &self,
        line: &str,
        captures: &[Option<(usize, usize)>],
    ) -> Vec<Scope> {
        self.content_name()
            .map(|n| n.resolve(line, captures))
            .unwrap_or_default()
    }
}

/// Depth-first expansion of a rule into the flat alternative list its scanner
/// is compiled from.
///
/// `is_first` distinguishes the two compilation modes: a rule compiling its
/// own program contributes its children, while a begin-kind rule offered as a
/// nested alternative contributes only its begin pattern. The visited set
/// makes diamond and cyclic includes terminate.
pub(crate) fn collect_patterns_recursive<'g>(
    arena: &'g [Rule],
    rule_id: RuleId,
    is_first: bool,
    visited: &mut HashSet<RuleId>,
    out: &mut Vec<&'g RegexSource>,
) {
    match &arena[rule_id.index()] {
        Rule::Match(r) => out.push(&r.match_),
        Rule::IncludeOnly(r) => {
            // the visited set only guards container expansion; leaves carry
            // no recursion and may legitimately appear more than once
            if !visited.insert(rule_id) {
                return;
            }
            for &child in &r.patterns {
                collect_patterns_recursive(arena, child, false, visited, out);
            }
        }
        Rule::BeginEnd(r) => {
            if is_first {
                if !visited.insert(rule_id) {
                    return;
                }
                for &child in &r.patterns {
                    collect_patterns_recursive(arena, child, false, visited, out);
                }
            } else {
                out.push(&r.begin);
            }
        }
        Rule::BeginWhile(r) => {
            if is_first {
                if !visited.insert(rule_id) {
                    return;
                }
                for &child in &r.patterns {
                    collect_patterns_recursive(arena, child, false, visited, out);
                }
            } else {
                out.push(&r.begin);
            }
        }
    }
}
