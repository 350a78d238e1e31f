//! Compilation of raw rule trees into the flat rule arena.
//!
//! Registration is idempotent: a raw rule reached through two include paths
//! compiles once and reuses its id (keyed on the raw rule's identity, the
//! first repository chain wins). The id is recorded *before* children
//! compile, which is what makes self-referencing and mutually-including
//! rules terminate.

use std::collections::HashMap;
use std::sync::Arc;

use crate::grammars::raw::{Captures, RawGrammar, RawRule};
use crate::grammars::regex_source::RegexSource;
use crate::grammars::rules::{
    BeginEndRule, BeginWhileRule, CaptureRef, END_RULE_ID, IncludeOnlyRule, MatchRule, Rule,
    RuleId, ScopeName, WHILE_RULE_ID,
};

/// Everything a rule needs to resolve its references: the grammar it belongs
/// to (for `$self`) and the repository chain it was found in, innermost last.
#[derive(Clone)]
struct Context<'a> {
    grammar: &'a RawGrammar,
    repositories: Vec<&'a HashMap<String, RawRule>>,
}

impl<'a> Context<'a> {
    fn for_grammar(grammar: &'a RawGrammar) -> Self {
        Self {
            grammar,
            repositories: vec![&grammar.repository],
        }
    }

    fn lookup(&self, name: &str) -> Option<&'a RawRule> {
        self.repositories
            .iter()
            .rev()
            .find_map(|repo| repo.get(name))
    }
}

pub(crate) struct RuleCompiler<'a> {
    base: &'a RawGrammar,
    raws: &'a HashMap<String, Arc<RawGrammar>>,
    rules: Vec<Option<Rule>>,
    /// Memo keyed on raw rule identity; registering twice returns the same id
    ids_by_raw: HashMap<*const RawRule, RuleId>,
    /// `$self` / `$base` / whole-grammar include roots, per scope name
    root_ids: HashMap<String, RuleId>,
}

impl<'a> RuleCompiler<'a> {
    pub fn new(base: &'a RawGrammar, raws: &'a HashMap<String, Arc<RawGrammar>>) -> Self {
        Self {
            base,
            raws,
            rules: Vec::new(),
            ids_by_raw: HashMap::new(),
            root_ids: HashMap::new(),
        }
    }

    pub fn into_rules(self) -> Vec<Rule> {
        self.rules
            .into_iter()
            .enumerate()
            .map(|(index, rule)| {
                rule.unwrap_or_else(|| {
                    Rule::IncludeOnly(IncludeOnlyRule {
                        id: RuleId(index as u32),
                        name: None,
                        content_name: None,
                        patterns: Vec::new(),
                        has_missing_patterns: false,
                    })
                })
            })
            .collect()
    }

    fn alloc(&mut self) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(None);
        id
    }

    /// Compiles a grammar's root patterns into an `IncludeOnly` container.
    pub fn root_id(&mut self, grammar: &'a RawGrammar) -> RuleId {
        if let Some(&id) = self.root_ids.get(&grammar.scope_name) {
            return id;
        }

        let id = self.alloc();
        self.root_ids.insert(grammar.scope_name.clone(), id);

        let ctx = Context::for_grammar(grammar);
        let (patterns, has_missing_patterns) = self.compile_patterns(&grammar.patterns, &ctx);
        self.rules[id.index()] = Some(Rule::IncludeOnly(IncludeOnlyRule {
            id,
            name: None,
            content_name: None,
            patterns,
            has_missing_patterns,
        }));

        id
    }

    /// Compiles a rule that lives directly in `grammar` (used for injection
    /// tables, which sit outside the root pattern list).
    pub fn compile_rule_in(&mut self, grammar: &'a RawGrammar, raw: &'a RawRule) -> RuleId {
        let ctx = Context::for_grammar(grammar);
        self.rule_id(raw, &ctx)
    }

    fn rule_id(&mut self, raw: &'a RawRule, ctx: &Context<'a>) -> RuleId {
        let key = raw as *const RawRule;
        if let Some(&id) = self.ids_by_raw.get(&key) {
            return id;
        }

        let id = self.alloc();
        self.ids_by_raw.insert(key, id);

        let name = raw.name.as_deref().map(ScopeName::parse);
        let content_name = raw.content_name.as_deref().map(ScopeName::parse);

        let rule = if let Some(match_source) = &raw.match_ {
            Rule::Match(MatchRule {
                id,
                name,
                match_: RegexSource::new(match_source.clone(), id),
                captures: self.compile_captures(&raw.captures, ctx),
            })
        } else if let Some(begin_source) = &raw.begin {
            let begin = RegexSource::new(begin_source.clone(), id);
            let begin_captures = self.compile_captures(
                if raw.begin_captures.is_empty() {
                    &raw.captures
                } else {
                    &raw.begin_captures
                },
                ctx,
            );
            let (patterns, has_missing_patterns) =
                self.compile_patterns(raw.patterns.as_deref().unwrap_or(&[]), ctx);

            if let Some(while_source) = &raw.while_ {
                Rule::BeginWhile(BeginWhileRule {
                    id,
                    name,
                    content_name,
                    begin,
                    begin_captures,
                    while_: RegexSource::new(while_source.clone(), WHILE_RULE_ID),
                    while_captures: self.compile_captures(
                        if raw.while_captures.is_empty() {
                            &raw.captures
                        } else {
                            &raw.while_captures
                        },
                        ctx,
                    ),
                    patterns,
                    has_missing_patterns,
                })
            } else {
                // a missing end pattern compiles to something unmatchable so
                // the span can only be closed by the document ending
                let end_source = raw.end.clone().unwrap_or_else(|| "\u{FFFF}".to_owned());
                Rule::BeginEnd(BeginEndRule {
                    id,
                    name,
                    content_name,
                    begin,
                    begin_captures,
                    end: RegexSource::new(end_source, END_RULE_ID),
                    end_captures: self.compile_captures(
                        if raw.end_captures.is_empty() {
                            &raw.captures
                        } else {
                            &raw.end_captures
                        },
                        ctx,
                    ),
                    apply_end_pattern_last: raw.apply_end_pattern_last,
                    patterns,
                    has_missing_patterns,
                })
            }
        } else {
            // no match, no begin: a container of nested patterns
            let mut ctx = ctx.clone();
            if !raw.repository.is_empty() {
                ctx.repositories.push(&raw.repository);
            }

            let (patterns, has_missing_patterns) = match (&raw.patterns, &raw.include) {
                // an `include` with no patterns list takes the place of the
                // patterns; with a patterns list present the include is
                // ignored entirely
                (None, Some(include)) => {
                    let mut out = Vec::new();
                    if let Some(included) = self.resolve_include(include, &ctx)
                        && !self.is_prunable(included)
                    {
                        out.push(included);
                    }
                    let has_missing = out.is_empty();
                    (out, has_missing)
                }
                (patterns, _) => {
                    self.compile_patterns(patterns.as_deref().unwrap_or(&[]), &ctx)
                }
            };

            Rule::IncludeOnly(IncludeOnlyRule {
                id,
                name,
                content_name,
                patterns,
                has_missing_patterns,
            })
        };

        self.rules[id.index()] = Some(rule);
        id
    }

    fn compile_patterns(
        &mut self,
        patterns: &'a [RawRule],
        ctx: &Context<'a>,
    ) -> (Vec<RuleId>, bool) {
        let mut out = Vec::new();

        for pattern in patterns {
            let resolved = if let Some(include) = &pattern.include {
                self.resolve_include(include, ctx)
            } else {
                Some(self.rule_id(pattern, ctx))
            };

            let Some(id) = resolved else { continue };

            // a container whose own patterns all failed to resolve would be
            // an unconditionally-empty alternative; drop it from the parent
            if self.is_prunable(id) {
                log::debug!("dropping rule {} with only missing patterns", id.0);
                continue;
            }

            out.push(id);
        }

        let has_missing = out.len() != patterns.len();
        (out, has_missing)
    }

    /// True for containers whose patterns went missing entirely.
    /// Rules still mid-compilation (cycles) are never pruned.
    fn is_prunable(&self, id: RuleId) -> bool {
        match self.rules.get(id.index()) {
            Some(Some(Rule::IncludeOnly(r))) => r.has_missing_patterns && r.patterns.is_empty(),
            Some(Some(Rule::BeginEnd(r))) => r.has_missing_patterns && r.patterns.is_empty(),
            Some(Some(Rule::BeginWhile(r))) => r.has_missing_patterns && r.patterns.is_empty(),
            _ => false,
        }
    }

    fn resolve_include(&mut self, include: &str, ctx: &Context<'a>) -> Option<RuleId> {
        if let Some(local) = include.strip_prefix('#') {
            return match ctx.lookup(local) {
                Some(rule) => Some(self.rule_id(rule, ctx)),
                None => {
                    log::warn!(
                        "cannot find repository rule #{local} in <{}>",
                        ctx.grammar.scope_name
                    );
                    None
                }
            };
        }

        if include == "$self" {
            return Some(self.root_id(ctx.grammar));
        }
        if include == "$base" {
            let base = self.base;
            return Some(self.root_id(base));
        }

        // external reference: `scope` or `scope#rule`
        let (scope_name, external_rule) = match include.split_once('#') {
            Some((scope, rule)) => (scope, Some(rule)),
            None => (include, None),
        };

        let raws = self.raws;
        let Some(external) = raws.get(scope_name).map(|g| g.as_ref()) else {
            log::debug!("grammar <{scope_name}> was never supplied, include contributes nothing");
            return None;
        };

        match external_rule {
            None => Some(self.root_id(external)),
            Some(rule_name) => match external.repository.get(rule_name) {
                Some(rule) => {
                    let ctx = Context::for_grammar(external);
                    Some(self.rule_id(rule, &ctx))
                }
                None => {
                    log::warn!("cannot find repository rule #{rule_name} in <{scope_name}>");
                    None
                }
            },
        }
    }

    fn compile_captures(
        &mut self,
        captures: &'a Captures,
        ctx: &Context<'a>,
    ) -> Vec<Option<CaptureRef>> {
        if captures.is_empty() {
            return Vec::new();
        }

        let max_capture = captures.0.keys().max().copied().unwrap_or_default();
        let mut out: Vec<Option<CaptureRef>> = vec![None; max_capture + 1];

        for (&index, rule) in &captures.0 {
            let retokenize_rule = if rule.patterns.is_some() {
                Some(self.rule_id(rule, ctx))
            } else {
                None
            };
            out[index] = Some(CaptureRef {
                name: rule.name.as_deref().map(ScopeName::parse),
                content_name: rule.content_name.as_deref().map(ScopeName::parse),
                retokenize_rule,
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawGrammar {
        serde_json::from_value(value).unwrap()
    }

    fn compile(grammar: RawGrammar) -> Vec<Rule> {
        let mut raws = HashMap::new();
        let scope = grammar.scope_name.clone();
        raws.insert(scope.clone(), Arc::new(grammar));
        let base = Arc::clone(&raws[&scope]);
        let mut compiler = RuleCompiler::new(base.as_ref(), &raws);
        let root = compiler.root_id(base.as_ref());
        assert_eq!(root, RuleId(0));
        compiler.into_rules()
    }

    #[test]
    fn repository_rule_included_twice_compiles_once() {
        let rules = compile(raw(json!({
            "scopeName": "source.t",
            "patterns": [{ "include": "#kw" }, { "include": "#kw" }],
            "repository": {
                "kw": { "match": "\\bif\\b", "name": "keyword.control" }
            }
        })));

        let match_rules = rules
            .iter()
            .filter(|r| matches!(r, Rule::Match(_)))
            .count();
        assert_eq!(match_rules, 1);

        let Rule::IncludeOnly(root) = &rules[0] else {
            panic!("root must be a container")
        };
        assert_eq!(root.patterns.len(), 2);
        assert_eq!(root.patterns[0], root.patterns[1]);
    }

    #[test]
    fn self_reference_terminates() {
        let rules = compile(raw(json!({
            "scopeName": "source.t",
            "patterns": [
                { "begin": "\\{", "end": "\\}", "patterns": [{ "include": "$self" }] }
            ]
        })));

        let Rule::BeginEnd(block) = &rules[1] else {
            panic!("expected a begin/end rule")
        };
        // $self resolves back to the root container
        assert_eq!(block.patterns, vec![RuleId(0)]);
    }

    #[test]
    fn unresolved_external_include_is_pruned() {
        let rules = compile(raw(json!({
            "scopeName": "source.t",
            "patterns": [
                { "match": "x", "name": "constant" },
                { "patterns": [{ "include": "source.missing" }] }
            ]
        })));

        let Rule::IncludeOnly(root) = &rules[0] else {
            panic!("root must be a container")
        };
        // the container whose only pattern was the missing external
        // is dropped from the root entirely
        assert_eq!(root.patterns.len(), 1);
        assert!(root.has_missing_patterns);
        assert!(matches!(&rules[root.patterns[0].index()], Rule::Match(_)));
    }

    #[test]
    fn begin_without_end_gets_an_unmatchable_end() {
        let rules = compile(raw(json!({
            "scopeName": "source.t",
            "patterns": [{ "begin": "<", "name": "meta.tag" }]
        })));

        let Rule::BeginEnd(r) = &rules[1] else {
            panic!("expected a begin/end rule")
        };
        assert_eq!(r.end.source(), "\u{FFFF}");
    }

    #[test]
    fn rule_with_nothing_compiles_to_empty_container() {
        let rules = compile(raw(json!({
            "scopeName": "source.t",
            "patterns": [{ "name": "just.a.name" }]
        })));

        let Rule::IncludeOnly(r) = &rules[1] else {
            panic!("expected a container")
        };
        assert!(r.patterns.is_empty());
        assert!(!r.has_missing_patterns);
    }

    #[test]
    fn capture_with_patterns_gets_a_retokenize_rule() {
        let rules = compile(raw(json!({
            "scopeName": "source.t",
            "patterns": [{
                "match": "(foo)",
                "captures": {
                    "1": { "name": "wrapped", "patterns": [{ "match": "o", "name": "oh" }] }
                }
            }]
        })));

        let Rule::Match(m) = &rules[1] else {
            panic!("expected a match rule")
        };
        let capture = m.captures[1].as_ref().unwrap();
        assert!(capture.retokenize_rule.is_some());
    }

    #[test]
    fn local_repositories_shadow_outer_ones() {
        let rules = compile(raw(json!({
            "scopeName": "source.t",
            "patterns": [{
                "patterns": [{ "include": "#x" }],
                "repository": { "x": { "match": "inner", "name": "inner.scope" } }
            }],
            "repository": { "x": { "match": "outer", "name": "outer.scope" } }
        })));

        let inner_wins = rules.iter().any(|r| {
            matches!(r, Rule::Match(m) if m.match_.source() == "inner")
        });
        let outer_compiled = rules.iter().any(|r| {
            matches!(r, Rule::Match(m) if m.match_.source() == "outer")
        });
        assert!(inner_wins);
        assert!(!outer_compiled);
    }
}
