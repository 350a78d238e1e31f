mod compiler;
mod raw;
mod regex_source;
mod rules;

use std::collections::HashMap;
use std::sync::Arc;

pub use raw::{Captures, RawGrammar, RawRule};
pub(crate) use regex_source::RegexSource;
pub use rules::RuleId;
pub(crate) use rules::{CaptureRef, END_RULE_ID, Rule, collect_patterns_recursive};

use rules::ROOT_RULE_ID;

use crate::error::{Error, TintaResult};
use crate::matcher::{Matcher, parse_matchers};
use crate::registry::GrammarConfiguration;
use crate::scope::Scope;
use crate::tokenizer::Tokenizer;
use compiler::RuleCompiler;

/// One injected pattern source: a selector alternative guarding a rule.
#[derive(Debug)]
pub(crate) struct Injection {
    pub matcher: Matcher,
    /// -1 (`L:`) tries before the host grammar's own patterns on position
    /// ties, +1 (`R:`) and 0 after
    pub priority: i8,
    pub rule_id: RuleId,
}

/// A fully compiled grammar: the rule arena plus everything tokenization
/// needs at runtime. Immutable once built; dropping it releases every
/// compiled pattern program derived from it.
#[derive(Debug)]
pub struct Grammar {
    pub(crate) scope_name: String,
    pub(crate) scope: Scope,
    pub(crate) root_id: RuleId,
    pub(crate) rules: Vec<Rule>,
    pub(crate) injections: Vec<Injection>,
    pub(crate) initial_language: u32,
    pub(crate) embedded_languages: Vec<(Scope, u32)>,
}

impl Grammar {
    /// Compiles the grammar for `scope_name` out of the supplied raw grammar
    /// store. Every grammar transitively reachable through includes must
    /// already be in `raws`; ones that aren't contribute nothing, they never
    /// fail the build.
    pub(crate) fn build(
        scope_name: &str,
        raws: &HashMap<String, Arc<RawGrammar>>,
        injection_scopes: &[String],
        config: &GrammarConfiguration,
    ) -> TintaResult<Grammar> {
        let base = raws
            .get(scope_name)
            .ok_or_else(|| Error::GrammarNotFound(scope_name.to_owned()))?
            .as_ref();

        let mut compiler = RuleCompiler::new(base, raws);
        let root_id = compiler.root_id(base);
        debug_assert_eq!(root_id, ROOT_RULE_ID);

        let mut injections = Vec::new();

        // the grammar's own injection table
        for (selector, rule) in &base.injections {
            let rule_id = compiler.compile_rule_in(base, rule);
            for parsed in parse_matchers(selector) {
                injections.push(Injection {
                    matcher: parsed.matcher,
                    priority: parsed.priority,
                    rule_id,
                });
            }
        }

        // external injection grammars announced by the registry
        for injection_scope in injection_scopes {
            let Some(injected) = raws.get(injection_scope).map(|g| g.as_ref()) else {
                log::debug!("injection grammar <{injection_scope}> was never supplied");
                continue;
            };
            let Some(selector) = &injected.injection_selector else {
                continue;
            };
            let rule_id = compiler.root_id(injected);
            for parsed in parse_matchers(selector) {
                injections.push(Injection {
                    matcher: parsed.matcher,
                    priority: parsed.priority,
                    rule_id,
                });
            }
        }

        // stable sort: L: injections first, then declaration order
        injections.sort_by_key(|injection| injection.priority);

        Ok(Grammar {
            scope_name: base.scope_name.clone(),
            scope: Scope::new(&base.scope_name),
            root_id,
            rules: compiler.into_rules(),
            injections,
            initial_language: config.initial_language,
            embedded_languages: config
                .embedded_languages
                .iter()
                .map(|(scope, language)| (Scope::new(scope), *language))
                .collect(),
        })
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// A tokenizer for this grammar. The tokenizer owns the compiled pattern
    /// programs, so use one per document and keep it around between lines.
    pub fn tokenizer(&self) -> Tokenizer<'_> {
        Tokenizer::new(self)
    }
}

/// How an identifier list from a selector applies to a scope stack: each
/// identifier must prefix-match (at a dot boundary) a scope, in stack order.
pub(crate) fn scopes_match_identifiers(identifiers: &[String], scopes: &[Scope]) -> bool {
    let mut from = 0;
    'identifiers: for identifier in identifiers {
        let identifier_scope = Scope::new(identifier);
        for (offset, &scope) in scopes[from..].iter().enumerate() {
            if identifier_scope.is_prefix_of(scope) {
                from += offset + 1;
                continue 'identifiers;
            }
        }
        return false;
    }
    true
}
