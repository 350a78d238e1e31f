//! The grammar registry.
//!
//! Raw grammars come from the outside through [`GrammarSource`]; the
//! registry's job is to have every grammar a scope transitively needs loaded
//! *before* the first `tokenize_line` call, and to hand out compiled
//! [`Grammar`]s and the current [`Theme`].

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, TintaResult};
use crate::grammars::{Grammar, RawGrammar, RawRule};
use crate::themes::Theme;

/// Where raw grammars come from. The registry drives the breadth-first
/// dependency discovery; implementors only answer point queries.
pub trait GrammarSource {
    /// The raw grammar for a scope name, if this source knows it
    fn load_grammar(&self, scope_name: &str) -> Option<RawGrammar>;

    /// Scope names of injection grammars that want to participate whenever
    /// `scope_name` is tokenized
    fn get_injections(&self, scope_name: &str) -> Option<Vec<String>> {
        let _ = scope_name;
        None
    }
}

/// Per-grammar knobs for binary tokens.
#[derive(Debug, Clone, Default)]
pub struct GrammarConfiguration {
    /// Language id encoded into token metadata. Do not use 0 if you want to
    /// tell "no language" apart from your language.
    pub initial_language: u32,
    /// Scope name prefix -> language id for embedded languages
    pub embedded_languages: Vec<(String, u32)>,
}

/// A dependency discovered while walking a raw grammar's includes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScopeDependency {
    /// The whole grammar is needed (`include: "source.x"`)
    Full(String),
    /// Only a repository entry is needed (`include: "source.x#rule"`);
    /// loading-wise the same, but deduplicated separately
    Partial(String, String),
}

impl ScopeDependency {
    fn scope_name(&self) -> &str {
        match self {
            ScopeDependency::Full(scope) => scope,
            ScopeDependency::Partial(scope, _) => scope,
        }
    }
}

fn collect_rule_dependencies(rule: &RawRule, own_scope: &str, out: &mut Vec<ScopeDependency>) {
    if let Some(include) = &rule.include
        && !include.starts_with('#')
        && include != "$self"
        && include != "$base"
    {
        let (scope, external_rule) = match include.split_once('#') {
            Some((scope, rule_name)) => (scope, Some(rule_name)),
            None => (include.as_str(), None),
        };
        if scope != own_scope {
            out.push(match external_rule {
                Some(rule_name) => {
                    ScopeDependency::Partial(scope.to_owned(), rule_name.to_owned())
                }
                None => ScopeDependency::Full(scope.to_owned()),
            });
        }
    }

    for pattern in rule.patterns.as_deref().unwrap_or(&[]) {
        collect_rule_dependencies(pattern, own_scope, out);
    }
    for nested in rule.repository.values() {
        collect_rule_dependencies(nested, own_scope, out);
    }
    for captures in [
        &rule.captures,
        &rule.begin_captures,
        &rule.end_captures,
        &rule.while_captures,
    ] {
        for capture in captures.0.values() {
            collect_rule_dependencies(capture, own_scope, out);
        }
    }
}

/// Every external scope a grammar references, in discovery order.
fn collect_grammar_dependencies(raw: &RawGrammar) -> Vec<ScopeDependency> {
    let mut out = Vec::new();
    for pattern in &raw.patterns {
        collect_rule_dependencies(pattern, &raw.scope_name, &mut out);
    }
    for rule in raw.repository.values() {
        collect_rule_dependencies(rule, &raw.scope_name, &mut out);
    }
    for rule in raw.injections.values() {
        collect_rule_dependencies(rule, &raw.scope_name, &mut out);
    }
    out
}

/// Dependencies reachable from one repository entry only.
fn collect_specific_dependencies(
    raw: &RawGrammar,
    repository_rule: &str,
) -> Vec<ScopeDependency> {
    let mut out = Vec::new();
    if let Some(rule) = raw.repository.get(repository_rule) {
        collect_rule_dependencies(rule, &raw.scope_name, &mut out);
    }
    out
}

/// Holds all raw grammars, their injection lists, compiled grammars and the
/// current theme.
pub struct Registry {
    raw_grammars: HashMap<String, Arc<RawGrammar>>,
    injection_lists: HashMap<String, Vec<String>>,
    grammars: HashMap<String, Arc<Grammar>>,
    theme: Theme,
}

impl Registry {
    pub fn new(theme: Theme) -> Self {
        Self {
            raw_grammars: HashMap::new(),
            injection_lists: HashMap::new(),
            grammars: HashMap::new(),
            theme,
        }
    }

    /// Adds a raw grammar directly, together with the scope names of the
    /// grammars injected into it.
    pub fn add_grammar(&mut self, raw: RawGrammar, injections: Option<Vec<String>>) {
        if let Some(injections) = injections {
            self.injection_lists
                .insert(raw.scope_name.clone(), injections);
        }
        self.raw_grammars
            .insert(raw.scope_name.clone(), Arc::new(raw));
    }

    /// Reads a JSON grammar file and adds it.
    pub fn add_grammar_from_path(&mut self, path: impl AsRef<Path>) -> TintaResult<()> {
        let raw = RawGrammar::load_from_file(path)?;
        self.add_grammar(raw, None);
        Ok(())
    }

    /// Loads `scope_name` and everything it transitively needs from
    /// `source`, breadth-first, then compiles it.
    ///
    /// Missing transitive grammars are tolerated (their includes contribute
    /// nothing); a missing root grammar is fatal.
    pub fn load_grammar(
        &mut self,
        scope_name: &str,
        source: &dyn GrammarSource,
    ) -> TintaResult<Arc<Grammar>> {
        let mut seen_full: HashSet<String> = HashSet::new();
        let mut seen_partial: HashSet<(String, String)> = HashSet::new();
        seen_full.insert(scope_name.to_owned());

        let mut queue = vec![ScopeDependency::Full(scope_name.to_owned())];
        while !queue.is_empty() {
            // load this generation, then walk what it pulled in
            for dep in &queue {
                self.ensure_raw_grammar(dep.scope_name(), source);
            }

            let mut next = Vec::new();
            for dep in queue.drain(..) {
                let Some(raw) = self.raw_grammars.get(dep.scope_name()) else {
                    if dep.scope_name() == scope_name {
                        return Err(Error::GrammarNotFound(scope_name.to_owned()));
                    }
                    log::debug!("grammar <{}> not supplied, skipping", dep.scope_name());
                    continue;
                };

                let mut discovered = match &dep {
                    ScopeDependency::Full(_) => collect_grammar_dependencies(raw),
                    ScopeDependency::Partial(_, rule) => collect_specific_dependencies(raw, rule),
                };
                // injection grammars are full dependencies of their host
                if let Some(injections) = self.injection_lists.get(dep.scope_name()) {
                    discovered.extend(
                        injections
                            .iter()
                            .map(|scope| ScopeDependency::Full(scope.clone())),
                    );
                }

                for discovered_dep in discovered {
                    match &discovered_dep {
                        ScopeDependency::Full(scope) => {
                            if seen_full.insert(scope.clone()) {
                                next.push(discovered_dep);
                            }
                        }
                        ScopeDependency::Partial(scope, rule) => {
                            if seen_full.contains(scope) {
                                continue;
                            }
                            if seen_partial.insert((scope.clone(), rule.clone())) {
                                next.push(discovered_dep);
                            }
                        }
                    }
                }
            }
            queue = next;
        }

        self.grammar_for_scope(scope_name)
    }

    fn ensure_raw_grammar(&mut self, scope_name: &str, source: &dyn GrammarSource) {
        if self.raw_grammars.contains_key(scope_name) {
            return;
        }
        if let Some(raw) = source.load_grammar(scope_name) {
            let injections = source.get_injections(scope_name);
            self.add_grammar(raw, injections);
        }
    }

    /// The compiled grammar for a scope that has already been supplied.
    pub fn grammar_for_scope(&mut self, scope_name: &str) -> TintaResult<Arc<Grammar>> {
        if let Some(grammar) = self.grammars.get(scope_name) {
            return Ok(Arc::clone(grammar));
        }

        let grammar = self.compile(scope_name, &GrammarConfiguration::default())?;
        self.grammars.insert(scope_name.to_owned(), Arc::clone(&grammar));
        Ok(grammar)
    }

    /// Like [`Registry::grammar_for_scope`] but with language metadata
    /// configuration; configured grammars are not cached.
    pub fn grammar_for_scope_with_config(
        &mut self,
        scope_name: &str,
        config: &GrammarConfiguration,
    ) -> TintaResult<Arc<Grammar>> {
        self.compile(scope_name, config)
    }

    fn compile(
        &self,
        scope_name: &str,
        config: &GrammarConfiguration,
    ) -> TintaResult<Arc<Grammar>> {
        let injection_scopes = self
            .injection_lists
            .get(scope_name)
            .cloned()
            .unwrap_or_default();
        let grammar = Grammar::build(scope_name, &self.raw_grammars, &injection_scopes, config)?;
        Ok(Arc::new(grammar))
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    /// Swaps the theme wholesale. Stacks returned earlier stay valid;
    /// metadata computed against the old theme does not, so callers
    /// re-tokenize (with fresh tokenizers) after this.
    pub fn set_theme(&mut self, theme: Theme) {
        self.theme = theme;
    }

    pub fn color_map(&self) -> Vec<String> {
        self.theme.color_map()
    }
}
