//! The line tokenizer.
//!
//! `tokenize_line(line, previous_stack)` is the whole public contract: feed
//! it one line and the stack returned for the previous line, get tokens and
//! the next stack back. There is no hidden state anywhere else, which is
//! what lets editors restart highlighting from any line whose entry stack
//! they kept around.

mod anchors;
mod scanner;
mod stack;

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use crate::error::TintaResult;
use crate::grammars::{
    END_RULE_ID, Grammar, RegexSource, Rule, RuleId, collect_patterns_recursive,
    scopes_match_identifiers,
};
use crate::scope::Scope;
use crate::themes::Theme;
use crate::tokenizer::anchors::AnchorActive;
use crate::tokenizer::scanner::{RulePatterns, ScanMatch};
use crate::tokenizer::stack::Frame;

pub use stack::StateStack;

/// Layout of the metadata word of binary tokens, low bits first:
/// `languageId(8) | tokenType(3) | fontStyle(3) | foreground(9) | background(9)`.
pub mod metadata {
    pub const LANGUAGE_ID_OFFSET: u32 = 0;
    pub const TOKEN_TYPE_OFFSET: u32 = 8;
    pub const FONT_STYLE_OFFSET: u32 = 11;
    pub const FOREGROUND_OFFSET: u32 = 14;
    pub const BACKGROUND_OFFSET: u32 = 23;

    pub fn language_id(metadata: u32) -> u32 {
        (metadata >> LANGUAGE_ID_OFFSET) & 0b1111_1111
    }

    pub fn token_type(metadata: u32) -> u32 {
        (metadata >> TOKEN_TYPE_OFFSET) & 0b111
    }

    pub fn font_style(metadata: u32) -> u32 {
        (metadata >> FONT_STYLE_OFFSET) & 0b111
    }

    pub fn foreground(metadata: u32) -> u32 {
        (metadata >> FOREGROUND_OFFSET) & 0b1_1111_1111
    }

    pub fn background(metadata: u32) -> u32 {
        (metadata >> BACKGROUND_OFFSET) & 0b1_1111_1111
    }
}

/// Token categories editors key bracket-matching and word-selection off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardTokenType {
    Other = 0,
    Comment = 1,
    String = 2,
    RegEx = 4,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Byte span within the line (start inclusive, end exclusive)
    pub span: Range<usize>,
    /// Open scope names at this span, outermost first
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenizeLineResult {
    pub tokens: Vec<Token>,
    /// Thread this into the next line's `tokenize_line` call
    pub stack: StateStack,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenizeLine2Result {
    /// Two words per token: start index, then the packed metadata word
    pub tokens: Vec<u32>,
    pub stack: StateStack,
}

/// Small wrapper making sure we only produce well-formed, gap-free tokens
#[derive(Debug, Clone, Default)]
struct TokenAccumulator {
    tokens: Vec<Token>,
    /// Position up to which tokens have been generated
    last_end_pos: usize,
}

impl TokenAccumulator {
    fn produce(&mut self, end_pos: usize, scopes: &[Scope]) {
        // zero-width matches ask for empty tokens all the time
        if self.last_end_pos >= end_pos {
            return;
        }

        #[cfg(feature = "debug")]
        log::debug!(
            "[produce] [{}..{end_pos}] {:?}",
            self.last_end_pos,
            scopes.iter().map(|s| s.build_string()).collect::<Vec<_>>()
        );

        self.tokens.push(Token {
            span: self.last_end_pos..end_pos,
            scopes: scopes.to_vec(),
        });
        self.last_end_pos = end_pos;
    }

    /// Trims the token covering the `\n` every line gets appended before
    /// scanning.
    fn finalize(&mut self, line_len: usize) {
        if let Some(token) = self.tokens.last()
            && token.span.start == line_len - 1
        {
            self.tokens.pop();
        }

        if let Some(token) = self.tokens.last_mut()
            && token.span.end == line_len
        {
            token.span.end -= 1;
        }
    }
}

fn top_frame<'s>(stack: &'s StateStack) -> &'s Arc<Frame> {
    stack.top().expect("stack never empty during tokenization")
}

fn advance_one_char(line: &str, pos: usize) -> usize {
    match line.get(pos..).and_then(|rest| rest.chars().next()) {
        Some(c) => pos + c.len_utf8(),
        None => pos + 1,
    }
}

/// Loop detection for zero-width begin matches: true when an enclosing frame
/// entered at this very position already runs the same rule.
fn entered_same_rule_at(stack: &StateStack, rule_id: RuleId, pos: usize) -> bool {
    let mut current = stack.top().map(|frame| frame.as_ref());
    while let Some(frame) = current {
        if frame.enter_pos != pos as i32 {
            return false;
        }
        if frame.rule_id == rule_id {
            return true;
        }
        current = frame.parent.as_deref();
    }
    false
}

fn standard_token_type(scope: Scope) -> Option<StandardTokenType> {
    let name = scope.build_string();
    for segment in name.split('.') {
        match segment {
            "comment" => return Some(StandardTokenType::Comment),
            "string" => return Some(StandardTokenType::String),
            "regex" => return Some(StandardTokenType::RegEx),
            _ => {}
        }
    }
    None
}

fn build_rule_patterns(grammar: &Grammar, rule_id: RuleId) -> RulePatterns<'_> {
    let mut items: Vec<&RegexSource> = Vec::new();
    let mut visited = HashSet::new();
    collect_patterns_recursive(&grammar.rules, rule_id, true, &mut visited, &mut items);

    match &grammar.rules[rule_id.index()] {
        Rule::BeginEnd(rule) => RulePatterns::with_end(items, &rule.end, rule.apply_end_pattern_last),
        _ => RulePatterns::new(items),
    }
}

/// Per-document tokenizer: borrows an immutable [`Grammar`] and owns every
/// compiled pattern program derived from it. Tokenizing independent
/// documents concurrently therefore just means one `Tokenizer` each.
///
/// For binary tokens the resolved style metadata is cached per scope path;
/// after a theme swap, create a fresh tokenizer.
pub struct Tokenizer<'g> {
    grammar: &'g Grammar,
    rule_patterns: HashMap<RuleId, RulePatterns<'g>>,
    while_patterns: HashMap<RuleId, RulePatterns<'g>>,
    metadata_cache: HashMap<Vec<Scope>, u32>,
}

impl<'g> Tokenizer<'g> {
    pub fn new(grammar: &'g Grammar) -> Self {
        Self {
            grammar,
            rule_patterns: HashMap::new(),
            while_patterns: HashMap::new(),
            metadata_cache: HashMap::new(),
        }
    }

    /// Tokenizes one line given the stack returned for the previous line
    /// (or [`StateStack::initial`] for the first line of a document).
    ///
    /// Malformed regexes coming from the grammar surface here as
    /// [`crate::Error::TokenizeRegex`] and abort the line.
    pub fn tokenize_line(
        &mut self,
        line: &str,
        previous_stack: &StateStack,
    ) -> TintaResult<TokenizeLineResult> {
        // some patterns ($, \z, while guards) need to see the line ending
        let buffered;
        let line = if line.ends_with('\n') {
            line
        } else {
            buffered = format!("{line}\n");
            &buffered
        };

        let is_first_line = previous_stack.is_empty();
        let stack = if is_first_line {
            let scopes = vec![self.grammar.scope];
            StateStack::initial().push(
                self.grammar.root_id,
                -1,
                -1,
                false,
                None,
                scopes.clone(),
                scopes,
            )
        } else {
            previous_stack.clone()
        };

        let mut acc = TokenAccumulator::default();
        let next_stack = self.tokenize_internal(line, is_first_line, 0, stack, &mut acc, true)?;
        acc.finalize(line.len());

        Ok(TokenizeLineResult {
            tokens: acc.tokens,
            stack: next_stack.reset_positions(),
        })
    }

    /// Like [`Tokenizer::tokenize_line`] but resolves every token against
    /// `theme` into the packed binary form: two u32 words per token.
    pub fn tokenize_line2(
        &mut self,
        line: &str,
        previous_stack: &StateStack,
        theme: &Theme,
    ) -> TintaResult<TokenizeLine2Result> {
        let result = self.tokenize_line(line, previous_stack)?;

        let mut tokens = Vec::with_capacity(result.tokens.len() * 2);
        for token in &result.tokens {
            let metadata = self.metadata_for(&token.scopes, theme);
            // a token styled exactly like its predecessor merges into it
            if let Some(&previous) = tokens.last()
                && previous == metadata
            {
                continue;
            }
            tokens.push(token.span.start as u32);
            tokens.push(metadata);
        }

        Ok(TokenizeLine2Result {
            tokens,
            stack: result.stack,
        })
    }

    fn metadata_for(&mut self, scopes: &[Scope], theme: &Theme) -> u32 {
        if let Some(&cached) = self.metadata_cache.get(scopes) {
            return cached;
        }

        let grammar = self.grammar;
        let mut language_id = grammar.initial_language;
        let mut token_type = StandardTokenType::Other;
        for &scope in scopes {
            for &(embedded, language) in &grammar.embedded_languages {
                if embedded.is_prefix_of(scope) {
                    language_id = language;
                }
            }
            if let Some(detected) = standard_token_type(scope) {
                token_type = detected;
            }
        }

        let style = theme.resolve_path(scopes);
        let packed = (language_id & 0xFF) << metadata::LANGUAGE_ID_OFFSET
            | (token_type as u32) << metadata::TOKEN_TYPE_OFFSET
            | (style.font_style.bits() as u32) << metadata::FONT_STYLE_OFFSET
            | style.foreground << metadata::FOREGROUND_OFFSET
            | style.background << metadata::BACKGROUND_OFFSET;

        self.metadata_cache.insert(scopes.to_vec(), packed);
        packed
    }

    fn scan_rule(
        &mut self,
        rule_id: RuleId,
        end_override: Option<&str>,
        line: &str,
        pos: usize,
        anchors: AnchorActive,
    ) -> TintaResult<Option<ScanMatch>> {
        let grammar = self.grammar;
        let patterns = self
            .rule_patterns
            .entry(rule_id)
            .or_insert_with(|| build_rule_patterns(grammar, rule_id));
        patterns.set_end_source(end_override);
        let scanner = patterns.compile(anchors)?;
        Ok(scanner.find_next_match(line, pos))
    }

    fn scan_while(
        &mut self,
        rule_id: RuleId,
        while_override: Option<&str>,
        line: &str,
        pos: usize,
        anchors: AnchorActive,
    ) -> TintaResult<Option<ScanMatch>> {
        let grammar = self.grammar;
        let patterns = self.while_patterns.entry(rule_id).or_insert_with(|| {
            let Rule::BeginWhile(rule) = &grammar.rules[rule_id.index()] else {
                unreachable!("while scans only happen for begin/while frames")
            };
            RulePatterns::for_while(&rule.while_)
        });
        patterns.set_end_source(while_override);
        let scanner = patterns.compile(anchors)?;
        Ok(scanner.find_next_match(line, pos))
    }

    /// Tries every injection whose selector matches the open scopes, keeping
    /// the earliest match (ties go to the earliest-priority injection, the
    /// list is pre-sorted).
    fn match_injections(
        &mut self,
        stack: &StateStack,
        line: &str,
        pos: usize,
        anchors: AnchorActive,
    ) -> TintaResult<Option<(i8, ScanMatch)>> {
        let grammar = self.grammar;
        if grammar.injections.is_empty() {
            return Ok(None);
        }

        let scopes = top_frame(stack).content_scopes.clone();
        let matches_name =
            |identifiers: &[String], input: &Vec<Scope>| scopes_match_identifiers(identifiers, input);

        let mut best: Option<(i8, ScanMatch)> = None;
        for injection in &grammar.injections {
            if !injection.matcher.matches(&scopes, &matches_name) {
                continue;
            }
            let Some(found) = self.scan_rule(injection.rule_id, None, line, pos, anchors)? else {
                continue;
            };
            if let Some((_, best_match)) = &best
                && found.start >= best_match.start
            {
                continue;
            }
            let is_done = found.start == pos;
            best = Some((injection.priority, found));
            if is_done {
                break;
            }
        }

        Ok(best)
    }

    fn match_rule_or_injections(
        &mut self,
        stack: &StateStack,
        line: &str,
        pos: usize,
        anchors: AnchorActive,
    ) -> TintaResult<Option<ScanMatch>> {
        let top = Arc::clone(top_frame(stack));
        let regular = self.scan_rule(top.rule_id, top.end_rule.as_deref(), line, pos, anchors)?;
        let injection = self.match_injections(stack, line, pos, anchors)?;

        Ok(match (regular, injection) {
            (None, None) => None,
            (Some(regular), None) => Some(regular),
            (None, Some((_, injection))) => Some(injection),
            (Some(regular), Some((priority, injection))) => {
                // position wins; an L: injection also wins position ties
                if injection.start < regular.start
                    || (injection.start == regular.start && priority < 0)
                {
                    Some(injection)
                } else {
                    Some(regular)
                }
            }
        })
    }

    /// Re-validates every open while-guard at the start of a line, outermost
    /// first. The first guard that fails closes its block and every block
    /// above it.
    fn check_while_conditions(
        &mut self,
        stack: StateStack,
        line: &str,
        pos: &mut usize,
        is_first_line: &mut bool,
        acc: &mut TokenAccumulator,
    ) -> TintaResult<(StateStack, i32)> {
        let grammar = self.grammar;
        let mut anchor_position: i32 = if top_frame(&stack).begin_rule_captured_eol {
            0
        } else {
            -1
        };
        let mut stack = stack;

        for frame in stack.frames_outermost_first() {
            let Rule::BeginWhile(rule) = &grammar.rules[frame.rule_id.index()] else {
                continue;
            };

            let anchors = AnchorActive::new(*is_first_line, anchor_position, *pos);
            let found =
                self.scan_while(frame.rule_id, frame.end_rule.as_deref(), line, *pos, anchors)?;

            match found {
                Some(found) if found.start == *pos => {
                    if !rule.while_captures.is_empty() {
                        let guard_stack = StateStack::from_frame(Some(Arc::clone(&frame)));
                        self.resolve_captures(
                            &guard_stack,
                            line,
                            &rule.while_captures,
                            &found.capture_pos,
                            acc,
                            *is_first_line,
                        )?;
                    }
                    acc.produce(found.end, &frame.content_scopes);

                    if found.end > *pos {
                        *pos = found.end;
                        anchor_position = found.end as i32;
                        *is_first_line = false;
                    }
                }
                _ => {
                    #[cfg(feature = "debug")]
                    log::debug!(
                        "[check_while_conditions] guard broke for rule {}",
                        frame.rule_id.0
                    );
                    stack = StateStack::from_frame(frame.parent.clone());
                    break;
                }
            }
        }

        Ok((stack, anchor_position))
    }

    fn resolve_captures(
        &mut self,
        stack: &StateStack,
        line: &str,
        capture_refs: &[Option<crate::grammars::CaptureRef>],
        captures: &[Option<(usize, usize)>],
        acc: &mut TokenAccumulator,
        is_first_line: bool,
    ) -> TintaResult<()> {
        if capture_refs.is_empty() {
            return Ok(());
        }

        let top_content = top_frame(stack).content_scopes.clone();
        // nested captures open and close like a tiny private stack
        let mut local_stack: Vec<(Vec<Scope>, usize)> = Vec::with_capacity(2);

        let count = capture_refs.len().min(captures.len());
        for i in 0..count {
            let Some(capture) = &capture_refs[i] else {
                continue;
            };
            let Some((cap_start, cap_end)) = captures[i] else {
                continue;
            };
            if cap_start == cap_end {
                continue;
            }

            while let Some((scopes, end_pos)) = local_stack.last() {
                if *end_pos > cap_start {
                    break;
                }
                acc.produce(*end_pos, scopes);
                local_stack.pop();
            }
            match local_stack.last() {
                Some((scopes, _)) => acc.produce(cap_start, scopes),
                None => acc.produce(cap_start, &top_content),
            }

            if let Some(retokenize_id) = capture.retokenize_rule {
                // the capture carries nested patterns: re-run the tokenizer
                // over just that substring with a private sub-stack
                let mut name_scopes = match local_stack.last() {
                    Some((scopes, _)) => scopes.clone(),
                    None => top_content.clone(),
                };
                if let Some(name) = &capture.name {
                    name_scopes.extend(name.resolve(line, captures));
                }
                let mut content_scopes = name_scopes.clone();
                if let Some(content_name) = &capture.content_name {
                    content_scopes.extend(content_name.resolve(line, captures));
                }

                let sub_stack = stack.push(
                    retokenize_id,
                    cap_start as i32,
                    -1,
                    false,
                    None,
                    name_scopes,
                    content_scopes,
                );
                self.tokenize_internal(
                    &line[..cap_end],
                    is_first_line && cap_start == 0,
                    cap_start,
                    sub_stack,
                    acc,
                    false,
                )?;
                continue;
            }

            if let Some(name) = &capture.name {
                let resolved = name.resolve(line, captures);
                if !resolved.is_empty() {
                    let mut scopes = match local_stack.last() {
                        Some((existing, _)) => existing.clone(),
                        None => top_content.clone(),
                    };
                    scopes.extend(resolved);
                    local_stack.push((scopes, cap_end));
                }
            }
        }

        while let Some((scopes, end_pos)) = local_stack.pop() {
            acc.produce(end_pos, &scopes);
        }

        Ok(())
    }

    fn tokenize_internal(
        &mut self,
        line: &str,
        mut is_first_line: bool,
        start_pos: usize,
        mut stack: StateStack,
        acc: &mut TokenAccumulator,
        check_while_conditions: bool,
    ) -> TintaResult<StateStack> {
        let grammar = self.grammar;
        let mut pos = start_pos;
        let mut anchor_position: i32 = -1;

        if check_while_conditions {
            let (while_stack, anchor) =
                self.check_while_conditions(stack, line, &mut pos, &mut is_first_line, acc)?;
            stack = while_stack;
            anchor_position = anchor;
        }

        loop {
            #[cfg(feature = "debug")]
            log::trace!("[tokenize] scanning at {pos}: {:?}", &line[pos..]);

            let anchors = AnchorActive::new(is_first_line, anchor_position, pos);
            let Some(m) = self.match_rule_or_injections(&stack, line, pos, anchors)? else {
                // nothing matches: the rest of the line inherits the open scopes
                acc.produce(line.len(), &top_frame(&stack).content_scopes);
                break;
            };

            let has_advanced = m.end > pos;

            if m.rule_id == END_RULE_ID {
                let top = Arc::clone(top_frame(&stack));
                let Rule::BeginEnd(rule) = &grammar.rules[top.rule_id.index()] else {
                    log::warn!("end pattern matched outside a begin/end frame");
                    break;
                };

                acc.produce(m.start, &top.content_scopes);
                // the end delimiter carries the name scopes, not the content ones
                stack = stack.with_top(|frame| frame.content_scopes = frame.name_scopes.clone());
                self.resolve_captures(
                    &stack,
                    line,
                    &rule.end_captures,
                    &m.capture_pos,
                    acc,
                    is_first_line,
                )?;
                acc.produce(m.end, &top_frame(&stack).content_scopes);

                let restorable = stack.top().cloned();
                stack = stack.pop();
                anchor_position = top.anchor_pos;

                if !has_advanced && top.enter_pos == pos as i32 {
                    // pushed and popped at the same spot without consuming
                    // anything; keep the rule active and force progress
                    stack = StateStack::from_frame(restorable);
                    pos = advance_one_char(line, pos);
                    if pos >= line.len() {
                        acc.produce(line.len(), &top_frame(&stack).content_scopes);
                        break;
                    }
                    continue;
                }
            } else {
                let rule = &grammar.rules[m.rule_id.index()];
                let top_content = top_frame(&stack).content_scopes.clone();
                acc.produce(m.start, &top_content);

                let mut name_scopes = top_content;
                name_scopes.extend(rule.name_scopes(line, &m.capture_pos));

                match rule {
                    Rule::BeginEnd(_) | Rule::BeginWhile(_) => {
                        if !has_advanced && entered_same_rule_at(&stack, m.rule_id, pos) {
                            // a zero-width begin re-entering the same rule at
                            // the same spot can never make progress
                            pos = advance_one_char(line, pos);
                            if pos >= line.len() {
                                acc.produce(line.len(), &top_frame(&stack).content_scopes);
                                break;
                            }
                            continue;
                        }

                        stack = stack.push(
                            m.rule_id,
                            pos as i32,
                            anchor_position,
                            m.end == line.len(),
                            None,
                            name_scopes.clone(),
                            name_scopes,
                        );

                        let (begin_captures, delimiter, delimiter_has_backrefs) = match rule {
                            Rule::BeginEnd(r) => {
                                (&r.begin_captures, &r.end, r.end.has_back_references())
                            }
                            Rule::BeginWhile(r) => {
                                (&r.begin_captures, &r.while_, r.while_.has_back_references())
                            }
                            _ => unreachable!(),
                        };

                        self.resolve_captures(
                            &stack,
                            line,
                            begin_captures,
                            &m.capture_pos,
                            acc,
                            is_first_line,
                        )?;
                        acc.produce(m.end, &top_frame(&stack).content_scopes);
                        anchor_position = m.end as i32;

                        let mut content_scopes = top_frame(&stack).name_scopes.clone();
                        content_scopes.extend(rule.content_name_scopes(line, &m.capture_pos));
                        let end_rule = delimiter_has_backrefs
                            .then(|| delimiter.resolve_back_references(line, &m.capture_pos));
                        stack = stack.with_top(move |frame| {
                            frame.content_scopes = content_scopes;
                            frame.end_rule = end_rule;
                        });
                    }
                    Rule::Match(r) => {
                        // transient frame, so captures resolve inside the
                        // rule's own scopes
                        stack = stack.push(
                            m.rule_id,
                            pos as i32,
                            anchor_position,
                            m.end == line.len(),
                            None,
                            name_scopes.clone(),
                            name_scopes,
                        );
                        self.resolve_captures(
                            &stack,
                            line,
                            &r.captures,
                            &m.capture_pos,
                            acc,
                            is_first_line,
                        )?;
                        acc.produce(m.end, &top_frame(&stack).content_scopes);
                        stack = stack.pop();

                        if !has_advanced {
                            // a zero-width leaf match would rescan forever
                            pos = advance_one_char(line, pos);
                            if pos >= line.len() {
                                acc.produce(line.len(), &top_frame(&stack).content_scopes);
                                break;
                            }
                            continue;
                        }
                    }
                    Rule::IncludeOnly(_) => {
                        unreachable!("containers contribute no patterns of their own")
                    }
                }
            }

            if has_advanced {
                pos = m.end;
                is_first_line = false;
            }
        }

        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;
    use crate::grammars::RawGrammar;
    use crate::registry::GrammarConfiguration;
    use crate::themes::{FontStyle, RawTheme};

    fn build_grammar_with_config(
        value: serde_json::Value,
        config: &GrammarConfiguration,
    ) -> Grammar {
        let raw: RawGrammar = serde_json::from_value(value).unwrap();
        let scope = raw.scope_name.clone();
        let mut raws = HashMap::new();
        raws.insert(scope.clone(), Arc::new(raw));
        Grammar::build(&scope, &raws, &[], config).unwrap()
    }

    fn build_grammar(value: serde_json::Value) -> Grammar {
        build_grammar_with_config(value, &GrammarConfiguration::default())
    }

    fn scope_strings(token: &Token) -> Vec<String> {
        token.scopes.iter().map(|s| s.build_string()).collect()
    }

    /// Tokenizes a whole document, returning per-line (text, scopes) pairs
    /// and the final stack.
    #[allow(clippy::type_complexity)]
    fn tokenize_doc(
        grammar: &Grammar,
        lines: &[&str],
    ) -> (Vec<Vec<(String, Vec<String>)>>, StateStack) {
        let mut tokenizer = grammar.tokenizer();
        let mut stack = StateStack::initial();
        let mut out = Vec::new();
        for line in lines {
            let result = tokenizer.tokenize_line(line, &stack).unwrap();
            out.push(
                result
                    .tokens
                    .iter()
                    .map(|t| (line[t.span.clone()].to_owned(), scope_strings(t)))
                    .collect(),
            );
            stack = result.stack;
        }
        (out, stack)
    }

    #[test]
    fn simple_match_rule() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "match": "\\b(?:if|else)\\b", "name": "keyword.control" }]
        }));

        let (lines, _) = tokenize_doc(&grammar, &["if x"]);
        assert_eq!(
            lines[0],
            vec![
                (
                    "if".to_owned(),
                    vec!["source.t".to_owned(), "keyword.control".to_owned()]
                ),
                (" x".to_owned(), vec!["source.t".to_owned()]),
            ]
        );
    }

    #[test]
    fn multi_line_begin_end_restarts_from_the_stack() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [
                { "begin": "/\\*", "end": "\\*/", "name": "comment.block" },
                { "match": "\\w+", "name": "word" }
            ]
        }));

        let (lines, final_stack) = tokenize_doc(&grammar, &["a /* b", "c", "d */ e"]);

        // the middle line is entirely inside the comment
        assert_eq!(
            lines[1],
            vec![(
                "c".to_owned(),
                vec!["source.t".to_owned(), "comment.block".to_owned()]
            )]
        );
        // the comment closes on line 3 and `e` is plain again
        let last = lines[2].last().unwrap();
        assert_eq!(last.0, "e");
        assert_eq!(last.1, vec!["source.t".to_owned(), "word".to_owned()]);

        // after the comment closed we are back to the root state
        let (_, fresh_stack) = tokenize_doc(&grammar, &["a"]);
        assert_eq!(final_stack, fresh_stack);
        assert_eq!(final_stack.depth(), 1);
    }

    #[test]
    fn self_including_spans_nest() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{
                "begin": "\\(", "end": "\\)", "name": "paren",
                "patterns": [{ "include": "$self" }]
            }]
        }));

        let (lines, stack) = tokenize_doc(&grammar, &["((x))"]);
        let expected_scopes: Vec<Vec<&str>> = vec![
            vec!["source.t", "paren"],
            vec!["source.t", "paren", "paren"],
            vec!["source.t", "paren", "paren"],
            vec!["source.t", "paren", "paren"],
            vec!["source.t", "paren"],
        ];
        let actual: Vec<Vec<String>> = lines[0].iter().map(|(_, scopes)| scopes.clone()).collect();
        assert_eq!(
            actual,
            expected_scopes
                .iter()
                .map(|s| s.iter().map(|x| x.to_string()).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        );
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn tokenization_is_idempotent() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "begin": "\"", "end": "\"", "name": "string.quoted" }]
        }));

        let mut tokenizer = grammar.tokenizer();
        let first = tokenizer.tokenize_line("x \"open", &StateStack::initial()).unwrap();
        let second = tokenizer.tokenize_line("x \"open", &StateStack::initial()).unwrap();
        assert_eq!(first.tokens, second.tokens);
        assert_eq!(first.stack, second.stack);
        assert_eq!(first.stack.depth(), 2);
    }

    #[test]
    fn stacks_from_independent_runs_are_equal() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "begin": "\\(", "end": "\\)", "name": "meta.parens" }]
        }));

        let (_, one) = tokenize_doc(&grammar, &["(a", "b"]);
        let (_, two) = tokenize_doc(&grammar, &["(a", "b"]);
        assert_eq!(one, two);

        // and tokenizing the next line from either stack gives the same result
        let mut t1 = grammar.tokenizer();
        let mut t2 = grammar.tokenizer();
        let r1 = t1.tokenize_line("c)", &one).unwrap();
        let r2 = t2.tokenize_line("c)", &two).unwrap();
        assert_eq!(r1.tokens, r2.tokens);
        assert_eq!(r1.stack, r2.stack);
    }

    #[test]
    fn end_back_reference_matches_only_the_opening_text() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "begin": "<(\\w+)>", "end": "</\\1>", "name": "meta.tag" }]
        }));

        let (lines, stack) = tokenize_doc(&grammar, &["<a>x</b></a>y"]);
        let tokens = &lines[0];

        // the </b> inside does not close the <a> region
        let inner = tokens.iter().find(|(text, _)| text == "x</b>").unwrap();
        assert!(inner.1.contains(&"meta.tag".to_owned()));
        // the pop happened exactly at </a>
        let after = tokens.iter().find(|(text, _)| text == "y").unwrap();
        assert_eq!(after.1, vec!["source.t".to_owned()]);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn resolved_end_pattern_survives_across_lines() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "begin": "<(\\w+)>", "end": "</\\1>", "name": "meta.tag" }]
        }));

        let (lines, stack) = tokenize_doc(&grammar, &["<a>x", "y</b>", "z</a>w"]);

        // line 2 stays inside: </b> does not close the <a> region
        assert_eq!(
            lines[1],
            vec![(
                "y</b>".to_owned(),
                vec!["source.t".to_owned(), "meta.tag".to_owned()]
            )]
        );
        // line 3 closes at </a>
        let last = lines[2].last().unwrap();
        assert_eq!(last.0, "w");
        assert_eq!(last.1, vec!["source.t".to_owned()]);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn a_anchor_only_matches_document_start() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "match": "\\Afoo", "name": "doc.start" }]
        }));

        let (lines, _) = tokenize_doc(&grammar, &["foo", "foo"]);
        assert_eq!(lines[0][0].1, vec!["source.t".to_owned(), "doc.start".to_owned()]);
        // second line: \A is disabled, nothing matches
        assert_eq!(lines[1], vec![("foo".to_owned(), vec!["source.t".to_owned()])]);

        // and it cannot fire mid-line either
        let (lines, _) = tokenize_doc(&grammar, &["xfoo"]);
        assert_eq!(lines[0], vec![("xfoo".to_owned(), vec!["source.t".to_owned()])]);
    }

    #[test]
    fn g_anchor_binds_to_the_rule_entry_position() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{
                "begin": "q", "end": "!", "name": "quoted",
                "patterns": [{ "match": "\\Gy", "name": "anchored.y" }]
            }]
        }));

        let (lines, _) = tokenize_doc(&grammar, &["qyy!"]);
        let tokens = &lines[0];

        // first y sits exactly at the entry position
        assert_eq!(
            tokens[1],
            (
                "y".to_owned(),
                vec!["source.t".to_owned(), "quoted".to_owned(), "anchored.y".to_owned()]
            )
        );
        // second y is past it, \G no longer asserts
        assert_eq!(
            tokens[2],
            ("y".to_owned(), vec!["source.t".to_owned(), "quoted".to_owned()])
        );
    }

    #[test]
    fn zero_length_matches_terminate() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "match": "(?=.)", "name": "peek" }]
        }));

        let (lines, _) = tokenize_doc(&grammar, &["abcdefghij"]);
        // no empty tokens come out, the line is covered exactly once
        assert_eq!(
            lines[0],
            vec![("abcdefghij".to_owned(), vec!["source.t".to_owned()])]
        );
    }

    #[test]
    fn begin_while_continues_and_breaks() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{
                "begin": "^> ", "while": "^> ", "name": "markup.quote",
                "patterns": [{ "match": "\\w+", "name": "word" }]
            }]
        }));

        let (lines, stack) = tokenize_doc(&grammar, &["> a", "> b", "c"]);

        // line 2 continues the quote: the guard text and the word are scoped
        assert_eq!(
            lines[1],
            vec![
                (
                    "> ".to_owned(),
                    vec!["source.t".to_owned(), "markup.quote".to_owned()]
                ),
                (
                    "b".to_owned(),
                    vec![
                        "source.t".to_owned(),
                        "markup.quote".to_owned(),
                        "word".to_owned()
                    ]
                ),
            ]
        );
        // line 3 breaks the guard and tokenizes outside the quote
        assert_eq!(lines[2], vec![("c".to_owned(), vec!["source.t".to_owned()])]);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn capture_scopes_nest() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{
                "match": "(\\d+)-(\\d+)",
                "name": "meta.range",
                "captures": {
                    "1": { "name": "num.first" },
                    "2": { "name": "num.second" }
                }
            }]
        }));

        let (lines, _) = tokenize_doc(&grammar, &["3-4"]);
        assert_eq!(
            lines[0],
            vec![
                (
                    "3".to_owned(),
                    vec!["source.t".to_owned(), "meta.range".to_owned(), "num.first".to_owned()]
                ),
                ("-".to_owned(), vec!["source.t".to_owned(), "meta.range".to_owned()]),
                (
                    "4".to_owned(),
                    vec!["source.t".to_owned(), "meta.range".to_owned(), "num.second".to_owned()]
                ),
            ]
        );
    }

    #[test]
    fn captures_with_patterns_retokenize_the_capture() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{
                "match": "\"([^\"]*)\"",
                "name": "string.quoted",
                "captures": {
                    "1": { "patterns": [{ "match": "\\d+", "name": "constant.numeric" }] }
                }
            }]
        }));

        let (lines, _) = tokenize_doc(&grammar, &["\"a1b\""]);
        let digit = lines[0].iter().find(|(text, _)| text == "1").unwrap();
        assert_eq!(
            digit.1,
            vec![
                "source.t".to_owned(),
                "string.quoted".to_owned(),
                "constant.numeric".to_owned()
            ]
        );
        // the surrounding pieces stay at the string scope
        let quote = lines[0].iter().find(|(text, _)| text == "a").unwrap();
        assert_eq!(quote.1, vec!["source.t".to_owned(), "string.quoted".to_owned()]);
    }

    #[test]
    fn content_name_starts_after_the_begin_match() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{
                "begin": "\\(", "end": "\\)",
                "name": "meta.parens", "contentName": "inside.parens"
            }]
        }));

        let (lines, _) = tokenize_doc(&grammar, &["(x)"]);
        assert_eq!(
            lines[0],
            vec![
                ("(".to_owned(), vec!["source.t".to_owned(), "meta.parens".to_owned()]),
                (
                    "x".to_owned(),
                    vec![
                        "source.t".to_owned(),
                        "meta.parens".to_owned(),
                        "inside.parens".to_owned()
                    ]
                ),
                (")".to_owned(), vec!["source.t".to_owned(), "meta.parens".to_owned()]),
            ]
        );
    }

    #[test]
    fn apply_end_pattern_last_lets_children_win() {
        let span_rule = |apply_last: bool| {
            serde_json::json!({
                "scopeName": "source.t",
                "patterns": [{
                    "begin": "a", "end": "b", "name": "span",
                    "applyEndPatternLast": apply_last,
                    "patterns": [{ "match": "b", "name": "inner.b" }]
                }]
            })
        };

        // end first: the b closes the span
        let grammar = build_grammar(span_rule(false));
        let mut tokenizer = grammar.tokenizer();
        let result = tokenizer.tokenize_line("ab", &StateStack::initial()).unwrap();
        assert_eq!(result.stack.depth(), 1);
        assert_eq!(
            scope_strings(&result.tokens[1]),
            vec!["source.t".to_owned(), "span".to_owned()]
        );

        // end last: the child consumes the b, the span stays open
        let grammar = build_grammar(span_rule(true));
        let mut tokenizer = grammar.tokenizer();
        let result = tokenizer.tokenize_line("ab", &StateStack::initial()).unwrap();
        assert_eq!(result.stack.depth(), 2);
        assert_eq!(
            scope_strings(&result.tokens[1]),
            vec!["source.t".to_owned(), "span".to_owned(), "inner.b".to_owned()]
        );
    }

    #[test]
    fn injections_match_at_every_position() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "match": "[ab]+", "name": "letters" }],
            "injections": {
                "L:source.t": { "match": "!", "name": "bang.injected" }
            }
        }));

        let (lines, _) = tokenize_doc(&grammar, &["a!b"]);
        assert_eq!(
            lines[0],
            vec![
                ("a".to_owned(), vec!["source.t".to_owned(), "letters".to_owned()]),
                ("!".to_owned(), vec!["source.t".to_owned(), "bang.injected".to_owned()]),
                ("b".to_owned(), vec!["source.t".to_owned(), "letters".to_owned()]),
            ]
        );
    }

    #[test]
    fn left_injections_win_position_ties() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "match": "!", "name": "host.bang" }],
            "injections": {
                "L:source.t": { "match": "!", "name": "inj.bang" }
            }
        }));
        let (lines, _) = tokenize_doc(&grammar, &["!"]);
        assert_eq!(lines[0][0].1, vec!["source.t".to_owned(), "inj.bang".to_owned()]);

        // without the L: marker the host grammar keeps the tie
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "match": "!", "name": "host.bang" }],
            "injections": {
                "R:source.t": { "match": "!", "name": "inj.bang" }
            }
        }));
        let (lines, _) = tokenize_doc(&grammar, &["!"]);
        assert_eq!(lines[0][0].1, vec!["source.t".to_owned(), "host.bang".to_owned()]);
    }

    #[test]
    fn malformed_regexes_abort_the_line() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "match": "*", "name": "broken" }]
        }));

        let mut tokenizer = grammar.tokenizer();
        let result = tokenizer.tokenize_line("x", &StateStack::initial());
        assert!(matches!(result, Err(Error::TokenizeRegex(_))));
    }

    #[test]
    fn binary_tokens_pack_style_and_language_metadata() {
        let grammar = build_grammar_with_config(
            serde_json::json!({
                "scopeName": "source.t",
                "patterns": [
                    { "match": "\\bif\\b", "name": "keyword.control" },
                    { "match": "\"[^\"]*\"", "name": "string.quoted" }
                ]
            }),
            &GrammarConfiguration {
                initial_language: 7,
                embedded_languages: Vec::new(),
            },
        );

        let raw_theme: RawTheme = serde_json::from_value(serde_json::json!({
            "settings": [
                { "settings": { "foreground": "#AAAAAA", "background": "#BBBBBB" } },
                { "scope": "keyword", "settings": { "foreground": "#CC0000", "fontStyle": "bold" } }
            ]
        }))
        .unwrap();
        let theme = Theme::from_raw(&raw_theme).unwrap();

        let mut tokenizer = grammar.tokenizer();
        let result = tokenizer
            .tokenize_line2("if \"s\"", &StateStack::initial(), &theme)
            .unwrap();

        // three tokens, two words each
        assert_eq!(result.tokens.len(), 6);

        let keyword_meta = result.tokens[1];
        assert_eq!(metadata::language_id(keyword_meta), 7);
        assert_eq!(metadata::font_style(keyword_meta), FontStyle::BOLD.bits() as u32);
        assert_eq!(
            theme.color(metadata::foreground(keyword_meta)),
            Some("#CC0000")
        );
        assert_eq!(
            theme.color(metadata::background(keyword_meta)),
            Some("#BBBBBB")
        );
        assert_eq!(metadata::token_type(keyword_meta), 0);

        // the string literal carries the standard String token type
        assert_eq!(result.tokens[4], 3);
        let string_meta = result.tokens[5];
        assert_eq!(
            metadata::token_type(string_meta),
            StandardTokenType::String as u32
        );
        assert_eq!(
            theme.color(metadata::foreground(string_meta)),
            Some("#AAAAAA")
        );
    }

    #[test]
    fn token_output_snapshot() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "match": "\\b(?:if|else)\\b", "name": "keyword.control" }]
        }));

        let (lines, _) = tokenize_doc(&grammar, &["if x"]);
        let formatted = lines[0]
            .iter()
            .map(|(text, scopes)| format!("'{}' -> [{}]", text, scopes.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");
        insta::assert_snapshot!(
            formatted,
            @"'if' -> [source.t, keyword.control]; ' x' -> [source.t]"
        );
    }

    #[test]
    fn empty_lines_produce_no_tokens() {
        let grammar = build_grammar(serde_json::json!({
            "scopeName": "source.t",
            "patterns": [{ "match": "\\w+", "name": "word" }]
        }));

        let (lines, stack) = tokenize_doc(&grammar, &["", "x"]);
        assert!(lines[0].is_empty());
        assert_eq!(lines[1][0].0, "x");
        assert_eq!(stack.depth(), 1);
    }
}
